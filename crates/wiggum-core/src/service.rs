//! Service definitions: the immutable description of every orchestrated service.
//!
//! Every open-ended config shape (schedule, execution, condition) is a tagged
//! enum here, validated once at load so dispatch never re-checks presence.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Lifecycle phase a service belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Startup,
    Pre,
    Periodic,
    Post,
    Shutdown,
}

impl Phase {
    /// All phases in lifecycle order.
    pub const ALL: [Phase; 5] = [
        Phase::Startup,
        Phase::Pre,
        Phase::Periodic,
        Phase::Post,
        Phase::Shutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Startup => "startup",
            Phase::Pre => "pre",
            Phase::Periodic => "periodic",
            Phase::Post => "post",
            Phase::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| OrchestratorError::Config(format!("Unknown phase: '{s}'")))
    }
}

/// When a service becomes due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScheduleSpec {
    /// Due on every periodic pass.
    #[default]
    Tick,
    /// Due once `interval` seconds have elapsed since the last run.
    Interval {
        #[serde(default)]
        interval: u64,
        /// Maximum random seconds the due threshold may be pulled forward.
        #[serde(default)]
        jitter: u64,
        #[serde(default)]
        run_on_startup: bool,
    },
    /// Due only when an emitted event matches one of the patterns.
    Event {
        #[serde(default)]
        trigger: Vec<String>,
    },
}

impl ScheduleSpec {
    /// Trigger patterns for event schedules; empty otherwise.
    pub fn triggers(&self) -> &[String] {
        match self {
            ScheduleSpec::Event { trigger } => trigger,
            _ => &[],
        }
    }

    pub fn is_event(&self) -> bool {
        matches!(self, ScheduleSpec::Event { .. })
    }
}

/// How a service is executed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecutionSpec {
    /// A named shell function, batchable with other functions of the same phase.
    Function {
        #[serde(alias = "target", default)]
        function: String,
    },
    /// A free-form shell command line.
    Command {
        #[serde(alias = "target", default)]
        command: String,
    },
    /// A named pipeline; defaults to the service id when empty.
    Pipeline {
        #[serde(alias = "target", default)]
        pipeline: String,
        #[serde(default)]
        workspace: bool,
    },
}

impl ExecutionSpec {
    pub fn function(name: &str) -> Self {
        ExecutionSpec::Function {
            function: name.to_string(),
        }
    }

    pub fn command(cmd: &str) -> Self {
        ExecutionSpec::Command {
            command: cmd.to_string(),
        }
    }

    pub fn pipeline(name: &str) -> Self {
        ExecutionSpec::Pipeline {
            pipeline: name.to_string(),
            workspace: false,
        }
    }

    /// The function name, command line or pipeline name.
    pub fn target(&self) -> &str {
        match self {
            ExecutionSpec::Function { function } => function,
            ExecutionSpec::Command { command } => command,
            ExecutionSpec::Pipeline { pipeline, .. } => pipeline,
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self, ExecutionSpec::Function { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionSpec::Function { .. } => "function",
            ExecutionSpec::Command { .. } => "command",
            ExecutionSpec::Pipeline { .. } => "pipeline",
        }
    }
}

/// What to do when a new run is due while the previous one is still alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IfRunning {
    #[default]
    Skip,
    /// Any other policy: dispatch regardless.
    #[serde(other)]
    Proceed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencySpec {
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    #[serde(default)]
    pub if_running: IfRunning,
}

fn default_max_instances() -> u32 { 1 }

impl Default for ConcurrencySpec {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            if_running: IfRunning::Skip,
        }
    }
}

impl ConcurrencySpec {
    /// True when a live previous run must block a new dispatch.
    pub fn skips_when_running(&self) -> bool {
        self.max_instances == 1 && self.if_running == IfRunning::Skip
    }
}

/// Precondition checked at evaluation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Every listed variable must equal its value.
    EnvEquals(BTreeMap<String, String>),
    /// Every listed variable must differ from its value.
    EnvNotEquals(BTreeMap<String, String>),
    /// The path must exist.
    FileExists(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSpec {
    #[serde(default)]
    pub enabled: bool,
    /// Consecutive failures that trip the breaker.
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    /// Seconds an open breaker waits before allowing a trial run.
    #[serde(default = "default_cooldown")]
    pub cooldown: u64,
}

fn default_threshold() -> u32 { 5 }
fn default_cooldown() -> u64 { 300 }

impl Default for CircuitBreakerSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: default_threshold(),
            cooldown: default_cooldown(),
        }
    }
}

/// Kind of lifecycle event a finished execution emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Emitted after every execution, whatever the outcome.
    Completed,
    Succeeded,
    Failed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Completed => "completed",
            EventKind::Succeeded => "succeeded",
            EventKind::Failed => "failed",
        }
    }

    /// Event name for a service, e.g. `service.succeeded:memory-extract`.
    pub fn event_name(&self, service_id: &str) -> String {
        format!("service.{}:{service_id}", self.as_str())
    }
}

/// Raw dependency triggers; rewritten into an event schedule at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TriggerSpec {
    #[serde(default)]
    pub on_complete: Vec<String>,
    #[serde(default)]
    pub on_failure: Vec<String>,
    #[serde(default)]
    pub on_finish: Vec<String>,
}

impl TriggerSpec {
    pub fn is_empty(&self) -> bool {
        self.on_complete.is_empty() && self.on_failure.is_empty() && self.on_finish.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    #[default]
    Skip,
    Retry,
    Backoff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for `backoff`, doubled per consecutive retry.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
}

fn default_max_retries() -> u32 { 2 }
fn default_backoff_secs() -> u64 { 60 }

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            on_failure: OnFailure::Skip,
            max_retries: default_max_retries(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

/// A single service as declared in `services.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_phase")]
    pub phase: Phase,
    /// Tie-break within a phase, ascending.
    #[serde(default)]
    pub order: i64,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Startup-only: a failure aborts the run.
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub schedule: ScheduleSpec,
    pub execution: ExecutionSpec,
    #[serde(default)]
    pub concurrency: ConcurrencySpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers: Option<TriggerSpec>,
    /// Seconds the backend may spend on one run.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

fn default_phase() -> Phase { Phase::Periodic }
fn bool_true() -> bool { true }
pub(crate) fn default_timeout() -> u64 { 300 }

impl ServiceDefinition {
    /// Create an enabled service with default schedule, concurrency and policy.
    pub fn new(id: &str, phase: Phase, execution: ExecutionSpec) -> Self {
        Self {
            id: id.to_string(),
            description: String::new(),
            phase,
            order: 0,
            enabled: true,
            required: false,
            schedule: ScheduleSpec::Tick,
            execution,
            concurrency: ConcurrencySpec::default(),
            condition: None,
            circuit_breaker: None,
            triggers: None,
            timeout: default_timeout(),
            restart_policy: RestartPolicy::default(),
        }
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.order = order;
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleSpec) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_circuit_breaker(mut self, threshold: u32, cooldown: u64) -> Self {
        self.circuit_breaker = Some(CircuitBreakerSpec {
            enabled: true,
            threshold,
            cooldown,
        });
        self
    }

    pub fn with_triggers(mut self, triggers: TriggerSpec) -> Self {
        self.triggers = Some(triggers);
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// The breaker config, only when circuit breaking is enabled.
    pub fn breaker(&self) -> Option<&CircuitBreakerSpec> {
        self.circuit_breaker.as_ref().filter(|cb| cb.enabled)
    }

    /// Check invariants that dispatch relies on.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(OrchestratorError::Config("Service with empty id".into()));
        }
        match &self.schedule {
            ScheduleSpec::Interval { interval: 0, .. } => {
                return Err(OrchestratorError::invalid(&self.id, "interval schedule needs interval > 0"));
            }
            ScheduleSpec::Event { trigger } if trigger.is_empty() => {
                return Err(OrchestratorError::invalid(&self.id, "event schedule needs at least one trigger"));
            }
            _ => {}
        }
        match &self.execution {
            ExecutionSpec::Function { function } if function.trim().is_empty() => {
                return Err(OrchestratorError::invalid(&self.id, "function execution without a function name"));
            }
            ExecutionSpec::Command { command } if command.trim().is_empty() => {
                return Err(OrchestratorError::invalid(&self.id, "command execution without a command"));
            }
            _ => {}
        }
        if let Some(cb) = self.breaker() {
            if cb.threshold == 0 {
                return Err(OrchestratorError::invalid(&self.id, "circuit breaker threshold must be >= 1"));
            }
        }
        if self.concurrency.max_instances == 0 {
            return Err(OrchestratorError::invalid(&self.id, "max_instances must be >= 1"));
        }
        Ok(())
    }
}
