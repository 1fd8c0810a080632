//! Service scheduler: phase dispatch, periodic due-time checks and
//! in-pass event propagation.
//!
//! Dispatch is single-threaded: every executor call blocks the loop until it
//! returns. Cancellation comes from outside through an [`InterruptHandle`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use wiggum_core::{OnFailure, Phase, ScheduleSpec, ServiceDefinition, ServiceRegistry};

use crate::condition::{self, ConditionEnv, SystemEnv};
use crate::events::{self, EventLog, ServiceEvent};
use crate::executor::{self, ExecOutcome, Executor, InterruptHandle};
use crate::state::{ServiceStatus, StateStore, now_secs};

/// Default bound on trigger chains within one periodic pass.
pub const DEFAULT_MAX_CASCADE_DEPTH: usize = 8;

/// Longest delay a backoff policy will impose, in seconds.
pub const MAX_BACKOFF_SECS: u64 = 3600;

/// Owns the runtime state and drives services through the executor.
pub struct ServiceScheduler {
    registry: Arc<ServiceRegistry>,
    state: StateStore,
    executor: Arc<dyn Executor>,
    events: EventLog,
    env: Box<dyn ConditionEnv>,
    /// Baseline for interval services that have never run.
    started_at: i64,
    max_cascade_depth: usize,
}

impl ServiceScheduler {
    pub fn new(registry: Arc<ServiceRegistry>, state: StateStore, executor: Arc<dyn Executor>) -> Self {
        Self {
            registry,
            state,
            executor,
            events: EventLog::default(),
            env: Box::new(SystemEnv),
            started_at: now_secs(),
            max_cascade_depth: DEFAULT_MAX_CASCADE_DEPTH,
        }
    }

    pub fn with_max_cascade_depth(mut self, depth: usize) -> Self {
        self.max_cascade_depth = depth;
        self
    }

    /// Replace the environment conditions are evaluated against.
    pub fn with_condition_env(mut self, env: Box<dyn ConditionEnv>) -> Self {
        self.env = env;
        self
    }

    pub fn with_started_at(mut self, ts: i64) -> Self {
        self.started_at = ts;
        self
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StateStore {
        &mut self.state
    }

    /// Events emitted recently, oldest first.
    pub fn recent_events(&self) -> Vec<ServiceEvent> {
        self.events.recent()
    }

    /// Handle that can cancel the in-flight execution from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle::new(Arc::clone(&self.executor))
    }

    /// Run one lifecycle phase. Returns false when a function batch failed
    /// or a required startup service failed; the periodic phase always
    /// returns true.
    pub fn run_phase(&mut self, phase: Phase) -> bool {
        match phase {
            Phase::Periodic => {
                self.run_periodic();
                true
            }
            _ => self.run_lifecycle(phase),
        }
    }

    /// One full tick: `pre`, `periodic`, `post`, then persist if anything changed.
    pub fn run_tick(&mut self) -> bool {
        let pre_ok = self.run_phase(Phase::Pre);
        self.run_phase(Phase::Periodic);
        let post_ok = self.run_phase(Phase::Post);
        if let Err(e) = self.state.save_if_dirty() {
            tracing::warn!("Failed to save service state: {}", e);
        }
        pre_ok && post_ok
    }

    // ─── Lifecycle phases ───────────────────────────────────

    fn run_lifecycle(&mut self, phase: Phase) -> bool {
        let registry = Arc::clone(&self.registry);
        let services = registry.dispatch_order(phase);
        if services.is_empty() {
            return true;
        }
        tracing::info!("▶️ Running {} phase ({} services)", phase, services.len());

        let mut batch: Vec<&ServiceDefinition> = Vec::new();
        for svc in services {
            if !self.condition_met(svc) {
                tracing::debug!("Skipping '{}': condition not met", svc.id);
                self.state.mark_skipped(&svc.id);
                continue;
            }
            if !self.gates_open(svc, now_secs()) {
                continue;
            }
            self.state.begin_trial(&svc.id);
            if svc.execution.is_function() {
                batch.push(svc);
                continue;
            }
            // Keep relative order: earlier functions run before this one
            if !self.flush_batch(phase, &mut batch) {
                return false;
            }
            let (outcome, _) = self.execute(svc);
            if !outcome.is_success() && svc.required {
                if phase == Phase::Startup {
                    tracing::error!("Required service '{}' failed in {} phase", svc.id, phase);
                    return false;
                }
                tracing::warn!("Required service '{}' failed in {} phase, continuing", svc.id, phase);
            }
        }
        self.flush_batch(phase, &mut batch)
    }

    fn flush_batch(&mut self, phase: Phase, batch: &mut Vec<&ServiceDefinition>) -> bool {
        if batch.is_empty() {
            return true;
        }
        let functions: Vec<String> = batch.iter().map(|s| s.execution.target().to_string()).collect();
        for svc in batch.iter() {
            self.state.mark_started(&svc.id, None);
        }

        let start = Instant::now();
        let ok = self.executor.run_phase_batch(phase, &functions);
        let elapsed = elapsed_ms(start);

        let now = now_secs();
        for svc in batch.iter() {
            self.state.record_execution(&svc.id, elapsed, if ok { 0 } else { 1 });
            if ok {
                self.state.mark_completed(&svc.id);
            } else {
                self.state.mark_failed(&svc.id);
                if self.state.trip_circuit(&svc.id, svc.breaker(), now) {
                    tracing::warn!("⚡ Circuit for '{}' opened", svc.id);
                }
            }
            self.emit(&svc.id, ok, now);
        }
        batch.clear();

        if !ok {
            tracing::error!("{} phase batch failed ({})", phase, functions.join(", "));
        }
        ok
    }

    // ─── Periodic pass ──────────────────────────────────────

    fn run_periodic(&mut self) {
        let registry = Arc::clone(&self.registry);
        let services = registry.enabled_for_phase(Phase::Periodic);
        let now = now_secs();
        let mut fired: HashSet<String> = HashSet::new();

        for svc in &services {
            if fired.contains(&svc.id) {
                continue;
            }
            if !self.condition_met(svc) {
                self.state.mark_skipped(&svc.id);
                continue;
            }
            if !self.is_due(svc, now) {
                continue;
            }
            if let Some(emitted) = self.try_run(svc, now) {
                fired.insert(svc.id.clone());
                self.propagate(&services, &emitted, &mut fired, 1);
            }
        }
    }

    /// Dispatch event-scheduled services whose patterns match `emitted`.
    fn propagate(
        &mut self,
        services: &[&ServiceDefinition],
        emitted: &[String],
        fired: &mut HashSet<String>,
        depth: usize,
    ) {
        if emitted.is_empty() {
            return;
        }
        if depth > self.max_cascade_depth {
            tracing::warn!(
                "Trigger cascade deeper than {} dropped (events: {})",
                self.max_cascade_depth,
                emitted.join(", ")
            );
            return;
        }
        for svc in services.iter().filter(|s| s.schedule.is_event()) {
            if fired.contains(&svc.id) {
                continue;
            }
            if !events::any_match(svc.schedule.triggers(), emitted) {
                continue;
            }
            if !self.condition_met(svc) {
                self.state.mark_skipped(&svc.id);
                continue;
            }
            tracing::debug!("'{}' triggered by {}", svc.id, emitted.join(", "));
            let now = now_secs();
            if let Some(next) = self.try_run(svc, now) {
                fired.insert(svc.id.clone());
                self.propagate(services, &next, fired, depth + 1);
            }
        }
    }

    fn is_due(&mut self, svc: &ServiceDefinition, now: i64) -> bool {
        // Event services only become eligible through a matching event
        if !svc.schedule.is_event() && self.retry_pending(svc) {
            return true;
        }
        match &svc.schedule {
            ScheduleSpec::Tick => true,
            ScheduleSpec::Event { .. } => false,
            ScheduleSpec::Interval {
                interval,
                jitter,
                run_on_startup,
            } => {
                let last_run = self.state.get(&svc.id).last_run;
                if last_run == 0 && *run_on_startup {
                    return true;
                }
                let reference = if last_run == 0 { self.started_at } else { last_run };
                let slack = if *jitter > 0 {
                    rand::thread_rng().gen_range(0..=*jitter)
                } else {
                    0
                };
                let threshold = i64::try_from(interval.saturating_sub(slack)).unwrap_or(i64::MAX);
                now.saturating_sub(reference) >= threshold
            }
        }
    }

    /// A `retry` policy still has budget after the latest failure.
    fn retry_pending(&mut self, svc: &ServiceDefinition) -> bool {
        if svc.restart_policy.on_failure != OnFailure::Retry {
            return false;
        }
        let s = self.state.get(&svc.id);
        s.status == ServiceStatus::Failed && s.retry_count > 0 && s.fail_count <= s.retry_count
    }

    /// Backoff, breaker and concurrency gates, then execute.
    /// Returns the emitted event names when the service ran.
    fn try_run(&mut self, svc: &ServiceDefinition, now: i64) -> Option<Vec<String>> {
        if !self.gates_open(svc, now) {
            return None;
        }
        if svc.concurrency.skips_when_running() && self.state.is_running(&svc.id) {
            tracing::debug!("Skipping '{}': previous run still alive", svc.id);
            return None;
        }
        self.state.begin_trial(&svc.id);
        let (_, emitted) = self.execute(svc);
        Some(emitted)
    }

    /// Backoff and breaker checks shared by every phase.
    fn gates_open(&mut self, svc: &ServiceDefinition, now: i64) -> bool {
        if self.state.is_in_backoff(&svc.id) {
            tracing::debug!("Skipping '{}': in backoff", svc.id);
            return false;
        }
        if !self.state.check_circuit(&svc.id, svc.breaker(), now) {
            tracing::debug!("Skipping '{}': circuit open", svc.id);
            return false;
        }
        true
    }

    // ─── Execution and results ──────────────────────────────

    fn execute(&mut self, svc: &ServiceDefinition) -> (ExecOutcome, Vec<String>) {
        tracing::info!("🔔 Running '{}' ({} {})", svc.id, svc.execution.kind(), svc.execution.target());
        self.state.mark_started(&svc.id, None);

        let start = Instant::now();
        let outcome = executor::dispatch(self.executor.as_ref(), svc);
        let elapsed = elapsed_ms(start);
        self.state.record_execution(&svc.id, elapsed, outcome.exit_code());

        let now = now_secs();
        match outcome {
            ExecOutcome::Success => {
                self.state.mark_completed(&svc.id);
                tracing::debug!("'{}' succeeded in {}ms", svc.id, elapsed);
            }
            ExecOutcome::Failed(code) => {
                tracing::warn!("'{}' failed with exit code {}", svc.id, code);
                self.record_failure(svc, now);
            }
            ExecOutcome::TimedOut => {
                tracing::warn!("'{}' timed out after {}s", svc.id, svc.timeout);
                self.record_failure(svc, now);
            }
        }
        let emitted = self.emit(&svc.id, outcome.is_success(), now);
        (outcome, emitted)
    }

    fn record_failure(&mut self, svc: &ServiceDefinition, now: i64) {
        self.state.mark_failed(&svc.id);

        let policy = &svc.restart_policy;
        match policy.on_failure {
            OnFailure::Skip => {}
            OnFailure::Retry => {
                let e = self.state.get_mut(&svc.id);
                if e.retry_count < policy.max_retries {
                    e.retry_count += 1;
                    tracing::info!("'{}' will retry ({}/{})", svc.id, e.retry_count, policy.max_retries);
                }
            }
            OnFailure::Backoff => {
                let e = self.state.get_mut(&svc.id);
                e.retry_count = e.retry_count.saturating_add(1);
                let delay = backoff_delay(policy.backoff_secs, e.retry_count);
                tracing::info!("'{}' backing off for {}s", svc.id, delay);
                self.state.set_backoff(&svc.id, delay);
            }
        }

        if self.state.trip_circuit(&svc.id, svc.breaker(), now) {
            tracing::warn!("⚡ Circuit for '{}' opened", svc.id);
        }
    }

    fn emit(&mut self, service_id: &str, success: bool, now: i64) -> Vec<String> {
        events::events_for(service_id, success, now)
            .into_iter()
            .map(|event| {
                let name = event.name();
                self.events.push(event);
                name
            })
            .collect()
    }

    fn condition_met(&self, svc: &ServiceDefinition) -> bool {
        svc.condition
            .as_ref()
            .is_none_or(|c| condition::evaluate(c, self.env.as_ref()))
    }
}

/// `base * 2^(attempt-1)`, capped at [`MAX_BACKOFF_SECS`].
pub fn backoff_delay(base: u64, attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(32);
    base.saturating_mul(1u64 << exp).min(MAX_BACKOFF_SECS)
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
