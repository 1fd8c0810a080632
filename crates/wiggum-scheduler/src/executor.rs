//! Execution backend contract.
//!
//! The scheduler never spawns anything itself: every dispatch goes through
//! an `Executor`, and each call blocks until the work unit exits or its
//! timeout expires.

use std::sync::Arc;

use wiggum_core::{ExecutionSpec, Phase, ServiceDefinition};

/// Exit code reported when a run exceeded its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Backend that turns service targets into running processes.
pub trait Executor: Send + Sync {
    /// Run function targets in order inside one shared context.
    fn run_phase_batch(&self, phase: Phase, functions: &[String]) -> bool;

    /// Run one function target, blocking up to `service.timeout`.
    fn run_function(&self, service: &ServiceDefinition, extra_args: &[String]) -> i32;

    fn run_command(&self, service: &ServiceDefinition) -> i32;

    fn run_pipeline(&self, service: &ServiceDefinition) -> i32;

    /// Best-effort terminate of whatever call is in flight.
    fn interrupt(&self);
}

/// Classified result of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Success,
    Failed(i32),
    TimedOut,
}

impl ExecOutcome {
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => ExecOutcome::Success,
            TIMEOUT_EXIT_CODE => ExecOutcome::TimedOut,
            other => ExecOutcome::Failed(other),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecOutcome::Success)
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ExecOutcome::Success => 0,
            ExecOutcome::Failed(code) => *code,
            ExecOutcome::TimedOut => TIMEOUT_EXIT_CODE,
        }
    }
}

/// Route a single service to the matching executor entry point.
pub fn dispatch(executor: &dyn Executor, service: &ServiceDefinition) -> ExecOutcome {
    let code = match &service.execution {
        ExecutionSpec::Function { .. } => executor.run_function(service, &[]),
        ExecutionSpec::Command { .. } => executor.run_command(service),
        ExecutionSpec::Pipeline { .. } => executor.run_pipeline(service),
    };
    ExecOutcome::from_exit_code(code)
}

/// Cloneable handle for cancelling the in-flight execution from another thread.
#[derive(Clone)]
pub struct InterruptHandle {
    executor: Arc<dyn Executor>,
}

impl InterruptHandle {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    pub fn interrupt(&self) {
        self.executor.interrupt();
    }
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandle").finish_non_exhaustive()
    }
}
