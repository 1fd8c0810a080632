//! # Wiggum Core
//!
//! Service data model, configuration loading and the read-only service
//! registry shared by the scheduler and the orchestrator binary.
//!
//! ## Load pipeline
//! ```text
//! config/services.json ──parse (+defaults)──┐
//! .ralph/services.json ──overrides──────────┤
//!                                           ├─ normalize triggers → validate
//! run mode / --no-* flags ──filters─────────┘
//!                                           └─ ServiceRegistry (immutable)
//! ```

pub mod config;
pub mod error;
pub mod loader;
pub mod registry;
pub mod service;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use loader::{DisableFlags, RunMode, apply_overrides, apply_run_mode_filters, load_services, normalize_triggers};
pub use registry::ServiceRegistry;
pub use service::{
    CircuitBreakerSpec, ConcurrencySpec, Condition, EventKind, ExecutionSpec, IfRunning, OnFailure, Phase,
    RestartPolicy, ScheduleSpec, ServiceDefinition, TriggerSpec,
};
