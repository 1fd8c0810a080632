//! # Wiggum Scheduler
//!
//! Dispatch engine for orchestrated services: phase runs, periodic due-time
//! checks, a circuit breaker per service, and event triggers that cascade
//! within a single pass. Runtime state survives restarts through an atomic
//! JSON snapshot.
//!
//! ## Architecture
//! ```text
//! ServiceScheduler::run_phase(phase)
//!   ├── startup/pre/post/shutdown → condition → backoff → breaker → batch or single run
//!   └── periodic
//!         ├── condition → due? → backoff → breaker → concurrency
//!         ├── Executor (blocking)  ──▶ exit code
//!         ├── StateStore           ──▶ counters, metrics, breaker
//!         └── events ──▶ matching event services run in the same pass
//!
//! StateStore ──save()──▶ <state_dir>/services/state.json (temp + rename)
//!            ◀─restore()─ (running pids re-checked via ProcessProbe)
//!
//! WorkerPool ──save()──▶ <state_dir>/orchestrator/pool.json
//!            ◀─restore()─ (dead worker pids dropped)
//! ```

pub mod circuit;
pub mod condition;
pub mod engine;
pub mod events;
pub mod executor;
pub mod liveness;
pub mod persistence;
pub mod pool;
pub mod state;

pub use condition::{ConditionEnv, SystemEnv};
pub use engine::{DEFAULT_MAX_CASCADE_DEPTH, ServiceScheduler, backoff_delay};
pub use events::{EventLog, ServiceEvent, pattern_matches};
pub use executor::{ExecOutcome, Executor, InterruptHandle, TIMEOUT_EXIT_CODE};
pub use liveness::{ProcessProbe, SignalProbe};
pub use pool::{WorkerEntry, WorkerPool};
pub use state::{CircuitState, ServiceRuntimeState, ServiceStatus, StateStore, now_secs};
