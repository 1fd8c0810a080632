//! Per-service runtime state and the store that owns it.
//!
//! Records are created lazily on first lookup and mutated only through the
//! transition methods below. Every mutation sets the dirty flag so that
//! `save_if_dirty` can skip redundant writes.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use wiggum_core::CircuitBreakerSpec;

use crate::circuit;
use crate::liveness::{ProcessProbe, SignalProbe};

/// Current wall-clock time in unix seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    #[default]
    Stopped,
    Failed,
    Skipped,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Failed => "failed",
            ServiceStatus::Skipped => "skipped",
        }
    }

    /// Lenient parse; unknown values read as `stopped`.
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => ServiceStatus::Running,
            "failed" => ServiceStatus::Failed,
            "skipped" => ServiceStatus::Skipped,
            _ => ServiceStatus::Stopped,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    #[serde(alias = "half-open")]
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Lenient parse; accepts `half-open` as written by older tools.
    pub fn parse(s: &str) -> Self {
        match s {
            "open" => CircuitState::Open,
            "half_open" | "half-open" => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable runtime record for one service.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServiceRuntimeState {
    pub last_run: i64,
    pub status: ServiceStatus,
    pub run_count: u64,
    /// Consecutive failures; reset by any success.
    pub fail_count: u32,
    pub success_count: u64,
    pub last_success: i64,
    /// Present only while `status == Running`.
    pub pid: Option<u32>,
    pub retry_count: u32,
    /// Ineligible while `now < backoff_until`.
    pub backoff_until: i64,
    pub circuit_state: CircuitState,
    pub circuit_opened_at: i64,
    pub half_open_attempts: u32,
    pub last_duration_ms: u64,
    /// `None` until the first sample.
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: u64,
    pub total_duration_ms: u64,
    /// Exit code of the latest execution (not persisted).
    pub last_exit_code: Option<i32>,
    /// Opaque pending work items, carried through persistence untouched.
    pub queue: Vec<serde_json::Value>,
}

/// Owner of all runtime records plus the on-disk snapshot location.
pub struct StateStore {
    pub(crate) entries: BTreeMap<String, ServiceRuntimeState>,
    pub(crate) state_file: PathBuf,
    pub(crate) probe: Arc<dyn ProcessProbe>,
    pub(crate) dirty: bool,
}

impl StateStore {
    /// Store persisting to `<state_dir>/services/state.json`.
    pub fn new(state_dir: &Path) -> Self {
        Self::with_probe(state_dir, Arc::new(SignalProbe))
    }

    /// Same as `new`, with a custom liveness probe.
    pub fn with_probe(state_dir: &Path, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            entries: BTreeMap::new(),
            state_file: state_dir.join("services").join("state.json"),
            probe,
            dirty: false,
        }
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Get or lazily create the record for a service.
    pub fn get(&mut self, id: &str) -> &ServiceRuntimeState {
        self.entry(id)
    }

    /// Mutable access for callers outside the transition set. Marks dirty.
    pub fn get_mut(&mut self, id: &str) -> &mut ServiceRuntimeState {
        self.dirty = true;
        self.entry(id)
    }

    /// Look up without creating.
    pub fn peek(&self, id: &str) -> Option<&ServiceRuntimeState> {
        self.entries.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&mut self, id: &str) -> &mut ServiceRuntimeState {
        self.entries.entry(id.to_string()).or_default()
    }

    // ─── Lifecycle transitions ──────────────────────────────

    pub fn mark_started(&mut self, id: &str, pid: Option<u32>) {
        let e = self.get_mut(id);
        e.status = ServiceStatus::Running;
        e.last_run = now_secs();
        e.run_count += 1;
        e.pid = pid;
    }

    /// Success: clears failure bookkeeping and closes the circuit.
    pub fn mark_completed(&mut self, id: &str) {
        let e = self.get_mut(id);
        e.status = ServiceStatus::Stopped;
        e.fail_count = 0;
        e.retry_count = 0;
        e.backoff_until = 0;
        e.last_success = now_secs();
        e.success_count += 1;
        e.pid = None;
        if e.circuit_state != CircuitState::Closed {
            tracing::info!("Circuit for '{}' closed after successful run", id);
        }
        e.circuit_state = CircuitState::Closed;
        e.half_open_attempts = 0;
    }

    /// Failure: bumps `fail_count`. Breaker transitions are the caller's job.
    pub fn mark_failed(&mut self, id: &str) {
        let e = self.get_mut(id);
        e.status = ServiceStatus::Failed;
        e.fail_count += 1;
        e.pid = None;
    }

    pub fn mark_skipped(&mut self, id: &str) {
        let e = self.entry(id);
        if e.status != ServiceStatus::Skipped {
            e.status = ServiceStatus::Skipped;
            self.dirty = true;
        }
    }

    /// True only if the service is `running` and its pid is confirmed alive.
    /// A dead pid demotes the record to `stopped`.
    pub fn is_running(&mut self, id: &str) -> bool {
        let probe = Arc::clone(&self.probe);
        let e = self.entry(id);
        if e.status != ServiceStatus::Running {
            return false;
        }
        let Some(pid) = e.pid else {
            return false;
        };
        if probe.is_alive(pid) {
            return true;
        }
        tracing::debug!("Service '{}' pid {} is gone, marking stopped", id, pid);
        e.status = ServiceStatus::Stopped;
        e.pid = None;
        self.dirty = true;
        false
    }

    pub fn record_execution(&mut self, id: &str, duration_ms: u64, exit_code: i32) {
        let e = self.get_mut(id);
        e.last_duration_ms = duration_ms;
        e.total_duration_ms = e.total_duration_ms.saturating_add(duration_ms);
        e.min_duration_ms = Some(e.min_duration_ms.map_or(duration_ms, |m| m.min(duration_ms)));
        e.max_duration_ms = e.max_duration_ms.max(duration_ms);
        e.last_exit_code = Some(exit_code);
    }

    // ─── Backoff ────────────────────────────────────────────

    pub fn set_backoff(&mut self, id: &str, seconds: u64) {
        let until = now_secs().saturating_add(i64::try_from(seconds).unwrap_or(i64::MAX));
        self.get_mut(id).backoff_until = until;
    }

    pub fn is_in_backoff(&mut self, id: &str) -> bool {
        now_secs() < self.entry(id).backoff_until
    }

    // ─── Circuit breaker ────────────────────────────────────

    /// Ask the breaker whether the service may run now.
    pub fn check_circuit(&mut self, id: &str, cb: Option<&CircuitBreakerSpec>, now: i64) -> bool {
        let e = self.entry(id);
        let before = e.circuit_state;
        let allowed = circuit::may_run(e, cb, now);
        if e.circuit_state != before {
            tracing::info!("Circuit for '{}' is now {} (cooldown elapsed)", id, e.circuit_state);
            self.dirty = true;
        }
        allowed
    }

    /// Fold a recorded failure into the breaker. Returns true if it opened.
    pub fn trip_circuit(&mut self, id: &str, cb: Option<&CircuitBreakerSpec>, now: i64) -> bool {
        let e = self.entry(id);
        let opened = circuit::record_failure(e, cb, now);
        if opened {
            self.dirty = true;
        }
        opened
    }

    /// Count a half-open trial before it is dispatched.
    pub fn begin_trial(&mut self, id: &str) {
        let e = self.entry(id);
        if circuit::begin_trial(e) {
            self.dirty = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = StateStore::with_probe(dir.path(), Arc::new(|_pid: u32| false));
        (dir, store)
    }

    #[test]
    fn test_get_creates_default_entry() {
        let (_dir, mut state) = store();
        let e = state.get("svc");
        assert_eq!(e.status, ServiceStatus::Stopped);
        assert_eq!(e.last_run, 0);
        assert_eq!(e.run_count, 0);
        assert_eq!(e.circuit_state, CircuitState::Closed);
        assert!(!state.is_dirty());
    }

    #[test]
    fn test_mark_started() {
        let (_dir, mut state) = store();
        state.mark_started("svc", Some(12345));
        let e = state.get("svc");
        assert_eq!(e.status, ServiceStatus::Running);
        assert_eq!(e.pid, Some(12345));
        assert_eq!(e.run_count, 1);
        assert!(e.last_run > 0);
        assert!(state.is_dirty());
    }

    #[test]
    fn test_mark_completed_resets_failures() {
        let (_dir, mut state) = store();
        state.mark_started("svc", None);
        state.mark_failed("svc");
        {
            let e = state.get_mut("svc");
            e.retry_count = 2;
            e.backoff_until = now_secs() + 100;
            e.circuit_state = CircuitState::HalfOpen;
            e.half_open_attempts = 3;
        }
        state.mark_completed("svc");
        let e = state.get("svc");
        assert_eq!(e.status, ServiceStatus::Stopped);
        assert_eq!(e.fail_count, 0);
        assert_eq!(e.retry_count, 0);
        assert_eq!(e.backoff_until, 0);
        assert_eq!(e.success_count, 1);
        assert!(e.last_success > 0);
        assert_eq!(e.pid, None);
        assert_eq!(e.circuit_state, CircuitState::Closed);
        assert_eq!(e.half_open_attempts, 0);
    }

    #[test]
    fn test_mark_failed_increments() {
        let (_dir, mut state) = store();
        state.mark_started("svc", Some(7));
        state.mark_failed("svc");
        state.mark_failed("svc");
        state.mark_failed("svc");
        let e = state.get("svc");
        assert_eq!(e.status, ServiceStatus::Failed);
        assert_eq!(e.fail_count, 3);
        assert_eq!(e.pid, None);
        // Breaker is untouched by the store itself
        assert_eq!(e.circuit_state, CircuitState::Closed);
    }

    #[test]
    fn test_is_running_dead_pid_self_heals() {
        let (_dir, mut state) = store();
        state.mark_started("svc", Some(999_999_999));
        assert!(!state.is_running("svc"));
        let e = state.get("svc");
        assert_eq!(e.status, ServiceStatus::Stopped);
        assert_eq!(e.pid, None);
    }

    #[test]
    fn test_is_running_live_pid() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut state = StateStore::with_probe(dir.path(), Arc::new(|pid: u32| pid == 4242));
        state.mark_started("svc", Some(4242));
        assert!(state.is_running("svc"));
        // Running without a pid is not verifiable
        state.mark_started("other", None);
        assert!(!state.is_running("other"));
    }

    #[test]
    fn test_record_execution_metrics() {
        let (_dir, mut state) = store();
        state.record_execution("svc", 150, 0);
        let e = state.get("svc");
        assert_eq!(e.last_duration_ms, 150);
        assert_eq!(e.total_duration_ms, 150);
        assert_eq!(e.min_duration_ms, Some(150));
        assert_eq!(e.max_duration_ms, 150);

        state.record_execution("svc", 50, 1);
        let e = state.get("svc");
        assert_eq!(e.min_duration_ms, Some(50));
        assert_eq!(e.max_duration_ms, 150);
        assert_eq!(e.total_duration_ms, 200);
        assert_eq!(e.last_exit_code, Some(1));
    }

    #[test]
    fn test_zero_duration_is_a_real_minimum() {
        let (_dir, mut state) = store();
        state.record_execution("svc", 0, 0);
        state.record_execution("svc", 40, 0);
        assert_eq!(state.get("svc").min_duration_ms, Some(0));
        assert_eq!(state.get("svc").max_duration_ms, 40);
    }

    #[test]
    fn test_backoff() {
        let (_dir, mut state) = store();
        state.set_backoff("svc", 10);
        assert!(state.is_in_backoff("svc"));

        state.get_mut("svc").backoff_until = now_secs() - 1;
        assert!(!state.is_in_backoff("svc"));
    }

    #[test]
    fn test_status_parsing_is_lenient() {
        assert_eq!(ServiceStatus::parse("failed"), ServiceStatus::Failed);
        assert_eq!(ServiceStatus::parse("bogus"), ServiceStatus::Stopped);
        assert_eq!(CircuitState::parse("half-open"), CircuitState::HalfOpen);
        assert_eq!(CircuitState::parse("half_open"), CircuitState::HalfOpen);
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }
}
