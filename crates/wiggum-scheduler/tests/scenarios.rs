//! End-to-end scheduler scenarios against a scripted executor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;
use wiggum_core::{ExecutionSpec, Phase, ScheduleSpec, ServiceDefinition, ServiceRegistry, TriggerSpec, normalize_triggers};
use wiggum_scheduler::{
    CircuitState, Executor, ServiceScheduler, ServiceStatus, StateStore, now_secs,
};

#[derive(Default)]
struct ScriptedExecutor {
    exit_codes: HashMap<String, i32>,
    ran: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn with_exit(mut self, id: &str, code: i32) -> Self {
        self.exit_codes.insert(id.to_string(), code);
        self
    }

    fn run(&self, svc: &ServiceDefinition) -> i32 {
        self.ran.lock().unwrap().push(svc.id.clone());
        self.exit_codes.get(&svc.id).copied().unwrap_or(0)
    }

    fn ran(&self) -> Vec<String> {
        self.ran.lock().unwrap().clone()
    }
}

impl Executor for ScriptedExecutor {
    fn run_phase_batch(&self, _phase: Phase, _functions: &[String]) -> bool {
        true
    }
    fn run_function(&self, svc: &ServiceDefinition, _extra_args: &[String]) -> i32 {
        self.run(svc)
    }
    fn run_command(&self, svc: &ServiceDefinition) -> i32 {
        self.run(svc)
    }
    fn run_pipeline(&self, svc: &ServiceDefinition) -> i32 {
        self.run(svc)
    }
    fn interrupt(&self) {}
}

fn dead_probe(dir: &std::path::Path) -> StateStore {
    StateStore::with_probe(dir, Arc::new(|_pid: u32| false))
}

fn interval_service(id: &str, order: i64, secs: u64) -> ServiceDefinition {
    ServiceDefinition::new(id, Phase::Periodic, ExecutionSpec::function(&format!("svc_{id}")))
        .with_order(order)
        .with_schedule(ScheduleSpec::Interval {
            interval: secs,
            jitter: 0,
            run_on_startup: false,
        })
}

fn event_service(id: &str, order: i64, pattern: &str) -> ServiceDefinition {
    ServiceDefinition::new(id, Phase::Periodic, ExecutionSpec::function(&format!("svc_{id}")))
        .with_order(order)
        .with_schedule(ScheduleSpec::Event {
            trigger: vec![pattern.to_string()],
        })
}

fn build(
    services: Vec<ServiceDefinition>,
    exec: ScriptedExecutor,
    state: StateStore,
) -> (Arc<ScriptedExecutor>, ServiceScheduler) {
    let registry = Arc::new(ServiceRegistry::new(services).unwrap());
    let exec = Arc::new(exec);
    (exec.clone(), ServiceScheduler::new(registry, state, exec))
}

#[test]
fn scenario_a_success_triggers_dependent_in_same_pass() {
    let dir = tempfile::TempDir::new().unwrap();
    let services = vec![
        interval_service("memory-extract", 10, 60),
        event_service("memory-analyze", 20, "service.succeeded:memory-extract"),
    ];
    let (exec, mut sched) = build(services, ScriptedExecutor::default(), dead_probe(dir.path()));
    sched.state_mut().get_mut("memory-extract").last_run = now_secs() - 120;

    assert!(sched.run_phase(Phase::Periodic));
    assert_eq!(exec.ran(), vec!["memory-extract", "memory-analyze"]);
    assert_eq!(sched.state_mut().get("memory-analyze").success_count, 1);
}

#[test]
fn scenario_b_failure_fires_on_finish_but_not_on_success() {
    let dir = tempfile::TempDir::new().unwrap();
    let services = vec![
        interval_service("memory-analyze", 10, 60),
        event_service("on-finish", 20, "service.completed:memory-analyze"),
        event_service("on-success", 30, "service.succeeded:memory-analyze"),
        event_service("on-failure", 40, "service.failed:*"),
    ];
    let exec = ScriptedExecutor::default().with_exit("memory-analyze", 1);
    let (exec, mut sched) = build(services, exec, dead_probe(dir.path()));
    sched.state_mut().get_mut("memory-analyze").last_run = now_secs() - 120;

    sched.run_phase(Phase::Periodic);
    assert_eq!(exec.ran(), vec!["memory-analyze", "on-finish", "on-failure"]);
    assert_eq!(sched.state_mut().get("memory-analyze").status, ServiceStatus::Failed);
    assert_eq!(sched.state_mut().get("on-success").run_count, 0);
}

#[test]
fn normalized_triggers_drive_propagation() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut services = vec![
        ServiceDefinition::new("sync", Phase::Periodic, ExecutionSpec::command("sync")).with_order(1),
        ServiceDefinition::new("report", Phase::Periodic, ExecutionSpec::pipeline("report"))
            .with_order(2)
            .with_triggers(TriggerSpec {
                on_complete: vec!["sync".into()],
                ..Default::default()
            }),
    ];
    normalize_triggers(&mut services);
    let (exec, mut sched) = build(services, ScriptedExecutor::default(), dead_probe(dir.path()));
    sched.run_phase(Phase::Periodic);
    assert_eq!(exec.ran(), vec!["sync", "report"]);
}

#[test]
fn scenario_c_restore_demotes_dead_running_pid() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("services")).unwrap();
    let doc = json!({
        "version": "1.0",
        "saved_at": 1_700_000_000,
        "services": {
            "worker": {
                "last_run": 1_700_000_000, "status": "running", "run_count": 4, "fail_count": 0,
                "pid": 4_000_000,
                "circuit": {"state": "closed", "opened_at": 0, "half_open_attempts": 0},
                "metrics": {"total_duration_ms": 400, "success_count": 3, "last_duration_ms": 100,
                            "min_duration_ms": 90, "max_duration_ms": 110},
                "queue": [], "backoff_until": 0, "retry_count": 0, "last_success": 1_699_999_000
            }
        }
    });
    std::fs::write(dir.path().join("services/state.json"), doc.to_string()).unwrap();

    let mut state = dead_probe(dir.path());
    assert!(state.restore());
    let worker = state.get("worker");
    assert_eq!(worker.status, ServiceStatus::Stopped);
    assert_eq!(worker.pid, None);
    assert_eq!(worker.run_count, 4);
    assert!(state.is_dirty());
}

#[test]
fn restore_keeps_running_pid_that_is_alive() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut state = StateStore::with_probe(dir.path(), Arc::new(|pid: u32| pid == 31337));
    state.mark_started("worker", Some(31337));
    state.save().unwrap();

    let mut fresh = StateStore::with_probe(dir.path(), Arc::new(|pid: u32| pid == 31337));
    assert!(fresh.restore());
    assert!(fresh.is_running("worker"));
    assert_eq!(fresh.get("worker").pid, Some(31337));
}

#[test]
fn scenario_d_save_restore_round_trips_every_field() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut state = dead_probe(dir.path());

    state.mark_started("alpha", None);
    state.record_execution("alpha", 250, 0);
    state.mark_completed("alpha");
    state.mark_started("alpha", None);
    state.record_execution("alpha", 40, 2);
    state.mark_failed("alpha");
    {
        let a = state.get_mut("alpha");
        a.retry_count = 1;
        a.backoff_until = 1_900_000_000;
        a.circuit_state = CircuitState::HalfOpen;
        a.circuit_opened_at = 1_800_000_000;
        a.half_open_attempts = 2;
        a.queue = vec![json!({"issue": 42}), json!("next")];
    }
    state.mark_skipped("beta");
    state.save().unwrap();

    let mut restored = dead_probe(dir.path());
    assert!(restored.restore());
    for id in ["alpha", "beta"] {
        let mut expected = state.get(id).clone();
        expected.last_exit_code = None;
        // Statuses other than a live run come back as stopped
        expected.status = ServiceStatus::Stopped;
        assert_eq!(restored.get(id), &expected, "mismatch for {id}");
    }
    let a = restored.get("alpha");
    assert_eq!(a.run_count, 2);
    assert_eq!(a.fail_count, 1);
    assert_eq!(a.success_count, 1);
    assert_eq!(a.min_duration_ms, Some(40));
    assert_eq!(a.max_duration_ms, 250);
    assert_eq!(a.total_duration_ms, 290);
    assert_eq!(a.circuit_state, CircuitState::HalfOpen);
}

#[test]
fn breaker_lifecycle_over_ticks() {
    let dir = tempfile::TempDir::new().unwrap();
    let services = vec![
        ServiceDefinition::new("flaky", Phase::Periodic, ExecutionSpec::command("flaky")).with_circuit_breaker(3, 120),
    ];
    let exec = ScriptedExecutor::default().with_exit("flaky", 7);
    let (exec, mut sched) = build(services, exec, dead_probe(dir.path()));

    for _ in 0..5 {
        sched.run_phase(Phase::Periodic);
    }
    assert_eq!(exec.ran().len(), 3);
    let s = sched.state_mut().get("flaky").clone();
    assert_eq!(s.circuit_state, CircuitState::Open);
    assert_eq!(s.fail_count, 3);
    assert_eq!(s.last_exit_code, Some(7));
}

#[test]
fn tick_persists_state_for_other_readers() {
    let dir = tempfile::TempDir::new().unwrap();
    let services = vec![ServiceDefinition::new("beat", Phase::Periodic, ExecutionSpec::command("true"))];
    let (_exec, mut sched) = build(services, ScriptedExecutor::default(), dead_probe(dir.path()));
    assert!(sched.run_tick());

    let raw = std::fs::read_to_string(dir.path().join("services/state.json")).unwrap();
    let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(v["services"]["beat"]["status"], "stopped");
    assert_eq!(v["services"]["beat"]["metrics"]["success_count"], 1);
}
