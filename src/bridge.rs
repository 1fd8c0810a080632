//! Process-backed executor: every target goes through the bash bridge script.
//!
//! ```text
//! phase batch   bash <bridge> phase <phase> <fn>...
//! function      bash <bridge> function <fn> <args>...
//! pipeline      bash <bridge> pipeline <id> <name> <workspace>
//! command       bash -c <command>
//! ```

use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use wiggum_core::{ExecutionSpec, Phase, ServiceDefinition};
use wiggum_scheduler::{Executor, TIMEOUT_EXIT_CODE};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exit code reported when the child could not be spawned.
const SPAWN_FAILED: i32 = 127;

pub struct BridgeExecutor {
    bridge: PathBuf,
    home: PathBuf,
    project_dir: PathBuf,
    state_dir: PathBuf,
    run_mode: String,
    batch_timeout: Duration,
    /// PID of the child currently being waited on.
    current: Mutex<Option<u32>>,
}

impl BridgeExecutor {
    pub fn new(
        bridge: PathBuf,
        home: PathBuf,
        project_dir: PathBuf,
        state_dir: PathBuf,
        run_mode: &str,
        batch_timeout: Duration,
    ) -> Self {
        Self {
            bridge,
            home,
            project_dir,
            state_dir,
            run_mode: run_mode.to_string(),
            batch_timeout,
            current: Mutex::new(None),
        }
    }

    fn bridge_command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("bash");
        cmd.arg(&self.bridge).args(args);
        self.prepare(&mut cmd);
        cmd
    }

    fn prepare(&self, cmd: &mut Command) {
        let path = match std::env::var("PATH") {
            Ok(existing) if !existing.is_empty() => format!("{}:{existing}", self.home.join("bin").display()),
            _ => self.home.join("bin").display().to_string(),
        };
        cmd.current_dir(&self.project_dir)
            .env("WIGGUM_HOME", &self.home)
            .env("PROJECT_DIR", &self.project_dir)
            .env("RALPH_DIR", &self.state_dir)
            .env("WIGGUM_RUN_MODE", &self.run_mode)
            .env("PATH", path)
            .stdin(Stdio::null());
    }

    fn set_current(&self, pid: Option<u32>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = pid;
    }

    /// Spawn, then poll until exit or `timeout`; a timed-out child is killed.
    fn run(&self, label: &str, mut cmd: Command, timeout: Duration) -> i32 {
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("Failed to spawn '{}': {}", label, e);
                return SPAWN_FAILED;
            }
        };
        self.set_current(Some(child.id()));
        tracing::debug!("'{}' started (pid={})", label, child.id());

        let deadline = Instant::now() + timeout;
        let code = loop {
            match child.try_wait() {
                Ok(Some(status)) => break exit_code(status),
                Ok(None) if Instant::now() >= deadline => {
                    tracing::warn!("'{}' exceeded {}s, killing pid {}", label, timeout.as_secs(), child.id());
                    let _ = child.kill();
                    let _ = child.wait();
                    break TIMEOUT_EXIT_CODE;
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    tracing::error!("Lost track of '{}': {}", label, e);
                    let _ = child.kill();
                    let _ = child.wait();
                    break 1;
                }
            }
        };

        self.set_current(None);
        code
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

impl Executor for BridgeExecutor {
    fn run_phase_batch(&self, phase: Phase, functions: &[String]) -> bool {
        let mut args = vec!["phase", phase.as_str()];
        args.extend(functions.iter().map(String::as_str));
        let cmd = self.bridge_command(&args);
        self.run(&format!("{phase} batch"), cmd, self.batch_timeout) == 0
    }

    fn run_function(&self, service: &ServiceDefinition, extra_args: &[String]) -> i32 {
        let mut args = vec!["function", service.execution.target()];
        args.extend(extra_args.iter().map(String::as_str));
        let cmd = self.bridge_command(&args);
        self.run(&service.id, cmd, Duration::from_secs(service.timeout))
    }

    fn run_command(&self, service: &ServiceDefinition) -> i32 {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(service.execution.target());
        self.prepare(&mut cmd);
        self.run(&service.id, cmd, Duration::from_secs(service.timeout))
    }

    fn run_pipeline(&self, service: &ServiceDefinition) -> i32 {
        let (name, workspace) = match &service.execution {
            ExecutionSpec::Pipeline { pipeline, workspace } => (pipeline.as_str(), *workspace),
            other => (other.target(), false),
        };
        let cmd = self.bridge_command(&["pipeline", service.id.as_str(), name, if workspace { "true" } else { "false" }]);
        self.run(&service.id, cmd, Duration::from_secs(service.timeout))
    }

    fn interrupt(&self) {
        let pid = *self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pid) = pid else {
            return;
        };
        tracing::info!("Sending SIGTERM to pid {}", pid);
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Ok(raw) = i32::try_from(pid) {
                if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                    tracing::warn!("SIGTERM to pid {} failed: {}", pid, e);
                }
            }
        }
    }
}
