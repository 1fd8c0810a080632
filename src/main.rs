//! # Wiggum Orchestrator
//!
//! Loads the service catalog, restores runtime state and drives the
//! lifecycle phases: `startup` once, then `pre → periodic → post` every tick,
//! and `shutdown` on Ctrl-C.
//!
//! Usage:
//!   wiggum-orchestrator                       # Run in the current project
//!   wiggum-orchestrator --once                # One tick, then shut down
//!   wiggum-orchestrator --run-mode fix-only   # Restrict to fix work

mod bridge;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::{Mutex, watch};
use tracing_subscriber::EnvFilter;
use wiggum_core::{
    DisableFlags, OrchestratorConfig, Phase, RunMode, ServiceRegistry, apply_run_mode_filters, load_services,
};
use wiggum_scheduler::{ConditionEnv, ServiceScheduler, StateStore, SystemEnv, WorkerPool};

use crate::bridge::BridgeExecutor;

#[derive(Parser)]
#[command(
    name = "wiggum-orchestrator",
    version,
    about = "🔁 Wiggum Orchestrator — phase-based service scheduler"
)]
struct Cli {
    /// Orchestrator home (config/, lib/, bin/). Defaults to $WIGGUM_HOME or ~/.wiggum
    #[arg(long)]
    home: Option<String>,

    /// Project directory (defaults to the current directory)
    #[arg(long)]
    project_dir: Option<String>,

    /// Seconds between ticks (overrides orchestrator.toml)
    #[arg(long)]
    tick: Option<u64>,

    /// default | fix-only | merge-only | resume-only
    #[arg(long, default_value = "default")]
    run_mode: String,

    /// Disable resume services
    #[arg(long)]
    no_resume: bool,

    /// Disable fix services
    #[arg(long)]
    no_fix: bool,

    /// Disable merge services
    #[arg(long)]
    no_merge: bool,

    /// Disable GitHub sync services
    #[arg(long)]
    no_sync: bool,

    /// Run a single tick, then shut down
    #[arg(long)]
    once: bool,

    /// Verbose logging (also enabled by a non-empty DEBUG variable)
    #[arg(short, long)]
    verbose: bool,

    /// Append JSON log lines to this file instead of stderr
    #[arg(long)]
    log_file: Option<String>,
}

/// Process environment with `WIGGUM_RUN_MODE` pinned to the CLI value.
struct RunModeEnv {
    mode: RunMode,
}

impl ConditionEnv for RunModeEnv {
    fn var(&self, name: &str) -> Option<String> {
        if name == "WIGGUM_RUN_MODE" {
            return Some(self.mode.as_str().to_string());
        }
        SystemEnv.var(name)
    }

    fn path_exists(&self, path: &str) -> bool {
        SystemEnv.path_exists(path)
    }
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn resolve_home(cli: &Cli) -> PathBuf {
    cli.home
        .as_deref()
        .map(expand_path)
        .or_else(|| std::env::var("WIGGUM_HOME").ok().filter(|h| !h.is_empty()).map(|h| expand_path(&h)))
        .unwrap_or_else(OrchestratorConfig::default_home)
}

/// Run a scheduler operation on the blocking pool; executor calls block.
async fn run_blocking<T, F>(scheduler: &Arc<Mutex<ServiceScheduler>>, f: F) -> Result<T>
where
    F: FnOnce(&mut ServiceScheduler) -> T + Send + 'static,
    T: Send + 'static,
{
    let scheduler = Arc::clone(scheduler);
    let out = tokio::task::spawn_blocking(move || {
        let mut guard = scheduler.blocking_lock();
        f(&mut guard)
    })
    .await?;
    Ok(out)
}

/// Final save; a failure is logged and never ends the process.
fn save_state(scheduler: &mut ServiceScheduler) -> bool {
    match scheduler.state_mut().save() {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Failed to save service state: {}", e);
            false
        }
    }
}

/// `DEBUG=1` (anything but empty or `0`) forces debug output.
fn debug_requested(verbose: bool, debug_env: Option<&str>) -> bool {
    verbose || debug_env.is_some_and(|v| !v.is_empty() && v != "0")
}

fn log_filter(debug: bool) -> EnvFilter {
    let directives = if debug {
        "wiggum_orchestrator=debug,wiggum_scheduler=debug,wiggum_core=debug"
    } else {
        "wiggum_orchestrator=info,wiggum_scheduler=info,wiggum_core=info"
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives))
}

fn file_subscriber(path: &Path, filter: EnvFilter) -> Result<impl tracing::Subscriber + Send + Sync + 'static> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    Ok(tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .finish())
}

fn init_logging(cli: &Cli) -> Result<()> {
    let debug = debug_requested(cli.verbose, std::env::var("DEBUG").ok().as_deref());
    let filter = log_filter(debug);
    match cli.log_file.as_deref() {
        Some(path) => tracing::subscriber::set_global_default(file_subscriber(&expand_path(path), filter)?)?,
        None => tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init(),
    }
    Ok(())
}

/// Reload the worker pool, dropping workers that exited while we were down.
fn recover_workers(state_dir: &Path) -> WorkerPool {
    let mut pool = WorkerPool::new(state_dir);
    let live = pool.restore();
    if live > 0 {
        tracing::info!("👷 {} workers from a previous run still alive", live);
    }
    if let Err(e) = pool.save() {
        tracing::warn!("Failed to save worker pool: {}", e);
    }
    pool
}

fn build_scheduler(cli: &Cli, home: &Path, project_dir: &Path, config: &OrchestratorConfig) -> Result<ServiceScheduler> {
    let mode: RunMode = cli.run_mode.parse()?;
    let flags = DisableFlags {
        no_resume: cli.no_resume,
        no_fix: cli.no_fix,
        no_merge: cli.no_merge,
        no_sync: cli.no_sync,
    };
    let state_dir = config.state_dir_in(project_dir);

    let mut services = load_services(home, &state_dir)?;
    apply_run_mode_filters(&mut services, mode, &flags);
    let registry = Arc::new(ServiceRegistry::new(services)?);

    let mut state = StateStore::new(&state_dir);
    if state.restore() {
        tracing::info!("📂 Restored service state from {}", state.state_file().display());
    }

    let executor = Arc::new(BridgeExecutor::new(
        config.bridge_path(home),
        home.to_path_buf(),
        project_dir.to_path_buf(),
        state_dir,
        mode.as_str(),
        Duration::from_secs(config.batch_timeout_secs),
    ));

    Ok(ServiceScheduler::new(registry, state, executor)
        .with_max_cascade_depth(config.max_cascade_depth)
        .with_condition_env(Box::new(RunModeEnv { mode })))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli)?;

    let home = resolve_home(&cli);
    let project_dir = match cli.project_dir.as_deref() {
        Some(dir) => expand_path(dir),
        None => std::env::current_dir()?,
    };
    let config = OrchestratorConfig::load(&home)?;
    let tick_secs = cli.tick.unwrap_or(config.tick_interval_secs).max(1);

    let scheduler = build_scheduler(&cli, &home, &project_dir, &config)?;
    tracing::info!(
        "🔁 Wiggum Orchestrator v{} ({} services, tick {}s, mode {})",
        env!("CARGO_PKG_VERSION"),
        scheduler.registry().count(),
        tick_secs,
        cli.run_mode
    );
    let mut workers = recover_workers(&config.state_dir_in(&project_dir));
    let interrupt = scheduler.interrupt_handle();
    let scheduler = Arc::new(Mutex::new(scheduler));

    if !run_blocking(&scheduler, |s| s.run_phase(Phase::Startup)).await? {
        run_blocking(&scheduler, save_state).await?;
        anyhow::bail!("startup phase failed, aborting");
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("🛑 Interrupt received, stopping");
                interrupt.interrupt();
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                tracing::warn!("Cannot listen for Ctrl-C: {}", e);
                // Keep the sender alive so the loop is not told to stop
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    if cli.once {
        run_blocking(&scheduler, |s| s.run_tick()).await?;
    } else {
        tracing::info!("⏰ Tick loop started (every {}s)", tick_secs);
        let mut interval = tokio::time::interval(Duration::from_secs(tick_secs));
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                _ = interval.tick() => {
                    run_blocking(&scheduler, |s| s.run_tick()).await?;
                }
            }
        }
    }

    run_blocking(&scheduler, |s| {
        s.run_phase(Phase::Shutdown);
        save_state(s);
    })
    .await?;
    workers.cleanup_finished(|_| {});
    if let Err(e) = workers.save() {
        tracing::warn!("Failed to save worker pool: {}", e);
    }
    tracing::info!("👋 Orchestrator stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from([
            "wiggum-orchestrator",
            "--home",
            "/opt/wiggum",
            "--run-mode",
            "merge-only",
            "--no-sync",
            "--once",
            "--tick",
            "10",
            "--log-file",
            "/tmp/wiggum.log",
        ]);
        assert_eq!(resolve_home(&cli), PathBuf::from("/opt/wiggum"));
        assert_eq!(cli.run_mode.parse::<RunMode>().unwrap(), RunMode::MergeOnly);
        assert!(cli.no_sync && cli.once && !cli.no_fix);
        assert_eq!(cli.tick, Some(10));
        assert_eq!(cli.log_file.as_deref(), Some("/tmp/wiggum.log"));
    }

    #[test]
    fn test_run_mode_env_overrides_variable() {
        let env = RunModeEnv { mode: RunMode::FixOnly };
        assert_eq!(env.var("WIGGUM_RUN_MODE").as_deref(), Some("fix-only"));
        assert!(env.var("WIGGUM_SURELY_UNSET_VARIABLE").is_none());
    }

    #[test]
    fn test_save_failure_is_logged_not_returned() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let executor = Arc::new(BridgeExecutor::new(
            dir.path().join("bridge.sh"),
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
            blocker.clone(),
            "default",
            Duration::from_secs(1),
        ));
        let registry = Arc::new(ServiceRegistry::new(Vec::new()).unwrap());
        let mut scheduler = ServiceScheduler::new(registry, StateStore::new(&blocker), executor);
        scheduler.state_mut().mark_failed("svc");

        assert!(!save_state(&mut scheduler));
        assert!(scheduler.state().is_dirty());
    }

    #[test]
    fn test_debug_env_forces_debug() {
        assert!(debug_requested(true, None));
        assert!(debug_requested(false, Some("1")));
        assert!(!debug_requested(false, Some("0")));
        assert!(!debug_requested(false, Some("")));
        assert!(!debug_requested(false, None));
    }

    #[test]
    fn test_log_file_receives_json_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("logs/orchestrator.log");
        let subscriber = file_subscriber(&path, EnvFilter::new("info")).unwrap();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("file test message");
            tracing::debug!("filtered out");
        });

        let content = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["fields"]["message"], "file test message");
        assert!(!content.contains("filtered out"));
    }

    #[cfg(unix)]
    #[test]
    fn test_recover_workers_drops_dead_pids() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut pool = WorkerPool::new(dir.path());
        pool.add(std::process::id(), "main", "TASK-001");
        pool.add(999_999_991, "fix", "TASK-002");
        pool.save().unwrap();

        let recovered = recover_workers(dir.path());
        assert_eq!(recovered.all_pids(), vec![std::process::id()]);
        let saved = std::fs::read_to_string(recovered.pool_file()).unwrap();
        assert!(saved.contains("TASK-001"));
        assert!(!saved.contains("TASK-002"));
    }

    #[test]
    fn test_build_scheduler_from_home() {
        let home = tempfile::TempDir::new().unwrap();
        let project = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(home.path().join("config")).unwrap();
        std::fs::write(
            home.path().join("config/services.json"),
            r#"{"services": [
                {"id": "fix-workers", "phase": "periodic",
                 "execution": {"type": "function", "function": "svc_fix"}},
                {"id": "boot", "phase": "startup",
                 "execution": {"type": "command", "command": "true"}}
            ]}"#,
        )
        .unwrap();
        let cli = Cli::parse_from(["wiggum-orchestrator", "--run-mode", "merge-only"]);
        let config = OrchestratorConfig::default();
        let scheduler = build_scheduler(&cli, home.path(), project.path(), &config).unwrap();
        assert_eq!(scheduler.registry().count(), 2);
        assert!(scheduler.registry().enabled_for_phase(Phase::Periodic).is_empty());
        assert_eq!(scheduler.state().state_file(), project.path().join(".ralph/services/state.json"));
    }
}
