//! Service config loading: `config/services.json` plus project overrides.
//!
//! Load order: parse (with file-level defaults) → project overrides →
//! trigger normalization → validation. Run-mode filters are applied by the
//! caller before the registry is built.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{OrchestratorError, Result};
use crate::service::{EventKind, ExecutionSpec, RestartPolicy, ScheduleSpec, ServiceDefinition};

/// Root shape of `services.json`.
#[derive(Debug, Deserialize)]
struct ServicesFile {
    #[serde(default)]
    defaults: ServiceDefaults,
    #[serde(default)]
    services: Vec<Value>,
}

/// File-level defaults inherited by services that omit the field.
#[derive(Debug, Default, Deserialize)]
struct ServiceDefaults {
    timeout: Option<u64>,
    restart_policy: Option<RestartPolicy>,
}

/// Root shape of the project override file.
#[derive(Debug, Default, Deserialize)]
pub struct ServiceOverrides {
    #[serde(default)]
    pub services: Vec<ServiceOverride>,
}

/// One override entry. Only these fields may be changed.
#[derive(Debug, Default, Deserialize)]
pub struct ServiceOverride {
    #[serde(default)]
    pub id: String,
    pub enabled: Option<bool>,
    /// Shallow-merged into the service's schedule.
    pub schedule: Option<Map<String, Value>>,
    /// Shallow-merged into the service's concurrency.
    pub concurrency: Option<Map<String, Value>>,
}

/// Path of the shipped service config under the orchestrator home.
pub fn services_path(home: &Path) -> PathBuf {
    home.join("config").join("services.json")
}

/// Path of the per-project override file under the project state dir.
pub fn overrides_path(state_dir: &Path) -> PathBuf {
    state_dir.join("services.json")
}

/// Load, override, normalize and validate all services.
pub fn load_services(home: &Path, state_dir: &Path) -> Result<Vec<ServiceDefinition>> {
    let path = services_path(home);
    if !path.exists() {
        return Err(OrchestratorError::ConfigNotFound(path));
    }
    let content = std::fs::read_to_string(&path)?;
    let mut services = parse_services(&content, &path)?;

    let override_path = overrides_path(state_dir);
    if override_path.exists() {
        let content = std::fs::read_to_string(&override_path)?;
        let overrides: ServiceOverrides =
            serde_json::from_str(&content).map_err(|source| OrchestratorError::ConfigParse {
                path: override_path.clone(),
                source,
            })?;
        apply_overrides(&mut services, &overrides)?;
        tracing::debug!("Applied {} overrides from {}", overrides.services.len(), override_path.display());
    }

    normalize_triggers(&mut services);
    validate_all(&services)?;

    tracing::info!("Loaded {} services from {}", services.len(), path.display());
    Ok(services)
}

/// Parse a `services.json` document. `path` is only used for error reports.
pub fn parse_services(content: &str, path: &Path) -> Result<Vec<ServiceDefinition>> {
    let file: ServicesFile = serde_json::from_str(content).map_err(|source| OrchestratorError::ConfigParse {
        path: path.to_path_buf(),
        source,
    })?;

    let restart_default = match &file.defaults.restart_policy {
        Some(policy) => Some(serde_json::to_value(policy)?),
        None => None,
    };

    let mut services = Vec::with_capacity(file.services.len());
    for mut raw in file.services {
        let id = raw.get("id").and_then(Value::as_str).unwrap_or("<missing id>").to_string();
        if let Value::Object(obj) = &mut raw {
            if let Some(timeout) = file.defaults.timeout {
                obj.entry("timeout").or_insert_with(|| Value::from(timeout));
            }
            if let Some(policy) = &restart_default {
                obj.entry("restart_policy").or_insert_with(|| policy.clone());
            }
        }
        let mut svc: ServiceDefinition =
            serde_json::from_value(raw).map_err(|e| OrchestratorError::invalid(&id, e.to_string()))?;
        if let ExecutionSpec::Pipeline { pipeline, .. } = &mut svc.execution {
            if pipeline.is_empty() {
                *pipeline = svc.id.clone();
            }
        }
        services.push(svc);
    }
    Ok(services)
}

/// Apply project overrides in place. Unknown ids are ignored.
pub fn apply_overrides(services: &mut [ServiceDefinition], overrides: &ServiceOverrides) -> Result<()> {
    for ov in &overrides.services {
        let Some(svc) = services.iter_mut().find(|s| s.id == ov.id) else {
            tracing::debug!("Override for unknown service '{}' ignored", ov.id);
            continue;
        };
        if let Some(enabled) = ov.enabled {
            svc.enabled = enabled;
        }
        if let Some(patch) = &ov.schedule {
            svc.schedule = shallow_merge(&svc.schedule, patch)
                .map_err(|e| OrchestratorError::invalid(&svc.id, format!("schedule override: {e}")))?;
        }
        if let Some(patch) = &ov.concurrency {
            svc.concurrency = shallow_merge(&svc.concurrency, patch)
                .map_err(|e| OrchestratorError::invalid(&svc.id, format!("concurrency override: {e}")))?;
        }
    }
    Ok(())
}

fn shallow_merge<T: Serialize + DeserializeOwned>(current: &T, patch: &Map<String, Value>) -> serde_json::Result<T> {
    let mut value = serde_json::to_value(current)?;
    if let Value::Object(obj) = &mut value {
        for (key, v) in patch {
            obj.insert(key.clone(), v.clone());
        }
    }
    serde_json::from_value(value)
}

/// Rewrite `triggers.on_complete/on_failure/on_finish` into an event schedule.
///
/// `on_complete: [X]` → `service.succeeded:X`, `on_failure: [Y]` →
/// `service.failed:Y`, `on_finish: [Z]` → `service.completed:Z`. The raw
/// triggers are always cleared afterwards.
pub fn normalize_triggers(services: &mut [ServiceDefinition]) {
    for svc in services.iter_mut() {
        let Some(triggers) = svc.triggers.take() else {
            continue;
        };
        let patterns: Vec<String> = triggers
            .on_complete
            .iter()
            .map(|id| EventKind::Succeeded.event_name(id))
            .chain(triggers.on_failure.iter().map(|id| EventKind::Failed.event_name(id)))
            .chain(triggers.on_finish.iter().map(|id| EventKind::Completed.event_name(id)))
            .collect();
        if !patterns.is_empty() {
            svc.schedule = ScheduleSpec::Event { trigger: patterns };
        }
    }
}

fn validate_all(services: &[ServiceDefinition]) -> Result<()> {
    let mut seen = HashSet::new();
    for svc in services {
        if !seen.insert(svc.id.as_str()) {
            return Err(OrchestratorError::DuplicateService(svc.id.clone()));
        }
        svc.validate()?;
    }
    Ok(())
}

// ─── Run-mode filters ──────────────────────────────────────

/// Which slice of the orchestrator this run is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Default,
    FixOnly,
    MergeOnly,
    ResumeOnly,
}

impl FromStr for RunMode {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(RunMode::Default),
            "fix-only" => Ok(RunMode::FixOnly),
            "merge-only" => Ok(RunMode::MergeOnly),
            "resume-only" => Ok(RunMode::ResumeOnly),
            other => Err(OrchestratorError::Config(format!("Unknown run mode: '{other}'"))),
        }
    }
}

impl RunMode {
    /// Value exported to services as `WIGGUM_RUN_MODE`.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Default => "default",
            RunMode::FixOnly => "fix-only",
            RunMode::MergeOnly => "merge-only",
            RunMode::ResumeOnly => "resume-only",
        }
    }
}

/// `--no-*` switches that turn off groups of services.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisableFlags {
    pub no_resume: bool,
    pub no_fix: bool,
    pub no_merge: bool,
    pub no_sync: bool,
}

/// Disable services according to the run mode and flags.
pub fn apply_run_mode_filters(services: &mut [ServiceDefinition], mode: RunMode, flags: &DisableFlags) {
    let mut off: Vec<&str> = Vec::new();
    match mode {
        RunMode::MergeOnly => off.extend(["fix-workers", "multi-pr-planner"]),
        RunMode::ResumeOnly => {
            off.extend(["fix-workers", "multi-pr-planner", "resolve-workers", "orphan-workspace"])
        }
        RunMode::Default | RunMode::FixOnly => {}
    }
    if flags.no_resume {
        off.extend(["resume-poll", "resume-decide"]);
    }
    if flags.no_fix {
        off.extend(["fix-workers", "multi-pr-planner"]);
    }
    if flags.no_merge {
        off.push("resolve-workers");
    }
    if flags.no_sync {
        off.extend(["github-issue-sync", "github-plan-sync", "pr-sync"]);
    }

    for svc in services.iter_mut().filter(|s| off.contains(&s.id.as_str())) {
        if svc.enabled {
            tracing::debug!("Service '{}' disabled by run mode", svc.id);
        }
        svc.enabled = false;
    }
}
