//! Crash-safe JSON snapshot of the state store.
//!
//! The document layout is shared with other tools that read
//! `services/state.json`, so field names and nesting are fixed:
//!
//! ```text
//! { "version": "1.0", "saved_at": <secs>,
//!   "services": { "<id>": { last_run, status, run_count, fail_count, pid,
//!                           circuit { state, opened_at, half_open_attempts },
//!                           metrics { total_duration_ms, success_count, last_duration_ms,
//!                                     min_duration_ms, max_duration_ms },
//!                           queue, backoff_until, retry_count, last_success } } }
//! ```
//!
//! Writes go to a temp file in the same directory and are renamed over the
//! target, so readers never observe a partial document.

use std::collections::BTreeMap;
use std::io::Write;

use serde::{Deserialize, Deserializer, Serialize};
use tempfile::NamedTempFile;
use wiggum_core::Result;

use crate::state::{CircuitState, ServiceRuntimeState, ServiceStatus, StateStore, now_secs};

pub const STATE_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default)]
    version: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    saved_at: i64,
    #[serde(default)]
    services: BTreeMap<String, PersistedService>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct PersistedService {
    #[serde(deserialize_with = "lenient_i64")]
    last_run: i64,
    #[serde(deserialize_with = "lenient_status")]
    status: String,
    #[serde(deserialize_with = "lenient_u64")]
    run_count: u64,
    #[serde(deserialize_with = "lenient_u64")]
    fail_count: u64,
    #[serde(deserialize_with = "lenient_pid")]
    pid: Option<u32>,
    circuit: PersistedCircuit,
    metrics: PersistedMetrics,
    queue: Vec<serde_json::Value>,
    #[serde(deserialize_with = "lenient_i64")]
    backoff_until: i64,
    #[serde(deserialize_with = "lenient_u64")]
    retry_count: u64,
    #[serde(deserialize_with = "lenient_i64")]
    last_success: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct PersistedCircuit {
    #[serde(deserialize_with = "lenient_status")]
    state: String,
    #[serde(deserialize_with = "lenient_i64")]
    opened_at: i64,
    #[serde(deserialize_with = "lenient_u64")]
    half_open_attempts: u64,
}

impl Default for PersistedCircuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed.as_str().to_string(),
            opened_at: 0,
            half_open_attempts: 0,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct PersistedMetrics {
    #[serde(deserialize_with = "lenient_u64")]
    total_duration_ms: u64,
    #[serde(deserialize_with = "lenient_u64")]
    success_count: u64,
    #[serde(deserialize_with = "lenient_u64")]
    last_duration_ms: u64,
    #[serde(deserialize_with = "lenient_u64")]
    min_duration_ms: u64,
    #[serde(deserialize_with = "lenient_u64")]
    max_duration_ms: u64,
}

// Other writers may emit floats or nulls for counters.
fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    Ok(match v {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        _ => 0,
    })
}

fn lenient_u64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    Ok(u64::try_from(lenient_i64(d)?).unwrap_or(0))
}

fn lenient_pid<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u32>, D::Error> {
    let raw = lenient_i64(d)?;
    Ok(u32::try_from(raw).ok().filter(|&p| p > 0))
}

fn lenient_status<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    Ok(v.as_str().unwrap_or_default().to_string())
}

fn clamp_u32(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

impl From<&ServiceRuntimeState> for PersistedService {
    fn from(s: &ServiceRuntimeState) -> Self {
        Self {
            last_run: s.last_run,
            status: s.status.as_str().to_string(),
            run_count: s.run_count,
            fail_count: u64::from(s.fail_count),
            pid: s.pid,
            circuit: PersistedCircuit {
                state: s.circuit_state.as_str().to_string(),
                opened_at: s.circuit_opened_at,
                half_open_attempts: u64::from(s.half_open_attempts),
            },
            metrics: PersistedMetrics {
                total_duration_ms: s.total_duration_ms,
                success_count: s.success_count,
                last_duration_ms: s.last_duration_ms,
                min_duration_ms: s.min_duration_ms.unwrap_or(0),
                max_duration_ms: s.max_duration_ms,
            },
            queue: s.queue.clone(),
            backoff_until: s.backoff_until,
            retry_count: u64::from(s.retry_count),
            last_success: s.last_success,
        }
    }
}

impl From<PersistedService> for ServiceRuntimeState {
    fn from(p: PersistedService) -> Self {
        Self {
            last_run: p.last_run,
            status: ServiceStatus::parse(&p.status),
            run_count: p.run_count,
            fail_count: clamp_u32(p.fail_count),
            success_count: p.metrics.success_count,
            last_success: p.last_success,
            pid: p.pid,
            retry_count: clamp_u32(p.retry_count),
            backoff_until: p.backoff_until,
            circuit_state: CircuitState::parse(&p.circuit.state),
            circuit_opened_at: p.circuit.opened_at,
            half_open_attempts: clamp_u32(p.circuit.half_open_attempts),
            last_duration_ms: p.metrics.last_duration_ms,
            // 0 on disk means "no sample" only when nothing has run yet
            min_duration_ms: (p.run_count > 0).then_some(p.metrics.min_duration_ms),
            max_duration_ms: p.metrics.max_duration_ms,
            total_duration_ms: p.metrics.total_duration_ms,
            last_exit_code: None,
            queue: p.queue,
        }
    }
}

impl StateStore {
    /// Write the full snapshot atomically and clear the dirty flag.
    pub fn save(&mut self) -> Result<()> {
        let doc = StateDocument {
            version: STATE_VERSION.to_string(),
            saved_at: now_secs(),
            services: self
                .entries
                .iter()
                .map(|(id, s)| (id.clone(), PersistedService::from(s)))
                .collect(),
        };
        let json = serde_json::to_string_pretty(&doc)?;

        let dir = self
            .state_file
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.state_file).map_err(|e| e.error)?;

        self.dirty = false;
        tracing::debug!("Saved state for {} services to {}", self.entries.len(), self.state_file.display());
        Ok(())
    }

    /// Save only when something changed since the last save.
    pub fn save_if_dirty(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Load the snapshot, replacing in-memory records for every id present.
    /// Missing or corrupt files restore nothing and return false.
    pub fn restore(&mut self) -> bool {
        let content = match std::fs::read_to_string(&self.state_file) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No saved state at {}", self.state_file.display());
                return false;
            }
            Err(e) => {
                tracing::warn!("Failed to read state file {}: {}", self.state_file.display(), e);
                return false;
            }
        };
        let doc: StateDocument = match serde_json::from_str(&content) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Ignoring corrupt state file {}: {}", self.state_file.display(), e);
                return false;
            }
        };
        if !doc.version.is_empty() && doc.version != STATE_VERSION {
            tracing::warn!("State file version {} differs from {}, loading anyway", doc.version, STATE_VERSION);
        }

        let mut demoted = 0usize;
        let count = doc.services.len();
        for (id, persisted) in doc.services {
            let mut state = ServiceRuntimeState::from(persisted);
            if state.status == ServiceStatus::Running {
                let alive = state.pid.is_some_and(|pid| self.probe.is_alive(pid));
                if !alive {
                    state.status = ServiceStatus::Stopped;
                    state.pid = None;
                    demoted += 1;
                }
            } else {
                // Only a confirmed live run survives a restart
                state.status = ServiceStatus::Stopped;
                state.pid = None;
            }
            self.entries.insert(id, state);
        }
        if demoted > 0 {
            tracing::info!("Restore: {} stale running services marked stopped", demoted);
            self.dirty = true;
        }
        tracing::info!("Restored state for {} services", count);
        true
    }
}
