//! Worker pool: PIDs of spawned workers, keyed by pid and grouped by type.
//!
//! Persisted to `<state_dir>/orchestrator/pool.json` with the same temp file
//! then rename write as the state store. Restore keeps only live workers.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use wiggum_core::Result;

use crate::liveness::{ProcessProbe, SignalProbe};
use crate::state::now_secs;

/// One tracked worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub pid: u32,
    #[serde(rename = "type")]
    pub worker_type: String,
    pub task_id: String,
    #[serde(default)]
    pub started_at: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PoolDocument {
    #[serde(default)]
    saved_at: i64,
    #[serde(default)]
    workers: Vec<WorkerEntry>,
}

pub struct WorkerPool {
    workers: BTreeMap<u32, WorkerEntry>,
    pool_file: PathBuf,
    probe: Arc<dyn ProcessProbe>,
}

impl WorkerPool {
    pub fn new(state_dir: &Path) -> Self {
        Self::with_probe(state_dir, Arc::new(SignalProbe))
    }

    pub fn with_probe(state_dir: &Path, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            workers: BTreeMap::new(),
            pool_file: state_dir.join("orchestrator").join("pool.json"),
            probe,
        }
    }

    pub fn pool_file(&self) -> &Path {
        &self.pool_file
    }

    /// Track a worker. Re-adding a pid replaces its entry.
    pub fn add(&mut self, pid: u32, worker_type: &str, task_id: &str) {
        tracing::debug!("Tracking {} worker pid={} task={}", worker_type, pid, task_id);
        self.workers.insert(
            pid,
            WorkerEntry {
                pid,
                worker_type: worker_type.to_string(),
                task_id: task_id.to_string(),
                started_at: now_secs(),
            },
        );
    }

    pub fn remove(&mut self, pid: u32) -> Option<WorkerEntry> {
        self.workers.remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Number of workers of one type.
    pub fn count(&self, worker_type: &str) -> usize {
        self.workers.values().filter(|w| w.worker_type == worker_type).count()
    }

    pub fn get_by_type(&self, worker_type: &str) -> Vec<&WorkerEntry> {
        self.workers.values().filter(|w| w.worker_type == worker_type).collect()
    }

    pub fn all_pids(&self) -> Vec<u32> {
        self.workers.keys().copied().collect()
    }

    /// Drop every worker whose process has exited, calling `on_complete` for
    /// each one. Returns the removed entries in pid order.
    pub fn cleanup_finished<F>(&mut self, mut on_complete: F) -> Vec<WorkerEntry>
    where
        F: FnMut(&WorkerEntry),
    {
        let finished: Vec<u32> = self
            .workers
            .keys()
            .copied()
            .filter(|pid| !self.probe.is_alive(*pid))
            .collect();

        let mut done = Vec::with_capacity(finished.len());
        for pid in finished {
            if let Some(entry) = self.workers.remove(&pid) {
                tracing::info!("✅ {} worker for {} finished (pid={})", entry.worker_type, entry.task_id, pid);
                on_complete(&entry);
                done.push(entry);
            }
        }
        done
    }

    /// Write the pool atomically.
    pub fn save(&self) -> Result<()> {
        let doc = PoolDocument {
            saved_at: now_secs(),
            workers: self.workers.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&doc)?;

        let dir = self
            .pool_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.pool_file).map_err(|e| e.error)?;
        Ok(())
    }

    /// Load saved workers, keeping only those still alive. Returns how many
    /// were restored; a missing or unreadable file restores none.
    pub fn restore(&mut self) -> usize {
        let content = match std::fs::read_to_string(&self.pool_file) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                tracing::warn!("Failed to read worker pool {}: {}", self.pool_file.display(), e);
                return 0;
            }
        };
        let doc: PoolDocument = match serde_json::from_str(&content) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Ignoring corrupt worker pool {}: {}", self.pool_file.display(), e);
                return 0;
            }
        };

        let mut restored = 0;
        for entry in doc.workers {
            if self.probe.is_alive(entry.pid) {
                self.workers.insert(entry.pid, entry);
                restored += 1;
            } else {
                tracing::debug!("Dropping dead worker pid={} ({})", entry.pid, entry.task_id);
            }
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEAD_A: u32 = 999_999_991;
    const DEAD_B: u32 = 999_999_992;

    /// Only this test process counts as alive.
    fn pool_in(dir: &Path) -> WorkerPool {
        let me = std::process::id();
        WorkerPool::with_probe(dir, Arc::new(move |pid: u32| pid == me))
    }

    #[test]
    fn test_add_and_count() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut pool = pool_in(dir.path());
        pool.add(100, "main", "TASK-001");
        pool.add(200, "fix", "TASK-002");
        pool.add(300, "main", "TASK-003");

        assert_eq!(pool.len(), 3);
        assert_eq!(pool.count("main"), 2);
        assert_eq!(pool.count("fix"), 1);
        assert_eq!(pool.count("resolve"), 0);
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut pool = pool_in(dir.path());
        pool.add(100, "main", "TASK-001");
        let entry = pool.remove(100).unwrap();
        assert_eq!(entry.task_id, "TASK-001");
        assert!(pool.is_empty());
        assert!(pool.remove(999).is_none());
    }

    #[test]
    fn test_get_by_type_and_all_pids() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut pool = pool_in(dir.path());
        pool.add(100, "main", "TASK-001");
        pool.add(200, "fix", "TASK-002");
        pool.add(300, "main", "TASK-003");

        assert_eq!(pool.get_by_type("main").len(), 2);
        let fix = pool.get_by_type("fix");
        assert_eq!(fix.len(), 1);
        assert_eq!(fix[0].task_id, "TASK-002");
        assert_eq!(pool.all_pids(), vec![100, 200, 300]);
    }

    #[test]
    fn test_cleanup_finished() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut pool = pool_in(dir.path());
        pool.add(DEAD_A, "main", "TASK-001");
        pool.add(DEAD_B, "fix", "TASK-002");

        let mut completed = Vec::new();
        let removed = pool.cleanup_finished(|w| completed.push(w.task_id.clone()));
        assert_eq!(completed, vec!["TASK-001", "TASK-002"]);
        assert_eq!(removed.len(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_cleanup_preserves_running() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut pool = pool_in(dir.path());
        pool.add(std::process::id(), "main", "TASK-001");
        pool.add(DEAD_A, "fix", "TASK-002");

        let completed = pool.cleanup_finished(|_| {});
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].task_id, "TASK-002");
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_save_and_restore() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut pool = pool_in(dir.path());
        pool.add(std::process::id(), "main", "TASK-001");
        pool.save().unwrap();
        assert!(dir.path().join("orchestrator/pool.json").is_file());

        let mut fresh = pool_in(dir.path());
        assert_eq!(fresh.restore(), 1);
        assert_eq!(fresh.count("main"), 1);
        assert_eq!(fresh.get_by_type("main")[0].task_id, "TASK-001");
    }

    #[test]
    fn test_restore_skips_dead_pids() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut pool = pool_in(dir.path());
        pool.add(DEAD_A, "main", "TASK-001");
        pool.save().unwrap();

        let mut fresh = pool_in(dir.path());
        assert_eq!(fresh.restore(), 0);
        assert!(fresh.is_empty());
    }

    #[test]
    fn test_restore_missing_or_corrupt() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut pool = pool_in(dir.path());
        assert_eq!(pool.restore(), 0);

        std::fs::create_dir_all(dir.path().join("orchestrator")).unwrap();
        std::fs::write(pool.pool_file(), "{not json").unwrap();
        assert_eq!(pool.restore(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_liveness_sees_own_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut pool = WorkerPool::new(dir.path());
        pool.add(std::process::id(), "main", "TASK-001");
        assert!(pool.cleanup_finished(|_| {}).is_empty());
    }
}
