//! Orchestrator runtime configuration (`config/orchestrator.toml`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result};

/// Runtime settings for the dispatch loop. Every field has a default, so an
/// absent file yields a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Seconds between periodic passes.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Project state directory, relative to the project dir.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Bridge script, relative to the orchestrator home.
    #[serde(default = "default_bridge_script")]
    pub bridge_script: String,
    /// Upper bound for one batched phase call.
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_secs: u64,
    /// Max event cascade depth within one periodic pass.
    #[serde(default = "default_max_cascade_depth")]
    pub max_cascade_depth: usize,
}

fn default_tick_interval() -> u64 { 5 }
fn default_state_dir() -> String { ".ralph".into() }
fn default_bridge_script() -> String { "lib/orchestrator/bash-bridge.sh".into() }
fn default_batch_timeout() -> u64 { 600 }
fn default_max_cascade_depth() -> usize { 8 }

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            state_dir: default_state_dir(),
            bridge_script: default_bridge_script(),
            batch_timeout_secs: default_batch_timeout(),
            max_cascade_depth: default_max_cascade_depth(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from `<home>/config/orchestrator.toml`, or defaults if absent.
    pub fn load(home: &Path) -> Result<Self> {
        let path = Self::path_in(home);
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::Config(format!("Failed to read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&content)?;
        if config.tick_interval_secs == 0 {
            return Err(OrchestratorError::Config("tick_interval_secs must be > 0".into()));
        }
        Ok(config)
    }

    pub fn path_in(home: &Path) -> PathBuf {
        home.join("config").join("orchestrator.toml")
    }

    /// Default orchestrator home (~/.wiggum).
    pub fn default_home() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".wiggum")
    }

    /// Resolve the project state directory.
    pub fn state_dir_in(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.state_dir)
    }

    /// Resolve the bridge script path.
    pub fn bridge_path(&self, home: &Path) -> PathBuf {
        home.join(&self.bridge_script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let home = tempfile::TempDir::new().unwrap();
        let config = OrchestratorConfig::load(home.path()).unwrap();
        assert_eq!(config.tick_interval_secs, 5);
        assert_eq!(config.max_cascade_depth, 8);
        assert_eq!(config.state_dir_in(Path::new("/p")), PathBuf::from("/p/.ralph"));
    }

    #[test]
    fn test_partial_file() {
        let home = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(home.path().join("config")).unwrap();
        std::fs::write(
            OrchestratorConfig::path_in(home.path()),
            "tick_interval_secs = 30\nmax_cascade_depth = 2\n",
        )
        .unwrap();
        let config = OrchestratorConfig::load(home.path()).unwrap();
        assert_eq!(config.tick_interval_secs, 30);
        assert_eq!(config.max_cascade_depth, 2);
        assert_eq!(config.batch_timeout_secs, 600);
    }

    #[test]
    fn test_invalid_toml() {
        let home = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(home.path().join("config")).unwrap();
        std::fs::write(OrchestratorConfig::path_in(home.path()), "tick_interval_secs = \"soon\"").unwrap();
        assert!(matches!(OrchestratorConfig::load(home.path()), Err(OrchestratorError::Toml(_))));
    }
}
