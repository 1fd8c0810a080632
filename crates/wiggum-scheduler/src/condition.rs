//! Condition evaluation against the live environment and filesystem.

use std::path::Path;

use wiggum_core::Condition;

/// Inputs a condition may read. Read at evaluation time, never cached.
pub trait ConditionEnv: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
    fn path_exists(&self, path: &str) -> bool;
}

/// The real process environment and filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl ConditionEnv for SystemEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn path_exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }
}

/// True when the condition holds. Unset variables compare as "".
pub fn evaluate(condition: &Condition, env: &dyn ConditionEnv) -> bool {
    match condition {
        Condition::EnvEquals(vars) => vars
            .iter()
            .all(|(name, expected)| env.var(name).unwrap_or_default() == *expected),
        Condition::EnvNotEquals(vars) => vars
            .iter()
            .all(|(name, rejected)| env.var(name).unwrap_or_default() != *rejected),
        Condition::FileExists(path) => env.path_exists(path),
    }
}
