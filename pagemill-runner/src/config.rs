//! Pool configuration.
//!
//! Values are layered: built-in defaults, then a TOML file, then the
//! `PAGEMILL_JOBS` / `PAGEMILL_POLL_MS` environment variables, then whatever
//! the caller sets with the builder methods.

use pagemill_core::{PagemillError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cores::available_concurrency;

/// File looked up in the current directory when no config path is given
pub const DEFAULT_CONFIG_FILE: &str = "pagemill.toml";

pub const ENV_JOBS: &str = "PAGEMILL_JOBS";
pub const ENV_POLL_MS: &str = "PAGEMILL_POLL_MS";

/// What a pool does when a command cannot be spawned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnFailurePolicy {
    /// Log the failure, count the command as consumed and keep going
    #[default]
    Skip,
    /// Return the error from `run()`, leaving the rest of the backlog queued
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub max_concurrency: Option<usize>,
    pub poll_interval_ms: u64,
    pub shell: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub on_spawn_failure: SpawnFailurePolicy,
    pub collect_outcomes: bool,
    pub kill_grace_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            poll_interval_ms: 100,
            shell: None,
            working_dir: None,
            on_spawn_failure: SpawnFailurePolicy::Skip,
            collect_outcomes: false,
            kill_grace_ms: 500,
        }
    }
}

impl PoolConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PoolConfig = toml::from_str(content)
            .map_err(|e| PagemillError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Load `path` if given, else `pagemill.toml` from the current directory
    /// if it exists, else the defaults. Environment overrides are applied.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => Self::load(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.with_env()
    }

    pub fn with_env(self) -> Result<Self> {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    fn with_env_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(jobs) = lookup(ENV_JOBS) {
            let jobs = jobs.trim().parse::<usize>().map_err(|e| {
                PagemillError::InvalidConfiguration(format!("{}={:?}: {}", ENV_JOBS, jobs, e))
            })?;
            self.max_concurrency = Some(jobs);
        }
        if let Some(poll) = lookup(ENV_POLL_MS) {
            self.poll_interval_ms = poll.trim().parse::<u64>().map_err(|e| {
                PagemillError::InvalidConfiguration(format!("{}={:?}: {}", ENV_POLL_MS, poll, e))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == Some(0) {
            return Err(PagemillError::InvalidConfiguration(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if let Some(shell) = &self.shell {
            if shell.trim().is_empty() {
                return Err(PagemillError::InvalidConfiguration(
                    "shell must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn with_working_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    pub fn with_spawn_failure_policy(mut self, policy: SpawnFailurePolicy) -> Self {
        self.on_spawn_failure = policy;
        self
    }

    pub fn with_outcomes(mut self, collect: bool) -> Self {
        self.collect_outcomes = collect;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Poll interval, never shorter than one millisecond
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn resolve_concurrency(&self) -> usize {
        match self.max_concurrency {
            Some(n) if n > 0 => n,
            _ => available_concurrency(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.max_concurrency, None);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.on_spawn_failure, SpawnFailurePolicy::Skip);
        assert!(!config.collect_outcomes);
        assert!(config.resolve_concurrency() > 0);
    }

    #[test]
    fn test_parse_toml() {
        let config = PoolConfig::from_toml_str(
            r#"
max_concurrency = 3
poll_interval_ms = 25
working_dir = "/tmp"
on_spawn_failure = "abort"
collect_outcomes = true
"#,
        )
        .unwrap();
        assert_eq!(config.max_concurrency, Some(3));
        assert_eq!(config.resolve_concurrency(), 3);
        assert_eq!(config.poll_interval(), Duration::from_millis(25));
        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(config.on_spawn_failure, SpawnFailurePolicy::Abort);
        assert!(config.collect_outcomes);
        assert_eq!(config.kill_grace_ms, 500);
    }

    #[test]
    fn test_parse_toml_rejects_unknown_keys() {
        assert!(PoolConfig::from_toml_str("jobs = 3").is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = PoolConfig::from_toml_str("max_concurrency = 0").unwrap_err();
        assert!(matches!(err, PagemillError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_zero_poll_interval_clamped() {
        let config = PoolConfig::default().with_poll_interval(Duration::ZERO);
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [(ENV_JOBS, "6"), (ENV_POLL_MS, " 40 ")].into_iter().collect();
        let config = PoolConfig::default()
            .with_env_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_concurrency, Some(6));
        assert_eq!(config.poll_interval_ms, 40);
    }

    #[test]
    fn test_env_invalid_jobs() {
        let result = PoolConfig::default().with_env_from(|key| {
            (key == ENV_JOBS).then(|| "many".to_string())
        });
        assert!(matches!(result, Err(PagemillError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pagemill.toml");
        std::fs::write(&path, "max_concurrency = 2\nshell = \"sh\"\n").unwrap();

        let config = PoolConfig::load(&path).unwrap();
        assert_eq!(config.max_concurrency, Some(2));
        assert_eq!(config.shell.as_deref(), Some("sh"));
    }
}
