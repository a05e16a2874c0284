//! Engine configuration
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! no file at all) is valid. Precedence: CLI flag > environment > file >
//! default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::{Display, EnumString};

/// Environment variable overriding [`EngineConfig::state_db`].
pub const STATE_DB_ENV: &str = "HOMESTEAD_STATE_DB";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub state_db: PathBuf,
    pub backup_dir: PathBuf,
    /// Upper bound for persisted output excerpts
    pub output_excerpt_bytes: usize,
    /// A lease whose heartbeat is older than this is considered abandoned
    pub lease_ttl_secs: u64,
    /// SIGTERM → SIGKILL grace when killing a process group
    pub kill_grace_ms: u64,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub limits: ResourceLimits,
}

/// Resource ceilings applied to every spawned command. `None` leaves the
/// inherited limit in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// RLIMIT_AS soft limit
    pub address_space_bytes: Option<u64>,
    /// RLIMIT_CPU soft limit
    pub cpu_secs: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            address_space_bytes: Some(2 * 1024 * 1024 * 1024),
            cpu_secs: Some(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
    /// Wall time allowed from a step's first attempt to the start of its last retry
    pub step_retry_budget_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub window_secs: u64,
    pub cooldown_secs: u64,
    pub on_open: BreakerAction,
}

/// What the engine does once the session breaker opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BreakerAction {
    /// Pause the session until the cool-down elapses
    #[default]
    Pause,
    /// Roll back everything the session applied
    Rollback,
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = home_dir().join(".homestead");
        Self {
            state_db: base.join("state.db"),
            backup_dir: base.join("backups"),
            output_excerpt_bytes: 4096,
            lease_ttl_secs: 60,
            kill_grace_ms: 5000,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            limits: ResourceLimits::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_ratio: 0.1,
            step_retry_budget_secs: 900,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 300,
            cooldown_secs: 30,
            on_open: BreakerAction::Pause,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn step_budget(&self) -> Duration {
        Duration::from_secs(self.step_retry_budget_secs)
    }
}

impl BreakerConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs as i64)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }
}

impl EngineConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;
        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;
        Ok(config)
    }

    /// File (if given) then environment overrides, validated.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Some(db) = std::env::var_os(STATE_DB_ENV) {
            if !db.is_empty() {
                self.state_db = PathBuf::from(db);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.state_db.as_os_str().is_empty() {
            anyhow::bail!("state_db must be specified");
        }
        if self.backup_dir.as_os_str().is_empty() {
            anyhow::bail!("backup_dir must be specified");
        }
        if self.output_excerpt_bytes < 64 {
            anyhow::bail!("output_excerpt_bytes must be at least 64");
        }
        if self.lease_ttl_secs == 0 {
            anyhow::bail!("lease_ttl_secs must be positive");
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            anyhow::bail!("retry.max_delay_ms must be >= retry.base_delay_ms");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            anyhow::bail!("retry.jitter_ratio must be between 0.0 and 1.0");
        }
        if self.retry.step_retry_budget_secs == 0 {
            anyhow::bail!("retry.step_retry_budget_secs must be positive");
        }
        if self.breaker.failure_threshold == 0 {
            anyhow::bail!("breaker.failure_threshold must be at least 1");
        }
        if self.breaker.window_secs == 0 {
            anyhow::bail!("breaker.window_secs must be positive");
        }
        if self.limits.address_space_bytes == Some(0) || self.limits.cpu_secs == Some(0) {
            anyhow::bail!("limits must be positive or null");
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// A config rooted in `dir`, with millisecond backoff. Used by tests.
    pub fn for_dir(dir: &Path) -> Self {
        Self {
            state_db: dir.join("state.db"),
            backup_dir: dir.join("backups"),
            kill_grace_ms: 200,
            retry: RetryConfig {
                base_delay_ms: 1,
                max_delay_ms: 5,
                jitter_ratio: 0.0,
                step_retry_budget_secs: 60,
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.breaker.on_open, BreakerAction::Pause);
        assert_eq!(config.retry.base_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(br#"{ "breaker": { "on_open": "rollback" }, "lease_ttl_secs": 5 }"#)
            .expect("write");
        let config = EngineConfig::load_from_file(file.path()).expect("load");
        assert_eq!(config.breaker.on_open, BreakerAction::Rollback);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.lease_ttl_secs, 5);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_load_invalid_json() {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(b"{ invalid json }").expect("write");
        assert!(EngineConfig::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_load_nonexistent_file() {
        assert!(EngineConfig::load_from_file("/nonexistent/homestead.json").is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let config = EngineConfig::for_dir(dir.path());
        config.save_to_file(&path).expect("save");
        assert_eq!(EngineConfig::load_from_file(&path).expect("load"), config);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.retry.jitter_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.max_delay_ms = 10;
        config.retry.base_delay_ms = 100;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_limits_can_be_lifted_individually() {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(br#"{ "limits": { "cpu_secs": null } }"#).expect("write");
        let config = EngineConfig::load_from_file(file.path()).expect("load");
        assert_eq!(config.limits.cpu_secs, None);
        assert_eq!(config.limits.address_space_bytes, Some(2 * 1024 * 1024 * 1024));

        let mut config = EngineConfig::default();
        config.limits.cpu_secs = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_breaker_action_parses() {
        assert_eq!("rollback".parse::<BreakerAction>().ok(), Some(BreakerAction::Rollback));
        assert_eq!(BreakerAction::Pause.to_string(), "pause");
    }
}
