//! Configuration loading and management
//!
//! Handles parsing of `.tally.toml` configuration files.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Config file name at the repository root
pub const CONFIG_FILE: &str = ".tally.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory, relative to the repository root
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub actor: ActorConfig,

    #[serde(default)]
    pub statuses: StatusConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            actor: ActorConfig::default(),
            statuses: StatusConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

fn default_data_dir() -> String {
    crate::storage::DATA_DIR.to_string()
}

/// Actor-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
    /// Default actor name when none specified
    #[serde(default = "default_actor")]
    pub default: String,
}

fn default_actor() -> String {
    "unknown".to_string()
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            default: default_actor(),
        }
    }
}

/// Allowed item statuses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_status_values")]
    pub values: Vec<String>,

    /// Status given to new items
    #[serde(default = "default_status")]
    pub default: String,

    /// Statuses that can only be left by going back to `default`
    #[serde(default = "default_terminal_statuses")]
    pub terminal: Vec<String>,
}

fn default_status_values() -> Vec<String> {
    ["open", "in_progress", "blocked", "done", "dropped"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_status() -> String {
    "open".to_string()
}

fn default_terminal_statuses() -> Vec<String> {
    vec!["done".to_string(), "dropped".to_string()]
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            values: default_status_values(),
            default: default_status(),
            terminal: default_terminal_statuses(),
        }
    }
}

impl StatusConfig {
    pub fn is_known(&self, status: &str) -> bool {
        self.values.iter().any(|value| value == status)
    }

    pub fn is_terminal(&self, status: &str) -> bool {
        self.terminal.iter().any(|value| value == status)
    }

    /// Check that an item may move from `from` to `to`
    pub fn check_transition(&self, from: &str, to: &str) -> Result<()> {
        if !self.is_known(to) {
            return Err(Error::InvalidArgument(format!(
                "unknown status '{to}' (expected one of: {})",
                self.values.join(", ")
            )));
        }
        if from == to || (self.is_terminal(from) && to != self.default) {
            return Err(Error::StatusTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.values.is_empty() {
            return Err(Error::InvalidConfig(
                "statuses.values cannot be empty".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for status in &self.values {
            let trimmed = status.trim();
            if trimmed.is_empty() || trimmed != status {
                return Err(Error::InvalidConfig(format!(
                    "statuses.values has an empty or padded entry '{status}'"
                )));
            }
            if !seen.insert(trimmed) {
                return Err(Error::InvalidConfig(format!(
                    "statuses.values has duplicate entry '{trimmed}'"
                )));
            }
        }

        if !seen.contains(self.default.as_str()) {
            return Err(Error::InvalidConfig(format!(
                "statuses.default '{}' not in statuses.values",
                self.default
            )));
        }
        if self.is_terminal(&self.default) {
            return Err(Error::InvalidConfig(
                "statuses.default cannot be terminal".to_string(),
            ));
        }
        for status in &self.terminal {
            if !seen.contains(status.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "statuses.terminal '{status}' not in statuses.values"
                )));
            }
        }
        Ok(())
    }
}

/// Git synchronization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_remote")]
    pub remote: String,

    #[serde(default = "default_branch")]
    pub branch: String,

    /// Quiet period after the last write before committing
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Retries after the first push attempt
    #[serde(default = "default_max_push_retries")]
    pub max_push_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_debounce_ms() -> u64 {
    5000
}

fn default_max_push_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    5000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            remote: default_remote(),
            branch: default_branch(),
            debounce_ms: default_debounce_ms(),
            max_push_retries: default_max_push_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let millis = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(millis)
    }

    fn validate(&self) -> Result<()> {
        if self.remote.trim().is_empty() {
            return Err(Error::InvalidConfig("sync.remote cannot be empty".to_string()));
        }
        if self.branch.trim().is_empty() {
            return Err(Error::InvalidConfig("sync.branch cannot be empty".to_string()));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(Error::InvalidConfig(
                "sync.backoff_base_ms must be <= sync.backoff_max_ms".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a `.tally.toml` file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from repo root, or return defaults when absent
    ///
    /// Unlike a missing file, an invalid one is an error.
    pub fn load_from_repo(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let data_dir = Path::new(self.data_dir.trim());
        if self.data_dir.trim().is_empty()
            || data_dir.is_absolute()
            || data_dir
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::InvalidConfig(format!(
                "data_dir '{}' must be a relative path inside the repository",
                self.data_dir
            )));
        }
        self.statuses.validate()?;
        self.sync.validate()?;
        Ok(())
    }
}
