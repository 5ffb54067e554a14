//! Configuration parsing for the factory daemon.
//!
//! key=value format, read from `.factory/config` or `--config`.
//! Precedence: CLI flags > `--config` file > `.factory/config` > defaults.

use crate::types::AutofixStrategy;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Upper bound accepted for `max_parallel`.
pub const MAX_PARALLEL_LIMIT: u32 = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Daemon and engine configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    // Storage
    pub db_path: PathBuf,

    // Scheduling
    pub worker_interval_ms: u64,
    pub default_max_parallel: u32,
    /// Fail `running` attempts left over from a previous process on start.
    pub fail_orphaned_attempts_on_start: bool,

    // Maintenance
    pub gc_delay_minutes: u64,
    pub maintenance_interval_sec: u64,
    pub metrics_bucket_minutes: u32,
    pub stuck_run_minutes: u64,

    // Worktrees and git
    pub branch_prefix: String,
    /// Relative paths resolve against the project's repository.
    pub worktree_dir: PathBuf,
    pub remote: String,

    // Execution
    /// Shell command run inside the worktree for each attempt.
    pub agent_cmd: Option<String>,
    /// 0 disables the timeout.
    pub agent_timeout_sec: u64,
    pub create_pull_requests: bool,

    // Auto-fix
    pub autofix_enabled: bool,
    pub autofix_strategy: AutofixStrategy,
    pub autofix_fix_cmd: Option<String>,
    pub autofix_test_cmd: Option<String>,
    pub autofix_log_max_bytes: usize,
    pub artifacts_dir: PathBuf,

    // Budget
    pub budget_ok: bool,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            db_path: dirs::data_local_dir().map_or_else(
                || PathBuf::from(".factory/factory.db"),
                |d| d.join("factoryd/factory.db"),
            ),
            worker_interval_ms: 1000,
            default_max_parallel: 3,
            fail_orphaned_attempts_on_start: true,
            gc_delay_minutes: 30,
            maintenance_interval_sec: 60,
            metrics_bucket_minutes: 5,
            stuck_run_minutes: 60,
            branch_prefix: "factory/".to_string(),
            worktree_dir: PathBuf::from(".factory/worktrees"),
            remote: "origin".to_string(),
            agent_cmd: None,
            agent_timeout_sec: 0,
            create_pull_requests: true,
            autofix_enabled: true,
            autofix_strategy: AutofixStrategy::Diagnostic,
            autofix_fix_cmd: None,
            autofix_test_cmd: None,
            autofix_log_max_bytes: 8192,
            artifacts_dir: PathBuf::from(".factory/artifacts"),
            budget_ok: true,
        }
    }
}

impl FactoryConfig {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<()> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn optional(value: &str) -> Option<String> {
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "db_path" => self.db_path = PathBuf::from(value),
            "worker_interval_ms" => self.worker_interval_ms = Self::parse_int(key, value)?,
            "default_max_parallel" => {
                let parsed: u32 = Self::parse_int(key, value)?;
                validate_max_parallel(parsed).map_err(|message| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message,
                })?;
                self.default_max_parallel = parsed;
            }
            "fail_orphaned_attempts_on_start" => {
                self.fail_orphaned_attempts_on_start = Self::parse_bool(key, value)?;
            }
            "gc_delay_minutes" => self.gc_delay_minutes = Self::parse_int(key, value)?,
            "maintenance_interval_sec" => {
                self.maintenance_interval_sec = Self::parse_int(key, value)?;
            }
            "metrics_bucket_minutes" => {
                let parsed: u32 = Self::parse_int(key, value)?;
                if parsed == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: key.to_string(),
                        message: "must be at least 1".to_string(),
                    });
                }
                self.metrics_bucket_minutes = parsed;
            }
            "stuck_run_minutes" => self.stuck_run_minutes = Self::parse_int(key, value)?,
            "branch_prefix" => self.branch_prefix = value.to_string(),
            "worktree_dir" => self.worktree_dir = PathBuf::from(value),
            "remote" => self.remote = value.to_string(),
            "agent_cmd" => self.agent_cmd = Self::optional(value),
            "agent_timeout_sec" => self.agent_timeout_sec = Self::parse_int(key, value)?,
            "create_pull_requests" => self.create_pull_requests = Self::parse_bool(key, value)?,
            "autofix_enabled" => self.autofix_enabled = Self::parse_bool(key, value)?,
            "autofix_strategy" => {
                self.autofix_strategy = match value {
                    "diagnostic" => AutofixStrategy::Diagnostic,
                    "ai_fix" => AutofixStrategy::AiFix,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "autofix_strategy must be 'diagnostic' or 'ai_fix', got '{value}'"
                        )))
                    }
                }
            }
            "autofix_fix_cmd" => self.autofix_fix_cmd = Self::optional(value),
            "autofix_test_cmd" => self.autofix_test_cmd = Self::optional(value),
            "autofix_log_max_bytes" => self.autofix_log_max_bytes = Self::parse_int(key, value)?,
            "artifacts_dir" => self.artifacts_dir = PathBuf::from(value),
            "budget_ok" => self.budget_ok = Self::parse_bool(key, value)?,
            _ => {
                tracing::warn!(key, "unknown config key");
            }
        }
        Ok(())
    }

    fn parse_int<T: FromStr>(key: &str, value: &str) -> Result<T> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Worktree root for a repository.
    pub fn worktree_root(&self, repo_path: &Path) -> PathBuf {
        if self.worktree_dir.is_relative() {
            repo_path.join(&self.worktree_dir)
        } else {
            self.worktree_dir.clone()
        }
    }

    /// Artifact root for a repository.
    pub fn artifacts_root(&self, repo_path: &Path) -> PathBuf {
        if self.artifacts_dir.is_relative() {
            repo_path.join(&self.artifacts_dir)
        } else {
            self.artifacts_dir.clone()
        }
    }
}

/// `1 <= max_parallel <= 20`.
pub fn validate_max_parallel(max_parallel: u32) -> std::result::Result<(), String> {
    if (1..=MAX_PARALLEL_LIMIT).contains(&max_parallel) {
        Ok(())
    } else {
        Err(format!(
            "max_parallel must be between 1 and {MAX_PARALLEL_LIMIT}, got {max_parallel}"
        ))
    }
}
