//! Configuration types.
//!
//! The launcher reads one JSON file at startup and then lets a handful of
//! environment variables override the scheduling knobs. Anything wrong with
//! the file is fatal: the scheduler never initialises on a bad config.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Env var naming the config file.
pub const CONFIG_PATH_ENV: &str = "AGENT_LAUNCHER_CONFIG";

/// Config file used when `AGENT_LAUNCHER_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Launcher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Number of work items to launch over the launcher's lifetime.
    pub total_agents: usize,
    /// Maximum number of simultaneously alive agents.
    pub max_concurrent: usize,
    /// Delay between a launch and the next stagger-driven admission check.
    pub stagger_ms: u64,
    /// Delay between an agent exit and the replacement admission check.
    pub settle_ms: u64,
    /// Progress log interval in seconds (0 disables the reporter).
    pub progress_interval_secs: u64,
    /// How long shutdown waits for live agents to exit.
    pub shutdown_timeout_secs: u64,
    /// Parameters passed through to every spawned agent.
    pub agent: AgentCommand,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            total_agents: 65,
            max_concurrent: 20,
            stagger_ms: 2000,
            settle_ms: 500,
            progress_interval_secs: 30,
            shutdown_timeout_secs: 10,
            agent: AgentCommand::default(),
        }
    }
}

/// How to start one agent process. Not interpreted by the scheduler.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentCommand {
    /// Program to execute.
    pub command: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Extra environment for the child (on top of `WORKER_INDEX`).
    pub env: HashMap<String, String>,
    /// Working directory for the child, if any.
    pub working_dir: Option<PathBuf>,
}

impl LauncherConfig {
    /// Load from the path in `AGENT_LAUNCHER_CONFIG` (or `config.json`),
    /// apply environment overrides, and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without overrides or validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Missing {
                path: path.to_path_buf(),
            });
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Parse a JSON document without overrides or validation.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Override scheduling knobs from the environment. Unparsable values keep
    /// the file's setting.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parse = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        if let Some(v) = parse("AGENT_LAUNCHER_TOTAL") {
            self.total_agents = v as usize;
        }
        if let Some(v) = parse("AGENT_LAUNCHER_MAX_CONCURRENT") {
            self.max_concurrent = v as usize;
        }
        if let Some(v) = parse("AGENT_LAUNCHER_STAGGER_MS") {
            self.stagger_ms = v;
        }
        if let Some(v) = parse("AGENT_LAUNCHER_SETTLE_MS") {
            self.settle_ms = v;
        }
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.command.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "agent.command".to_string(),
                hint: "Set the program each agent should run.".to_string(),
            });
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn stagger_interval(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// `None` when progress reporting is disabled.
    pub fn progress_interval(&self) -> Option<Duration> {
        (self.progress_interval_secs > 0).then(|| Duration::from_secs(self.progress_interval_secs))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
