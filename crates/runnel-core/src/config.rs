use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunnelError};

/// Top-level Runnel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    /// Runtime logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

/// Scheduler settings shared by every orchestrator built from this config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default bound on invocations of one process at one runnable (default: 3).
    #[serde(default = "default_max_reruns")]
    pub max_reruns: u32,
    /// Record one execution record per invocation (default: false).
    #[serde(default)]
    pub record_steps: bool,
    /// Maximum concurrent invocations within a tick. 0 = unbounded.
    #[serde(default)]
    pub max_concurrency: usize,
    /// Maximum ticks per run before failing. 0 = unlimited.
    #[serde(default = "default_max_ticks")]
    pub max_ticks: u64,
    /// Capacity of the lifecycle event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_reruns: default_max_reruns(),
            record_steps: false,
            max_concurrency: 0,
            max_ticks: default_max_ticks(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_reruns() -> u32 { 3 }
fn default_max_ticks() -> u64 { 10_000 }
fn default_event_capacity() -> usize { 256 }

/// Runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for JSONL run logs. Default: ./logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = run summary only, 2 = per-tick, 3 = per-step (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
    /// `tracing` filter directive used by the CLI, e.g. `runnel=debug`.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
            filter: None,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl LogConfig {
    /// Resolve the log directory (expand ~).
    pub fn log_dir(&self) -> PathBuf {
        let dir = self.log_dir.as_deref().unwrap_or("./logs");
        if let Some(rest) = dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(dir)
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| RunnelError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| RunnelError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.max_reruns == 0 {
            return Err(RunnelError::Config(
                "engine.max_reruns must be at least 1".into(),
            ));
        }
        if let Some(ref log) = self.log {
            if !(1..=3).contains(&log.level) {
                return Err(RunnelError::Config(format!(
                    "log.level must be 1, 2 or 3 (got {})",
                    log.level
                )));
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
