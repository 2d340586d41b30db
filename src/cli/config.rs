// ABOUTME: Configuration management for the taskchain application
// ABOUTME: Handles loading and merging configuration from files and environment variables

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::engine::SchedulerConfig;
use crate::process::ProcessSettings;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub process: ProcessSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file path or default locations
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => Self::find_config_file(),
        };

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Invalid configuration in {}", config_path.display()))?
        } else {
            Config::default()
        };

        config.merge_env()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> PathBuf {
        let possible_paths = [
            PathBuf::from("taskchain.yaml"),
            PathBuf::from("taskchain.yml"),
            PathBuf::from(".taskchain.yaml"),
            PathBuf::from(".taskchain.yml"),
        ];

        for path in possible_paths {
            if path.exists() {
                return path;
            }
        }

        if let Some(home_dir) = dirs::home_dir() {
            let home_config = home_dir.join(".taskchain").join("config.yaml");
            if home_config.exists() {
                return home_config;
            }
        }

        // Default path (may not exist)
        PathBuf::from("taskchain.yaml")
    }

    /// Merge environment variables into configuration
    fn merge_env(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var("TASKCHAIN_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TASKCHAIN_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(threads) = std::env::var("TASKCHAIN_WORKER_THREADS") {
            self.scheduler.worker_threads = threads
                .parse()
                .context("TASKCHAIN_WORKER_THREADS must be a number")?;
        }
        if let Ok(idle) = std::env::var("TASKCHAIN_IDLE_TIMEOUT_MS") {
            self.process.idle_timeout_ms = idle
                .parse()
                .context("TASKCHAIN_IDLE_TIMEOUT_MS must be a number of milliseconds")?;
        }

        Ok(())
    }
}
