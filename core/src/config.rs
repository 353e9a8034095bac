/// Configuration management for docflow.
/// Handles loading, validation and environment overrides of `docflow.toml`.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::errors::{ConfigError, ConfigResult};

/// Top-level configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocflowConfig {
    /// Workflow definitions
    #[serde(default)]
    pub workflow: WorkflowConfig,

    /// Cluster task queue
    #[serde(default)]
    pub queue: QueueConfig,

    /// Logging and observability settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where state-chart definitions come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Directory of additional `*.toml` definitions
    #[serde(default)]
    pub definitions_dir: Option<PathBuf>,

    /// Definition used for document handles
    #[serde(default = "default_definition")]
    pub default_definition: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            definitions_dir: None,
            default_definition: default_definition(),
        }
    }
}

fn default_definition() -> String {
    crate::definition::DOCUMENT_WORKFLOW.to_string()
}

/// Cluster task queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Identity of this node when holding the queue lease
    #[serde(default = "default_cluster_node_id")]
    pub cluster_node_id: String,

    /// Lock root; the queue and history live beneath it
    #[serde(default = "default_update_path")]
    pub update_path: String,

    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    #[serde(default = "default_history_name")]
    pub history_name: String,

    /// Lease length in seconds
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,

    /// Lease refresh period in seconds
    #[serde(default = "default_keep_alive_seconds")]
    pub keep_alive_seconds: u64,

    /// Drain the queue once when the worker starts
    #[serde(default = "default_true")]
    pub run_on_startup: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            cluster_node_id: default_cluster_node_id(),
            update_path: default_update_path(),
            queue_name: default_queue_name(),
            history_name: default_history_name(),
            lease_seconds: default_lease_seconds(),
            keep_alive_seconds: default_keep_alive_seconds(),
            run_on_startup: default_true(),
        }
    }
}

impl QueueConfig {
    /// Check the queue layout and lease timing.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.cluster_node_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "Cluster node id must not be empty".to_string(),
            ));
        }

        if !self.update_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "Update path must be absolute, got '{}'",
                self.update_path
            )));
        }

        if self.queue_name == self.history_name {
            return Err(ConfigError::Invalid(
                "Queue and history must be different nodes".to_string(),
            ));
        }

        if self.lease_seconds == 0 || self.keep_alive_seconds == 0 {
            return Err(ConfigError::Invalid(
                "Lease and keep-alive periods must be greater than 0".to_string(),
            ));
        }

        if self.keep_alive_seconds >= self.lease_seconds {
            return Err(ConfigError::Invalid(format!(
                "Keep-alive period ({}s) must be shorter than the lease ({}s)",
                self.keep_alive_seconds, self.lease_seconds
            )));
        }

        Ok(())
    }

    pub fn queue_path(&self) -> String {
        format!("{}/{}", self.update_path.trim_end_matches('/'), self.queue_name)
    }

    pub fn history_path(&self) -> String {
        format!("{}/{}", self.update_path.trim_end_matches('/'), self.history_name)
    }
}

fn default_cluster_node_id() -> String {
    "default".to_string()
}

fn default_update_path() -> String {
    "/update".to_string()
}

fn default_queue_name() -> String {
    "queue".to_string()
}

fn default_history_name() -> String {
    "history".to_string()
}

fn default_lease_seconds() -> u64 {
    120
}

fn default_keep_alive_seconds() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include source line numbers
    #[serde(default = "default_true")]
    pub line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            line_numbers: default_true(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Configuration manager
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: DocflowConfig,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Load configuration from file or use defaults
    pub fn load(config_path: Option<&Path>) -> ConfigResult<Self> {
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("docflow.toml"));

        let config = if path.exists() {
            info!("Loading config from {:?}", path);
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            warn!("Config file not found at {:?}, using defaults", path);
            DocflowConfig::default()
        };

        debug!("Configuration loaded successfully");
        Ok(ConfigManager {
            config,
            config_path: path,
        })
    }

    /// Wrap an in-memory configuration
    pub fn from_config(config: DocflowConfig, config_path: PathBuf) -> Self {
        Self {
            config,
            config_path,
        }
    }

    /// Get configuration reference
    pub fn config(&self) -> &DocflowConfig {
        &self.config
    }

    /// Get mutable configuration reference
    pub fn config_mut(&mut self) -> &mut DocflowConfig {
        &mut self.config
    }

    /// Save configuration to file
    pub fn save(&self) -> ConfigResult<()> {
        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(&self.config)?;
        std::fs::write(&self.config_path, content)?;

        info!("Configuration saved to {:?}", self.config_path);
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        self.config.queue.validate()?;

        if !matches!(self.config.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::Invalid(format!(
                "Unknown log format '{}'",
                self.config.logging.format
            )));
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    /// Load configuration overrides from environment variables
    pub fn load_from_env(&mut self) -> ConfigResult<()> {
        if let Ok(node_id) = std::env::var("DOCFLOW_CLUSTER_NODE_ID") {
            self.config.queue.cluster_node_id = node_id;
        }

        if let Ok(level) = std::env::var("DOCFLOW_LOG_LEVEL") {
            self.config.logging.level = level;
        }

        if let Ok(dir) = std::env::var("DOCFLOW_DEFINITIONS_DIR") {
            self.config.workflow.definitions_dir = Some(PathBuf::from(dir));
        }

        info!("Configuration loaded from environment variables");
        Ok(())
    }

    /// Get the configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}
