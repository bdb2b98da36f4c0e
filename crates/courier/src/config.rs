//! Configuration
//!
//! Read from a TOML file. Every field has a default, so an empty file (or no
//! file at all) gives a working setup.
//!
//! ```toml
//! [directory]
//! capacity = 10
//! monitor_interval_ms = 1000
//!
//! [debug]
//! level = 1
//! ansi = true
//!
//! [plugin]
//! queue_depth = 4
//! command_timeout_ms = 500
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::Timeout;
use crate::directory::DEFAULT_CAPACITY;
use crate::error::ConfigError;
use crate::plugin::StartOptions;

/// Top-level configuration (courier.toml)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub debug: DebugConfig,
    #[serde(default)]
    pub plugin: PluginConfig,
}

impl CourierConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

/// Directory settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Period of the status monitor task. No monitor when unset.
    pub monitor_interval_ms: Option<u64>,
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            monitor_interval_ms: None,
        }
    }
}

impl DirectoryConfig {
    pub fn monitor_interval(&self) -> Option<Duration> {
        self.monitor_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Debug sink settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugConfig {
    #[serde(default)]
    pub level: u8,
    #[serde(default)]
    pub ansi: bool,
}

/// Defaults applied to every plugin started by the binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
    #[serde(default = "default_interface_stack_size")]
    pub interface_stack_size: usize,
    #[serde(default = "default_interface_buffer_size")]
    pub interface_buffer_size: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// 0 waits forever.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_stack_size() -> usize {
    64
}

fn default_interface_stack_size() -> usize {
    256
}

fn default_interface_buffer_size() -> usize {
    crate::codec::DEFAULT_RESPONSE_CAPACITY
}

fn default_queue_depth() -> usize {
    1
}

fn default_priority() -> u8 {
    1
}

fn default_command_timeout_ms() -> u64 {
    1000
}

fn default_shutdown_grace_ms() -> u64 {
    1000
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            stack_size: default_stack_size(),
            interface_stack_size: default_interface_stack_size(),
            interface_buffer_size: default_interface_buffer_size(),
            queue_depth: default_queue_depth(),
            priority: default_priority(),
            command_timeout_ms: default_command_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl PluginConfig {
    pub fn command_timeout(&self) -> Timeout {
        match self.command_timeout_ms {
            0 => Timeout::Forever,
            ms => Timeout::from_millis(ms),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn start_options(&self) -> StartOptions {
        StartOptions::from(self)
    }
}

impl From<&PluginConfig> for StartOptions {
    fn from(config: &PluginConfig) -> Self {
        StartOptions::default()
            .with_stack_size(config.stack_size)
            .with_interface_stack_size(config.interface_stack_size)
            .with_interface_buffer_size(config.interface_buffer_size)
            .with_queue_depth(config.queue_depth)
            .with_priority(config.priority)
            .with_shutdown_grace(config.shutdown_grace())
    }
}
