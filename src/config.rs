//! Configuration module for vpnwatch
//!
//! This module provides TOML-based configuration parsing and validation.
//! Every section is optional; an empty document yields the defaults.

use crate::classifier::Platform;
use crate::error::{Result, WatchError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// An extra interface-name marker appended to the built-in table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternEntry {
    /// Substring looked for in lowercased interface names
    pub marker: String,
    /// Protocol label reported when this marker matches
    #[serde(default)]
    pub protocol: Option<String>,
}

/// Per-platform ignore list overrides
///
/// Entries ending in `*` are prefix matches, all others are exact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IgnoreConfig {
    /// Use only the entries below instead of extending the built-in defaults
    #[serde(default)]
    pub replace_defaults: bool,
    #[serde(default)]
    pub macos: Vec<String>,
    #[serde(default)]
    pub ios: Vec<String>,
    #[serde(default)]
    pub linux: Vec<String>,
    #[serde(default)]
    pub windows: Vec<String>,
    #[serde(default)]
    pub android: Vec<String>,
    #[serde(default)]
    pub other: Vec<String>,
}

impl IgnoreConfig {
    /// Configured entries for one platform
    pub fn entries_for(&self, platform: Platform) -> &[String] {
        match platform {
            Platform::MacOs => &self.macos,
            Platform::Ios => &self.ios,
            Platform::Linux => &self.linux,
            Platform::Windows => &self.windows,
            Platform::Android => &self.android,
            Platform::Other => &self.other,
        }
    }
}

/// Detection strategy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Consult the OS "active path is VPN transport" flag
    #[serde(default = "default_true")]
    pub use_capability_flag: bool,
    /// Consult the OS VPN profile status
    #[serde(default = "default_true")]
    pub use_profile_status: bool,
    /// Fall back to interface-name classification; must stay enabled
    #[serde(default = "default_true")]
    pub use_interface_names: bool,
    /// Classify only interfaces the OS reports as up
    #[serde(default = "default_true")]
    pub only_active_interfaces: bool,
    /// Upper bound on any single external OS query, in milliseconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,
    /// Markers appended to the built-in pattern table
    #[serde(default)]
    pub patterns: Vec<PatternEntry>,
    /// Ignore list overrides
    #[serde(default)]
    pub ignore: IgnoreConfig,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            use_capability_flag: true,
            use_profile_status: true,
            use_interface_names: true,
            only_active_interfaces: true,
            query_timeout_ms: default_query_timeout(),
            patterns: Vec::new(),
            ignore: IgnoreConfig::default(),
        }
    }
}

/// Change monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interface snapshot polling period in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Subscribe to rtnetlink link/address notifications where available
    #[serde(default = "default_true")]
    pub netlink: bool,
    /// Per-subscriber buffer of undelivered transitions
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            netlink: true,
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| WatchError::Config(format!("Failed to read config file: {e}")))?;

        <Self as FromStr>::from_str(&contents)
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| WatchError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let detection = &self.detection;

        // Names are the only strategy every platform can always answer
        if !detection.use_interface_names {
            return Err(WatchError::Config(
                "use_interface_names cannot be disabled".to_string(),
            ));
        }

        if !(100..=30_000).contains(&detection.query_timeout_ms) {
            return Err(WatchError::Config(
                "query_timeout_ms must be between 100 and 30000".to_string(),
            ));
        }

        if let Some(entry) = detection
            .patterns
            .iter()
            .find(|p| p.marker.trim().is_empty())
        {
            return Err(WatchError::Config(format!(
                "Pattern marker cannot be empty (protocol {:?})",
                entry.protocol
            )));
        }

        if self.monitor.poll_interval_ms < 100 {
            return Err(WatchError::Config(
                "poll_interval_ms must be at least 100".to_string(),
            ));
        }

        if self.monitor.broadcast_capacity == 0 {
            return Err(WatchError::Config(
                "broadcast_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.detection.query_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.poll_interval_ms)
    }
}

impl FromStr for Config {
    type Err = WatchError;

    fn from_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_query_timeout() -> u64 {
    2000
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_broadcast_capacity() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}
