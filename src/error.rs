//! Error types and handling for vpnwatch
//!
//! Detection entry points never surface these to callers; they are used by
//! configuration loading, wire decoding and the internal platform probes.

use thiserror::Error;

/// Main error type for detection internals
#[derive(Error, Debug)]
pub enum WatchError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network interface enumeration errors
    #[error("Interface enumeration failed: {0}")]
    Enumeration(String),

    /// Capability or profile status query errors
    #[error("Query failed: {0}")]
    Query(String),

    /// The platform has no such facility
    #[error("Not supported on this platform: {0}")]
    Unsupported(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Flat map / wire decoding errors
    #[error("Wire format error: {0}")]
    Wire(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// Whether this error means "strategy not applicable" rather than a failure
    pub fn is_unsupported(&self) -> bool {
        matches!(self, WatchError::Unsupported(_))
    }
}

/// Result type alias for detection internals
pub type Result<T> = std::result::Result<T, WatchError>;

impl From<toml::de::Error> for WatchError {
    fn from(err: toml::de::Error) -> Self {
        WatchError::Config(format!("Failed to parse TOML: {err}"))
    }
}
