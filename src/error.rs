//! Error types for the tunnel adapter
//!
//! This module defines the error types used throughout the crate.
//! We use `thiserror` for ergonomic error definitions; every fallible
//! operation returns the crate-wide [`Result`] alias.

use std::time::Duration;
use thiserror::Error;

/// Main error type for tunnel adapter operations
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Configuration is unusable (no peers, malformed endpoint, bad key)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The OS rejected the network settings or did not confirm them in time
    #[error("Network settings error: {0}")]
    NetworkSettings(String),

    /// Peer sessions did not become ready before the deadline
    #[error("UDP sessions not ready after {0:?}")]
    SessionTimeout(Duration),

    /// A UDP session failed or could not be created
    #[error("UDP session error: {0}")]
    Session(String),

    /// The stats query did not complete before the deadline
    #[error("Stats query timed out after {0:?}")]
    StatsTimeout(Duration),

    /// The protocol core refused to initialise
    #[error("Protocol core error: {0}")]
    Core(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A cross-boundary handle does not name a live slot
    #[error("Invalid handle: {0:#x}")]
    InvalidHandle(u64),

    /// Virtual interface errors
    #[error("Virtual interface error: {0}")]
    Interface(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias using AdapterError
pub type Result<T> = std::result::Result<T, AdapterError>;

impl AdapterError {
    /// Whether the error should make the facade retry a start attempt
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, AdapterError::InvalidState(_))
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        AdapterError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for AdapterError {
    fn from(err: toml::de::Error) -> Self {
        AdapterError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_errors_are_distinct() {
        let stats = AdapterError::StatsTimeout(Duration::from_secs(1));
        let sessions = AdapterError::SessionTimeout(Duration::from_secs(5));

        assert!(matches!(stats, AdapterError::StatsTimeout(_)));
        assert!(matches!(sessions, AdapterError::SessionTimeout(_)));
        assert_eq!(stats.to_string(), "Stats query timed out after 1s");
    }

    #[test]
    fn test_invalid_state_detection() {
        assert!(AdapterError::InvalidState("busy".into()).is_invalid_state());
        assert!(!AdapterError::Core("busy".into()).is_invalid_state());
    }

    #[test]
    fn test_invalid_handle_display() {
        let err = AdapterError::InvalidHandle(0x1_0000_0002);
        assert_eq!(err.to_string(), "Invalid handle: 0x100000002");
    }
}
