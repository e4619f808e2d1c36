//! Error types for the mecbus transport core.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the transport core.
#[derive(Debug, Error)]
pub enum BusError {
    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection busy: pending-write queue full for {client}")]
    Busy { client: String },

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Client not found: {client_name}/{instance_name}")]
    ClientNotFound {
        client_name: String,
        instance_name: String,
    },

    // Naming errors
    #[error("Client already exists: {client_name}/{instance_name}")]
    ClientAlreadyExists {
        client_name: String,
        instance_name: String,
    },

    // Framing errors
    #[error("Package too large: {size} exceeds maximum {max}")]
    PackageTooLarge { size: usize, max: usize },

    #[error("Pending-write queue full: {requested} bytes over {capacity} capacity")]
    QueueFull { requested: usize, capacity: usize },

    // Event loop state errors
    #[error("Event loop role already set")]
    RoleAlreadySet,

    #[error("Event loop not running")]
    NotRunning,

    #[error("Listener already registered for package id {0:#010x}")]
    ListenerExists(u32),

    #[error("Poller event not submitted")]
    EventNotSubmitted,

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for transport core operations.
pub type Result<T> = std::result::Result<T, BusError>;

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        BusError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}
