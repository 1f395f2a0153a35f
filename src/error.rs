//! Unified error types for the notification service.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, NotifError>;

/// Service error types
#[derive(Debug, Error)]
pub enum NotifError {
    /// Configuration store (SQL) error
    #[error("configuration store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Message bus (MQTT) error
    #[error("message bus error: {0}")]
    Bus(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rumqttc::ClientError> for NotifError {
    fn from(err: rumqttc::ClientError) -> Self {
        NotifError::Bus(err.to_string())
    }
}
