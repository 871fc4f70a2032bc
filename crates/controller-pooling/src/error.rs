//! Pooling error types

use thiserror::Error;

/// Result type for pooling operations
pub type Result<T> = std::result::Result<T, PoolingError>;

/// Pooling errors
#[derive(Debug, Error)]
pub enum PoolingError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing required property: {0}")]
    MissingProperty(String),

    #[error("no tokio runtime available to drive pooling timers")]
    NoRuntime,

    // ==================== Protocol Errors ====================
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    // ==================== Transport Errors ====================
    #[error("publish failed on topic {topic}: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("endpoint not started: {0}")]
    EndpointNotStarted(String),
}

impl PoolingError {
    /// Check if this error was raised while building a manager
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            PoolingError::InvalidConfig(_)
                | PoolingError::MissingProperty(_)
                | PoolingError::NoRuntime
        )
    }

    /// Check if this error is a protocol fault (malformed or invalid message)
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            PoolingError::InvalidMessage(_)
                | PoolingError::UnknownMessageType(_)
                | PoolingError::Serialization(_)
                | PoolingError::Deserialization(_)
                | PoolingError::MessageTooLarge { .. }
        )
    }

    /// Check if this error is a transport fault (self-heals via timers)
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PoolingError::PublishFailed { .. } | PoolingError::EndpointNotStarted(_)
        )
    }
}
