//! Error types for the function runtime.
//!
//! Errors fall into five classes that decide how the runtime reacts:
//! - **Configuration**: fatal, raised before any connection attempt
//! - **Connection**: retried by the connection manager
//! - **Provisioning**: fatal at startup, logged and retried after a reconnect
//! - **Handler**: logged and swallowed by the consumption loop
//! - **Publish**: returned to the caller, never retried here

use core_config::ConfigError;
use thiserror::Error;

/// How an error is treated by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Connection,
    Provisioning,
    Handler,
    Publish,
}

/// Error that can occur in function runtime operations.
#[derive(Debug, Error)]
pub enum FunctionError {
    /// Missing or invalid startup configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Failure to establish the broker connection
    #[error("NATS connection error: {0}")]
    Connection(String),

    /// An operation ran against a connection that has since closed
    #[error("Connection generation {0} is closed")]
    StaleConnection(u64),

    /// Stream or consumer creation/update failed
    #[error("Provisioning error on stream '{stream}': {message}")]
    Provisioning { stream: String, message: String },

    /// The broker reports that the resource already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Pulling or acknowledging messages failed
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Publishing a response failed
    #[error("Publish error on subject '{subject}': {message}")]
    Publish { subject: String, message: String },

    /// Encoding or decoding a payload failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The caller-supplied handler failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// Metrics recorder could not be installed
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// The runtime has been shut down
    #[error("Shutdown requested")]
    Shutdown,
}

impl FunctionError {
    /// Get the error class.
    pub fn class(&self) -> ErrorClass {
        match self {
            FunctionError::Config(_) | FunctionError::Metrics(_) => ErrorClass::Configuration,
            FunctionError::Connection(_)
            | FunctionError::StaleConnection(_)
            | FunctionError::Consumer(_)
            | FunctionError::Shutdown => ErrorClass::Connection,
            FunctionError::Provisioning { .. } | FunctionError::AlreadyExists(_) => {
                ErrorClass::Provisioning
            }
            FunctionError::Handler(_) => ErrorClass::Handler,
            FunctionError::Publish { .. } | FunctionError::Serialization(_) => ErrorClass::Publish,
        }
    }

    /// Whether this error aborts startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Configuration | ErrorClass::Provisioning
        )
    }

    /// Whether the connection manager retries this error.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Connection && !matches!(self, FunctionError::Shutdown)
    }

    pub fn connection(error: impl std::fmt::Display) -> Self {
        Self::Connection(error.to_string())
    }

    pub fn provisioning(stream: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Provisioning {
            stream: stream.into(),
            message: error.to_string(),
        }
    }

    pub fn publish(subject: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Publish {
            subject: subject.into(),
            message: error.to_string(),
        }
    }

    pub fn consumer(error: impl std::fmt::Display) -> Self {
        Self::Consumer(error.to_string())
    }
}
