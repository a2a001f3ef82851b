//! Engine error types.

use thiserror::Error;

use crate::classifier::ClassifierError;

/// Errors that can occur in the topics engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] topics_storage::StorageError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Missing or malformed argument, rejected before any mutation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Classifier error
    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    /// Blocked topics backend error
    #[error("Consent error: {0}")]
    Consent(String),

    /// A lock was poisoned by a panicking holder
    #[error("Lock error: {0}")]
    Lock(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(#[from] topics_types::TopicsError),

    /// Installed app list could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reject an empty application id.
pub(crate) fn require_app(app: &str) -> Result<(), EngineError> {
    if app.is_empty() {
        return Err(EngineError::InvalidArgument(
            "app id must not be empty".to_string(),
        ));
    }
    Ok(())
}
