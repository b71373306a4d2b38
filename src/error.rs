//! Error types for persistent subscriptions.

use thiserror::Error;

/// Main error type for subscription operations.
///
/// Per-message operations (ack, nack, timeouts, client removal) never return
/// these: unknown references are absorbed silently. Errors are reserved for
/// construction, registry lookups and collaborator failures.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Subscription already exists: {0}")]
    AlreadyExists(String),

    #[error("Subscription not found: {0}")]
    NotFound(String),

    #[error("Subscription is deleted: {0}")]
    Deleted(String),

    #[error("Maximum number of subscribers reached for {0}")]
    MaxSubscribersReached(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SubscriptionError {
    fn from(e: serde_json::Error) -> Self {
        SubscriptionError::Serialization(e.to_string())
    }
}

/// Result type for subscription operations.
pub type Result<T> = std::result::Result<T, SubscriptionError>;
