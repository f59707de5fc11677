//! Error types for the chain-following pipeline.

use thiserror::Error;

/// Errors that can occur while following the chain.
#[derive(Debug, Error)]
pub enum FollowerError {
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Filter error in '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("Filter '{0}' is already enabled")]
    DuplicateFilter(String),

    #[error("Consumer fell behind the bus and missed {0} messages")]
    Lagged(u64),

    #[error("No position available to checkpoint")]
    NoCheckpoint,

    #[error("Chain-sync session is not initialized")]
    NotInitialized,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl FollowerError {
    /// Returns `true` for errors caused by an external collaborator that may
    /// succeed on a later attempt (session, message bus, checkpoint store).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::Publish(_) | Self::Storage(_))
    }

    /// Short label used as the `kind` attribute on the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Upstream(_) => "upstream",
            Self::Publish(_) => "publish",
            Self::Storage(_) => "storage",
            Self::Filter { .. } | Self::DuplicateFilter(_) => "filter",
            Self::Lagged(_) => "lagged",
            Self::NoCheckpoint => "checkpoint",
            Self::NotInitialized => "lifecycle",
            Self::Serialization(_) => "serialization",
            Self::Other(_) => "other",
        }
    }
}
