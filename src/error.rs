use std::fmt::Display;

/// Errors raised by the monitoring components.
///
/// Only `Transport` is ever retried. `Duplicate` never escapes the store layer
/// as a failure; inserts report it as `Ok(None)` instead.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// A node, database or delivery endpoint could not be reached.
    #[error("transport error ({endpoint}): {message}")]
    Transport { endpoint: String, message: String },

    /// A log or payload could not be decoded into a known shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// Unique-key violation.
    #[error("duplicate record: {0}")]
    Duplicate(String),

    /// Rejected input, e.g. an alert without a title or an impossible match.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A delivery channel refused or dropped the alert.
    #[error("delivery via {channel} failed: {message}")]
    Delivery { channel: String, message: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error(transparent)]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl MonitorError {
    pub fn transport(endpoint: impl Into<String>, err: impl Display) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: err.to_string(),
        }
    }

    pub fn delivery(channel: impl Display, err: impl Display) -> Self {
        Self::Delivery {
            channel: channel.to_string(),
            message: err.to_string(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True for failures that may succeed if the same call is repeated later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Delivery { .. } | Self::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
