//! Error taxonomy for the agent engine.
//!
//! Every worker iteration funnels its failures into [`AgentError`]; the
//! supervisor logs them at the task boundary and moves on to the next
//! scheduled iteration. Only [`AgentError::Config`] and an [`AgentError::Auth`]
//! raised during bootstrap are fatal to the process.

use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    /// The remote service rejected the credentials or the session expired.
    #[error("Authentication failed: {reason}")]
    Auth { reason: String },

    /// Connection reset, timeout, 5xx and friends. Retried with backoff.
    #[error("Transient network error during {operation}: {reason}")]
    TransientNetwork { operation: String, reason: String },

    /// The remote asked us to slow down.
    #[error("Rate limited during {operation} (retry after {retry_after:?})")]
    RateLimited {
        operation: String,
        retry_after: Option<Duration>,
    },

    /// Nothing to say right now: news source down, nothing matched, or a
    /// freshly created post is not yet visible.
    #[error("Content unavailable: {reason}")]
    ContentUnavailable { reason: String },

    /// The post was created but could not be confirmed. It may already be
    /// live, so the comment it answers counts as answered.
    #[error("Post {post_id} submitted but not confirmed: {reason}")]
    Unconfirmed { post_id: String, reason: String },

    /// A reply could not be attached to any known conversation root.
    #[error("Orphan reply for comment {comment_id}: {reason}")]
    OrphanReply { comment_id: String, reason: String },

    /// The text-generation service failed or returned nothing usable.
    #[error("Generation failed: {reason}")]
    Generation { reason: String },

    /// The remote understood the request and refused it (4xx other than auth/429).
    #[error("Request rejected during {operation}: {status} - {body}")]
    Rejected {
        operation: String,
        status: u16,
        body: String,
    },

    /// Shutdown has begun; no new external call is started.
    #[error("Shutting down, {operation} not started")]
    ShuttingDown { operation: String },

    /// Missing or invalid startup configuration.
    #[error("Configuration error: {reason}")]
    Config { reason: String },
}

impl AgentError {
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::Auth {
            reason: reason.into(),
        }
    }

    pub fn transient(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransientNetwork {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn content_unavailable(reason: impl Into<String>) -> Self {
        Self::ContentUnavailable {
            reason: reason.into(),
        }
    }

    pub fn generation(reason: impl Into<String>) -> Self {
        Self::Generation {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call after a pause can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::TransientNetwork { .. } | AgentError::RateLimited { .. }
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, AgentError::Auth { .. })
    }

    /// Whether the remote accepted the post before things went wrong.
    pub fn was_submitted(&self) -> bool {
        matches!(self, AgentError::Unconfirmed { .. })
    }

    /// Map a reqwest transport failure. Anything that never produced an HTTP
    /// response is treated as transient.
    pub fn from_transport(operation: &str, err: reqwest::Error) -> Self {
        Self::transient(operation, err.to_string())
    }

    /// Classify a non-success HTTP status returned by a collaborator.
    pub fn from_status(operation: &str, status: u16, body: String) -> Self {
        match status {
            401 => Self::auth(format!("{} returned 401: {}", operation, body)),
            // XRPC reports expired access tokens as 400 with a named error.
            400 if body.contains("ExpiredToken") || body.contains("InvalidToken") => {
                Self::auth(format!("{} token rejected: {}", operation, body))
            }
            429 => Self::RateLimited {
                operation: operation.to_string(),
                retry_after: None,
            },
            500..=599 | 408 => Self::transient(operation, format!("HTTP {}: {}", status, body)),
            _ => Self::Rejected {
                operation: operation.to_string(),
                status,
                body,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
