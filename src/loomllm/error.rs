//! Crate-wide error taxonomy.
//!
//! Every fallible surface of the gateway reports one of the kinds below.
//! Provider drivers map their wire-level failures into this taxonomy and never
//! retry on their own; the orchestrator decides what a failure means for the
//! conversation (see `orchestrator`).  The kind tag is stable: it is embedded
//! in [`Event::Error`](crate::event::Event::Error) payloads and in the
//! user-visible `"Error: <kind>: <detail>"` assistant messages that a failed
//! generation leaves behind in the conversation.

use thiserror::Error;

/// Errors surfaced by the gateway core.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed parameters, unknown provider, or a bad path.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Credential missing or rejected by the provider.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The provider replied with a rate-limit status.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A network call or the subscriber queue exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Transport-level failure talking to a provider.
    #[error("network error: {0}")]
    Network(String),

    /// The provider reports the request as malformed, often a model
    /// constraint (e.g. a parameter the selected model does not accept).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Provider-side 5xx.
    #[error("provider server error: {0}")]
    ServerError(String),

    /// An identifier did not resolve in the store or the graph.
    #[error("not found: {0}")]
    NotFound(String),

    /// An on-disk conversation violates the graph invariants.  Surfaced on
    /// explicit load; `list()` skips such files with a warning instead.
    #[error("conversation corrupt: {0}")]
    ConversationCorrupt(String),

    /// Internal invariant breach.  Represents a bug; never reached in
    /// correct code.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The operation was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Stable kind tag used in event payloads and user-visible messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigInvalid(_) => "ConfigInvalid",
            Error::AuthFailed(_) => "AuthFailed",
            Error::RateLimited(_) => "RateLimited",
            Error::Timeout(_) => "Timeout",
            Error::Network(_) => "Network",
            Error::BadRequest(_) => "BadRequest",
            Error::ServerError(_) => "ServerError",
            Error::NotFound(_) => "NotFound",
            Error::ConversationCorrupt(_) => "ConversationCorrupt",
            Error::InvariantViolation(_) => "InvariantViolation",
            Error::Cancelled(_) => "Cancelled",
        }
    }

    /// Detail string without the kind prefix.
    pub fn detail(&self) -> &str {
        match self {
            Error::ConfigInvalid(s)
            | Error::AuthFailed(s)
            | Error::RateLimited(s)
            | Error::Timeout(s)
            | Error::Network(s)
            | Error::BadRequest(s)
            | Error::ServerError(s)
            | Error::NotFound(s)
            | Error::ConversationCorrupt(s)
            | Error::InvariantViolation(s)
            | Error::Cancelled(s) => s,
        }
    }

    /// The `"Error: <kind>: <detail>"` form persisted as assistant content
    /// when a generation fails before producing any text.
    pub fn user_message(&self) -> String {
        format!("Error: {}: {}", self.kind(), self.detail())
    }

    /// Process exit code when the core is embedded in a CLI.
    ///
    /// `0` is reserved for normal termination and is never produced here.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ConfigInvalid(_) | Error::BadRequest(_) => 2,
            Error::AuthFailed(_) => 3,
            Error::NotFound(_) | Error::ConversationCorrupt(_) => 4,
            Error::Cancelled(_) => 130,
            _ => 1,
        }
    }

    /// Map an HTTP status from a provider reply into the taxonomy.
    pub fn from_status(status: u16, body: &str) -> Error {
        let detail = if body.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, body)
        };
        match status {
            401 | 403 => Error::AuthFailed(detail),
            408 => Error::Timeout(detail),
            429 => Error::RateLimited(detail),
            400 | 404 | 409 | 413 | 422 => Error::BadRequest(detail),
            500..=599 => Error::ServerError(detail),
            _ => Error::Network(detail),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            Error::from_status(status.as_u16(), &err.to_string())
        } else {
            Error::Network(err.to_string())
        }
    }
}
