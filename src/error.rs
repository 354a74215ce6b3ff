//! Typed hard faults.
//!
//! Policy violations inside the core are not errors: they surface as denied
//! [`PolicyDecision`](crate::risk::PolicyDecision)s or `false` returns. Only
//! operator calls on the orchestrator report a denial as [`EngineError::Rejected`].

use thiserror::Error;

/// Failures raised by a venue client while submitting an order.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VenueError {
    #[error("order rejected by venue: {0}")]
    Rejected(String),
    #[error("venue transport failure: {0}")]
    Transport(String),
    #[error("venue authentication failed")]
    Unauthorized,
}

/// Hard faults inside the trading core.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error(transparent)]
    Venue(#[from] VenueError),

    #[error("malformed order book for {token_id}: {reason}")]
    MalformedBook { token_id: String, reason: String },

    #[error("credentials are locked")]
    CredentialsLocked,

    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    #[error("market discovery failed: {0}")]
    Discovery(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
