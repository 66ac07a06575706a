use thiserror::Error;
use uuid::Uuid;

/// Failure taxonomy for gateway event handling.
///
/// Every variant is recovered at the connection boundary into an `error`
/// event for the originating client; none of them aborts other sessions.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Room-membership or ownership check failed.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// The message store failed. Aborts the publish before any fan-out.
    #[error("storage failure: {0}")]
    Persistence(#[from] anyhow::Error),

    /// Malformed or out-of-state event.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Edit/delete target is gone.
    #[error("no such message: {0}")]
    NotFound(Uuid),
}
