//! Aggregating error type for the gateway core.
//!
//! Matches the error taxonomy of the design: Auth, Transport/Broker-Reported
//! (carried by [`gateway_execution::RestError`]), Validation, Concurrency
//! (carried by [`gateway_sync::LockError`]), Bracket and Reconciliation.
//! Every fallible router handler returns `Result<_, GatewayError>`; the
//! dispatcher never lets one propagate into a panic — it is caught at the
//! top of [`crate::router::GatewayCore`]'s dispatch loop and turned into a
//! failed response envelope instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("auth error: {0}")]
    Auth(#[from] gateway_auth::AuthError),

    #[error("markets error: {0}")]
    Markets(#[from] gateway_markets::MarketsError),

    #[error("rest error: {0}")]
    Rest(#[from] gateway_execution::RestError),

    #[error("streaming error: {0}")]
    Stream(#[from] gateway_stream::StreamError),

    #[error("concurrency error: {0}")]
    Lock(#[from] gateway_sync::LockError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown request type: {0}")]
    UnknownRequestType(String),

    #[error("bracket order not attached after retries: {0}")]
    Bracket(String),

    #[error("join error: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for GatewayError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Join(format!("{value:?}"))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for GatewayError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Join("receiver dropped".to_string())
    }
}
