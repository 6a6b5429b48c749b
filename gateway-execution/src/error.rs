use thiserror::Error;

/// Broker-reported error surfaced verbatim from a non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerApiError {
    pub code: i32,
    pub message: String,
}

impl std::fmt::Display for BrokerApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "broker error {}: {}", self.code, self.message)
    }
}

#[derive(Debug, Error)]
pub enum RestError {
    #[error("auth: {0}")]
    Auth(#[from] gateway_auth::AuthError),
    #[error("contract lookup: {0}")]
    Contract(#[from] gateway_markets::MarketsError),
    #[error("validation: {0}")]
    Validation(String),
    #[error("broker: {0}")]
    Broker(BrokerApiError),
    #[error("transport: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
}
