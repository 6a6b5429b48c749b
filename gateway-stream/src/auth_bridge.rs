//! Small bridge so a reconnect loop can fetch a fresh bearer token from
//! [`gateway_auth::AuthModule`] without the hubs depending on its generic
//! broker-transport parameter.

use gateway_auth::{AuthModule, BrokerLogin};

use crate::market::StreamError;

/// Fetches (and refreshes if necessary) the bearer token to present on the
/// next hub handshake.
pub async fn bearer_token<B>(auth: &AuthModule<B>) -> Result<String, StreamError>
where
    B: BrokerLogin + 'static,
{
    auth.ensure_valid_token()
        .await
        .map_err(|err| StreamError::Connect(err.to_string()))
}
