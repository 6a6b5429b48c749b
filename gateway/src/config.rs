//! Env-var bootstrap for the `gateway` binary only. [`gateway_core::config`]
//! deliberately stops at "what a [`GatewayConfig`] looks like"; turning
//! environment variables into one is this crate's problem, the same split
//! the auth module draws for [`gateway_auth::Credentials::from_env`].

use std::env;
use std::time::Duration;

use gateway_core::{BracketConfigInput, GatewayConfig, HistoricalDataConfig, OrderMutexConfig, ReconciliationConfigInput};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for env var {0}: {1}")]
    Invalid(&'static str, String),
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn optional_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid(name, raw)),
        Err(_) => Ok(default),
    }
}

fn optional_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Ok(raw) => match raw.as_str() {
            "1" | "true" | "TRUE" => Ok(true),
            "0" | "false" | "FALSE" => Ok(false),
            _ => Err(ConfigError::Invalid(name, raw)),
        },
        Err(_) => Ok(default),
    }
}

/// Builds a [`GatewayConfig`] from `GATEWAY_*` environment variables,
/// falling back to the same defaults [`GatewayConfig`]'s nested sections use
/// when deserialized from JSON.
pub fn from_env() -> Result<GatewayConfig, ConfigError> {
    Ok(GatewayConfig {
        api_base_url: required("GATEWAY_API_BASE_URL")?,
        market_hub_url: required("GATEWAY_MARKET_HUB_URL")?,
        user_hub_url: required("GATEWAY_USER_HUB_URL")?,
        bus_address: env::var("GATEWAY_BUS_ADDRESS").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        monitoring_port: optional_u64("GATEWAY_MONITORING_PORT", 9200)? as u16,
        heartbeat_interval: Duration::from_millis(optional_u64("GATEWAY_HEARTBEAT_INTERVAL_MS", 15_000)?),
        reconnect_delay_ms: optional_u64("GATEWAY_RECONNECT_DELAY_MS", 1_000)?,
        max_reconnect_attempts: optional_u64("GATEWAY_MAX_RECONNECT_ATTEMPTS", 10)? as u32,
        order_mutex: OrderMutexConfig::default(),
        reconciliation: ReconciliationConfigInput::default(),
        historical_data: HistoricalDataConfig::default(),
        micro_only: optional_bool("GATEWAY_MICRO_ONLY", false)?,
        bracket: BracketConfigInput::default(),
        bot_slot_count: optional_u64("GATEWAY_BOT_SLOT_COUNT", 16)? as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_var_is_reported_by_name() {
        // Safe: these vars are not set by the test harness and no other
        // test in this module touches them concurrently.
        env::remove_var("GATEWAY_API_BASE_URL");
        let err = required("GATEWAY_API_BASE_URL").unwrap_err();
        assert!(matches!(err, ConfigError::Missing("GATEWAY_API_BASE_URL")));
    }

    #[test]
    fn optional_bool_rejects_unrecognized_values() {
        env::set_var("GATEWAY_TEST_FLAG", "maybe");
        let err = optional_bool("GATEWAY_TEST_FLAG", false).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("GATEWAY_TEST_FLAG", _)));
        env::remove_var("GATEWAY_TEST_FLAG");
    }
}
