//! Typed configuration surface.
//!
//! Loading belongs to an external launcher (file/env parsing is out of
//! scope here, mirroring the framework's `core::system::config::SystemConfig`
//! split between "what the value looks like" and "where it comes from").
//! The gateway is simply handed a [`GatewayConfig`] value.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderMutexConfig {
    #[serde(with = "duration_millis")]
    pub lock_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub queue_timeout: Duration,
    pub max_queue_size: usize,
}

impl Default for OrderMutexConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            queue_timeout: Duration::from_secs(60),
            max_queue_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfigInput {
    #[serde(with = "duration_millis")]
    pub reconciliation_interval_ms: Duration,
    pub max_discrepancy_threshold: rust_decimal::Decimal,
    #[serde(with = "duration_millis")]
    pub position_timeout_ms: Duration,
    pub enable_auto_correction: bool,
}

impl Default for ReconciliationConfigInput {
    fn default() -> Self {
        Self {
            reconciliation_interval_ms: Duration::from_secs(30),
            max_discrepancy_threshold: rust_decimal::Decimal::new(1, 2),
            position_timeout_ms: Duration::from_secs(300),
            enable_auto_correction: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalDataConfig {
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub cache_duration: Duration,
    pub max_concurrent_requests: usize,
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
}

impl Default for HistoricalDataConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            cache_duration: Duration::from_secs(300),
            max_concurrent_requests: 5,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketConfigInput {
    pub max_retries: u32,
}

impl Default for BracketConfigInput {
    fn default() -> Self {
        Self { max_retries: 10 }
    }
}

/// Every field the core consumes, per the design's "Configuration inputs"
/// list. The gateway never reads files or environment variables itself —
/// that remains the launcher's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub api_base_url: String,
    pub market_hub_url: String,
    pub user_hub_url: String,
    pub bus_address: String,
    pub monitoring_port: u16,
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    #[serde(default)]
    pub order_mutex: OrderMutexConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfigInput,
    #[serde(default)]
    pub historical_data: HistoricalDataConfig,
    #[serde(default)]
    pub micro_only: bool,
    #[serde(default)]
    pub bracket: BracketConfigInput,
    pub bot_slot_count: usize,
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults_for_nested_sections() {
        let json = serde_json::json!({
            "api_base_url": "https://broker.example/api",
            "market_hub_url": "wss://broker.example/market",
            "user_hub_url": "wss://broker.example/user",
            "bus_address": "redis://127.0.0.1:6379",
            "monitoring_port": 9200,
            "heartbeat_interval": 15000,
            "reconnect_delay_ms": 2000,
            "max_reconnect_attempts": 10,
            "bot_slot_count": 6,
        });
        let config: GatewayConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.order_mutex.max_queue_size, 50);
        assert_eq!(config.bracket.max_retries, 10);
        assert!(config.reconciliation.enable_auto_correction);
    }
}
