//! Narrow publish-only view of [`gateway_bus::MessageBus`], so the hubs
//! depend on a trait object rather than a concrete transport and can be
//! exercised in tests without a Redis connection.

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event_type: &str, data: Value, channel: Option<&str>) -> bool;
}

#[async_trait]
impl Publisher for gateway_bus::MessageBus {
    async fn publish(&self, event_type: &str, data: Value, channel: Option<&str>) -> bool {
        gateway_bus::MessageBus::publish(self, event_type, data, channel).await
    }
}

/// Discards every publish. Used in tests that only care about dedup/reconnect
/// bookkeeping, not what crosses the bus.
#[derive(Debug, Default)]
pub struct NullPublisher;

#[async_trait]
impl Publisher for NullPublisher {
    async fn publish(&self, _event_type: &str, _data: Value, _channel: Option<&str>) -> bool {
        true
    }
}
