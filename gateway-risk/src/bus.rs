//! Narrow publish-only view of [`gateway_bus::MessageBus`], mirroring the
//! same seam used in `gateway-stream` and `gateway-execution` so this crate
//! can be exercised without a Redis connection.

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

#[derive(Debug, Default)]
pub struct NullPublisher;

#[async_trait]
impl Publisher for NullPublisher {
    async fn publish(&self, _event_type: &str, _data: Value, _channel: Option<&str>) -> bool {
        true
    }
}
