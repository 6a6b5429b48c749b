#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    clippy::unused_self,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_extern_crates
)]

//! # Message Bus Adapter
//!
//! Publish/subscribe wrapper over a Redis-style external broker. Channels
//! are plain strings resolved from a fixed event-type table; payloads are
//! JSON envelopes `{type, payload, timestamp}`. Owns reconnection with
//! exponential backoff, an offline send-queue drained on reconnect, and a
//! periodic ping that drives reconnection on failure.
//!
//! Publish never raises to the caller: a failed publish is logged and
//! returns `false`. Subscribe handlers run in their own task; a panicking
//! handler is caught and logged rather than taking down the bus.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Envelope every message is wrapped in on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: i64,
}

/// Resolves a fixed event-type to its channel, mirroring the router's
/// request-type table. Unknown event types fall back to the system channel
/// with a warning rather than failing the publish.
pub fn resolve_channel(event_type: &str) -> &'static str {
    match event_type {
        "QUOTE" | "TRADE" | "DEPTH" | "ORDER_FILLED" | "POSITION_UPDATE" | "TRADE_EXECUTED" | "ACCOUNT_UPDATE" => {
            "market:data"
        }
        "PLACE_ORDER" | "CANCEL_ORDER" | "ORDER_RESPONSE" | "ORDER_CANCELLATION_RESPONSE" | "BRACKET_ORDER_COMPLETE" => {
            "order:management"
        }
        "REGISTER_INSTANCE" | "DEREGISTER_INSTANCE" | "REQUEST_RECONCILIATION" | "RECONCILIATION_RESULT" => {
            "connection-manager:requests"
        }
        "CONNECTION_MANAGER_RESPONSE" | "GET_POSITIONS" | "GET_ACCOUNTS" | "EDIT_SLTP" | "SLTP_RESPONSE" => {
            "connection-manager:response"
        }
        "REGISTER_ACCOUNT" | "ACCOUNT_RESPONSE" => "account-response",
        "REQUEST_HISTORICAL_DATA" | "HISTORICAL_DATA_RESPONSE" => "historical:data:response",
        "CONNECTED" | "RECONNECTING" | "SHUTTING_DOWN" => "connection:status",
        "SYSTEM" | "HEARTBEAT" | "GATEWAY_STATUS" | "PAUSE_TRADING" | "RESUME_TRADING" | "RECONCILIATION_REQUIRED" => {
            "system:events"
        }
        other => {
            warn!(event_type = other, "unmapped event type, defaulting to system:events channel");
            "system:events"
        }
    }
}

/// Handles one decoded [`Envelope`] delivered on a subscribed channel.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope);
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(Envelope) + Send + Sync,
{
    async fn handle(&self, envelope: Envelope) {
        (self)(envelope)
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub redis_url: String,
    pub max_reconnect_attempts: u32,
    pub ping_interval: StdDuration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".into(),
            max_reconnect_attempts: 10,
            ping_interval: StdDuration::from_secs(30),
        }
    }
}

/// `min(1000 * 2^attempt, 30000)` ms, matching the design's backoff curve.
fn reconnect_delay(attempt: u32) -> StdDuration {
    let millis = 1000u64.saturating_mul(1u64 << attempt.min(20));
    StdDuration::from_millis(millis.min(30_000))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Outgoing {
    channel: String,
    body: String,
}

struct Shared {
    client: redis::Client,
    config: BusConfig,
    state: RwLock<ConnectionState>,
    conn: RwLock<Option<ConnectionManager>>,
    offline_queue: Mutex<VecDeque<Outgoing>>,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn MessageHandler>>>>,
    subscribed: Mutex<HashSet<String>>,
    resubscribe_tx: mpsc::UnboundedSender<()>,
}

/// Handle to the message bus. Cheap to clone; all state lives behind `Arc`.
#[derive(Clone)]
pub struct MessageBus {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("redis_url", &self.shared.config.redis_url)
            .finish_non_exhaustive()
    }
}

impl MessageBus {
    pub async fn connect(config: BusConfig) -> Result<Self, BusError> {
        let client = redis::Client::open(config.redis_url.clone())
            .map_err(|err| BusError::Connection(err.to_string()))?;

        let (resubscribe_tx, resubscribe_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            client,
            config: config.clone(),
            state: RwLock::new(ConnectionState::Disconnected),
            conn: RwLock::new(None),
            offline_queue: Mutex::new(VecDeque::new()),
            handlers: RwLock::new(HashMap::new()),
            subscribed: Mutex::new(HashSet::new()),
            resubscribe_tx,
        });

        let bus = Self { shared };
        bus.establish_connection().await;
        bus.spawn_ping_task();
        bus.spawn_pubsub_task(resubscribe_rx);
        Ok(bus)
    }

    /// Wraps `data` in an envelope and publishes it, resolving `channel`
    /// from [`resolve_channel`] when not supplied. Never propagates an
    /// error: failures are logged and `false` is returned.
    pub async fn publish(
        &self,
        event_type: &str,
        data: serde_json::Value,
        channel: Option<&str>,
    ) -> bool {
        let channel = channel.unwrap_or_else(|| resolve_channel(event_type)).to_string();
        let envelope = Envelope {
            event_type: event_type.to_string(),
            payload: data,
            timestamp: Utc::now().timestamp_millis(),
        };

        let body = match serde_json::to_string(&envelope) {
            Ok(body) => body,
            Err(err) => {
                error!(%err, event_type, "failed to serialize envelope");
                return false;
            }
        };

        self.publish_raw(channel, body).await
    }

    async fn publish_raw(&self, channel: String, body: String) -> bool {
        let connected = *self.shared.state.read().await == ConnectionState::Connected;
        if !connected {
            self.enqueue_offline(channel, body).await;
            return false;
        }

        let mut guard = self.shared.conn.write().await;
        if let Some(conn) = guard.as_mut() {
            match conn.publish::<_, _, i64>(&channel, body.clone()).await {
                Ok(_) => true,
                Err(err) => {
                    warn!(%err, channel, "publish failed, queuing and marking disconnected");
                    drop(guard);
                    self.mark_disconnected().await;
                    self.enqueue_offline(channel, body).await;
                    false
                }
            }
        } else {
            drop(guard);
            self.enqueue_offline(channel, body).await;
            false
        }
    }

    async fn enqueue_offline(&self, channel: String, body: String) {
        let mut queue = self.shared.offline_queue.lock().await;
        queue.push_back(Outgoing { channel, body });
    }

    /// Marks the bus disconnected without scheduling a reconnect. Used at
    /// shutdown, after which further `publish` calls queue offline instead
    /// of reaching the wire.
    pub async fn disconnect(&self) {
        *self.shared.state.write().await = ConnectionState::Disconnected;
        *self.shared.conn.write().await = None;
        info!("message bus disconnected");
    }

    /// Registers `handler` for `channel`, subscribing over the wire if this
    /// is the channel's first handler.
    pub async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) {
        let mut handlers = self.shared.handlers.write().await;
        handlers.entry(channel.to_string()).or_default().push(handler);
        drop(handlers);

        let mut subscribed = self.shared.subscribed.lock().await;
        subscribed.insert(channel.to_string());
        drop(subscribed);

        let _ = self.shared.resubscribe_tx.send(());
    }

    async fn establish_connection(&self) {
        *self.shared.state.write().await = ConnectionState::Connecting;
        match ConnectionManager::new(self.shared.client.clone()).await {
            Ok(manager) => {
                *self.shared.conn.write().await = Some(manager);
                *self.shared.state.write().await = ConnectionState::Connected;
                info!("message bus connected");
                self.drain_offline_queue().await;
                let _ = self.shared.resubscribe_tx.send(());
            }
            Err(err) => {
                warn!(%err, "initial message bus connection failed, will retry");
                *self.shared.state.write().await = ConnectionState::Disconnected;
                self.spawn_reconnect_task();
            }
        }
    }

    async fn mark_disconnected(&self) {
        let mut state = self.shared.state.write().await;
        if *state == ConnectionState::Connected {
            *state = ConnectionState::Disconnected;
            *self.shared.conn.write().await = None;
            drop(state);
            self.spawn_reconnect_task();
        }
    }

    fn spawn_reconnect_task(&self) {
        let bus = self.clone();
        tokio::spawn(async move {
            for attempt in 0..bus.shared.config.max_reconnect_attempts {
                let delay = reconnect_delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect backoff");
                tokio::time::sleep(delay).await;

                match ConnectionManager::new(bus.shared.client.clone()).await {
                    Ok(manager) => {
                        *bus.shared.conn.write().await = Some(manager);
                        *bus.shared.state.write().await = ConnectionState::Connected;
                        info!(attempt, "message bus reconnected");
                        bus.drain_offline_queue().await;
                        let _ = bus.shared.resubscribe_tx.send(());
                        return;
                    }
                    Err(err) => {
                        warn!(%err, attempt, "reconnect attempt failed");
                    }
                }
            }
            error!(
                attempts = bus.shared.config.max_reconnect_attempts,
                "exhausted reconnect attempts, message bus remains disconnected"
            );
        });
    }

    async fn drain_offline_queue(&self) {
        let mut queue = self.shared.offline_queue.lock().await;
        if queue.is_empty() {
            return;
        }
        info!(queued = queue.len(), "draining offline publish queue");
        let pending: Vec<Outgoing> = queue.drain(..).collect();
        drop(queue);

        for item in pending {
            if !self.publish_raw(item.channel.clone(), item.body.clone()).await {
                // publish_raw already re-queued it on failure.
                break;
            }
        }
    }

    fn spawn_ping_task(&self) {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(bus.shared.config.ping_interval);
            loop {
                interval.tick().await;
                let connected = *bus.shared.state.read().await == ConnectionState::Connected;
                if !connected {
                    continue;
                }
                let mut guard = bus.shared.conn.write().await;
                if let Some(conn) = guard.as_mut() {
                    let pong: Result<String, _> = redis::cmd("PING").query_async(conn).await;
                    if pong.is_err() {
                        warn!("ping failed, triggering reconnection");
                        drop(guard);
                        bus.mark_disconnected().await;
                    }
                }
            }
        });
    }

    fn spawn_pubsub_task(&self, mut resubscribe_rx: mpsc::UnboundedReceiver<()>) {
        let bus = self.clone();
        tokio::spawn(async move {
            loop {
                if resubscribe_rx.recv().await.is_none() {
                    return;
                }
                let channels: Vec<String> =
                    bus.shared.subscribed.lock().await.iter().cloned().collect();
                if channels.is_empty() {
                    continue;
                }
                bus.run_pubsub_until_error(channels).await;
            }
        });
    }

    async fn run_pubsub_until_error(&self, channels: Vec<String>) {
        let mut pubsub = match self.shared.client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(err) => {
                warn!(%err, "failed to open pubsub connection");
                return;
            }
        };

        for channel in &channels {
            if let Err(err) = pubsub.subscribe(channel).await {
                warn!(%err, channel, "failed to subscribe");
                return;
            }
        }
        debug!(?channels, "subscribed to channels");

        let mut stream = pubsub.on_message();
        use futures_util::StreamExt;
        while let Some(msg) = stream.next().await {
            let channel: String = msg.get_channel_name().to_string();
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(%err, channel, "failed to decode pubsub payload");
                    continue;
                }
            };
            self.dispatch(&channel, payload).await;
        }

        warn!("pubsub stream ended, will attempt to reconnect and resubscribe");
        self.mark_disconnected().await;
    }

    async fn dispatch(&self, channel: &str, raw: String) {
        let raw_value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, channel, "failed to parse message as json");
                return;
            }
        };

        let fixed = reconstitute_character_array(raw_value);
        let envelope: Envelope = match serde_json::from_value(fixed) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%err, channel, "message did not match envelope shape");
                return;
            }
        };

        let handlers = {
            let guard = self.shared.handlers.read().await;
            guard.get(channel).cloned().unwrap_or_default()
        };

        for handler in handlers {
            let envelope = envelope.clone();
            let channel = channel.to_string();
            let join = tokio::spawn(async move {
                handler.handle(envelope).await;
            });
            if let Err(err) = join.await {
                error!(%err, channel, "subscribe handler panicked");
            }
        }
    }
}

/// Workaround for a known broker-library quirk: a JSON string value
/// arriving as a dict of consecutive integer-string keys to single
/// characters (e.g. `{"0": "a", "1": "b"}` instead of `"ab"`). Detected and
/// reassembled, then re-parsed as JSON (falling back to the plain string if
/// it isn't itself JSON).
fn reconstitute_character_array(value: serde_json::Value) -> serde_json::Value {
    let serde_json::Value::Object(map) = &value else {
        return value;
    };
    if map.is_empty() {
        return value;
    }

    let is_character_array = (0..map.len()).all(|i| {
        matches!(
            map.get(&i.to_string()),
            Some(serde_json::Value::String(s)) if s.chars().count() == 1
        )
    });
    if !is_character_array {
        return value;
    }

    let reconstructed: String = (0..map.len())
        .filter_map(|i| map.get(&i.to_string()).and_then(|v| v.as_str()))
        .collect();

    serde_json::from_str(&reconstructed)
        .unwrap_or(serde_json::Value::String(reconstructed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_channel_maps_known_event_types() {
        assert_eq!(resolve_channel("PLACE_ORDER"), "order:management");
        assert_eq!(resolve_channel("QUOTE"), "market:data");
        assert_eq!(resolve_channel("ORDER_FILLED"), "market:data");
        assert_eq!(resolve_channel("ACCOUNT_UPDATE"), "market:data");
        assert_eq!(resolve_channel("REQUEST_RECONCILIATION"), "connection-manager:requests");
    }

    #[test]
    fn resolve_channel_defaults_unknown_to_system() {
        assert_eq!(resolve_channel("SOMETHING_NEW"), "system:events");
    }

    #[test]
    fn reconstitute_turns_character_dict_into_string() {
        let input = serde_json::json!({"0": "\"", "1": "o", "2": "k", "3": "\""});
        let result = reconstitute_character_array(input);
        assert_eq!(result, serde_json::Value::String("ok".to_string()));
    }

    #[test]
    fn reconstitute_turns_character_dict_into_nested_json() {
        let input = serde_json::json!({"0": "{", "1": "}"});
        let result = reconstitute_character_array(input);
        assert_eq!(result, serde_json::json!({}));
    }

    #[test]
    fn reconstitute_leaves_ordinary_objects_untouched() {
        let input = serde_json::json!({"accountId": "A1", "symbol": "WINQ24"});
        let result = reconstitute_character_array(input.clone());
        assert_eq!(result, input);
    }

    #[test]
    fn reconstitute_leaves_non_objects_untouched() {
        let input = serde_json::json!([1, 2, 3]);
        let result = reconstitute_character_array(input.clone());
        assert_eq!(result, input);
    }

    #[test]
    fn reconnect_delay_follows_exponential_curve_capped_at_30s() {
        assert_eq!(reconnect_delay(0), StdDuration::from_millis(1000));
        assert_eq!(reconnect_delay(1), StdDuration::from_millis(2000));
        assert_eq!(reconnect_delay(4), StdDuration::from_millis(16_000));
        assert_eq!(reconnect_delay(10), StdDuration::from_millis(30_000));
    }
}
