//! Market hub — per-instrument subscriptions to quotes, trades, and market
//! depth, with change-detecting fan-out to `market:data` and full
//! resubscription (plus a quote-cache flush) on reconnect.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, warn};

use crate::bus::Publisher;
use crate::event::{MarketEvent, MarketEventKind};
use crate::normalize::{decimal_field, i64_field, string_field};
use crate::quote_cache::{Depth, DepthLevel, Quote, QuoteCache, Trade};
use crate::side::{decode_side_numeric, decode_side_text};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("subscribe failed for {instrument:?}: {reason}")]
    Subscribe { instrument: String, reason: String },
}

/// The broker's market-hub invokable methods. Implemented by the real
/// WebSocket client; abstracted here so the dedup/reconnect/resubscribe
/// logic can be tested without a socket.
#[async_trait]
pub trait MarketHubTransport: Send + Sync {
    async fn connect(&self, bearer_token: &str) -> Result<(), StreamError>;
    async fn subscribe_contract_quotes(&self, contract_id: &str) -> Result<(), StreamError>;
    async fn subscribe_contract_trades(&self, contract_id: &str) -> Result<(), StreamError>;
    async fn subscribe_contract_market_depth(&self, contract_id: &str) -> Result<(), StreamError>;
    async fn unsubscribe_contract_quotes(&self, contract_id: &str) -> Result<(), StreamError>;
    async fn unsubscribe_contract_trades(&self, contract_id: &str) -> Result<(), StreamError>;
    async fn unsubscribe_contract_market_depth(&self, contract_id: &str)
        -> Result<(), StreamError>;
}

/// Lets callers keep an `Arc<WsMarketTransport>` handle alongside the one
/// moved into [`MarketHub`] (e.g. to drive [`crate::ws_transport::WsMarketTransport::connect_and_pump`]
/// from the process entry point) without the hub needing its own clone bound.
#[async_trait]
impl<T: MarketHubTransport + ?Sized> MarketHubTransport for Arc<T> {
    async fn connect(&self, bearer_token: &str) -> Result<(), StreamError> {
        (**self).connect(bearer_token).await
    }
    async fn subscribe_contract_quotes(&self, contract_id: &str) -> Result<(), StreamError> {
        (**self).subscribe_contract_quotes(contract_id).await
    }
    async fn subscribe_contract_trades(&self, contract_id: &str) -> Result<(), StreamError> {
        (**self).subscribe_contract_trades(contract_id).await
    }
    async fn subscribe_contract_market_depth(&self, contract_id: &str) -> Result<(), StreamError> {
        (**self).subscribe_contract_market_depth(contract_id).await
    }
    async fn unsubscribe_contract_quotes(&self, contract_id: &str) -> Result<(), StreamError> {
        (**self).unsubscribe_contract_quotes(contract_id).await
    }
    async fn unsubscribe_contract_trades(&self, contract_id: &str) -> Result<(), StreamError> {
        (**self).unsubscribe_contract_trades(contract_id).await
    }
    async fn unsubscribe_contract_market_depth(&self, contract_id: &str) -> Result<(), StreamError> {
        (**self).unsubscribe_contract_market_depth(contract_id).await
    }
}

/// `(0ms, 2s, 10s, 30s, 30s, ...)` reconnect backoff curve from §4.F.
pub fn reconnect_delay(attempt: u32) -> StdDuration {
    match attempt {
        0 => StdDuration::ZERO,
        1 => StdDuration::from_secs(2),
        2 => StdDuration::from_secs(10),
        _ => StdDuration::from_secs(30),
    }
}

#[derive(Debug, Default)]
pub struct MarketMetrics {
    pub received: AtomicU64,
    pub emitted: AtomicU64,
    pub filtered: AtomicU64,
}

impl MarketMetrics {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.received.load(Ordering::Relaxed),
            self.emitted.load(Ordering::Relaxed),
            self.filtered.load(Ordering::Relaxed),
        )
    }
}

struct Shared<T> {
    transport: T,
    bus: Arc<dyn Publisher>,
    cache: QuoteCache,
    subscribed: RwLock<HashSet<String>>,
    metrics: MarketMetrics,
    local_events: broadcast::Sender<MarketEvent>,
    reconnect_lock: Mutex<()>,
}

/// Handle to the market hub. Cheap to clone; state lives behind `Arc`.
pub struct MarketHub<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for MarketHub<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T> std::fmt::Debug for MarketHub<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketHub").finish_non_exhaustive()
    }
}

impl<T> MarketHub<T>
where
    T: MarketHubTransport + 'static,
{
    pub fn new(transport: T, bus: Arc<dyn Publisher>) -> Self {
        let (local_events, _) = broadcast::channel(1024);
        Self {
            shared: Arc::new(Shared {
                transport,
                bus,
                cache: QuoteCache::new(),
                subscribed: RwLock::new(HashSet::new()),
                metrics: MarketMetrics::default(),
                local_events,
                reconnect_lock: Mutex::new(()),
            }),
        }
    }

    pub fn metrics(&self) -> &MarketMetrics {
        &self.shared.metrics
    }

    /// Local observers (e.g. the bracket engine) can watch emitted events
    /// without going through the bus.
    pub fn subscribe_local(&self) -> broadcast::Receiver<MarketEvent> {
        self.shared.local_events.subscribe()
    }

    pub async fn subscribed_instruments(&self) -> HashSet<String> {
        self.shared.subscribed.read().await.clone()
    }

    /// Subscribes to quotes, trades, and depth for `contract_id`.
    pub async fn subscribe(&self, contract_id: &str) -> Result<(), StreamError> {
        self.shared.transport.subscribe_contract_quotes(contract_id).await?;
        self.shared.transport.subscribe_contract_trades(contract_id).await?;
        self.shared.transport.subscribe_contract_market_depth(contract_id).await?;
        self.shared.subscribed.write().await.insert(contract_id.to_string());
        Ok(())
    }

    /// Unsubscribes from `contract_id`. Leaves no new QUOTE emission for it
    /// afterward (the round-trip law from §8).
    pub async fn unsubscribe(&self, contract_id: &str) -> Result<(), StreamError> {
        self.shared.transport.unsubscribe_contract_quotes(contract_id).await?;
        self.shared.transport.unsubscribe_contract_trades(contract_id).await?;
        self.shared.transport.unsubscribe_contract_market_depth(contract_id).await?;
        self.shared.subscribed.write().await.remove(contract_id);
        self.shared.cache.clear_instrument(contract_id).await;
        Ok(())
    }

    /// Resubscribes the full instrument set and clears the quote cache, as
    /// the design requires after a reconnect (S6).
    pub async fn on_reconnect(&self, bearer_token: &str) -> Result<(), StreamError> {
        let _guard = self.shared.reconnect_lock.lock().await;
        self.shared.transport.connect(bearer_token).await?;
        self.shared.cache.clear().await;
        let instruments: Vec<String> =
            self.shared.subscribed.read().await.iter().cloned().collect();
        for instrument in instruments {
            self.shared.transport.subscribe_contract_quotes(&instrument).await?;
            self.shared.transport.subscribe_contract_trades(&instrument).await?;
            self.shared.transport.subscribe_contract_market_depth(&instrument).await?;
        }
        Ok(())
    }

    /// Reconnects with the backoff curve from [`reconnect_delay`], retrying
    /// indefinitely until `on_reconnect` succeeds.
    pub async fn reconnect_with_backoff(&self, bearer_token: &str) {
        let mut attempt = 0;
        loop {
            tokio::time::sleep(reconnect_delay(attempt)).await;
            match self.on_reconnect(bearer_token).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(attempt, %err, "market hub reconnect attempt failed");
                    attempt += 1;
                }
            }
        }
    }

    /// Normalises and dedups a `GatewayQuote` payload, emitting iff
    /// `{bid, ask, bidSize, askSize}` changed.
    pub async fn handle_quote(&self, raw: Value) {
        self.shared.metrics.received.fetch_add(1, Ordering::Relaxed);
        let Some(instrument) = string_field(&raw, &["instrument", "symbol", "contractId"]) else {
            warn!("quote payload missing instrument identifier");
            return;
        };
        let (Some(bid), Some(ask)) = (
            decimal_field(&raw, &["bid", "bidPrice", "Bid"]),
            decimal_field(&raw, &["ask", "askPrice", "Ask"]),
        ) else {
            warn!(instrument, "quote payload missing bid/ask");
            return;
        };
        let bid_size = decimal_field(&raw, &["bidSize", "bidQty", "BidSize"]).unwrap_or_default();
        let ask_size = decimal_field(&raw, &["askSize", "askQty", "AskSize"]).unwrap_or_default();

        let quote = Quote { bid, ask, bid_size, ask_size };
        if !self.shared.cache.offer_quote(&instrument, quote).await {
            self.shared.metrics.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let data = json!({
            "bid": bid, "ask": ask, "bidSize": bid_size, "askSize": ask_size,
        });
        self.emit(instrument, MarketEventKind::Quote, data).await;
    }

    /// `GatewayTrade` payloads arrive as an array; each element is
    /// normalised and deduped independently. Trades with a non-positive or
    /// missing price/size are dropped; an undecodable side is logged but
    /// does not drop the trade.
    pub async fn handle_trade(&self, raw: Value) {
        let trades: Vec<Value> = match raw {
            Value::Array(items) => items,
            other => vec![other],
        };
        for item in trades {
            self.handle_single_trade(item).await;
        }
    }

    async fn handle_single_trade(&self, raw: Value) {
        self.shared.metrics.received.fetch_add(1, Ordering::Relaxed);
        let Some(instrument) = string_field(&raw, &["instrument", "symbol", "contractId"]) else {
            warn!("trade payload missing instrument identifier");
            return;
        };
        let price = decimal_field(&raw, &["price", "Price"]);
        let size = decimal_field(&raw, &["size", "volume", "Size"]);
        let (Some(price), Some(size)) = (price, size) else {
            debug!(instrument, "dropping trade with missing price/size");
            return;
        };
        if price <= rust_decimal::Decimal::ZERO || size <= rust_decimal::Decimal::ZERO {
            debug!(instrument, %price, %size, "dropping trade with non-positive price/size");
            return;
        }

        let side = i64_field(&raw, &["type", "side"])
            .and_then(decode_side_numeric)
            .or_else(|| string_field(&raw, &["side", "Side"]).and_then(|s| decode_side_text(&s)));
        if side.is_none() {
            warn!(instrument, "trade payload has unknown side");
        }

        let timestamp = i64_field(&raw, &["timestamp", "time", "ts"]).unwrap_or_else(|| Utc::now().timestamp_millis());

        let trade = Trade { price, size, side, timestamp };
        if !self.shared.cache.offer_trade(&instrument, trade).await {
            self.shared.metrics.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let data = json!({
            "price": price, "size": size,
            "side": side.map(|s| format!("{s:?}").to_uppercase()),
            "timestamp": timestamp,
        });
        self.emit(instrument, MarketEventKind::Trade, data).await;
    }

    /// Deep-compares the normalised bid/ask level arrays against the cache.
    pub async fn handle_depth(&self, raw: Value) {
        self.shared.metrics.received.fetch_add(1, Ordering::Relaxed);
        let Some(instrument) = string_field(&raw, &["instrument", "symbol", "contractId"]) else {
            warn!("depth payload missing instrument identifier");
            return;
        };
        let bids = parse_levels(&raw, &["bids", "Bids"]);
        let asks = parse_levels(&raw, &["asks", "Asks"]);
        let depth = Depth { bids, asks };

        if !self.shared.cache.offer_depth(&instrument, depth.clone()).await {
            self.shared.metrics.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let data = json!({
            "bids": depth.bids.iter().map(|l| json!({"price": l.price, "size": l.size})).collect::<Vec<_>>(),
            "asks": depth.asks.iter().map(|l| json!({"price": l.price, "size": l.size})).collect::<Vec<_>>(),
        });
        self.emit(instrument, MarketEventKind::Depth, data).await;
    }

    async fn emit(&self, instrument: String, kind: MarketEventKind, data: Value) {
        self.shared.metrics.emitted.fetch_add(1, Ordering::Relaxed);
        let timestamp = Utc::now().timestamp_millis();
        let event = MarketEvent { instrument, kind, data, timestamp };

        let event_type = match kind {
            MarketEventKind::Quote => "QUOTE",
            MarketEventKind::Trade => "TRADE",
            MarketEventKind::Depth => "DEPTH",
        };
        let payload = serde_json::to_value(&event).unwrap_or(Value::Null);
        self.shared.bus.publish(event_type, payload, Some("market:data")).await;
        let _ = self.shared.local_events.send(event);
    }
}

fn parse_levels(raw: &Value, names: &[&str]) -> Vec<DepthLevel> {
    let Some(array) = crate::normalize::first_field(raw, names).and_then(Value::as_array) else {
        return Vec::new();
    };
    array
        .iter()
        .filter_map(|level| {
            let price = decimal_field(level, &["price", "Price"])
                .or_else(|| level.as_array().and_then(|a| a.first()).and_then(crate::normalize::decimal_from_value))?;
            let size = decimal_field(level, &["size", "volume", "Size"])
                .or_else(|| level.as_array().and_then(|a| a.get(1)).and_then(crate::normalize::decimal_from_value))
                .unwrap_or_default();
            Some(DepthLevel { price, size })
        })
        .collect()
}
