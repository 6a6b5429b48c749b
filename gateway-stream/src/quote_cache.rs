//! Per-instrument memory of the last *emitted* quote/trade/depth, used to
//! suppress re-emitting a value that hasn't actually changed.
//!
//! Each `offer_*` call compares against the cached value and, if different,
//! updates the cache and reports that the caller should emit. The cache
//! itself never publishes anything; that stays the market hub's job.

use std::collections::HashMap;

use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::side::Side;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trade {
    pub price: Decimal,
    pub size: Decimal,
    pub side: Option<Side>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthLevel {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Depth {
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

#[derive(Debug, Default)]
struct Entry {
    quote: Option<Quote>,
    trade: Option<Trade>,
    depth: Option<Depth>,
}

/// Change-detecting cache of the last value sent for each instrument's
/// quote, trade, and depth streams.
#[derive(Debug, Default)]
pub struct QuoteCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl QuoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` (and updates the cache) iff `quote` differs from the
    /// last quote sent for `instrument` in any of `{bid, ask, bid_size,
    /// ask_size}`.
    pub async fn offer_quote(&self, instrument: &str, quote: Quote) -> bool {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(instrument.to_string()).or_default();
        if entry.quote == Some(quote) {
            return false;
        }
        entry.quote = Some(quote);
        true
    }

    /// Returns `true` (and updates the cache) iff `trade` differs from the
    /// last trade sent for `instrument` in `{price, size, side, timestamp}`.
    pub async fn offer_trade(&self, instrument: &str, trade: Trade) -> bool {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(instrument.to_string()).or_default();
        if entry.trade == Some(trade) {
            return false;
        }
        entry.trade = Some(trade);
        true
    }

    /// Returns `true` (and updates the cache) iff `depth` differs from the
    /// last depth snapshot sent for `instrument` (deep comparison of both
    /// sides).
    pub async fn offer_depth(&self, instrument: &str, depth: Depth) -> bool {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(instrument.to_string()).or_default();
        if entry.depth.as_ref() == Some(&depth) {
            return false;
        }
        entry.depth = Some(depth);
        true
    }

    /// Clears every cached entry, forcing the next value per instrument to
    /// always be treated as a change. Called on market-hub reconnect so
    /// resubscription doesn't silently suppress the first post-reconnect
    /// tick.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn clear_instrument(&self, instrument: &str) {
        self.entries.write().await.remove(instrument);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(bid: i64, ask: i64) -> Quote {
        Quote {
            bid: Decimal::new(bid, 1),
            ask: Decimal::new(ask, 1),
            bid_size: Decimal::ONE,
            ask_size: Decimal::ONE,
        }
    }

    #[tokio::test]
    async fn identical_quotes_are_suppressed_after_the_first() {
        let cache = QuoteCache::new();
        assert!(cache.offer_quote("MGC", q(33801, 33802)).await);
        assert!(!cache.offer_quote("MGC", q(33801, 33802)).await);
        assert!(cache.offer_quote("MGC", q(33801, 33803)).await);
    }

    #[tokio::test]
    async fn clear_forces_next_quote_to_emit() {
        let cache = QuoteCache::new();
        assert!(cache.offer_quote("MGC", q(33801, 33802)).await);
        cache.clear().await;
        assert!(cache.offer_quote("MGC", q(33801, 33802)).await);
    }

    #[tokio::test]
    async fn depth_is_compared_deeply() {
        let cache = QuoteCache::new();
        let depth_a = Depth {
            bids: vec![DepthLevel { price: Decimal::new(100, 0), size: Decimal::new(5, 0) }],
            asks: vec![DepthLevel { price: Decimal::new(101, 0), size: Decimal::new(3, 0) }],
        };
        let mut depth_b = depth_a.clone();
        assert!(cache.offer_depth("MGC", depth_a).await);
        assert!(!cache.offer_depth("MGC", depth_b.clone()).await);

        depth_b.bids[0].size = Decimal::new(6, 0);
        assert!(cache.offer_depth("MGC", depth_b).await);
    }
}
