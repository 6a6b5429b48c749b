//! Data carried across the REST facade and the bracket-order engine: order
//! intents, the broker's own account/contract/position/trade shapes, and
//! history-bar query parameters.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Broker wire convention: `0 -> Buy`, `1 -> Sell`.
    pub fn numeric(self) -> u8 {
        match self {
            Side::Buy => 0,
            Side::Sell => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Limit,
    Market,
    Stop,
}

impl OrderKind {
    /// Broker wire convention: `LIMIT=1, MARKET=2, STOP=4`.
    pub fn numeric(self) -> u8 {
        match self {
            OrderKind::Limit => 1,
            OrderKind::Market => 2,
            OrderKind::Stop => 4,
        }
    }
}

/// What a bot asked the gateway to place, before broker-specific
/// translation (numeric enums, tick-rounded prices).
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub instance_id: String,
    pub account_id: String,
    pub instrument: String,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: u64,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub bracket: Option<BracketSpec>,
}

/// The subset of an [`OrderIntent`] that describes the stop-loss/take-profit
/// to attach once the parent order fills. Either absolute prices or point
/// offsets from the fill price, never a mix for the same leg.
#[derive(Debug, Clone, Default)]
pub struct BracketSpec {
    pub stop_price: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub stop_loss_points: Option<Decimal>,
    pub take_profit_points: Option<Decimal>,
}

impl BracketSpec {
    pub fn is_empty(&self) -> bool {
        self.stop_price.is_none()
            && self.limit_price.is_none()
            && self.stop_loss_points.is_none()
            && self.take_profit_points.is_none()
    }

    /// Fill-based mode applies when either points field is set; price-based
    /// mode applies when absolute prices are set directly. A spec carrying
    /// both is treated as fill-based, since points are meaningless without a
    /// fill and this gateway only learns the fill price after matching.
    pub fn is_fill_based(&self) -> bool {
        self.stop_loss_points.is_some() || self.take_profit_points.is_some()
    }
}

/// A broker-reported tradable account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerAccount {
    pub account_id: String,
    pub name: String,
    pub can_trade: bool,
    pub balance: Decimal,
}

/// A broker-reported contract, as returned by `contracts/available`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerContract {
    pub contract_id: String,
    pub symbol: String,
    pub description: String,
    pub exchange: String,
    pub tick_size: Decimal,
    pub tick_value: Decimal,
    pub expiration_date: DateTime<Utc>,
    pub active_contract: bool,
}

/// A broker-reported open or closed position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub position_id: String,
    pub account_id: String,
    pub contract_id: String,
    pub side: Side,
    pub size: Decimal,
    pub average_price: Decimal,
    pub entry_time: DateTime<Utc>,
    /// Present only when the broker happens to expose parent-order linkage;
    /// the bracket engine prefers this when it's there.
    pub open_order_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerTrade {
    pub trade_id: String,
    pub account_id: String,
    pub contract_id: String,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub profit_loss: Decimal,
    pub executed_at: DateTime<Utc>,
}

/// History-bar unit, `1..7` matching the broker's own enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BarUnit {
    Second = 1,
    Minute = 2,
    Hour = 3,
    Day = 4,
    Week = 5,
    Month = 6,
    Year = 7,
}

#[derive(Debug, Clone)]
pub struct HistoryParams {
    pub contract_id: String,
    pub unit: BarUnit,
    pub unit_number: u32,
    pub limit: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub include_partial_bar: bool,
    pub live: bool,
}

impl HistoryParams {
    /// Cache key used by [`crate::history::HistoryQueue`]; two requests with
    /// the same shape share one cached response.
    pub fn cache_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{:?}|{:?}",
            self.contract_id,
            self.unit as u8,
            self.unit_number,
            self.limit,
            self.start_time,
            self.end_time
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub t: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct TradeSearchParams {
    pub account_id: String,
    pub contract_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// A single day's (or lifetime's) aggregated trading row, before the
/// router's own win-rate/profit-factor derivation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsRow {
    pub account_id: String,
    pub trade_count: u32,
    pub win_count: u32,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub net_profit: Decimal,
}
