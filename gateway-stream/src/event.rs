//! Event shapes published to `market:data` by the streaming data plane, and
//! the local-observer channel mirroring them for in-process consumers
//! (the bracket engine, the router's fill probe) that don't want to pay for
//! a bus round-trip.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketEventKind {
    Quote,
    Trade,
    Depth,
}

/// `{instrument, type, data, timestamp}` — the shape emitted on
/// `market:data` for every QUOTE/TRADE/DEPTH change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEvent {
    pub instrument: String,
    #[serde(rename = "type")]
    pub kind: MarketEventKind,
    pub data: serde_json::Value,
    pub timestamp: i64,
}

/// The five canonical user-hub events, after normalisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UserEvent {
    #[serde(rename = "ACCOUNT_UPDATE")]
    AccountUpdate { data: serde_json::Value },
    #[serde(rename = "POSITION_UPDATE")]
    PositionUpdate {
        account_id: String,
        position_id: String,
        contract_id: String,
        side: crate::side::PositionSide,
        size: rust_decimal::Decimal,
        average_price: rust_decimal::Decimal,
    },
    #[serde(rename = "ORDER_FILLED")]
    OrderFilled {
        account_id: String,
        order_id: String,
        contract_id: String,
        side: crate::side::Side,
        fill_volume: rust_decimal::Decimal,
        filled_price: rust_decimal::Decimal,
    },
    #[serde(rename = "TRADE_EXECUTED")]
    TradeExecuted {
        trade_id: String,
        order_id: String,
        size: rust_decimal::Decimal,
        price: rust_decimal::Decimal,
        profit_and_loss: Option<rust_decimal::Decimal>,
        fees: Option<rust_decimal::Decimal>,
    },
}

impl UserEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            UserEvent::AccountUpdate { .. } => "ACCOUNT_UPDATE",
            UserEvent::PositionUpdate { .. } => "POSITION_UPDATE",
            UserEvent::OrderFilled { .. } => "ORDER_FILLED",
            UserEvent::TradeExecuted { .. } => "TRADE_EXECUTED",
        }
    }
}
