//! The broker-facing HTTP concern, abstracted the same way the streaming
//! hubs abstract their sockets: production code talks to the real REST API,
//! tests talk to an in-memory fake. Every method here is a thin 1:1 mapping
//! to one broker endpoint; request validation, tick rounding, caching and
//! retries all live in [`crate::rest::RestFacade`], not here.

use async_trait::async_trait;
use gateway_auth::AuthHeaders;

use crate::error::RestError;
use crate::types::{
    Bar, BrokerAccount, BrokerContract, BrokerPosition, BrokerTrade, HistoryParams, OrderIntent,
    TradeSearchParams,
};

/// Request to place an order, already broker-numeric and tick-rounded.
#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub account_id: String,
    pub contract_id: String,
    pub side: u8,
    pub order_type: u8,
    pub quantity: u64,
    pub limit_price: Option<rust_decimal::Decimal>,
    pub stop_price: Option<rust_decimal::Decimal>,
}

#[async_trait]
pub trait BrokerRest: Send + Sync {
    async fn search_accounts(&self, headers: &AuthHeaders) -> Result<Vec<BrokerAccount>, RestError>;
    async fn contracts_available(&self, headers: &AuthHeaders) -> Result<Vec<BrokerContract>, RestError>;
    async fn place_order(&self, headers: &AuthHeaders, req: PlaceOrderRequest) -> Result<String, RestError>;
    async fn cancel_order(&self, headers: &AuthHeaders, broker_order_id: &str) -> Result<(), RestError>;
    async fn edit_stop_loss_take_profit(
        &self,
        headers: &AuthHeaders,
        position_id: &str,
        stop_loss: Option<rust_decimal::Decimal>,
        take_profit: Option<rust_decimal::Decimal>,
    ) -> Result<(), RestError>;
    async fn search_positions(&self, headers: &AuthHeaders, account_id: &str) -> Result<Vec<BrokerPosition>, RestError>;
    async fn search_open_positions(&self, headers: &AuthHeaders, account_id: &str) -> Result<Vec<BrokerPosition>, RestError>;
    async fn close_position(
        &self,
        headers: &AuthHeaders,
        account_id: &str,
        contract_id: &str,
        size: Option<rust_decimal::Decimal>,
    ) -> Result<(), RestError>;
    async fn history_bars(&self, headers: &AuthHeaders, params: &HistoryParams) -> Result<Vec<Bar>, RestError>;
    async fn search_trades(&self, headers: &AuthHeaders, params: &TradeSearchParams) -> Result<Vec<BrokerTrade>, RestError>;
    async fn today_stats(&self, headers: &AuthHeaders, account_id: &str) -> Result<crate::types::StatsRow, RestError>;
    async fn lifetime_stats(&self, headers: &AuthHeaders, account_id: &str) -> Result<crate::types::StatsRow, RestError>;
}

/// Trivial helper used by [`crate::rest::RestFacade::place_order`] to build
/// a [`PlaceOrderRequest`] from an already-validated, already-rounded
/// [`OrderIntent`] plus the resolved broker contract id.
pub fn build_place_order_request(intent: &OrderIntent, contract_id: String) -> PlaceOrderRequest {
    PlaceOrderRequest {
        account_id: intent.account_id.clone(),
        contract_id,
        side: intent.side.numeric(),
        order_type: intent.kind.numeric(),
        quantity: intent.quantity,
        limit_price: intent.limit_price,
        stop_price: intent.stop_price,
    }
}
