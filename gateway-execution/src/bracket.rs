//! Two-phase bracket-order fulfillment: a parent order is placed
//! synchronously, then this engine polls positions until it can match the
//! fill and attach the stop-loss/take-profit leg via `editStopLossAccount`.
//! At most one pending bracket exists per broker order id at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use gateway_auth::BrokerLogin;
use gateway_markets::ContractCache;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::bus::Publisher;
use crate::error::RestError;
use crate::rest::RestFacade;
use crate::transport::BrokerRest;
use crate::types::{BracketSpec, BrokerPosition, Side};

#[derive(Debug, Clone)]
pub struct BracketConfig {
    pub initial_delay: StdDuration,
    pub retry_delay: StdDuration,
    pub max_retries: u32,
}

impl Default for BracketConfig {
    fn default() -> Self {
        Self {
            initial_delay: StdDuration::from_secs(3),
            retry_delay: StdDuration::from_secs(2),
            max_retries: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingBracket {
    pub broker_order_id: String,
    pub spec: BracketSpec,
    pub side: Side,
    pub instance_id: String,
    pub account_id: String,
    pub instrument: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

struct BracketOutcome {
    position_id: String,
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
}

/// `60s + retryCount * 5s` — the window a just-filled position must fall
/// within to be considered a match, widened on each retry to tolerate slow
/// fills.
fn matching_window(retry_count: u32) -> chrono::Duration {
    chrono::Duration::seconds(60) + chrono::Duration::seconds(5) * retry_count as i32
}

pub struct BracketEngine<B, R> {
    facade: Arc<RestFacade<B, R>>,
    contract_cache: Arc<ContractCache>,
    bus: Arc<dyn Publisher>,
    config: BracketConfig,
    pending: RwLock<HashMap<String, PendingBracket>>,
}

impl<B, R> std::fmt::Debug for BracketEngine<B, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BracketEngine").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<B, R> BracketEngine<B, R>
where
    B: BrokerLogin + 'static,
    R: BrokerRest + 'static,
{
    pub fn new(
        facade: Arc<RestFacade<B, R>>,
        contract_cache: Arc<ContractCache>,
        bus: Arc<dyn Publisher>,
        config: BracketConfig,
    ) -> Self {
        Self { facade, contract_cache, bus, config, pending: RwLock::new(HashMap::new()) }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Records a pending bracket after a successful parent placement. The
    /// caller is responsible for scheduling the first [`Self::check_and_apply`]
    /// call after `config.initial_delay` (the engine itself spawns nothing,
    /// so it stays trivially testable without a background scheduler).
    pub async fn register(
        &self,
        broker_order_id: String,
        spec: BracketSpec,
        side: Side,
        instance_id: String,
        account_id: String,
        instrument: String,
    ) {
        let bracket = PendingBracket {
            broker_order_id: broker_order_id.clone(),
            spec,
            side,
            instance_id,
            account_id,
            instrument,
            retry_count: 0,
            max_retries: self.config.max_retries,
            created_at: Utc::now(),
        };
        self.pending.write().await.insert(broker_order_id, bracket);
    }

    pub fn initial_delay(&self) -> StdDuration {
        self.config.initial_delay
    }

    pub fn retry_delay(&self) -> StdDuration {
        self.config.retry_delay
    }

    pub async fn is_pending(&self, broker_order_id: &str) -> bool {
        self.pending.read().await.contains_key(broker_order_id)
    }

    /// One iteration of `checkAndApplyBracketOrders`. Returns `true` if the
    /// bracket reached a terminal outcome (matched-and-applied, retries
    /// exhausted, or a validation/broker failure) and was removed from the
    /// pending map; `false` if it should be rescheduled after
    /// `config.retry_delay`.
    pub async fn check_and_apply(&self, broker_order_id: &str) -> bool {
        let bracket = { self.pending.read().await.get(broker_order_id).cloned() };
        let Some(bracket) = bracket else { return true };

        match self.try_match_and_apply(&bracket).await {
            Ok(Some(outcome)) => {
                self.pending.write().await.remove(broker_order_id);
                self.publish_complete(&bracket, outcome).await;
                true
            }
            Ok(None) => {
                let mut guard = self.pending.write().await;
                let Some(entry) = guard.get_mut(broker_order_id) else { return true };
                entry.retry_count += 1;
                if entry.retry_count >= entry.max_retries {
                    let entry = guard.remove(broker_order_id).expect("just matched above");
                    drop(guard);
                    warn!(broker_order_id, "bracket position not matched after max retries");
                    self.publish_failure(&entry, "position not matched after max retries").await;
                    true
                } else {
                    false
                }
            }
            Err(err) => {
                let entry = self.pending.write().await.remove(broker_order_id);
                warn!(%err, broker_order_id, "bracket apply failed");
                if let Some(entry) = entry {
                    self.publish_failure(&entry, &err.to_string()).await;
                }
                true
            }
        }
    }

    async fn try_match_and_apply(&self, bracket: &PendingBracket) -> Result<Option<BracketOutcome>, RestError> {
        let positions = self.facade.search_open_positions(&bracket.account_id).await?;

        let source = self.facade.as_contract_source();
        let expected_contract_id = self
            .contract_cache
            .get_contract_id_for_instrument(&bracket.instrument, &source)
            .await?
            .ok_or_else(|| RestError::Validation(format!("unknown instrument {:?}", bracket.instrument)))?;

        let matched = match_position(&positions, bracket, &expected_contract_id);
        let Some(position) = matched else { return Ok(None) };

        let (final_stop, final_take) = compute_levels(bracket, &position)?;
        self.facade.edit_stop_loss_account(&position.position_id, final_stop, final_take).await?;

        Ok(Some(BracketOutcome { position_id: position.position_id.clone(), stop_loss: final_stop, take_profit: final_take }))
    }

    async fn publish_complete(&self, bracket: &PendingBracket, outcome: BracketOutcome) {
        let payload = json!({
            "success": true,
            "brokerOrderId": bracket.broker_order_id,
            "instanceId": bracket.instance_id,
            "positionId": outcome.position_id,
            "stopLoss": outcome.stop_loss,
            "takeProfit": outcome.take_profit,
        });
        self.bus.publish("BRACKET_ORDER_COMPLETE", payload, Some("order:management")).await;
        info!(broker_order_id = %bracket.broker_order_id, "bracket order complete");
    }

    async fn publish_failure(&self, bracket: &PendingBracket, error: &str) {
        let payload = json!({
            "success": false,
            "brokerOrderId": bracket.broker_order_id,
            "instanceId": bracket.instance_id,
            "error": error,
        });
        self.bus.publish("BRACKET_ORDER_COMPLETE", payload, Some("order:management")).await;
    }
}

/// Prefers a direct `openOrderId`/`orderId` match when the broker happens to
/// expose parent-child linkage; otherwise falls back to contract id plus a
/// recency window, picking the most recently opened candidate.
fn match_position(positions: &[BrokerPosition], bracket: &PendingBracket, expected_contract_id: &str) -> Option<BrokerPosition> {
    if let Some(direct) = positions.iter().find(|p| p.open_order_id.as_deref() == Some(bracket.broker_order_id.as_str())) {
        return Some(direct.clone());
    }

    let window = matching_window(bracket.retry_count);
    let now = Utc::now();
    positions
        .iter()
        .filter(|p| p.contract_id == expected_contract_id && now - p.entry_time < window)
        .max_by_key(|p| p.entry_time)
        .cloned()
}

fn compute_levels(bracket: &PendingBracket, position: &BrokerPosition) -> Result<(Option<Decimal>, Option<Decimal>), RestError> {
    if bracket.spec.is_fill_based() {
        let fill_price = position.average_price;
        if fill_price <= Decimal::ZERO {
            return Err(RestError::Validation("fill price must be positive".into()));
        }
        let sl_points = bracket.spec.stop_loss_points.unwrap_or(Decimal::ZERO);
        let tp_points = bracket.spec.take_profit_points.unwrap_or(Decimal::ZERO);
        if sl_points < Decimal::ZERO || tp_points < Decimal::ZERO {
            return Err(RestError::Validation("bracket points must be non-negative".into()));
        }
        let (stop, take) = match bracket.side {
            Side::Buy => (fill_price - sl_points, fill_price + tp_points),
            Side::Sell => (fill_price + sl_points, fill_price - tp_points),
        };
        Ok((
            bracket.spec.stop_loss_points.map(|_| stop),
            bracket.spec.take_profit_points.map(|_| take),
        ))
    } else {
        Ok((bracket.spec.stop_price, bracket.spec.limit_price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::NullPublisher;
    use crate::rest::RestFacade;
    use crate::transport::{BrokerRest, PlaceOrderRequest};
    use crate::types::{BrokerAccount, BrokerContract, BrokerTrade, HistoryParams, StatsRow, TradeSearchParams};
    use async_trait::async_trait;
    use gateway_auth::{AuthConfig, AuthError, AuthHeaders, AuthModule, Credentials, TokenResponse};
    use gateway_markets::Contract;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeLogin;
    #[async_trait]
    impl BrokerLogin for FakeLogin {
        async fn login(&self, _creds: &Credentials) -> Result<TokenResponse, AuthError> {
            Ok(TokenResponse { access_token: "tok".into(), expires_in_secs: 3600 })
        }
        async fn refresh(&self, _token: &str) -> Result<TokenResponse, AuthError> {
            Ok(TokenResponse { access_token: "tok".into(), expires_in_secs: 3600 })
        }
    }

    struct ScriptedRest {
        positions: StdMutex<Vec<BrokerPosition>>,
        edit_calls: AtomicUsize,
        last_edit: StdMutex<Option<(Option<Decimal>, Option<Decimal>)>>,
    }

    #[async_trait]
    impl BrokerRest for ScriptedRest {
        async fn search_accounts(&self, _h: &AuthHeaders) -> Result<Vec<BrokerAccount>, RestError> {
            Ok(vec![])
        }
        async fn contracts_available(&self, _h: &AuthHeaders) -> Result<Vec<BrokerContract>, RestError> {
            Ok(vec![BrokerContract {
                contract_id: "CON.F.US.MGC.Z25".into(),
                symbol: "MGC".into(),
                description: "Micro Gold".into(),
                exchange: "COMEX".into(),
                tick_size: Decimal::new(1, 1),
                tick_value: Decimal::new(1, 0),
                expiration_date: Utc::now(),
                active_contract: true,
            }])
        }
        async fn place_order(&self, _h: &AuthHeaders, _req: PlaceOrderRequest) -> Result<String, RestError> {
            Ok("broker-1".into())
        }
        async fn cancel_order(&self, _h: &AuthHeaders, _id: &str) -> Result<(), RestError> {
            Ok(())
        }
        async fn edit_stop_loss_take_profit(
            &self,
            _h: &AuthHeaders,
            _position_id: &str,
            sl: Option<Decimal>,
            tp: Option<Decimal>,
        ) -> Result<(), RestError> {
            self.edit_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_edit.lock().unwrap() = Some((sl, tp));
            Ok(())
        }
        async fn search_positions(&self, _h: &AuthHeaders, _account_id: &str) -> Result<Vec<BrokerPosition>, RestError> {
            Ok(self.positions.lock().unwrap().clone())
        }
        async fn search_open_positions(&self, _h: &AuthHeaders, _account_id: &str) -> Result<Vec<BrokerPosition>, RestError> {
            Ok(self.positions.lock().unwrap().clone())
        }
        async fn close_position(&self, _h: &AuthHeaders, _a: &str, _c: &str, _s: Option<Decimal>) -> Result<(), RestError> {
            Ok(())
        }
        async fn history_bars(&self, _h: &AuthHeaders, _params: &HistoryParams) -> Result<Vec<crate::types::Bar>, RestError> {
            Ok(vec![])
        }
        async fn search_trades(&self, _h: &AuthHeaders, _params: &TradeSearchParams) -> Result<Vec<BrokerTrade>, RestError> {
            Ok(vec![])
        }
        async fn today_stats(&self, _h: &AuthHeaders, account_id: &str) -> Result<StatsRow, RestError> {
            Ok(StatsRow { account_id: account_id.into(), ..Default::default() })
        }
        async fn lifetime_stats(&self, _h: &AuthHeaders, account_id: &str) -> Result<StatsRow, RestError> {
            Ok(StatsRow { account_id: account_id.into(), ..Default::default() })
        }
    }

    fn engine(positions: Vec<BrokerPosition>) -> (Arc<BracketEngine<FakeLogin, ScriptedRest>>, Arc<ScriptedRest>) {
        let auth = AuthModule::new(FakeLogin, Credentials { username: "u".into(), key: "k".into() }, AuthConfig::default());
        let rest = Arc::new(ScriptedRest { positions: StdMutex::new(positions), edit_calls: AtomicUsize::new(0), last_edit: StdMutex::new(None) });
        let cache = Arc::new(ContractCache::default());
        let facade = Arc::new(RestFacade::with_shared_rest(auth, rest.clone(), cache.clone()));
        let engine = Arc::new(BracketEngine::new(facade, cache, Arc::new(NullPublisher), BracketConfig::default()));
        (engine, rest)
    }

    fn position(contract_id: &str, entry_time: DateTime<Utc>, average_price: Decimal) -> BrokerPosition {
        BrokerPosition {
            position_id: "pos-1".into(),
            account_id: "A1".into(),
            contract_id: contract_id.into(),
            side: Side::Buy,
            size: Decimal::ONE,
            average_price,
            entry_time,
            open_order_id: None,
        }
    }

    #[tokio::test]
    async fn fill_based_bracket_computes_levels_from_position_average_price() {
        let pos = position("CON.F.US.MGC.Z25", Utc::now(), Decimal::new(33806, 1));
        let (engine, rest) = engine(vec![pos]);
        engine
            .register(
                "broker-1".into(),
                BracketSpec { stop_loss_points: Some(Decimal::new(40, 1)), take_profit_points: Some(Decimal::new(60, 1)), ..Default::default() },
                Side::Buy,
                "bot-1".into(),
                "A1".into(),
                "MGC".into(),
            )
            .await;

        let terminal = engine.check_and_apply("broker-1").await;
        assert!(terminal);
        assert!(!engine.is_pending("broker-1").await);
        assert_eq!(rest.edit_calls.load(Ordering::SeqCst), 1);
        let (stop, take) = rest.last_edit.lock().unwrap().unwrap();
        assert_eq!(stop, Some(Decimal::new(33766, 1)));
        assert_eq!(take, Some(Decimal::new(33866, 1)));
    }

    #[tokio::test]
    async fn no_match_reschedules_until_max_retries() {
        let (engine, _rest) = engine(vec![]);
        engine
            .register(
                "broker-1".into(),
                BracketSpec { stop_price: Some(Decimal::new(33700, 1)), ..Default::default() },
                Side::Buy,
                "bot-1".into(),
                "A1".into(),
                "MGC".into(),
            )
            .await;

        for _ in 0..9 {
            let terminal = engine.check_and_apply("broker-1").await;
            assert!(!terminal);
            assert!(engine.is_pending("broker-1").await);
        }

        let terminal = engine.check_and_apply("broker-1").await;
        assert!(terminal);
        assert!(!engine.is_pending("broker-1").await);
    }

    #[tokio::test]
    async fn price_based_bracket_uses_absolute_prices_verbatim() {
        let pos = position("CON.F.US.MGC.Z25", Utc::now(), Decimal::new(33806, 1));
        let (engine, _rest) = engine(vec![pos]);
        engine
            .register(
                "broker-1".into(),
                BracketSpec { stop_price: Some(Decimal::new(33700, 1)), limit_price: Some(Decimal::new(33900, 1)), ..Default::default() },
                Side::Buy,
                "bot-1".into(),
                "A1".into(),
                "MGC".into(),
            )
            .await;

        assert!(engine.check_and_apply("broker-1").await);
    }

    #[test]
    fn compute_levels_mirrors_sell_side() {
        let bracket = PendingBracket {
            broker_order_id: "b".into(),
            spec: BracketSpec { stop_loss_points: Some(Decimal::new(4, 0)), take_profit_points: Some(Decimal::new(6, 0)), ..Default::default() },
            side: Side::Sell,
            instance_id: "bot".into(),
            account_id: "A1".into(),
            instrument: "MGC".into(),
            retry_count: 0,
            max_retries: 10,
            created_at: Utc::now(),
        };
        let position = position("CON.F.US.MGC.Z25", Utc::now(), Decimal::new(3380, 0));
        let (stop, take) = compute_levels(&bracket, &position).unwrap();
        assert_eq!(stop, Some(Decimal::new(3384, 0)));
        assert_eq!(take, Some(Decimal::new(3374, 0)));
    }

    #[test]
    fn matching_window_widens_linearly_with_retries() {
        assert_eq!(matching_window(0), chrono::Duration::seconds(60));
        assert_eq!(matching_window(3), chrono::Duration::seconds(75));
    }
}
