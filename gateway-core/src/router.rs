//! Request Router: the central dispatch point wiring every subsystem crate
//! together, per the design's request-type table. Bot instances and the
//! rest of the trading stack never talk to a subsystem crate directly —
//! every request comes in as a bus [`Envelope`] and every response goes
//! back out the same way.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use gateway_auth::{AuthConfig, AuthModule, BrokerLogin, Credentials};
use gateway_bus::{Envelope, MessageBus};
use gateway_execution::{
    Bar, BracketConfig, BracketEngine, BrokerRest, HistoryConfig, HistoryParams, HistoryQueue,
    OrderIntent, RestFacade, StatsRow, TradeSearchParams,
};
use gateway_markets::{BotRegistry, ContractCache};
use gateway_risk::{Direction, InstancePosition, MasterPosition, ReconciliationConfig, ReconciliationService};
use gateway_stream::{MarketHub, MarketHubTransport, UserHub, UserHubTransport};
use gateway_sync::{order_lock_name, LockConfig, NamedLockMutex, Priority};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::state::ConnectionStatus;
use crate::stats;

const CONTRACT_CACHE_TTL: StdDuration = StdDuration::from_secs(3600);
const RECONCILIATION_COOLDOWN: StdDuration = StdDuration::from_secs(5);
const FILL_PROBE_MAX_ATTEMPTS: u32 = 10;

fn field<'a>(payload: &'a Value, name: &str) -> Option<&'a Value> {
    payload.get(name)
}

fn require_str(payload: &Value, name: &str) -> Result<String, GatewayError> {
    field(payload, name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GatewayError::Validation(format!("missing or non-string field {name:?}")))
}

fn optional_str(payload: &Value, name: &str) -> Option<String> {
    field(payload, name).and_then(Value::as_str).map(str::to_string)
}

fn decimal_from_value(raw: &Value) -> Option<Decimal> {
    match raw {
        Value::Number(n) => n
            .as_f64()
            .and_then(|f| Decimal::from_str_exact(&f.to_string()).ok())
            .or_else(|| n.to_string().parse().ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn require_decimal(payload: &Value, name: &str) -> Result<Decimal, GatewayError> {
    field(payload, name)
        .and_then(decimal_from_value)
        .ok_or_else(|| GatewayError::Validation(format!("missing or invalid decimal field {name:?}")))
}

fn optional_decimal(payload: &Value, name: &str) -> Option<Decimal> {
    field(payload, name).and_then(decimal_from_value)
}

fn require_u64(payload: &Value, name: &str) -> Result<u64, GatewayError> {
    field(payload, name)
        .and_then(Value::as_u64)
        .ok_or_else(|| GatewayError::Validation(format!("missing or invalid integer field {name:?}")))
}

fn parse_side(raw: &str) -> Result<gateway_execution::Side, GatewayError> {
    match raw.to_ascii_uppercase().as_str() {
        "BUY" => Ok(gateway_execution::Side::Buy),
        "SELL" => Ok(gateway_execution::Side::Sell),
        other => Err(GatewayError::Validation(format!("unknown order side {other:?}"))),
    }
}

fn parse_kind(raw: &str) -> Result<gateway_execution::OrderKind, GatewayError> {
    match raw.to_ascii_uppercase().as_str() {
        "LIMIT" => Ok(gateway_execution::OrderKind::Limit),
        "MARKET" => Ok(gateway_execution::OrderKind::Market),
        "STOP" => Ok(gateway_execution::OrderKind::Stop),
        other => Err(GatewayError::Validation(format!("unknown order type {other:?}"))),
    }
}

fn parse_bracket(payload: &Value) -> Option<gateway_execution::BracketSpec> {
    let raw = payload.get("bracket")?;
    let spec = gateway_execution::BracketSpec {
        stop_price: raw.get("stopPrice").and_then(decimal_from_value),
        limit_price: raw.get("limitPrice").and_then(decimal_from_value),
        stop_loss_points: raw.get("stopLossPoints").and_then(decimal_from_value),
        take_profit_points: raw.get("takeProfitPoints").and_then(decimal_from_value),
    };
    if spec.is_empty() {
        None
    } else {
        Some(spec)
    }
}

fn parse_bar_unit(raw: u64) -> Option<gateway_execution::BarUnit> {
    use gateway_execution::BarUnit::*;
    match raw {
        1 => Some(Second),
        2 => Some(Minute),
        3 => Some(Hour),
        4 => Some(Day),
        5 => Some(Week),
        6 => Some(Month),
        7 => Some(Year),
        _ => None,
    }
}

fn parse_direction(raw: &str) -> Direction {
    match raw.to_ascii_uppercase().as_str() {
        "LONG" => Direction::Long,
        _ => Direction::Short,
    }
}

/// Ties every subsystem crate together behind one dispatch surface, generic
/// over the broker login transport, the broker REST transport, and the two
/// streaming-hub transports (so tests can swap in in-memory fakes for all
/// four without touching this module).
pub struct GatewayCore<B, R, MT, UT>
where
    B: BrokerLogin + 'static,
    R: BrokerRest + 'static,
    MT: MarketHubTransport + 'static,
    UT: UserHubTransport + 'static,
{
    config: GatewayConfig,
    state: RwLock<ConnectionStatus>,
    auth: AuthModule<B>,
    bus: MessageBus,
    order_mutex: NamedLockMutex,
    bot_registry: Arc<BotRegistry>,
    contract_cache: Arc<ContractCache>,
    rest: Arc<RestFacade<B, R>>,
    bracket: Arc<BracketEngine<B, R>>,
    history: Arc<HistoryQueue<B, R>>,
    market_hub: Arc<MarketHub<MT>>,
    user_hub: Arc<UserHub<UT>>,
    reconciliation: Arc<ReconciliationService>,
}

impl<B, R, MT, UT> GatewayCore<B, R, MT, UT>
where
    B: BrokerLogin + 'static,
    R: BrokerRest + 'static,
    MT: MarketHubTransport + 'static,
    UT: UserHubTransport + 'static,
{
    pub fn new(
        config: GatewayConfig,
        creds: Credentials,
        broker_login: B,
        bus: MessageBus,
        rest_transport: R,
        market_transport: MT,
        user_transport: UT,
    ) -> Arc<Self> {
        let auth = AuthModule::new(broker_login, creds, AuthConfig::default());
        let contract_cache = Arc::new(ContractCache::new(CONTRACT_CACHE_TTL));
        let rest = Arc::new(RestFacade::new(auth.clone(), rest_transport, contract_cache.clone()));

        let bracket_bus: Arc<dyn gateway_execution::Publisher> = Arc::new(bus.clone());
        let bracket = Arc::new(BracketEngine::new(
            rest.clone(),
            contract_cache.clone(),
            bracket_bus,
            BracketConfig { max_retries: config.bracket.max_retries, ..Default::default() },
        ));

        let history = Arc::new(HistoryQueue::new(
            rest.clone(),
            HistoryConfig {
                concurrency: config.historical_data.max_concurrent_requests,
                request_timeout: config.historical_data.request_timeout,
                max_retries: config.historical_data.max_retries,
                cache_ttl: config.historical_data.cache_duration,
                ..Default::default()
            },
        ));

        let stream_bus: Arc<dyn gateway_stream::Publisher> = Arc::new(bus.clone());
        let market_hub = Arc::new(MarketHub::new(market_transport, stream_bus.clone()));
        let user_hub = Arc::new(UserHub::new(user_transport, stream_bus));

        let risk_bus: Arc<dyn gateway_risk::Publisher> = Arc::new(bus.clone());
        let reconciliation = Arc::new(ReconciliationService::new(
            ReconciliationConfig {
                max_discrepancy_threshold: config.reconciliation.max_discrepancy_threshold,
                staleness: chrono::Duration::from_std(config.reconciliation.position_timeout_ms)
                    .unwrap_or(chrono::Duration::minutes(5)),
                auto_correct: config.reconciliation.enable_auto_correction,
                cycle_interval: config.reconciliation.reconciliation_interval_ms,
                ..Default::default()
            },
            risk_bus,
        ));

        let bot_registry = Arc::new(BotRegistry::new(config.bot_slot_count));
        let order_mutex = NamedLockMutex::new(LockConfig {
            lock_timeout: config.order_mutex.lock_timeout,
            queue_timeout: config.order_mutex.queue_timeout,
            max_queue_size: config.order_mutex.max_queue_size,
        });

        Arc::new(Self {
            config,
            state: RwLock::new(ConnectionStatus::Starting),
            auth,
            bus,
            order_mutex,
            bot_registry,
            contract_cache,
            rest,
            bracket,
            history,
            market_hub,
            user_hub,
            reconciliation,
        })
    }

    pub async fn status(&self) -> ConnectionStatus {
        *self.state.read().await
    }

    /// Accessors the process entry point needs to wire concrete transports
    /// (dial sockets, subscribe bus channels, drive the reconciliation
    /// timer) without reaching into private state.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn auth(&self) -> &AuthModule<B> {
        &self.auth
    }

    pub fn market_hub(&self) -> &Arc<MarketHub<MT>> {
        &self.market_hub
    }

    pub fn user_hub(&self) -> &Arc<UserHub<UT>> {
        &self.user_hub
    }

    pub fn reconciliation(&self) -> &Arc<ReconciliationService> {
        &self.reconciliation
    }

    async fn set_status(&self, status: ConnectionStatus) {
        *self.state.write().await = status;
        self.bus
            .publish(status.as_event_type(), json!({ "status": status.as_event_type() }), Some("connection:status"))
            .await;
    }

    /// Startup sequence: auth, bus (already connected by the caller),
    /// reconciliation loop is left to the caller to schedule against
    /// [`gateway_risk::ReconciliationService::cycle_interval`]; this method
    /// performs the remaining steps — fetch accounts, subscribe active
    /// contracts, and a short verification window before declaring the
    /// gateway connected.
    pub async fn startup(self: &Arc<Self>) -> Result<(), GatewayError> {
        self.auth.ensure_valid_token().await?;
        let accounts = self.rest.fetch_accounts(true).await?;
        let contracts = self.rest.fetch_contracts_available(self.config.micro_only).await?;
        for contract in &contracts {
            if contract.active_contract {
                if let Err(err) = self.market_hub.subscribe(&contract.contract_id).await {
                    warn!(contract = %contract.contract_id, %err, "startup subscribe failed");
                }
            }
        }
        info!(accounts = accounts.len(), contracts = contracts.len(), "startup fetch complete");
        tokio::time::sleep(StdDuration::from_secs(15)).await;
        self.set_status(ConnectionStatus::Connected).await;
        Ok(())
    }

    /// Connection-loss transition: pauses trading immediately, then once the
    /// hub signals recovery asks every instance to reconcile before
    /// resuming, per the design's connection-loss behavior.
    pub async fn on_connection_lost(self: &Arc<Self>) {
        if self.status().await == ConnectionStatus::ShuttingDown {
            return;
        }
        self.set_status(ConnectionStatus::Reconnecting).await;
        self.bus.publish("PAUSE_TRADING", json!({}), Some("system:events")).await;
    }

    pub async fn on_connection_recovered(self: &Arc<Self>) {
        self.bus.publish("RECONCILIATION_REQUIRED", json!({}), Some("system:events")).await;
        tokio::time::sleep(RECONCILIATION_COOLDOWN).await;
        self.bus.publish("RESUME_TRADING", json!({}), Some("system:events")).await;
        self.set_status(ConnectionStatus::Connected).await;
    }

    /// Shutdown sequence: marks `SHUTTING_DOWN` (suppressing further
    /// `PAUSE_TRADING` broadcasts from a racing connection-loss handler),
    /// rejects queued lock waiters, and leaves disconnecting the bus and
    /// hubs to the caller, which owns their concrete transports.
    pub async fn shutdown(self: &Arc<Self>) {
        self.set_status(ConnectionStatus::ShuttingDown).await;
        self.order_mutex.reset().await;
        self.bus.disconnect().await;
    }

    /// Dispatches one inbound envelope and returns the response event type,
    /// channel and payload the caller should publish back, if any. Never
    /// panics: every handler error is caught here and turned into a failure
    /// envelope instead of propagating, per the design's global error policy.
    pub async fn dispatch(self: &Arc<Self>, envelope: Envelope) -> Option<(String, String, Value)> {
        let request_id = envelope.payload.get("requestId").and_then(Value::as_str).map(str::to_string);
        let result = self.handle(&envelope.event_type, &envelope.payload).await;
        let (event_type, channel, body) = match result {
            Ok(Some((channel, data))) => (
                response_event_type(&envelope.event_type),
                channel,
                json!({ "success": true, "data": data, "requestId": request_id }),
            ),
            Ok(None) => return None,
            Err(err) => {
                error!(request_type = %envelope.event_type, %err, "request handler failed");
                (
                    envelope.event_type.clone(),
                    response_channel(&envelope.event_type),
                    json!({ "success": false, "error": err.to_string(), "requestId": request_id }),
                )
            }
        };
        Some((event_type, channel, body))
    }

    async fn handle(&self, request_type: &str, payload: &Value) -> Result<Option<(String, Value)>, GatewayError> {
        match request_type {
            "REGISTER_INSTANCE" => self.register_instance(payload).await.map(Some),
            "DEREGISTER_INSTANCE" => self.deregister_instance(payload).await.map(Some),
            "SUBSCRIBE_MARKET_DATA" => self.subscribe_market_data(payload).await.map(Some),
            "PLACE_ORDER" => self.place_order(payload).await.map(Some),
            "CANCEL_ORDER" => self.cancel_order(payload).await.map(Some),
            "GET_POSITIONS" => self.get_positions(payload).await.map(Some),
            "GET_ACCOUNTS" => self.get_accounts(payload).await.map(Some),
            "GET_CONTRACTS" => self.get_contracts(false).await.map(Some),
            "GET_ACTIVE_CONTRACTS" => self.get_contracts(true).await.map(Some),
            "GET_WORKING_ORDERS" => self.get_open_positions(payload).await.map(Some),
            "GET_STATISTICS" => self.get_statistics(payload).await.map(Some),
            "GET_TRADES" | "SEARCH_TRADES" => self.search_trades(payload).await.map(Some),
            "GET_ACCOUNT_SUMMARY" => self.get_account_summary(payload).await.map(Some),
            "CLOSE_POSITION" => self.close_position(payload).await.map(Some),
            "UPDATE_SLTP" => self.update_sltp(payload).await.map(Some),
            "REQUEST_HISTORICAL_DATA" => self.request_historical_data(payload).await.map(Some),
            "REGISTER_ACCOUNT" => self.register_account(payload).await.map(Some),
            "POSITION_UPDATE" => {
                self.position_update(payload).await?;
                Ok(None)
            }
            "REQUEST_RECONCILIATION" => self.request_reconciliation(payload).await.map(Some),
            other => Err(GatewayError::UnknownRequestType(other.to_string())),
        }
    }

    async fn register_instance(&self, payload: &Value) -> Result<(String, Value), GatewayError> {
        let slot_id = require_str(payload, "slotId")?;
        let account = require_str(payload, "accountId")?;
        let instrument = require_str(payload, "instrument")?;
        let strategy = require_str(payload, "strategy")?;
        self.bot_registry.validate_registration(&slot_id, &account, &instrument, &strategy).await?;
        Ok(("connection-manager:response".to_string(), json!({ "slotId": slot_id, "registered": true })))
    }

    async fn deregister_instance(&self, payload: &Value) -> Result<(String, Value), GatewayError> {
        let slot_id = require_str(payload, "slotId")?;
        self.bot_registry.deregister(&slot_id).await?;
        Ok(("connection-manager:response".to_string(), json!({ "slotId": slot_id, "deregistered": true })))
    }

    async fn subscribe_market_data(&self, payload: &Value) -> Result<(String, Value), GatewayError> {
        let instrument = require_str(payload, "instrument")?;
        self.market_hub.subscribe(&instrument).await?;
        Ok(("connection-manager:response".to_string(), json!({ "instrument": instrument, "subscribed": true })))
    }

    /// `PLACE_ORDER`: serializes on `cm_order_{accountId}_{orderType}`,
    /// places through the REST facade, registers a bracket (if any), and
    /// always schedules a fill probe `config.bracket.initial_delay` later —
    /// it publishes `ORDER_FILLED` as soon as a position carrying this
    /// order id shows up (downstream consumers de-duplicate by `orderId`
    /// against whatever the streaming hub already reported), and, when a
    /// bracket was registered, keeps retrying `check_and_apply` alongside it
    /// so the stop/take-profit leg gets attached without the caller polling.
    async fn place_order(&self, payload: &Value) -> Result<(String, Value), GatewayError> {
        let account_id = require_str(payload, "accountId")?;
        let instance_id = require_str(payload, "instanceId")?;
        let instrument = require_str(payload, "instrument")?;
        let side = parse_side(&require_str(payload, "side")?)?;
        let order_type = require_str(payload, "orderType")?;
        let kind = parse_kind(&order_type)?;
        let quantity = require_u64(payload, "quantity")?;
        let bracket_spec = parse_bracket(payload);

        let intent = OrderIntent {
            instance_id: instance_id.clone(),
            account_id: account_id.clone(),
            instrument: instrument.clone(),
            side,
            kind,
            quantity,
            limit_price: optional_decimal(payload, "limitPrice"),
            stop_price: optional_decimal(payload, "stopPrice"),
            bracket: bracket_spec.clone(),
        };

        let lock_name = order_lock_name(&account_id, &order_type);
        let bracket_engine = self.bracket.clone();
        let rest = self.rest.clone();
        let lock_holder = format!("{instance_id}:{account_id}");

        let broker_order_id: String = self
            .order_mutex
            .with_lock(lock_name, lock_holder, Priority::Normal, || async move {
                rest.place_order(&intent).await.map_err(GatewayError::from)
            })
            .await?;

        let has_bracket = bracket_spec.is_some();
        if let Some(spec) = bracket_spec {
            bracket_engine
                .register(broker_order_id.clone(), spec, side, instance_id, account_id.clone(), instrument)
                .await;
        }

        let probe_engine = bracket_engine;
        let probe_rest = self.rest.clone();
        let probe_bus = self.bus.clone();
        let probe_order_id = broker_order_id.clone();
        let probe_account_id = account_id;
        tokio::spawn(async move {
            tokio::time::sleep(probe_engine.initial_delay()).await;
            let mut filled = false;
            for _ in 0..FILL_PROBE_MAX_ATTEMPTS {
                if !filled {
                    match probe_rest.search_open_positions(&probe_account_id).await {
                        Ok(positions) => {
                            if positions.iter().any(|p| p.open_order_id.as_deref() == Some(probe_order_id.as_str())) {
                                probe_bus
                                    .publish(
                                        "ORDER_FILLED",
                                        json!({ "orderId": probe_order_id, "accountId": probe_account_id }),
                                        Some("market:data"),
                                    )
                                    .await;
                                filled = true;
                            }
                        }
                        Err(err) => warn!(order_id = %probe_order_id, %err, "fill probe position lookup failed"),
                    }
                }
                let bracket_done = !has_bracket || probe_engine.check_and_apply(&probe_order_id).await;
                if filled && bracket_done {
                    break;
                }
                tokio::time::sleep(probe_engine.retry_delay()).await;
            }
        });

        Ok(("order:management".to_string(), json!({ "orderId": broker_order_id })))
    }

    async fn cancel_order(&self, payload: &Value) -> Result<(String, Value), GatewayError> {
        let order_id = require_str(payload, "orderId")?;
        self.rest.cancel_order(&order_id).await?;
        Ok(("order:management".to_string(), json!({ "orderId": order_id, "cancelled": true })))
    }

    async fn get_positions(&self, payload: &Value) -> Result<(String, Value), GatewayError> {
        let account_id = require_str(payload, "accountId")?;
        let positions = self.rest.search_positions(&account_id).await?;
        Ok(("connection-manager:response".to_string(), json!({ "positions": positions })))
    }

    async fn get_open_positions(&self, payload: &Value) -> Result<(String, Value), GatewayError> {
        let account_id = require_str(payload, "accountId")?;
        let positions = self.rest.search_open_positions(&account_id).await?;
        Ok(("connection-manager:response".to_string(), json!({ "positions": positions })))
    }

    async fn get_accounts(&self, _payload: &Value) -> Result<(String, Value), GatewayError> {
        let accounts = self.rest.fetch_accounts(false).await?;
        Ok(("connection-manager:response".to_string(), json!({ "accounts": accounts })))
    }

    async fn get_contracts(&self, active_only: bool) -> Result<(String, Value), GatewayError> {
        let contracts = self.rest.fetch_contracts_available(self.config.micro_only).await?;
        let contracts: Vec<_> = contracts.into_iter().filter(|c| !active_only || c.active_contract).collect();
        Ok(("connection-manager:response".to_string(), json!({ "contracts": contracts })))
    }

    async fn get_statistics(&self, payload: &Value) -> Result<(String, Value), GatewayError> {
        let account_id = require_str(payload, "accountId")?;
        let lifetime = payload.get("lifetime").and_then(Value::as_bool).unwrap_or(false);
        let row: StatsRow = if lifetime {
            self.rest.lifetime_stats(&account_id).await?
        } else {
            self.rest.today_stats(&account_id).await?
        };
        let aggregated = stats::aggregate(&account_id, std::slice::from_ref(&row));
        Ok(("connection-manager:response".to_string(), json!(aggregated)))
    }

    async fn search_trades(&self, payload: &Value) -> Result<(String, Value), GatewayError> {
        let params = TradeSearchParams {
            account_id: require_str(payload, "accountId")?,
            contract_id: optional_str(payload, "contractId"),
            start_time: optional_str(payload, "startTime").and_then(|s| s.parse::<chrono::DateTime<Utc>>().ok()),
            end_time: optional_str(payload, "endTime").and_then(|s| s.parse::<chrono::DateTime<Utc>>().ok()),
        };
        let trades = self.rest.search_trades(&params).await?;
        Ok(("connection-manager:response".to_string(), json!({ "trades": trades })))
    }

    async fn get_account_summary(&self, payload: &Value) -> Result<(String, Value), GatewayError> {
        let account_id = require_str(payload, "accountId")?;
        let accounts = self.rest.fetch_accounts(false).await?;
        let account = accounts
            .into_iter()
            .find(|a| a.account_id == account_id)
            .ok_or_else(|| GatewayError::Validation(format!("unknown account {account_id:?}")))?;
        let positions = self.rest.search_open_positions(&account_id).await?;
        Ok((
            "connection-manager:response".to_string(),
            json!({ "account": account, "openPositions": positions }),
        ))
    }

    async fn close_position(&self, payload: &Value) -> Result<(String, Value), GatewayError> {
        let account_id = require_str(payload, "accountId")?;
        let contract_id = require_str(payload, "contractId")?;
        let size = optional_decimal(payload, "size");
        self.rest.close_position(&account_id, &contract_id, size).await?;
        Ok(("connection-manager:response".to_string(), json!({ "closed": true })))
    }

    async fn update_sltp(&self, payload: &Value) -> Result<(String, Value), GatewayError> {
        let position_id = require_str(payload, "positionId")?;
        let stop_loss = optional_decimal(payload, "stopLoss");
        let take_profit = optional_decimal(payload, "takeProfit");
        self.rest.edit_stop_loss_account(&position_id, stop_loss, take_profit).await?;
        Ok(("connection-manager:response".to_string(), json!({ "positionId": position_id, "updated": true })))
    }

    async fn request_historical_data(&self, payload: &Value) -> Result<(String, Value), GatewayError> {
        let params = HistoryParams {
            contract_id: require_str(payload, "contractId")?,
            unit: payload
                .get("unit")
                .and_then(Value::as_u64)
                .and_then(parse_bar_unit)
                .ok_or_else(|| GatewayError::Validation("missing or invalid unit".to_string()))?,
            unit_number: require_u64(payload, "unitNumber")? as u32,
            limit: require_u64(payload, "limit")? as u32,
            start_time: optional_str(payload, "startTime").and_then(|s| s.parse::<chrono::DateTime<Utc>>().ok()),
            end_time: optional_str(payload, "endTime").and_then(|s| s.parse::<chrono::DateTime<Utc>>().ok()),
            include_partial_bar: payload.get("includePartialBar").and_then(Value::as_bool).unwrap_or(false),
            live: payload.get("live").and_then(Value::as_bool).unwrap_or(false),
        };
        let bars: Vec<Bar> = self.history.fetch(params).await?;
        Ok(("historical:data:response".to_string(), json!({ "bars": bars })))
    }

    async fn register_account(&self, payload: &Value) -> Result<(String, Value), GatewayError> {
        let account_id = require_str(payload, "accountId")?;
        self.user_hub.register_account(&account_id).await?;
        Ok(("account-response".to_string(), json!({ "accountId": account_id, "registered": true })))
    }

    async fn position_update(&self, payload: &Value) -> Result<(), GatewayError> {
        let instance_id = require_str(payload, "instanceId")?;
        let position = InstancePosition {
            order_id: require_str(payload, "orderId")?,
            size: require_decimal(payload, "size")?,
            entry_price: require_decimal(payload, "entryPrice")?,
            direction: parse_direction(&require_str(payload, "direction")?),
            status: require_str(payload, "status")?,
            last_update: Utc::now(),
        };
        self.reconciliation.feed_instance(&instance_id, position.clone()).await;

        if let Some(master_fields) = payload.get("master") {
            let master = MasterPosition {
                order_id: position.order_id.clone(),
                instance_id,
                account_id: require_str(master_fields, "accountId")?,
                contract_id: require_str(master_fields, "contractId")?,
                size: position.size,
                entry_price: position.entry_price,
                direction: position.direction,
                status: position.status,
                last_update: Utc::now(),
            };
            self.reconciliation.feed_master(master).await;
        }

        self.bus.publish("POSITION_UPDATE", payload.clone(), Some("market:data")).await;
        Ok(())
    }

    async fn request_reconciliation(&self, payload: &Value) -> Result<(String, Value), GatewayError> {
        let order_id = require_str(payload, "orderId")?;
        let reason = optional_str(payload, "reason").unwrap_or_else(|| "manual request".to_string());
        let accepted = self.reconciliation.force_reconciliation(&order_id, &reason).await;
        Ok(("connection-manager:response".to_string(), json!({ "orderId": order_id, "accepted": accepted })))
    }
}

fn response_channel(request_type: &str) -> String {
    match request_type {
        "REQUEST_HISTORICAL_DATA" => "historical:data:response".to_string(),
        "REGISTER_ACCOUNT" => "account-response".to_string(),
        "PLACE_ORDER" | "CANCEL_ORDER" => "order:management".to_string(),
        "POSITION_UPDATE" => "market:data".to_string(),
        _ => "connection-manager:response".to_string(),
    }
}

/// Maps a request type to the event type its success response carries,
/// where that differs from the request's own type (`§4.J`); every other
/// request type echoes back unchanged.
fn response_event_type(request_type: &str) -> String {
    match request_type {
        "PLACE_ORDER" => "ORDER_RESPONSE".to_string(),
        "CANCEL_ORDER" => "ORDER_CANCELLATION_RESPONSE".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_channel_routes_known_request_types() {
        assert_eq!(response_channel("REQUEST_HISTORICAL_DATA"), "historical:data:response");
        assert_eq!(response_channel("REGISTER_ACCOUNT"), "account-response");
        assert_eq!(response_channel("PLACE_ORDER"), "order:management");
        assert_eq!(response_channel("GET_POSITIONS"), "connection-manager:response");
    }

    #[test]
    fn response_event_type_overrides_order_requests() {
        assert_eq!(response_event_type("PLACE_ORDER"), "ORDER_RESPONSE");
        assert_eq!(response_event_type("CANCEL_ORDER"), "ORDER_CANCELLATION_RESPONSE");
        assert_eq!(response_event_type("GET_POSITIONS"), "GET_POSITIONS");
    }

    #[test]
    fn parse_bracket_returns_none_when_every_leg_is_absent() {
        let payload = json!({ "bracket": {} });
        assert!(parse_bracket(&payload).is_none());
    }

    #[test]
    fn parse_bracket_reads_fill_based_points() {
        let payload = json!({ "bracket": { "stopLossPoints": 4.0, "takeProfitPoints": 6.0 } });
        let spec = parse_bracket(&payload).expect("bracket present");
        assert!(spec.is_fill_based());
        assert_eq!(spec.stop_loss_points, Some(Decimal::new(40, 1)));
    }
}
