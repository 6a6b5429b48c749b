//! The one concrete implementation of [`gateway_auth::BrokerLogin`] and
//! [`gateway_execution::BrokerRest`] the process entry point wires up:
//! plain `reqwest` calls against the broker's REST surface (§6). Every
//! subsystem crate is generic over these traits so tests exercise fakes
//! instead; this module is the only place that touches the network.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_auth::{AuthError, AuthHeaders, BrokerLogin, Credentials, TokenResponse};
use gateway_execution::{
    Bar, BrokerAccount, BrokerApiError, BrokerContract, BrokerPosition, BrokerRest, BrokerTrade,
    HistoryParams, PlaceOrderRequest, RestError, StatsRow, TradeSearchParams,
};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

/// Thin wrapper over the broker's HTTP API. Implements both broker-facing
/// traits because, unlike the streaming hubs, login and REST share one
/// `reqwest::Client` and one base URL.
pub struct HttpBroker {
    client: Client,
    base_url: String,
}

impl std::fmt::Debug for HttpBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBroker").field("base_url", &self.base_url).finish()
    }
}

impl HttpBroker {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builder"),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct BrokerErrorBody {
    #[serde(default, alias = "errorCode")]
    error_code: Option<i32>,
    #[serde(default, alias = "errorMessage")]
    error_message: Option<String>,
}

/// Every broker response carries `success`; a non-2xx status or
/// `success: false` is surfaced as [`RestError::Broker`] rather than a bare
/// transport failure, per the design's Broker-Reported error kind.
async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RestError> {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|err| RestError::Transport(format!("invalid response body: {err}")))?;

    let success = body.get("success").and_then(Value::as_bool).unwrap_or(status.is_success());
    if !success {
        let errors: BrokerErrorBody = serde_json::from_value(body.clone()).unwrap_or(BrokerErrorBody {
            error_code: None,
            error_message: None,
        });
        return Err(RestError::Broker(BrokerApiError {
            code: errors.error_code.unwrap_or(status.as_u16() as i32),
            message: errors.error_message.unwrap_or_else(|| status.canonical_reason().unwrap_or("broker error").to_string()),
        }));
    }

    serde_json::from_value(body).map_err(|err| RestError::Transport(format!("unexpected response shape: {err}")))
}

async fn parse_empty(response: reqwest::Response) -> Result<(), RestError> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(RestError::Broker(BrokerApiError { code: 404, message: "not found".into() }));
    }
    let body: Value = response
        .json()
        .await
        .map_err(|err| RestError::Transport(format!("invalid response body: {err}")))?;
    let success = body.get("success").and_then(Value::as_bool).unwrap_or(status.is_success());
    if !success {
        let errors: BrokerErrorBody = serde_json::from_value(body).unwrap_or(BrokerErrorBody {
            error_code: None,
            error_message: None,
        });
        return Err(RestError::Broker(BrokerApiError {
            code: errors.error_code.unwrap_or(status.as_u16() as i32),
            message: errors.error_message.unwrap_or_else(|| "broker rejected request".to_string()),
        }));
    }
    Ok(())
}

#[async_trait]
impl BrokerLogin for HttpBroker {
    async fn login(&self, creds: &Credentials) -> Result<TokenResponse, AuthError> {
        #[derive(Serialize)]
        struct LoginRequest<'a> {
            #[serde(rename = "userName")]
            user_name: &'a str,
            #[serde(rename = "apiKey")]
            api_key: &'a str,
        }
        #[derive(Deserialize)]
        struct LoginResponse {
            token: String,
            #[serde(default = "default_expires_in")]
            expires_in_secs: i64,
        }
        fn default_expires_in() -> i64 {
            3600
        }

        let response = self
            .client
            .post(self.url("Auth/loginKey"))
            .json(&LoginRequest { user_name: &creds.username, api_key: &creds.key })
            .send()
            .await
            .map_err(|err| AuthError::LoginFailed(err.to_string()))?;

        let parsed: LoginResponse = parse_response(response)
            .await
            .map_err(|err| AuthError::LoginFailed(err.to_string()))?;
        Ok(TokenResponse { access_token: parsed.token, expires_in_secs: parsed.expires_in_secs })
    }

    /// The broker exposes no dedicated refresh endpoint (§6 lists only
    /// `Auth/loginKey`); re-authenticating with the same key is the only
    /// documented way to extend the session.
    async fn refresh(&self, _access_token: &str) -> Result<TokenResponse, AuthError> {
        Err(AuthError::RefreshFailed(
            "broker has no refresh endpoint; re-login from Credentials is required".to_string(),
        ))
    }
}

fn bearer(headers: &AuthHeaders) -> &str {
    headers.authorization.trim_start_matches("Bearer ").trim()
}

#[derive(Debug, Deserialize)]
struct WireContract {
    #[serde(rename = "contractId")]
    contract_id: String,
    symbol: String,
    #[serde(default)]
    name: String,
    exchange: String,
    #[serde(rename = "tickSize")]
    tick_size: Decimal,
    #[serde(rename = "tickValue")]
    tick_value: Decimal,
    #[serde(rename = "expirationDate")]
    expiration_date: DateTime<Utc>,
    #[serde(rename = "activeContract", default)]
    active_contract: bool,
}

impl From<WireContract> for BrokerContract {
    fn from(wire: WireContract) -> Self {
        BrokerContract {
            contract_id: wire.contract_id,
            symbol: wire.symbol,
            description: wire.name,
            exchange: wire.exchange,
            tick_size: wire.tick_size,
            tick_value: wire.tick_value,
            expiration_date: wire.expiration_date,
            active_contract: wire.active_contract,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    #[serde(rename = "positionId")]
    position_id: String,
    #[serde(rename = "accountId")]
    account_id: String,
    #[serde(rename = "contractId")]
    contract_id: String,
    #[serde(rename = "type", default)]
    side_numeric: u8,
    size: Decimal,
    #[serde(rename = "averagePrice")]
    average_price: Decimal,
    #[serde(rename = "creationTimestamp")]
    entry_time: DateTime<Utc>,
    #[serde(rename = "openOrderId", default)]
    open_order_id: Option<String>,
}

impl From<WirePosition> for BrokerPosition {
    fn from(wire: WirePosition) -> Self {
        BrokerPosition {
            position_id: wire.position_id,
            account_id: wire.account_id,
            contract_id: wire.contract_id,
            side: if wire.side_numeric == 1 { gateway_execution::Side::Sell } else { gateway_execution::Side::Buy },
            size: wire.size,
            average_price: wire.average_price,
            entry_time: wire.entry_time,
            open_order_id: wire.open_order_id,
        }
    }
}

#[async_trait]
impl BrokerRest for HttpBroker {
    async fn search_accounts(&self, headers: &AuthHeaders) -> Result<Vec<BrokerAccount>, RestError> {
        #[derive(Deserialize)]
        struct Row {
            id: String,
            name: String,
            #[serde(rename = "canTrade")]
            can_trade: bool,
            balance: Decimal,
        }
        #[derive(Deserialize)]
        struct Envelope {
            accounts: Vec<Row>,
        }
        let response = self
            .client
            .post(self.url("Account/search"))
            .bearer_auth(bearer(headers))
            .json(&json!({}))
            .send()
            .await
            .map_err(|err| RestError::Transport(err.to_string()))?;
        let parsed: Envelope = parse_response(response).await?;
        Ok(parsed
            .accounts
            .into_iter()
            .map(|row| BrokerAccount { account_id: row.id, name: row.name, can_trade: row.can_trade, balance: row.balance })
            .collect())
    }

    async fn contracts_available(&self, headers: &AuthHeaders) -> Result<Vec<BrokerContract>, RestError> {
        #[derive(Deserialize)]
        struct Envelope {
            contracts: Vec<WireContract>,
        }
        let response = self
            .client
            .post(self.url("Contract/available"))
            .bearer_auth(bearer(headers))
            .json(&json!({}))
            .send()
            .await
            .map_err(|err| RestError::Transport(err.to_string()))?;
        let parsed: Envelope = parse_response(response).await?;
        Ok(parsed.contracts.into_iter().map(BrokerContract::from).collect())
    }

    async fn place_order(&self, headers: &AuthHeaders, req: PlaceOrderRequest) -> Result<String, RestError> {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(rename = "orderId")]
            order_id: String,
        }
        let response = self
            .client
            .post(self.url("Order/place"))
            .bearer_auth(bearer(headers))
            .json(&json!({
                "accountId": req.account_id,
                "contractId": req.contract_id,
                "side": req.side,
                "type": req.order_type,
                "size": req.quantity,
                "limitPrice": req.limit_price,
                "stopPrice": req.stop_price,
            }))
            .send()
            .await
            .map_err(|err| RestError::Transport(err.to_string()))?;
        let parsed: Envelope = parse_response(response).await?;
        Ok(parsed.order_id)
    }

    async fn cancel_order(&self, headers: &AuthHeaders, broker_order_id: &str) -> Result<(), RestError> {
        let response = self
            .client
            .post(self.url("Order/cancel"))
            .bearer_auth(bearer(headers))
            .json(&json!({ "orderId": broker_order_id }))
            .send()
            .await
            .map_err(|err| RestError::Transport(err.to_string()))?;
        parse_empty(response).await
    }

    async fn edit_stop_loss_take_profit(
        &self,
        headers: &AuthHeaders,
        position_id: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), RestError> {
        let response = self
            .client
            .post(self.url("Order/editStopLossAccount"))
            .bearer_auth(bearer(headers))
            .json(&json!({
                "positionId": position_id,
                "stopLoss": stop_loss,
                "takeProfit": take_profit,
            }))
            .send()
            .await
            .map_err(|err| RestError::Transport(err.to_string()))?;
        parse_empty(response).await
    }

    async fn search_positions(&self, headers: &AuthHeaders, account_id: &str) -> Result<Vec<BrokerPosition>, RestError> {
        #[derive(Deserialize)]
        struct Envelope {
            positions: Vec<WirePosition>,
        }
        let response = self
            .client
            .get(self.url("Position"))
            .bearer_auth(bearer(headers))
            .query(&[("accountId", account_id)])
            .send()
            .await
            .map_err(|err| RestError::Transport(err.to_string()))?;
        let parsed: Envelope = parse_response(response).await?;
        Ok(parsed.positions.into_iter().map(BrokerPosition::from).collect())
    }

    /// A bare 404 here means "no open positions", per the design's §9 note
    /// — handled one layer up, in [`gateway_execution::rest::RestFacade`].
    async fn search_open_positions(&self, headers: &AuthHeaders, account_id: &str) -> Result<Vec<BrokerPosition>, RestError> {
        #[derive(Deserialize)]
        struct Envelope {
            positions: Vec<WirePosition>,
        }
        let response = self
            .client
            .post(self.url("Position/searchOpen"))
            .bearer_auth(bearer(headers))
            .json(&json!({ "accountId": account_id }))
            .send()
            .await
            .map_err(|err| RestError::Transport(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RestError::Broker(BrokerApiError { code: 404, message: "no open positions".into() }));
        }
        let parsed: Envelope = parse_response(response).await?;
        Ok(parsed.positions.into_iter().map(BrokerPosition::from).collect())
    }

    async fn close_position(
        &self,
        headers: &AuthHeaders,
        account_id: &str,
        contract_id: &str,
        size: Option<Decimal>,
    ) -> Result<(), RestError> {
        let (path, body) = match size {
            Some(size) => (
                "Position/partialCloseContract",
                json!({ "accountId": account_id, "contractId": contract_id, "size": size }),
            ),
            None => ("Position/closeContract", json!({ "accountId": account_id, "contractId": contract_id })),
        };
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(bearer(headers))
            .json(&body)
            .send()
            .await
            .map_err(|err| RestError::Transport(err.to_string()))?;
        parse_empty(response).await
    }

    async fn history_bars(&self, headers: &AuthHeaders, params: &HistoryParams) -> Result<Vec<Bar>, RestError> {
        #[derive(Deserialize)]
        struct Envelope {
            bars: Vec<Bar>,
        }
        let response = self
            .client
            .post(self.url("History/retrieveBars"))
            .bearer_auth(bearer(headers))
            .json(&json!({
                "contractId": params.contract_id,
                "unit": params.unit as u8,
                "unitNumber": params.unit_number,
                "limit": params.limit,
                "startTime": params.start_time,
                "endTime": params.end_time,
                "includePartialBar": params.include_partial_bar,
                "live": params.live,
            }))
            .send()
            .await
            .map_err(|err| RestError::Transport(err.to_string()))?;
        let parsed: Envelope = parse_response(response).await?;
        Ok(parsed.bars)
    }

    async fn search_trades(&self, headers: &AuthHeaders, params: &TradeSearchParams) -> Result<Vec<BrokerTrade>, RestError> {
        #[derive(Deserialize)]
        struct WireTrade {
            #[serde(rename = "tradeId")]
            trade_id: String,
            #[serde(rename = "accountId")]
            account_id: String,
            #[serde(rename = "contractId")]
            contract_id: String,
            #[serde(rename = "type", default)]
            side_numeric: u8,
            size: Decimal,
            price: Decimal,
            #[serde(rename = "profitAndLoss", default)]
            profit_loss: Decimal,
            #[serde(rename = "timestamp")]
            executed_at: DateTime<Utc>,
        }
        #[derive(Deserialize)]
        struct Envelope {
            trades: Vec<WireTrade>,
        }
        let response = self
            .client
            .post(self.url("Trade/search"))
            .bearer_auth(bearer(headers))
            .json(&json!({
                "accountId": params.account_id,
                "contractId": params.contract_id,
                "startTime": params.start_time,
                "endTime": params.end_time,
            }))
            .send()
            .await
            .map_err(|err| RestError::Transport(err.to_string()))?;
        let parsed: Envelope = parse_response(response).await?;
        Ok(parsed
            .trades
            .into_iter()
            .map(|wire| BrokerTrade {
                trade_id: wire.trade_id,
                account_id: wire.account_id,
                contract_id: wire.contract_id,
                side: if wire.side_numeric == 1 { gateway_execution::Side::Sell } else { gateway_execution::Side::Buy },
                size: wire.size,
                price: wire.price,
                profit_loss: wire.profit_loss,
                executed_at: wire.executed_at,
            })
            .collect())
    }

    async fn today_stats(&self, headers: &AuthHeaders, account_id: &str) -> Result<StatsRow, RestError> {
        self.stats(headers, "Statistics/todaystats", account_id).await
    }

    async fn lifetime_stats(&self, headers: &AuthHeaders, account_id: &str) -> Result<StatsRow, RestError> {
        self.stats(headers, "Statistics/lifetimestats", account_id).await
    }
}

impl HttpBroker {
    async fn stats(&self, headers: &AuthHeaders, path: &str, account_id: &str) -> Result<StatsRow, RestError> {
        #[derive(Deserialize, Default)]
        struct Envelope {
            #[serde(default)]
            #[serde(rename = "tradeCount")]
            trade_count: u32,
            #[serde(default)]
            #[serde(rename = "winCount")]
            win_count: u32,
            #[serde(default)]
            #[serde(rename = "grossProfit")]
            gross_profit: Decimal,
            #[serde(default)]
            #[serde(rename = "grossLoss")]
            gross_loss: Decimal,
            #[serde(default)]
            #[serde(rename = "netProfit")]
            net_profit: Decimal,
        }
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(bearer(headers))
            .query(&[("accountId", account_id)])
            .send()
            .await
            .map_err(|err| RestError::Transport(err.to_string()))?;
        let parsed: Envelope = parse_response(response).await?;
        Ok(StatsRow {
            account_id: account_id.to_string(),
            trade_count: parsed.trade_count,
            win_count: parsed.win_count,
            gross_profit: parsed.gross_profit,
            gross_loss: parsed.gross_loss,
            net_profit: parsed.net_profit,
        })
    }
}
