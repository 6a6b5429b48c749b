//! Real WebSocket transports for the market and user hubs, over
//! `tokio-tungstenite`. Both hubs speak the same shape: connect with the
//! bearer token as a query parameter, then send JSON "invoke" frames
//! (`{"target": <method>, "arguments": [...]}`) for each
//! Subscribe/Unsubscribe call. Inbound frames are dispatched to the
//! supplied [`MarketHub`]/[`UserHub`] handlers on a background task.

use std::future::Future;
use std::sync::Arc;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{error, warn};

use crate::market::{MarketHub, MarketHubTransport, StreamError};
use crate::user::{UserHub, UserHubTransport};

type InboundStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Reads invoke frames off `source` until the socket closes, calling
/// `on_event(target, first_argument)` for each one.
async fn pump_inbound<F, Fut>(mut source: InboundStream, on_event: F)
where
    F: Fn(&'static str, Value) -> Fut,
    Fut: Future<Output = ()>,
{
    while let Some(Ok(message)) = source.next().await {
        let Message::Text(text) = message else { continue };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else { continue };
        let Some(target) = frame.get("target").and_then(Value::as_str) else { continue };
        let Some(payload) = frame.get("arguments").and_then(Value::as_array).and_then(|a| a.first()) else {
            continue;
        };
        let target: &'static str = match target {
            "GatewayQuote" => "GatewayQuote",
            "GatewayTrade" => "GatewayTrade",
            "GatewayDepth" => "GatewayDepth",
            "GatewayUserAccount" => "GatewayUserAccount",
            "GatewayUserPosition" => "GatewayUserPosition",
            "GatewayUserOrder" => "GatewayUserOrder",
            "GatewayUserTrade" => "GatewayUserTrade",
            other => {
                warn!(target = other, "unrecognised hub event");
                continue;
            }
        };
        on_event(target, payload.clone()).await;
    }
}

async fn dial(url: &str, bearer_token: &str) -> Result<mpsc::UnboundedSender<Value>, StreamError> {
    let separator = if url.contains('?') { '&' } else { '?' };
    let full_url = format!("{url}{separator}access_token={bearer_token}");

    let (stream, _response) = tokio_tungstenite::connect_async(full_url)
        .await
        .map_err(|err| StreamError::Connect(err.to_string()))?;
    let (mut sink, _source) = stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let body = match serde_json::to_string(&frame) {
                Ok(body) => body,
                Err(err) => {
                    error!(%err, "failed to serialize invoke frame");
                    continue;
                }
            };
            if let Err(err) = sink.send(Message::Text(body)).await {
                warn!(%err, "websocket send failed");
                return;
            }
        }
    });
    Ok(tx)
}

fn invoke(target: &str, args: Vec<Value>) -> Value {
    json!({"target": target, "arguments": args})
}

/// Market-hub transport backed by a live WebSocket connection.
pub struct WsMarketTransport {
    url: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<Value>>>,
}

impl std::fmt::Debug for WsMarketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsMarketTransport").field("url", &self.url).finish()
    }
}

impl WsMarketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), outbound: Mutex::new(None) }
    }

    /// Connects and spawns a reader task that dispatches inbound frames to
    /// `hub`'s `GatewayQuote`/`GatewayTrade`/`GatewayDepth` handlers.
    pub async fn connect_and_pump<T>(&self, bearer_token: &str, hub: MarketHub<T>) -> Result<(), StreamError>
    where
        T: MarketHubTransport + 'static,
    {
        let (source, tx) = self.dial_with_reader(bearer_token).await?;
        *self.outbound.lock().await = Some(tx);

        tokio::spawn(async move {
            pump_inbound(source, move |target, payload| {
                let hub = hub.clone();
                async move {
                    match target {
                        "GatewayQuote" => hub.handle_quote(payload).await,
                        "GatewayTrade" => hub.handle_trade(payload).await,
                        "GatewayDepth" => hub.handle_depth(payload).await,
                        other => warn!(target = other, "unrecognised market hub event"),
                    }
                }
            })
            .await;
        });
        Ok(())
    }

    async fn dial_with_reader(
        &self,
        bearer_token: &str,
    ) -> Result<(InboundStream, mpsc::UnboundedSender<Value>), StreamError> {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let full_url = format!("{}{separator}access_token={bearer_token}", self.url);
        let (stream, _response) = tokio_tungstenite::connect_async(full_url)
            .await
            .map_err(|err| StreamError::Connect(err.to_string()))?;
        let (mut sink, source) = stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Ok(body) = serde_json::to_string(&frame) {
                    if sink.send(Message::Text(body)).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok((source, tx))
    }

    async fn send(&self, frame: Value) -> Result<(), StreamError> {
        let guard = self.outbound.lock().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| StreamError::Connect("market hub socket closed".into())),
            None => Err(StreamError::Connect("market hub not connected".into())),
        }
    }
}

#[async_trait::async_trait]
impl MarketHubTransport for WsMarketTransport {
    async fn connect(&self, bearer_token: &str) -> Result<(), StreamError> {
        let tx = dial(&self.url, bearer_token).await?;
        *self.outbound.lock().await = Some(tx);
        Ok(())
    }
    async fn subscribe_contract_quotes(&self, contract_id: &str) -> Result<(), StreamError> {
        self.send(invoke("SubscribeContractQuotes", vec![json!(contract_id)])).await
    }
    async fn subscribe_contract_trades(&self, contract_id: &str) -> Result<(), StreamError> {
        self.send(invoke("SubscribeContractTrades", vec![json!(contract_id)])).await
    }
    async fn subscribe_contract_market_depth(&self, contract_id: &str) -> Result<(), StreamError> {
        self.send(invoke("SubscribeContractMarketDepth", vec![json!(contract_id)])).await
    }
    async fn unsubscribe_contract_quotes(&self, contract_id: &str) -> Result<(), StreamError> {
        self.send(invoke("UnsubscribeContractQuotes", vec![json!(contract_id)])).await
    }
    async fn unsubscribe_contract_trades(&self, contract_id: &str) -> Result<(), StreamError> {
        self.send(invoke("UnsubscribeContractTrades", vec![json!(contract_id)])).await
    }
    async fn unsubscribe_contract_market_depth(&self, contract_id: &str) -> Result<(), StreamError> {
        self.send(invoke("UnsubscribeContractMarketDepth", vec![json!(contract_id)])).await
    }
}

/// User-hub transport backed by a live WebSocket connection.
pub struct WsUserTransport {
    url: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<Value>>>,
}

impl std::fmt::Debug for WsUserTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsUserTransport").field("url", &self.url).finish()
    }
}

impl WsUserTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), outbound: Mutex::new(None) }
    }

    /// Connects and spawns a reader task that dispatches inbound frames to
    /// `hub`'s five canonical event handlers.
    pub async fn connect_and_pump<T>(&self, bearer_token: &str, hub: UserHub<T>) -> Result<(), StreamError>
    where
        T: UserHubTransport + 'static,
    {
        let (source, tx) = self.dial_with_reader(bearer_token).await?;
        *self.outbound.lock().await = Some(tx);

        tokio::spawn(async move {
            pump_inbound(source, move |target, payload| {
                let hub = hub.clone();
                async move {
                    match target {
                        "GatewayUserAccount" => hub.handle_account(payload).await,
                        "GatewayUserPosition" => hub.handle_position(payload).await,
                        "GatewayUserOrder" => hub.handle_order(payload).await,
                        "GatewayUserTrade" => hub.handle_trade(payload).await,
                        other => warn!(target = other, "unrecognised user hub event"),
                    }
                }
            })
            .await;
        });
        Ok(())
    }

    async fn dial_with_reader(
        &self,
        bearer_token: &str,
    ) -> Result<(InboundStream, mpsc::UnboundedSender<Value>), StreamError> {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let full_url = format!("{}{separator}access_token={bearer_token}", self.url);
        let (stream, _response) = tokio_tungstenite::connect_async(full_url)
            .await
            .map_err(|err| StreamError::Connect(err.to_string()))?;
        let (mut sink, source) = stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Ok(body) = serde_json::to_string(&frame) {
                    if sink.send(Message::Text(body)).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok((source, tx))
    }

    async fn send(&self, frame: Value) -> Result<(), StreamError> {
        let guard = self.outbound.lock().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| StreamError::Connect("user hub socket closed".into())),
            None => Err(StreamError::Connect("user hub not connected".into())),
        }
    }
}

#[async_trait::async_trait]
impl UserHubTransport for WsUserTransport {
    async fn connect(&self, bearer_token: &str) -> Result<(), StreamError> {
        let tx = dial(&self.url, bearer_token).await?;
        *self.outbound.lock().await = Some(tx);
        Ok(())
    }
    async fn subscribe_accounts(&self) -> Result<(), StreamError> {
        self.send(invoke("SubscribeAccounts", vec![])).await
    }
    async fn subscribe_orders(&self, account_id: &str) -> Result<(), StreamError> {
        self.send(invoke("SubscribeOrders", vec![json!(account_id)])).await
    }
    async fn subscribe_positions(&self, account_id: &str) -> Result<(), StreamError> {
        self.send(invoke("SubscribePositions", vec![json!(account_id)])).await
    }
    async fn subscribe_trades(&self, account_id: &str) -> Result<(), StreamError> {
        self.send(invoke("SubscribeTrades", vec![json!(account_id)])).await
    }
}

/// Marker so `Arc<WsMarketTransport>`/`Arc<WsUserTransport>` can be shared
/// across the reconnect loop and the hub's own transport handle without
/// duplicating the dial logic.
pub type SharedWsMarketTransport = Arc<WsMarketTransport>;
pub type SharedWsUserTransport = Arc<WsUserTransport>;
