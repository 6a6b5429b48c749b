//! Process entry point: one authenticated broker session multiplexed across
//! bot instances via the message bus. Boots auth, the bus, both streaming
//! hubs and the REST facade, then runs until told to shut down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gateway::{from_env, HttpBroker};
use gateway_auth::Credentials;
use gateway_bus::{BusConfig, Envelope, MessageBus, MessageHandler};
use gateway_core::{init_logging, GatewayCore};
use gateway_stream::{WsMarketTransport, WsUserTransport};
use tracing::{error, info, warn};

/// Forwards one inbound channel's envelopes into [`GatewayCore::dispatch`]
/// and publishes whatever response it returns. One instance is shared
/// across however many control channels are subscribed.
struct RouterHandler<B, R, MT, UT>
where
    B: gateway_auth::BrokerLogin + 'static,
    R: gateway_execution::BrokerRest + 'static,
    MT: gateway_stream::MarketHubTransport + 'static,
    UT: gateway_stream::UserHubTransport + 'static,
{
    core: Arc<GatewayCore<B, R, MT, UT>>,
}

#[async_trait]
impl<B, R, MT, UT> MessageHandler for RouterHandler<B, R, MT, UT>
where
    B: gateway_auth::BrokerLogin + 'static,
    R: gateway_execution::BrokerRest + 'static,
    MT: gateway_stream::MarketHubTransport + 'static,
    UT: gateway_stream::UserHubTransport + 'static,
{
    async fn handle(&self, envelope: Envelope) {
        if let Some((event_type, channel, body)) = self.core.dispatch(envelope).await {
            self.core.bus().publish(&event_type, body, Some(&channel)).await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = from_env()?;
    let creds = Credentials::from_env()?;

    let broker_login = HttpBroker::new(config.api_base_url.clone());
    let broker_rest = HttpBroker::new(config.api_base_url.clone());

    let bus = MessageBus::connect(BusConfig {
        redis_url: config.bus_address.clone(),
        max_reconnect_attempts: config.max_reconnect_attempts,
        ping_interval: Duration::from_secs(30),
    })
    .await?;

    let market_transport = Arc::new(WsMarketTransport::new(config.market_hub_url.clone()));
    let user_transport = Arc::new(WsUserTransport::new(config.user_hub_url.clone()));

    let core = GatewayCore::new(
        config,
        creds,
        broker_login,
        bus,
        broker_rest,
        market_transport.clone(),
        user_transport.clone(),
    );

    let token = core.auth().ensure_valid_token().await?;
    market_transport.connect_and_pump(&token, core.market_hub().as_ref().clone()).await?;
    user_transport.connect_and_pump(&token, core.user_hub().as_ref().clone()).await?;

    core.startup().await?;

    for channel in ["instance:control", "order:management", "connection-manager:requests", "account-request"] {
        let handler = Arc::new(RouterHandler { core: core.clone() });
        core.bus().subscribe(channel, handler).await;
    }

    spawn_reconciliation_loop(core.clone());

    info!("gateway running");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    core.shutdown().await;
    Ok(())
}

/// Drives the reconciliation cycle on its own interval; the service itself
/// owns no scheduler so callers stay free to drive it in tests without
/// sleeping.
fn spawn_reconciliation_loop<B, R, MT, UT>(core: Arc<GatewayCore<B, R, MT, UT>>)
where
    B: gateway_auth::BrokerLogin + 'static,
    R: gateway_execution::BrokerRest + 'static,
    MT: gateway_stream::MarketHubTransport + 'static,
    UT: gateway_stream::UserHubTransport + 'static,
{
    tokio::spawn(async move {
        let interval = core.reconciliation().cycle_interval();
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let discrepancies = core.reconciliation().run_cycle().await;
            if !discrepancies.is_empty() {
                warn!(count = discrepancies.len(), "reconciliation cycle reported discrepancies");
            }
        }
    });
}
