//! Typed wrappers over the broker's REST surface. Every public method
//! starts by calling [`gateway_auth::AuthModule::ensure_valid_token`]; the
//! facade otherwise owns nothing but a couple of small TTL caches (accounts,
//! history bars) and the tick-rounding applied before an order is placed.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_auth::{AuthModule, BrokerLogin};
use gateway_markets::{round_to_tick_size, Contract, ContractCache, ContractSource, MarketsError};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::RestError;
use crate::transport::{build_place_order_request, BrokerRest};
use crate::types::{
    Bar, BrokerAccount, BrokerContract, BrokerPosition, BrokerTrade, HistoryParams, OrderIntent,
    StatsRow, TradeSearchParams,
};

const ACCOUNTS_TTL: StdDuration = StdDuration::from_secs(5 * 60);

/// Micro-contract naming markers the gateway recognises when `microOnly` is
/// requested: either the description explicitly says "micro", or the
/// symbol follows the common `M`-prefixed short-code convention (MES, MNQ,
/// MGC, M2K, MYM).
fn is_micro_contract(contract: &BrokerContract) -> bool {
    let description = contract.description.to_ascii_lowercase();
    if description.contains("micro") {
        return true;
    }
    let symbol = contract.symbol.to_ascii_uppercase();
    symbol.starts_with('M') && symbol.len() <= 4 && symbol != "M"
}

struct AccountsCache {
    accounts: Vec<BrokerAccount>,
    cached_at: DateTime<Utc>,
}

/// The REST facade, generic over the broker login transport (reused from
/// [`gateway_auth`]) and the broker REST transport ([`BrokerRest`]).
pub struct RestFacade<B, R> {
    auth: AuthModule<B>,
    pub(crate) rest: Arc<R>,
    contract_cache: Arc<ContractCache>,
    accounts_cache: RwLock<Option<AccountsCache>>,
}

impl<B, R> std::fmt::Debug for RestFacade<B, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestFacade").finish_non_exhaustive()
    }
}

impl<B, R> RestFacade<B, R>
where
    B: BrokerLogin + 'static,
    R: BrokerRest + 'static,
{
    pub fn new(auth: AuthModule<B>, rest: R, contract_cache: Arc<ContractCache>) -> Self {
        Self::with_shared_rest(auth, Arc::new(rest), contract_cache)
    }

    /// Like [`Self::new`], but takes an already-shared transport so the
    /// caller can keep its own handle (e.g. a test that wants to assert on
    /// call counters recorded by the same instance the facade uses).
    pub fn with_shared_rest(auth: AuthModule<B>, rest: Arc<R>, contract_cache: Arc<ContractCache>) -> Self {
        Self { auth, rest, contract_cache, accounts_cache: RwLock::new(None) }
    }

    /// An adapter implementing [`ContractSource`] so the same facade that
    /// places orders can also repopulate [`ContractCache`] on a miss.
    pub fn as_contract_source(self: &Arc<Self>) -> ContractSourceAdapter<B, R> {
        ContractSourceAdapter(self.clone())
    }

    pub async fn fetch_accounts(&self, force_fresh: bool) -> Result<Vec<BrokerAccount>, RestError> {
        if !force_fresh {
            let guard = self.accounts_cache.read().await;
            if let Some(cached) = guard.as_ref() {
                if Utc::now() - cached.cached_at < chrono::Duration::from_std(ACCOUNTS_TTL).unwrap() {
                    return Ok(cached.accounts.clone());
                }
            }
        }

        let headers = self.auth.auth_headers().await?;
        let accounts: Vec<BrokerAccount> = self
            .rest
            .search_accounts(&headers)
            .await?
            .into_iter()
            .filter(|account| account.can_trade)
            .collect();

        let mut guard = self.accounts_cache.write().await;
        *guard = Some(AccountsCache { accounts: accounts.clone(), cached_at: Utc::now() });
        Ok(accounts)
    }

    pub async fn fetch_contracts_available(&self, micro_only: bool) -> Result<Vec<BrokerContract>, RestError> {
        let headers = self.auth.auth_headers().await?;
        let contracts = self.rest.contracts_available(&headers).await?;
        Ok(contracts
            .into_iter()
            .filter(|contract| contract.active_contract)
            .filter(|contract| !micro_only || is_micro_contract(contract))
            .collect())
    }

    /// Resolves `intent.instrument` to a contract id, rounds prices to tick,
    /// maps side/type to the broker's numeric convention, and places the
    /// order. Returns the broker-assigned order id.
    pub async fn place_order(self: &Arc<Self>, intent: &OrderIntent) -> Result<String, RestError> {
        let headers = self.auth.auth_headers().await?;

        let source = self.as_contract_source();
        let contract_id = self
            .contract_cache
            .get_contract_id_for_instrument(&intent.instrument, &source)
            .await?
            .ok_or_else(|| RestError::Validation(format!("unknown instrument {:?}", intent.instrument)))?;
        let contract = self
            .contract_cache
            .get_contract(&intent.instrument)
            .await
            .ok_or_else(|| RestError::Validation(format!("contract metadata missing for {contract_id:?}")))?;

        let mut rounded = intent.clone();
        rounded.limit_price = rounded.limit_price.map(|price| round_to_tick_size(price, contract.tick_size));
        rounded.stop_price = rounded.stop_price.map(|price| round_to_tick_size(price, contract.tick_size));

        let request = build_place_order_request(&rounded, contract_id);
        debug!(account = %intent.account_id, instrument = %intent.instrument, "placing order");
        self.rest.place_order(&headers, request).await
    }

    pub async fn cancel_order(&self, broker_order_id: &str) -> Result<(), RestError> {
        let headers = self.auth.auth_headers().await?;
        self.rest.cancel_order(&headers, broker_order_id).await
    }

    /// Full close when `size` is `None`, partial close otherwise — the
    /// broker exposes these as distinct endpoints.
    pub async fn close_position(
        &self,
        account_id: &str,
        contract_id: &str,
        size: Option<Decimal>,
    ) -> Result<(), RestError> {
        let headers = self.auth.auth_headers().await?;
        self.rest.close_position(&headers, account_id, contract_id, size).await
    }

    /// Rounds both legs to 2 decimal places (the broker's own precision for
    /// SL/TP prices, independent of the contract's tick size) before
    /// submitting, or passes `None` through unchanged.
    pub async fn edit_stop_loss_account(
        &self,
        position_id: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), RestError> {
        let headers = self.auth.auth_headers().await?;
        let round2 = |value: Decimal| value.round_dp(2);
        self.rest
            .edit_stop_loss_take_profit(&headers, position_id, stop_loss.map(round2), take_profit.map(round2))
            .await
    }

    pub async fn search_positions(&self, account_id: &str) -> Result<Vec<BrokerPosition>, RestError> {
        let headers = self.auth.auth_headers().await?;
        self.rest.search_positions(&headers, account_id).await
    }

    /// Per §9, a 404 from the broker's position search means "no open
    /// positions" rather than an error; any other failure status
    /// propagates as [`RestError::Broker`].
    pub async fn search_open_positions(&self, account_id: &str) -> Result<Vec<BrokerPosition>, RestError> {
        let headers = self.auth.auth_headers().await?;
        match self.rest.search_open_positions(&headers, account_id).await {
            Ok(positions) => Ok(positions),
            Err(RestError::Broker(api_err)) if api_err.code == 404 => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    pub async fn fetch_history_bars(&self, params: &HistoryParams) -> Result<Vec<Bar>, RestError> {
        if params.limit > 20_000 {
            return Err(RestError::Validation(format!("limit {} exceeds 20000", params.limit)));
        }
        let headers = self.auth.auth_headers().await?;
        let mut bars = self.rest.history_bars(&headers, params).await?;
        bars.sort_by_key(|bar| bar.t);
        Ok(bars)
    }

    pub async fn search_trades(&self, params: &TradeSearchParams) -> Result<Vec<BrokerTrade>, RestError> {
        let headers = self.auth.auth_headers().await?;
        self.rest.search_trades(&headers, params).await
    }

    pub async fn today_stats(&self, account_id: &str) -> Result<StatsRow, RestError> {
        let headers = self.auth.auth_headers().await?;
        self.rest.today_stats(&headers, account_id).await
    }

    pub async fn lifetime_stats(&self, account_id: &str) -> Result<StatsRow, RestError> {
        let headers = self.auth.auth_headers().await?;
        self.rest.lifetime_stats(&headers, account_id).await
    }
}

/// Adapts [`RestFacade::fetch_contracts_available`] to the `ContractCache`
/// refill contract, converting the broker's wire shape to the cache's.
pub struct ContractSourceAdapter<B, R>(Arc<RestFacade<B, R>>);

#[async_trait]
impl<B, R> ContractSource for ContractSourceAdapter<B, R>
where
    B: BrokerLogin + 'static,
    R: BrokerRest + 'static,
{
    async fn fetch_available(&self) -> Result<Vec<Contract>, MarketsError> {
        let contracts = self.0.fetch_contracts_available(false).await.map_err(|err| {
            warn!(%err, "contracts/available refresh failed");
            MarketsError::InstrumentNotFound("contracts/available".to_string())
        })?;
        Ok(contracts
            .into_iter()
            .map(|contract| Contract {
                contract_id: contract.contract_id,
                symbol: contract.symbol,
                name: contract.description,
                exchange: contract.exchange,
                tick_size: contract.tick_size,
                tick_value: contract.tick_value,
                expiration_date: contract.expiration_date,
                active: contract.active_contract,
            })
            .collect())
    }
}
