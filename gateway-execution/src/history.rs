//! Historical-bar request queue: bounds how many history requests are ever
//! in flight against the broker at once, retries transient failures with a
//! linear backoff, and caches responses briefly so bursts of identical
//! requests (a bot re-warming on reconnect, several bots sharing a symbol)
//! cost one broker round trip.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use gateway_auth::BrokerLogin;
use tokio::sync::{RwLock, Semaphore};
use tracing::warn;

use crate::error::RestError;
use crate::rest::RestFacade;
use crate::transport::BrokerRest;
use crate::types::{Bar, HistoryParams};

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub concurrency: usize,
    pub request_timeout: StdDuration,
    pub max_retries: u32,
    pub retry_backoff: StdDuration,
    pub cache_ttl: StdDuration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            request_timeout: StdDuration::from_secs(30),
            max_retries: 3,
            retry_backoff: StdDuration::from_secs(1),
            cache_ttl: StdDuration::from_secs(5 * 60),
        }
    }
}

struct CachedBars {
    bars: Vec<Bar>,
    cached_at: DateTime<Utc>,
}

pub struct HistoryQueue<B, R> {
    facade: Arc<RestFacade<B, R>>,
    config: HistoryConfig,
    semaphore: Arc<Semaphore>,
    cache: RwLock<HashMap<String, CachedBars>>,
}

impl<B, R> std::fmt::Debug for HistoryQueue<B, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryQueue").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<B, R> HistoryQueue<B, R>
where
    B: BrokerLogin + 'static,
    R: BrokerRest + 'static,
{
    pub fn new(facade: Arc<RestFacade<B, R>>, config: HistoryConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        Self { facade, config, semaphore, cache: RwLock::new(HashMap::new()) }
    }

    pub async fn fetch(&self, params: HistoryParams) -> Result<Vec<Bar>, RestError> {
        let key = params.cache_key();
        if let Some(cached) = self.cached(&key).await {
            return Ok(cached);
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("history queue semaphore is never closed");

        if let Some(cached) = self.cached(&key).await {
            return Ok(cached);
        }

        let mut last_err = None;
        for attempt in 1..=self.config.max_retries {
            match tokio::time::timeout(self.config.request_timeout, self.facade.fetch_history_bars(&params)).await {
                Ok(Ok(bars)) => {
                    self.cache.write().await.insert(key, CachedBars { bars: bars.clone(), cached_at: Utc::now() });
                    return Ok(bars);
                }
                Ok(Err(err)) => {
                    warn!(attempt, %err, contract_id = %params.contract_id, "history bar fetch failed");
                    last_err = Some(err);
                }
                Err(_) => {
                    warn!(attempt, contract_id = %params.contract_id, "history bar fetch timed out");
                    last_err = Some(RestError::Timeout);
                }
            }
            if attempt < self.config.max_retries {
                tokio::time::sleep(self.config.retry_backoff * attempt).await;
            }
        }

        Err(last_err.unwrap_or(RestError::Timeout))
    }

    async fn cached(&self, key: &str) -> Option<Vec<Bar>> {
        let guard = self.cache.read().await;
        let entry = guard.get(key)?;
        let ttl = chrono::Duration::from_std(self.config.cache_ttl).unwrap_or(chrono::Duration::minutes(5));
        if Utc::now() - entry.cached_at < ttl {
            Some(entry.bars.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::RestFacade;
    use crate::transport::{BrokerRest, PlaceOrderRequest};
    use crate::types::{BarUnit, BrokerAccount, BrokerContract, BrokerPosition, BrokerTrade, StatsRow, TradeSearchParams};
    use async_trait::async_trait;
    use gateway_auth::{AuthConfig, AuthError, AuthHeaders, AuthModule, Credentials, TokenResponse};
    use gateway_markets::ContractCache;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    struct CountingRest {
        calls: AtomicUsize,
        fail_first_n: usize,
    }

    #[async_trait]
    impl BrokerRest for CountingRest {
        async fn search_accounts(&self, _h: &AuthHeaders) -> Result<Vec<BrokerAccount>, RestError> {
            Ok(vec![])
        }
        async fn contracts_available(&self, _h: &AuthHeaders) -> Result<Vec<BrokerContract>, RestError> {
            Ok(vec![])
        }
        async fn place_order(&self, _h: &AuthHeaders, _req: PlaceOrderRequest) -> Result<String, RestError> {
            Ok("ok".into())
        }
        async fn cancel_order(&self, _h: &AuthHeaders, _id: &str) -> Result<(), RestError> {
            Ok(())
        }
        async fn edit_stop_loss_take_profit(
            &self,
            _h: &AuthHeaders,
            _id: &str,
            _sl: Option<Decimal>,
            _tp: Option<Decimal>,
        ) -> Result<(), RestError> {
            Ok(())
        }
        async fn search_positions(&self, _h: &AuthHeaders, _account_id: &str) -> Result<Vec<BrokerPosition>, RestError> {
            Ok(vec![])
        }
        async fn search_open_positions(&self, _h: &AuthHeaders, _account_id: &str) -> Result<Vec<BrokerPosition>, RestError> {
            Ok(vec![])
        }
        async fn close_position(&self, _h: &AuthHeaders, _a: &str, _c: &str, _s: Option<Decimal>) -> Result<(), RestError> {
            Ok(())
        }
        async fn history_bars(&self, _h: &AuthHeaders, _params: &HistoryParams) -> Result<Vec<Bar>, RestError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first_n {
                return Err(RestError::Transport("upstream hiccup".into()));
            }
            Ok(vec![Bar {
                t: chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&chrono::Utc),
                open: Decimal::ONE,
                high: Decimal::ONE,
                low: Decimal::ONE,
                close: Decimal::ONE,
                volume: Decimal::ONE,
            }])
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

    fn queue(fail_first_n: usize) -> HistoryQueue<FakeLogin, CountingRest> {
        let auth = AuthModule::new(FakeLogin, Credentials { username: "u".into(), key: "k".into() }, AuthConfig::default());
        let rest = CountingRest { calls: AtomicUsize::new(0), fail_first_n };
        let facade = Arc::new(RestFacade::new(auth, rest, Arc::new(ContractCache::default())));
        HistoryQueue::new(facade, HistoryConfig { retry_backoff: StdDuration::from_millis(1), ..HistoryConfig::default() })
    }

    fn params() -> HistoryParams {
        HistoryParams {
            contract_id: "CON.F.US.MGC.Z25".into(),
            unit: BarUnit::Minute,
            unit_number: 1,
            limit: 100,
            start_time: None,
            end_time: None,
            include_partial_bar: false,
            live: false,
        }
    }

    #[tokio::test]
    async fn identical_requests_share_one_cached_response() {
        let queue = queue(0);
        queue.fetch(params()).await.unwrap();
        queue.fetch(params()).await.unwrap();
        assert_eq!(queue.facade.rest.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_within_budget() {
        let queue = queue(2);
        let bars = queue.fetch(params()).await.unwrap();
        assert_eq!(bars.len(), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_surfaces_the_last_error() {
        let queue = queue(100);
        let err = queue.fetch(params()).await.unwrap_err();
        assert!(matches!(err, RestError::Transport(_)));
    }
}
