//! Contract Cache — symbol to active-delivery-month contract id, with tick
//! metadata, refreshed from the broker's `contracts/available` endpoint.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::month::{encoded_expiry_date, expand_two_digit_year, month_code_to_month};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarketsError {
    #[error("malformed contract id {0:?}")]
    MalformedContractId(String),
    #[error("unknown month code {0:?}")]
    UnknownMonthCode(char),
    #[error("instrument {0:?} not found in broker response")]
    InstrumentNotFound(String),
    #[error("slot {0:?} is not a registered bot slot")]
    UnknownSlot(String),
    #[error("slot {0:?} is already connected")]
    SlotAlreadyConnected(String),
    #[error("(account={account:?}, instrument={instrument:?}) already claimed by slot {holder:?}")]
    SlotPairClaimed {
        account: String,
        instrument: String,
        holder: String,
    },
}

/// A broker-format contract id's decomposed parts:
/// `PREFIX.TYPE.EXCH.SYMBOL.MMYY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedContractId {
    pub prefix: String,
    pub contract_type: String,
    pub exchange: String,
    pub symbol: String,
    pub month_code: char,
    pub year_two_digit: u32,
}

impl ParsedContractId {
    pub fn month(&self) -> Option<u32> {
        month_code_to_month(self.month_code)
    }

    pub fn full_year(&self) -> i32 {
        expand_two_digit_year(self.year_two_digit)
    }

    pub fn is_expired_as_of(&self, now: DateTime<Utc>) -> bool {
        match self.month().and_then(|m| encoded_expiry_date(self.full_year(), m)) {
            Some(expiry) => now.date_naive() > expiry,
            None => false,
        }
    }
}

/// Parses a broker contract id of the form `PREFIX.TYPE.EXCH.SYMBOL.MMYY`.
pub fn parse_contract_id(id: &str) -> Result<ParsedContractId, MarketsError> {
    let parts: Vec<&str> = id.split('.').collect();
    let [prefix, contract_type, exchange, symbol, mmyy] = parts[..] else {
        return Err(MarketsError::MalformedContractId(id.to_string()));
    };

    if mmyy.len() != 3 {
        return Err(MarketsError::MalformedContractId(id.to_string()));
    }
    let mut chars = mmyy.chars();
    let month_code = chars.next().ok_or_else(|| MarketsError::MalformedContractId(id.to_string()))?;
    let year_two_digit: u32 = chars
        .as_str()
        .parse()
        .map_err(|_| MarketsError::MalformedContractId(id.to_string()))?;

    if month_code_to_month(month_code).is_none() {
        return Err(MarketsError::UnknownMonthCode(month_code));
    }

    Ok(ParsedContractId {
        prefix: prefix.to_string(),
        contract_type: contract_type.to_string(),
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        month_code,
        year_two_digit,
    })
}

/// Inverse of [`parse_contract_id`] for the fields it preserves; used by
/// tests and by active-contract subscription to build the id for a chosen
/// delivery month.
pub fn build_contract_id(
    prefix: &str,
    contract_type: &str,
    exchange: &str,
    symbol: &str,
    month_code: char,
    year_two_digit: u32,
) -> String {
    format!("{prefix}.{contract_type}.{exchange}.{symbol}.{month_code}{year_two_digit:02}")
}

/// A cached contract's broker-reported metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
    pub contract_id: String,
    pub symbol: String,
    pub name: String,
    pub exchange: String,
    pub tick_size: Decimal,
    pub tick_value: Decimal,
    pub expiration_date: DateTime<Utc>,
    pub active: bool,
}

impl Contract {
    /// `tickValue / tickSize`, the dollar value of one full point of price
    /// movement.
    pub fn point_value(&self) -> Decimal {
        if self.tick_size.is_zero() {
            Decimal::ZERO
        } else {
            self.tick_value / self.tick_size
        }
    }

    pub fn is_valid(&self) -> bool {
        self.tick_size > Decimal::ZERO && self.tick_value > Decimal::ZERO
    }
}

/// `round(price / tick) * tick`. Idempotent: rounding an already-rounded
/// price is a no-op.
pub fn round_to_tick_size(price: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size.is_zero() {
        return price;
    }
    let ticks = (price / tick_size).round();
    ticks * tick_size
}

#[derive(Debug, Clone)]
struct CachedContract {
    contract: Contract,
    expires_at: DateTime<Utc>,
}

/// Fetches the broker's current tradable contract list. Implemented by the
/// REST facade; abstracted here so the cache can be tested without network
/// access.
#[async_trait::async_trait]
pub trait ContractSource: Send + Sync {
    async fn fetch_available(&self) -> Result<Vec<Contract>, MarketsError>;
}

const DEFAULT_TTL: StdDuration = StdDuration::from_secs(3600);

/// In-memory symbol -> contract-id cache with a 1-hour TTL per entry.
#[derive(Debug)]
pub struct ContractCache {
    ttl: chrono::Duration,
    entries: RwLock<HashMap<String, CachedContract>>,
}

impl Default for ContractCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ContractCache {
    pub fn new(ttl: StdDuration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached contract id for `symbol`. On a cache miss (or
    /// expiry), calls `source.fetch_available()` and repopulates the whole
    /// cache from the response before resolving the request.
    pub async fn get_contract_id_for_instrument(
        &self,
        symbol: &str,
        source: &dyn ContractSource,
    ) -> Result<Option<String>, MarketsError> {
        if let Some(contract) = self.lookup_fresh(symbol).await {
            return Ok(Some(contract.contract_id));
        }

        self.refresh(source).await?;
        Ok(self
            .lookup_fresh(symbol)
            .await
            .map(|contract| contract.contract_id))
    }

    pub async fn get_contract(&self, symbol: &str) -> Option<Contract> {
        self.lookup_fresh(symbol).await
    }

    async fn lookup_fresh(&self, symbol: &str) -> Option<Contract> {
        let entries = self.entries.read().await;
        entries.get(symbol).and_then(|cached| {
            if cached.expires_at > Utc::now() {
                Some(cached.contract.clone())
            } else {
                None
            }
        })
    }

    async fn refresh(&self, source: &dyn ContractSource) -> Result<(), MarketsError> {
        let contracts = source.fetch_available().await?;
        let now = Utc::now();
        let expires_at = now + self.ttl;
        let mut entries = self.entries.write().await;
        for contract in contracts {
            if !contract.is_valid() {
                warn!(contract_id = %contract.contract_id, "dropping contract with non-positive tick size/value");
                continue;
            }
            debug!(symbol = %contract.symbol, contract_id = %contract.contract_id, "contract cached");
            entries.insert(
                contract.symbol.clone(),
                CachedContract { contract, expires_at },
            );
        }
        Ok(())
    }
}
