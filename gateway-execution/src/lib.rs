#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    clippy::unused_self,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_extern_crates
)]

//! # REST Facade & Bracket-Order Engine
//!
//! [`rest::RestFacade`] wraps the broker's HTTP surface behind typed
//! operations, applying tick-size rounding and `ensureValidToken` uniformly.
//! [`history::HistoryQueue`] bounds and caches the historical-bar subset of
//! that surface. [`bracket::BracketEngine`] drives the two-phase
//! place-then-attach-stop-loss/take-profit flow: it owns no scheduler of its
//! own (the caller drives `check_and_apply` on a timer), which keeps retry
//! and matching logic testable without sleeping in tests.

pub mod bracket;
pub mod bus;
pub mod error;
pub mod history;
pub mod rest;
pub mod transport;
pub mod types;

pub use bracket::{BracketConfig, BracketEngine, PendingBracket};
pub use bus::{NullPublisher, Publisher};
pub use error::{BrokerApiError, RestError};
pub use history::{HistoryConfig, HistoryQueue};
pub use rest::{ContractSourceAdapter, RestFacade};
pub use transport::{BrokerRest, PlaceOrderRequest};
pub use types::{
    Bar, BarUnit, BracketSpec, BrokerAccount, BrokerContract, BrokerPosition, BrokerTrade,
    HistoryParams, OrderIntent, OrderKind, Side, StatsRow, TradeSearchParams,
};
