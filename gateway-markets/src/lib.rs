#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    clippy::unused_self,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_extern_crates
)]

//! # Markets
//!
//! Contract Cache (symbol → active-delivery-month contract id, tick
//! metadata, 1h TTL) and Bot Registry (fixed slot roster, `(account,
//! instrument)` uniqueness) — the two pieces of gateway state that are
//! append-mostly and read far more often than they are written.

pub mod bot_registry;
pub mod contract;
pub mod month;

pub use bot_registry::BotRegistry;
pub use contract::{
    build_contract_id, parse_contract_id, round_to_tick_size, Contract, ContractCache,
    ContractSource, MarketsError, ParsedContractId,
};
pub use month::{month_code_to_month, month_to_month_code, MonthSchedule};
