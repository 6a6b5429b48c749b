#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    clippy::unused_self,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_extern_crates
)]

//! # Position Reconciliation Service
//!
//! A 30-second cycle comparing the gateway's own master position ledger
//! (fed by the streaming user hub) against each bot instance's self-reported
//! mirror, reporting `MISSING_INSTANCE`/`MISSING_POSITION`/`FIELD_MISMATCH`/
//! `ORPHANED_POSITION` discrepancies and auto-correcting the medium-severity
//! ones. [`service::ReconciliationService::force_reconciliation`] lets the
//! router trigger an out-of-band check for one order, with duplicate
//! in-flight requests suppressed.

pub mod bus;
pub mod service;
pub mod types;

pub use bus::{NullPublisher, Publisher};
pub use service::ReconciliationService;
pub use types::{
    Direction, Discrepancy, DiscrepancyKind, InstancePosition, MasterPosition,
    ReconciliationConfig, ReconciliationStats, ReconciliationSummary, Severity,
};
