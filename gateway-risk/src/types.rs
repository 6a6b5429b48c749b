//! The two position ledgers this service reconciles, and the discrepancy
//! vocabulary it reports them as.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

/// The gateway's own record of a position, fed by the streaming user hub.
/// `instance_id` names the bot that owns the order, so a reconciliation
/// cycle knows which instance mirror to compare against.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterPosition {
    pub order_id: String,
    pub instance_id: String,
    pub account_id: String,
    pub contract_id: String,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub direction: Direction,
    pub status: String,
    pub last_update: DateTime<Utc>,
}

/// A bot instance's own mirror of the same position, reported via
/// `POSITION_UPDATE`.
#[derive(Debug, Clone, PartialEq)]
pub struct InstancePosition {
    pub order_id: String,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub direction: Direction,
    pub status: String,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscrepancyKind {
    MissingInstance,
    MissingPosition,
    FieldMismatch,
    OrphanedPosition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Discrepancy {
    pub order_id: String,
    pub instance_id: String,
    pub kind: DiscrepancyKind,
    pub severity: Severity,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationSummary {
    pub ran_at: Option<DateTime<Utc>>,
    pub discrepancies: Vec<Discrepancy>,
    pub auto_corrections: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationStats {
    pub total_reconciliations: u64,
    pub discrepancies_found: u64,
    pub auto_corrections: u64,
    pub missing_instance: u64,
    pub missing_position: u64,
    pub field_mismatch: u64,
    pub orphaned_position: u64,
}

impl ReconciliationStats {
    pub(crate) fn record(&mut self, discrepancies: &[Discrepancy], auto_corrections: u32) {
        self.total_reconciliations += 1;
        self.discrepancies_found += discrepancies.len() as u64;
        self.auto_corrections += auto_corrections as u64;
        for discrepancy in discrepancies {
            match discrepancy.kind {
                DiscrepancyKind::MissingInstance => self.missing_instance += 1,
                DiscrepancyKind::MissingPosition => self.missing_position += 1,
                DiscrepancyKind::FieldMismatch => self.field_mismatch += 1,
                DiscrepancyKind::OrphanedPosition => self.orphaned_position += 1,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub cycle_interval: std::time::Duration,
    pub max_discrepancy_threshold: Decimal,
    pub staleness: chrono::Duration,
    pub auto_correct: bool,
    pub history_capacity: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            cycle_interval: std::time::Duration::from_secs(30),
            max_discrepancy_threshold: Decimal::new(1, 2), // 0.01
            staleness: chrono::Duration::minutes(5),
            auto_correct: true,
            history_capacity: 50,
        }
    }
}
