//! The reconciliation cycle itself: compares the gateway's master position
//! ledger against each bot instance's own mirror, reports and (for
//! medium-severity cases) auto-corrects discrepancies, and keeps a rolling
//! history and running stats for `GET_STATISTICS`-style introspection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::bus::Publisher;
use crate::types::{
    Discrepancy, DiscrepancyKind, InstancePosition, MasterPosition, ReconciliationConfig,
    ReconciliationStats, ReconciliationSummary, Severity,
};

pub struct ReconciliationService {
    master: RwLock<HashMap<String, MasterPosition>>,
    instances: RwLock<HashMap<String, HashMap<String, InstancePosition>>>,
    config: ReconciliationConfig,
    bus: Arc<dyn Publisher>,
    history: RwLock<VecDeque<ReconciliationSummary>>,
    stats: RwLock<ReconciliationStats>,
    pending_force: RwLock<HashSet<String>>,
}

impl std::fmt::Debug for ReconciliationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationService").field("config", &self.config).finish_non_exhaustive()
    }
}

impl ReconciliationService {
    pub fn new(config: ReconciliationConfig, bus: Arc<dyn Publisher>) -> Self {
        Self {
            master: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            config,
            bus,
            history: RwLock::new(VecDeque::new()),
            stats: RwLock::new(ReconciliationStats::default()),
            pending_force: RwLock::new(HashSet::new()),
        }
    }

    pub fn cycle_interval(&self) -> std::time::Duration {
        self.config.cycle_interval
    }

    pub async fn feed_master(&self, position: MasterPosition) {
        self.master.write().await.insert(position.order_id.clone(), position);
    }

    pub async fn feed_instance(&self, instance_id: &str, position: InstancePosition) {
        self.instances
            .write()
            .await
            .entry(instance_id.to_string())
            .or_default()
            .insert(position.order_id.clone(), position);
    }

    pub async fn stats(&self) -> ReconciliationStats {
        self.stats.read().await.clone()
    }

    pub async fn history(&self) -> Vec<ReconciliationSummary> {
        self.history.read().await.iter().cloned().collect()
    }

    /// One full cycle: compare, scan for orphans, purge stale entries,
    /// auto-correct, and record the outcome.
    pub async fn run_cycle(&self) -> Vec<Discrepancy> {
        let mut discrepancies = self.compare_master_to_instances().await;
        discrepancies.extend(self.scan_orphaned().await);

        self.purge_stale().await;

        let auto_corrections = if self.config.auto_correct {
            self.apply_auto_corrections(&discrepancies).await
        } else {
            0
        };

        self.record(discrepancies.clone(), auto_corrections).await;
        discrepancies
    }

    /// Reconciles a single order immediately, bypassing the 30s cadence.
    /// Duplicate in-flight requests for the same `order_id` are suppressed
    /// and return `false`.
    pub async fn force_reconciliation(&self, order_id: &str, reason: &str) -> bool {
        {
            let mut pending = self.pending_force.write().await;
            if !pending.insert(order_id.to_string()) {
                warn!(order_id, "force reconciliation already pending, suppressing duplicate");
                return false;
            }
        }

        self.bus
            .publish("RECONCILIATION_REQUESTED", json!({"orderId": order_id, "reason": reason}), Some("system:events"))
            .await;

        let master = self.master.read().await;
        let discrepancies = match master.get(order_id) {
            Some(position) => {
                let instances = self.instances.read().await;
                compare_one(position, &instances, self.config.max_discrepancy_threshold)
            }
            None => Vec::new(),
        };
        drop(master);

        let auto_corrections = if self.config.auto_correct {
            self.apply_auto_corrections(&discrepancies).await
        } else {
            0
        };

        self.record(discrepancies.clone(), auto_corrections).await;
        self.pending_force.write().await.remove(order_id);
        info!(order_id, reason, count = discrepancies.len(), "forced reconciliation complete");
        true
    }

    async fn compare_master_to_instances(&self) -> Vec<Discrepancy> {
        let master = self.master.read().await;
        let instances = self.instances.read().await;
        master
            .values()
            .flat_map(|position| compare_one(position, &instances, self.config.max_discrepancy_threshold))
            .collect()
    }

    async fn scan_orphaned(&self) -> Vec<Discrepancy> {
        let master = self.master.read().await;
        let instances = self.instances.read().await;
        let mut found = Vec::new();
        for (instance_id, positions) in instances.iter() {
            for order_id in positions.keys() {
                let known = master.get(order_id).is_some_and(|m| &m.instance_id == instance_id);
                if !known {
                    found.push(Discrepancy {
                        order_id: order_id.clone(),
                        instance_id: instance_id.clone(),
                        kind: DiscrepancyKind::OrphanedPosition,
                        severity: Severity::Medium,
                        detail: "instance reports a position absent from the master ledger".to_string(),
                    });
                }
            }
        }
        found
    }

    async fn purge_stale(&self) {
        let now = Utc::now();
        let staleness = self.config.staleness;

        let mut master = self.master.write().await;
        master.retain(|order_id, position| {
            let keep = now - position.last_update <= staleness;
            if !keep {
                info!(order_id, "purging stale master position");
            }
            keep
        });
        drop(master);

        let mut instances = self.instances.write().await;
        for positions in instances.values_mut() {
            positions.retain(|_, position| now - position.last_update <= staleness);
        }
    }

    /// `FIELD_MISMATCH` at `Medium` severity is overwritten from the master
    /// record; `ORPHANED_POSITION` is removed from the instance map. High
    /// severity discrepancies are left untouched — they're reported, not
    /// silently corrected.
    async fn apply_auto_corrections(&self, discrepancies: &[Discrepancy]) -> u32 {
        let master = self.master.read().await;
        let mut instances = self.instances.write().await;
        let mut corrections = 0;

        for discrepancy in discrepancies {
            match (discrepancy.kind, discrepancy.severity) {
                (DiscrepancyKind::FieldMismatch, Severity::Medium) => {
                    if let Some(master_position) = master.get(&discrepancy.order_id) {
                        if let Some(instance_map) = instances.get_mut(&discrepancy.instance_id) {
                            if let Some(instance_position) = instance_map.get_mut(&discrepancy.order_id) {
                                instance_position.size = master_position.size;
                                instance_position.entry_price = master_position.entry_price;
                                instance_position.direction = master_position.direction;
                                instance_position.status = master_position.status.clone();
                                corrections += 1;
                            }
                        }
                    }
                }
                (DiscrepancyKind::OrphanedPosition, _) => {
                    if let Some(instance_map) = instances.get_mut(&discrepancy.instance_id) {
                        if instance_map.remove(&discrepancy.order_id).is_some() {
                            corrections += 1;
                        }
                    }
                }
                _ => {}
            }
        }
        corrections
    }

    async fn record(&self, discrepancies: Vec<Discrepancy>, auto_corrections: u32) {
        self.stats.write().await.record(&discrepancies, auto_corrections);

        let mut history = self.history.write().await;
        if history.len() >= self.config.history_capacity {
            history.pop_front();
        }
        history.push_back(ReconciliationSummary { ran_at: Some(Utc::now()), discrepancies, auto_corrections });
    }
}

fn decimals_differ(a: rust_decimal::Decimal, b: rust_decimal::Decimal, threshold: rust_decimal::Decimal) -> bool {
    (a - b).abs() > threshold
}

fn compare_one(
    master_position: &MasterPosition,
    instances: &HashMap<String, HashMap<String, InstancePosition>>,
    threshold: rust_decimal::Decimal,
) -> Vec<Discrepancy> {
    let Some(instance_map) = instances.get(&master_position.instance_id) else {
        return vec![Discrepancy {
            order_id: master_position.order_id.clone(),
            instance_id: master_position.instance_id.clone(),
            kind: DiscrepancyKind::MissingInstance,
            severity: Severity::High,
            detail: format!("instance {:?} is not known to the gateway", master_position.instance_id),
        }];
    };

    let Some(instance_position) = instance_map.get(&master_position.order_id) else {
        return vec![Discrepancy {
            order_id: master_position.order_id.clone(),
            instance_id: master_position.instance_id.clone(),
            kind: DiscrepancyKind::MissingPosition,
            severity: Severity::High,
            detail: "instance does not report this order id".to_string(),
        }];
    };

    let size_mismatch = decimals_differ(master_position.size, instance_position.size, threshold);
    let price_mismatch = decimals_differ(master_position.entry_price, instance_position.entry_price, threshold);
    let direction_mismatch = master_position.direction != instance_position.direction;
    let status_mismatch = master_position.status != instance_position.status;

    if !size_mismatch && !price_mismatch && !direction_mismatch && !status_mismatch {
        return Vec::new();
    }

    let severity = if size_mismatch || direction_mismatch { Severity::High } else { Severity::Medium };
    let detail = describe_mismatch(size_mismatch, price_mismatch, direction_mismatch, status_mismatch);

    vec![Discrepancy {
        order_id: master_position.order_id.clone(),
        instance_id: master_position.instance_id.clone(),
        kind: DiscrepancyKind::FieldMismatch,
        severity,
        detail,
    }]
}

fn describe_mismatch(size: bool, price: bool, direction: bool, status: bool) -> String {
    let mut fields = Vec::new();
    if size {
        fields.push("size");
    }
    if price {
        fields.push("entryPrice");
    }
    if direction {
        fields.push("direction");
    }
    if status {
        fields.push("status");
    }
    format!("mismatched field(s): {}", fields.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::NullPublisher;
    use crate::types::Direction;
    use rust_decimal::Decimal;

    fn master(order_id: &str, instance_id: &str, size: Decimal, price: Decimal, direction: Direction) -> MasterPosition {
        MasterPosition {
            order_id: order_id.into(),
            instance_id: instance_id.into(),
            account_id: "A1".into(),
            contract_id: "CON.F.US.MGC.Z25".into(),
            size,
            entry_price: price,
            direction,
            status: "OPEN".into(),
            last_update: Utc::now(),
        }
    }

    fn instance(order_id: &str, size: Decimal, price: Decimal, direction: Direction) -> InstancePosition {
        InstancePosition {
            order_id: order_id.into(),
            size,
            entry_price: price,
            direction,
            status: "OPEN".into(),
            last_update: Utc::now(),
        }
    }

    fn service() -> ReconciliationService {
        ReconciliationService::new(ReconciliationConfig::default(), Arc::new(NullPublisher))
    }

    #[tokio::test]
    async fn missing_instance_is_high_severity() {
        let service = service();
        service.feed_master(master("ord-1", "bot-1", Decimal::ONE, Decimal::new(3380, 0), Direction::Long)).await;

        let discrepancies = service.run_cycle().await;
        assert_eq!(discrepancies.len(), 1);
        assert_eq!(discrepancies[0].kind, DiscrepancyKind::MissingInstance);
        assert_eq!(discrepancies[0].severity, Severity::High);
    }

    #[tokio::test]
    async fn field_mismatch_on_price_alone_is_medium_and_auto_corrected() {
        let service = service();
        service.feed_master(master("ord-1", "bot-1", Decimal::ONE, Decimal::new(3380, 0), Direction::Long)).await;
        service.feed_instance("bot-1", instance("ord-1", Decimal::ONE, Decimal::new(3390, 0), Direction::Long)).await;

        let discrepancies = service.run_cycle().await;
        assert_eq!(discrepancies.len(), 1);
        assert_eq!(discrepancies[0].kind, DiscrepancyKind::FieldMismatch);
        assert_eq!(discrepancies[0].severity, Severity::Medium);

        let stats = service.stats().await;
        assert_eq!(stats.auto_corrections, 1);

        // corrected: a second cycle sees no further mismatch.
        let second = service.run_cycle().await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn size_mismatch_is_high_and_not_auto_corrected() {
        let service = service();
        service.feed_master(master("ord-1", "bot-1", Decimal::new(2, 0), Decimal::new(3380, 0), Direction::Long)).await;
        service.feed_instance("bot-1", instance("ord-1", Decimal::ONE, Decimal::new(3380, 0), Direction::Long)).await;

        let discrepancies = service.run_cycle().await;
        assert_eq!(discrepancies[0].severity, Severity::High);

        let second = service.run_cycle().await;
        assert_eq!(second.len(), 1, "high-severity mismatches are reported every cycle, never corrected");
    }

    #[tokio::test]
    async fn orphaned_position_is_removed_on_auto_correct() {
        let service = service();
        service.feed_instance("bot-1", instance("ord-orphan", Decimal::ONE, Decimal::new(100, 0), Direction::Long)).await;

        let discrepancies = service.run_cycle().await;
        assert_eq!(discrepancies.len(), 1);
        assert_eq!(discrepancies[0].kind, DiscrepancyKind::OrphanedPosition);

        let second = service.run_cycle().await;
        assert!(second.is_empty(), "orphan should have been removed from the instance map");
    }

    #[tokio::test]
    async fn small_numeric_drift_within_threshold_is_not_a_discrepancy() {
        let service = service();
        service.feed_master(master("ord-1", "bot-1", Decimal::ONE, Decimal::new(338000, 2), Direction::Long)).await;
        service.feed_instance("bot-1", instance("ord-1", Decimal::ONE, Decimal::new(338000, 2) + Decimal::new(1, 3), Direction::Long)).await;

        let discrepancies = service.run_cycle().await;
        assert!(discrepancies.is_empty());
    }

    #[tokio::test]
    async fn force_reconciliation_runs_then_clears_the_pending_marker() {
        let service = service();
        service.feed_master(master("ord-1", "bot-1", Decimal::ONE, Decimal::new(3380, 0), Direction::Long)).await;

        assert!(service.force_reconciliation("ord-1", "manual check").await);
        // completion clears the pending marker, so a later call runs again rather
        // than being suppressed.
        assert!(service.force_reconciliation("ord-1", "manual check").await);
    }

    #[tokio::test]
    async fn force_reconciliation_suppresses_an_already_pending_order() {
        let service = service();
        service.pending_force.write().await.insert("ord-1".to_string());

        let result = service.force_reconciliation("ord-1", "duplicate").await;
        assert!(!result);
    }

    #[tokio::test]
    async fn stale_entries_are_purged_after_five_minutes() {
        let mut config = ReconciliationConfig::default();
        config.staleness = chrono::Duration::milliseconds(1);
        let service = ReconciliationService::new(config, Arc::new(NullPublisher));

        let mut position = master("ord-1", "bot-1", Decimal::ONE, Decimal::new(3380, 0), Direction::Long);
        position.last_update = Utc::now() - chrono::Duration::minutes(10);
        service.feed_master(position).await;

        service.run_cycle().await;
        assert!(service.master.read().await.is_empty());
    }
}
