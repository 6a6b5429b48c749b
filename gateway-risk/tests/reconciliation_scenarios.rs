//! Scenario S5 — reconciliation auto-correct — driven through the public
//! service API: a 0.01-point drift is within threshold and raises nothing,
//! the same drift at a 0.005 threshold raises one medium `FIELD_MISMATCH`
//! and, with auto-correction on, overwrites the instance mirror.

use std::sync::Arc;

use chrono::Utc;
use gateway_risk::{
    DiscrepancyKind, InstancePosition, MasterPosition, NullPublisher, ReconciliationConfig,
    ReconciliationService, Severity,
};
use rust_decimal::Decimal;

fn master() -> MasterPosition {
    MasterPosition {
        order_id: "O".into(),
        instance_id: "bot-1".into(),
        account_id: "A1".into(),
        contract_id: "CON.F.US.MGC.Z25".into(),
        size: Decimal::new(2, 0),
        entry_price: Decimal::new(338010, 2),
        direction: gateway_risk::Direction::Long,
        status: "OPEN".into(),
        last_update: Utc::now(),
    }
}

fn drifted_instance() -> InstancePosition {
    InstancePosition {
        order_id: "O".into(),
        size: Decimal::new(2, 0),
        entry_price: Decimal::new(338011, 2),
        direction: gateway_risk::Direction::Long,
        status: "OPEN".into(),
        last_update: Utc::now(),
    }
}

#[tokio::test]
async fn drift_within_default_threshold_raises_nothing() {
    let service = ReconciliationService::new(ReconciliationConfig::default(), Arc::new(NullPublisher));
    service.feed_master(master()).await;
    service.feed_instance("bot-1", drifted_instance()).await;

    let discrepancies = service.run_cycle().await;
    assert!(discrepancies.is_empty());
}

#[tokio::test]
async fn drift_over_a_tighter_threshold_raises_one_medium_mismatch_and_autocorrects() {
    let config = ReconciliationConfig { max_discrepancy_threshold: Decimal::new(5, 3), ..ReconciliationConfig::default() };
    let service = ReconciliationService::new(config, Arc::new(NullPublisher));
    service.feed_master(master()).await;
    service.feed_instance("bot-1", drifted_instance()).await;

    let discrepancies = service.run_cycle().await;
    assert_eq!(discrepancies.len(), 1);
    assert_eq!(discrepancies[0].kind, DiscrepancyKind::FieldMismatch);
    assert_eq!(discrepancies[0].severity, Severity::Medium);

    let stats = service.stats().await;
    assert_eq!(stats.auto_corrections, 1);

    let clean = service.run_cycle().await;
    assert!(clean.is_empty(), "the instance mirror should now read 3380.10, matching master");
}
