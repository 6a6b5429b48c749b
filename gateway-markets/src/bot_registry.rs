//! Bot Registry — fixed roster of bot slots, validating that each
//! `(account, instrument)` pair is claimed by at most one connected slot.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::info;

use crate::contract::MarketsError;

#[derive(Debug, Clone, Default)]
struct BotSlot {
    connected: bool,
    last_seen: Option<DateTime<Utc>>,
    account: Option<String>,
    instrument: Option<String>,
    strategy: Option<String>,
}

/// Fixed-size roster of `BOT_1..BOT_N` slots. `N` is set at construction
/// (the design's example uses 6) and never changes afterwards.
#[derive(Debug)]
pub struct BotRegistry {
    slots: RwLock<HashMap<String, BotSlot>>,
}

impl BotRegistry {
    pub fn new(slot_count: usize) -> Self {
        let mut slots = HashMap::with_capacity(slot_count);
        for i in 1..=slot_count {
            slots.insert(format!("BOT_{i}"), BotSlot::default());
        }
        Self {
            slots: RwLock::new(slots),
        }
    }

    /// Rejects if `slot_id` is unknown, already connected, or the
    /// `(account, instrument)` pair is claimed by a different connected
    /// slot. On success, marks the slot connected and records its claim.
    pub async fn validate_registration(
        &self,
        slot_id: &str,
        account: &str,
        instrument: &str,
        strategy: &str,
    ) -> Result<(), MarketsError> {
        let mut slots = self.slots.write().await;

        if !slots.contains_key(slot_id) {
            return Err(MarketsError::UnknownSlot(slot_id.to_string()));
        }

        if slots.get(slot_id).is_some_and(|slot| slot.connected) {
            return Err(MarketsError::SlotAlreadyConnected(slot_id.to_string()));
        }

        if let Some((holder, _)) = slots.iter().find(|(id, slot)| {
            slot.connected
                && id.as_str() != slot_id
                && slot.account.as_deref() == Some(account)
                && slot.instrument.as_deref() == Some(instrument)
        }) {
            return Err(MarketsError::SlotPairClaimed {
                account: account.to_string(),
                instrument: instrument.to_string(),
                holder: holder.clone(),
            });
        }

        let slot = slots.get_mut(slot_id).expect("slot presence checked above");
        slot.connected = true;
        slot.last_seen = Some(Utc::now());
        slot.account = Some(account.to_string());
        slot.instrument = Some(instrument.to_string());
        slot.strategy = Some(strategy.to_string());
        info!(slot_id, account, instrument, "bot slot registered");
        Ok(())
    }

    /// Clears the slot's claim but preserves the slot's identity so it can
    /// be re-registered later.
    pub async fn deregister(&self, slot_id: &str) -> Result<(), MarketsError> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(slot_id)
            .ok_or_else(|| MarketsError::UnknownSlot(slot_id.to_string()))?;
        *slot = BotSlot::default();
        info!(slot_id, "bot slot deregistered");
        Ok(())
    }

    pub async fn touch(&self, slot_id: &str) {
        if let Some(slot) = self.slots.write().await.get_mut(slot_id) {
            slot.last_seen = Some(Utc::now());
        }
    }

    pub async fn is_connected(&self, slot_id: &str) -> bool {
        self.slots
            .read()
            .await
            .get(slot_id)
            .is_some_and(|slot| slot.connected)
    }

    pub async fn connected_count(&self) -> usize {
        self.slots.read().await.values().filter(|s| s.connected).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registration_succeeds_for_known_free_slot() {
        let registry = BotRegistry::new(6);
        registry
            .validate_registration("BOT_1", "ACC-1", "MGC", "mean-reversion")
            .await
            .unwrap();
        assert!(registry.is_connected("BOT_1").await);
    }

    #[tokio::test]
    async fn unknown_slot_is_rejected() {
        let registry = BotRegistry::new(6);
        let err = registry
            .validate_registration("BOT_99", "ACC-1", "MGC", "s")
            .await
            .unwrap_err();
        assert_eq!(err, MarketsError::UnknownSlot("BOT_99".to_string()));
    }

    #[tokio::test]
    async fn already_connected_slot_is_rejected() {
        let registry = BotRegistry::new(6);
        registry
            .validate_registration("BOT_1", "ACC-1", "MGC", "s")
            .await
            .unwrap();
        let err = registry
            .validate_registration("BOT_1", "ACC-2", "MES", "s")
            .await
            .unwrap_err();
        assert_eq!(err, MarketsError::SlotAlreadyConnected("BOT_1".to_string()));
    }

    #[tokio::test]
    async fn duplicate_account_instrument_pair_is_rejected() {
        let registry = BotRegistry::new(6);
        registry
            .validate_registration("BOT_1", "ACC-1", "MGC", "s")
            .await
            .unwrap();
        let err = registry
            .validate_registration("BOT_2", "ACC-1", "MGC", "other")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MarketsError::SlotPairClaimed {
                account: "ACC-1".to_string(),
                instrument: "MGC".to_string(),
                holder: "BOT_1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn deregister_frees_the_slot_for_reuse() {
        let registry = BotRegistry::new(6);
        registry
            .validate_registration("BOT_1", "ACC-1", "MGC", "s")
            .await
            .unwrap();
        registry.deregister("BOT_1").await.unwrap();
        assert!(!registry.is_connected("BOT_1").await);
        registry
            .validate_registration("BOT_1", "ACC-2", "MES", "s")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn same_account_different_instrument_does_not_conflict() {
        let registry = BotRegistry::new(6);
        registry
            .validate_registration("BOT_1", "ACC-1", "MGC", "s")
            .await
            .unwrap();
        registry
            .validate_registration("BOT_2", "ACC-1", "MES", "s")
            .await
            .unwrap();
        assert_eq!(registry.connected_count().await, 2);
    }
}
