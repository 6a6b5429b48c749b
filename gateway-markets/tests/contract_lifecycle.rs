//! Exercises scenario S2 (tick rounding) and the contract-id validity
//! property from the testable-properties list: every contract id returned
//! by the cache has a valid month code and non-empty symbol.

use rust_decimal::Decimal;

use gateway_markets::{parse_contract_id, round_to_tick_size, Contract, ContractCache, ContractSource, MarketsError};

struct StaticSource(Vec<Contract>);

#[async_trait::async_trait]
impl ContractSource for StaticSource {
    async fn fetch_available(&self) -> Result<Vec<Contract>, MarketsError> {
        Ok(self.0.clone())
    }
}

fn mgc_contract() -> Contract {
    Contract {
        contract_id: "CON.F.US.MGC.Z25".to_string(),
        symbol: "MGC".to_string(),
        name: "Micro Gold".to_string(),
        exchange: "COMEX".to_string(),
        tick_size: Decimal::new(1, 1),
        tick_value: Decimal::new(1, 0),
        expiration_date: chrono::Utc::now(),
        active: true,
    }
}

#[tokio::test]
async fn every_cached_contract_id_is_well_formed() {
    let cache = ContractCache::default();
    let source = StaticSource(vec![mgc_contract()]);

    let contract_id = cache
        .get_contract_id_for_instrument("MGC", &source)
        .await
        .unwrap()
        .expect("contract should resolve");

    let parsed = parse_contract_id(&contract_id).unwrap();
    assert!(!parsed.symbol.is_empty());
    assert!(parsed.month().is_some());
}

#[tokio::test]
async fn limit_price_is_rounded_to_tick_before_submission() {
    let cache = ContractCache::default();
    let source = StaticSource(vec![mgc_contract()]);
    cache.get_contract_id_for_instrument("MGC", &source).await.unwrap();
    let contract = cache.get_contract("MGC").await.unwrap();

    let requested_limit = Decimal::new(33801270, 4); // 3380.1270
    let rounded = round_to_tick_size(requested_limit, contract.tick_size);
    assert_eq!(rounded, Decimal::new(33801, 1)); // 3380.1
}
