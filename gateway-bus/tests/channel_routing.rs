//! Pure-logic checks that don't require a live Redis instance: channel
//! resolution and envelope shape, exercised the way a caller would use them
//! from the router.

use gateway_bus::{resolve_channel, Envelope};

#[test]
fn order_and_market_event_types_route_to_distinct_channels() {
    assert_ne!(resolve_channel("PLACE_ORDER"), resolve_channel("QUOTE"));
}

#[test]
fn envelope_round_trips_through_json() {
    let envelope = Envelope {
        event_type: "ORDER_RESPONSE".to_string(),
        payload: serde_json::json!({"orderId": "O-1", "status": "FILLED"}),
        timestamp: 1_700_000_000_000,
    };
    let raw = serde_json::to_string(&envelope).unwrap();
    assert!(raw.contains("\"type\":\"ORDER_RESPONSE\""));

    let decoded: Envelope = serde_json::from_str(&raw).unwrap();
    assert_eq!(decoded.event_type, envelope.event_type);
    assert_eq!(decoded.timestamp, envelope.timestamp);
}
