//! Side decoding shared by the market and user hubs. Broker payloads encode
//! side as either a numeric `type`/`side` field or, inconsistently, a
//! textual field; both are accepted.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// Decodes the numeric convention used across the user hub (orders,
/// trades, positions): `0 -> Buy`, `1 -> Sell`.
pub fn decode_side_numeric(value: i64) -> Option<Side> {
    match value {
        0 => Some(Side::Buy),
        1 => Some(Side::Sell),
        _ => None,
    }
}

/// Falls back to a textual field (`"buy"`/`"sell"`, case-insensitive) when
/// no numeric field is present, as market-hub trade payloads sometimes omit
/// the numeric `type` and only carry a string.
pub fn decode_side_text(value: &str) -> Option<Side> {
    match value.to_ascii_lowercase().as_str() {
        "buy" | "b" | "bid" => Some(Side::Buy),
        "sell" | "s" | "ask" => Some(Side::Sell),
        _ => None,
    }
}

/// `type == 1 -> Long, else Short`, the convention used for
/// `GatewayUserPosition` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

pub fn decode_position_side(type_field: i64) -> PositionSide {
    if type_field == 1 {
        PositionSide::Long
    } else {
        PositionSide::Short
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_side_decodes_buy_and_sell() {
        assert_eq!(decode_side_numeric(0), Some(Side::Buy));
        assert_eq!(decode_side_numeric(1), Some(Side::Sell));
        assert_eq!(decode_side_numeric(2), None);
    }

    #[test]
    fn textual_side_is_case_insensitive() {
        assert_eq!(decode_side_text("BUY"), Some(Side::Buy));
        assert_eq!(decode_side_text("Sell"), Some(Side::Sell));
        assert_eq!(decode_side_text("unknown"), None);
    }

    #[test]
    fn position_side_follows_type_one_is_long_convention() {
        assert_eq!(decode_position_side(1), PositionSide::Long);
        assert_eq!(decode_position_side(0), PositionSide::Short);
        assert_eq!(decode_position_side(99), PositionSide::Short);
    }
}
