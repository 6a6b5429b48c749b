//! Field-name-variant tolerant extraction from inbound hub payloads. The
//! broker's own client libraries are inconsistent about casing and about
//! which of a few synonymous field names a given message carries; this
//! module is the single place that absorbs that.

use rust_decimal::Decimal;
use serde_json::Value;

/// Looks up the first key in `names` present in `value` (an object),
/// returning its raw `Value`.
pub fn first_field<'a>(value: &'a Value, names: &[&str]) -> Option<&'a Value> {
    let object = value.as_object()?;
    names.iter().find_map(|name| object.get(*name))
}

/// Decodes a `Decimal` from a JSON number or numeric string under any of
/// `names`.
pub fn decimal_field(value: &Value, names: &[&str]) -> Option<Decimal> {
    let raw = first_field(value, names)?;
    decimal_from_value(raw)
}

pub fn decimal_from_value(raw: &Value) -> Option<Decimal> {
    match raw {
        Value::Number(n) => n
            .as_f64()
            .and_then(|f| Decimal::from_str_exact(&f.to_string()).ok())
            .or_else(|| n.to_string().parse().ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn string_field(value: &Value, names: &[&str]) -> Option<String> {
    let raw = first_field(value, names)?;
    match raw {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn i64_field(value: &Value, names: &[&str]) -> Option<i64> {
    let raw = first_field(value, names)?;
    match raw {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
