//! Deserialisation helpers for the feed's mixed numeric encodings.
//!
//! The upstream feed serialises decimals inconsistently: the same field may
//! arrive as a JSON number or as a decimal string, and some records omit
//! fields entirely. Malformed values degrade to `None` rather than failing
//! the whole message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Extract an `f64` from a JSON number or a numeric string.
pub(crate) fn flexible_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

/// Deserialise an optional `f64` that may arrive as a number, a decimal
/// string, or null.
pub fn de_flexible_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(flexible_f64))
}

/// Deserialise an epoch-millisecond timestamp, tolerating string encoding.
/// Missing or unparseable values resolve to the epoch.
pub fn de_epoch_ms<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let ms = value.as_ref().and_then(flexible_f64).unwrap_or(0.0) as i64;
    Ok(DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH))
}

/// `#[serde(default)]` companion for [`de_epoch_ms`] fields.
pub fn unix_epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}
