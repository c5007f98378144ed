use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::ScrapedTransaction;
use crate::error::RecordError;
use crate::models::transaction::TransactionStatus;

/// Pull the record array out of a list response.
///
/// The portal has shipped bare arrays, `{data: [...]}`, `{rows: [...]}` and
/// `{data: {rows|list: [...]}}` over time. Anything else yields no records.
pub fn extract_records(payload: Value) -> Option<Vec<Value>> {
    match payload {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => {
            for key in ["data", "rows", "list", "items"] {
                if let Some(inner) = map.remove(key) {
                    if let Some(items) = extract_records(inner) {
                        return Some(items);
                    }
                }
            }
            None
        }
        _ => None,
    }
}

/// Token from the login response body: `{ detail: { token } }`
pub fn extract_login_token(payload: &Value) -> Option<String> {
    payload
        .pointer("/detail/token")
        .or_else(|| payload.pointer("/data/token"))
        .or_else(|| payload.get("token"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

impl ScrapedTransaction {
    /// Parse and validate a single list element
    pub fn from_value(raw: &Value) -> Result<Self, RecordError> {
        if !raw.is_object() {
            return Err(RecordError::NotAnObject);
        }

        let record = ScrapedTransaction::deserialize(raw)?;

        match record.order_id.as_deref().map(str::trim) {
            None | Some("") => return Err(RecordError::MissingOrderId),
            Some(_) => {}
        }

        if record.transaction_status.is_none() {
            return Err(RecordError::InvalidField {
                field: "transactionStatus",
                reason: "missing".to_string(),
            });
        }

        Ok(record)
    }
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y/%m/%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    raw.parse::<i64>().ok().and_then(timestamp_from_epoch)
}

/// Epoch values above 10^11 are milliseconds, anything smaller is seconds
fn timestamp_from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value <= 0 {
        return None;
    }
    if value > 100_000_000_000 {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

pub(crate) fn de_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Exact decimal from a portal amount: `1250.5`, `"1,250.50"`, `"1e3"`
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
    Decimal::from_str_exact(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .ok()
}

/// Null, empty or absent amounts are `None` so they never overwrite a stored value
pub(crate) fn de_opt_amount<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = match Value::deserialize(deserializer)? {
        Value::Null => return Ok(None),
        Value::String(s) if s.trim().is_empty() => return Ok(None),
        Value::String(s) => s,
        // Integers keep every digit; floats print their shortest exact form
        Value::Number(n) => n.to_string(),
        other => return Err(serde::de::Error::custom(format!("invalid amount: {}", other))),
    };

    parse_amount(&raw)
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid amount: {}", raw)))
}

pub(crate) fn de_opt_status<'de, D>(deserializer: D) -> Result<Option<TransactionStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
        Value::Number(n) => n
            .as_i64()
            .and_then(TransactionStatus::from_code)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown status code: {}", n))),
        other => Err(serde::de::Error::custom(format!("invalid status: {}", other))),
    }
}

pub(crate) fn de_opt_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    // Unparseable timestamps degrade to None rather than dropping the record
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => parse_timestamp(&s),
        Value::Number(n) => n.as_i64().and_then(timestamp_from_epoch),
        _ => None,
    })
}

pub(crate) fn de_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_i64().is_some_and(|v| v != 0),
        Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    })
}
