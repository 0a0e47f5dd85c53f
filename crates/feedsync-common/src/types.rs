//! Shared value types
//!
//! [`FieldValue`] is the typed cell the normalizer produces and every store
//! backend serializes. [`Watermark`] is the timestamp that marks which run
//! last wrote a row.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// A typed field value after normalization
///
/// Numbers keep the JSON representation they will be written with: integer
/// text stays an exact `i64`/`u64`, everything else is an `f64`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(serde_json::Number),
    Null,
}

impl FieldValue {
    /// Build a numeric value from a float.
    ///
    /// Whole numbers within `i64` range become integers so that integer
    /// columns accept them (`12` rather than `12.0`). NaN and infinities
    /// become [`FieldValue::Null`] because JSON cannot carry them.
    pub fn number(value: f64) -> Self {
        if !value.is_finite() {
            return FieldValue::Null;
        }
        if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
            return FieldValue::Number((value as i64).into());
        }
        serde_json::Number::from_f64(value)
            .map(FieldValue::Number)
            .unwrap_or(FieldValue::Null)
    }

    /// Parse numeric text; integers are kept exact, anything unparseable is
    /// [`FieldValue::Null`]
    pub fn parse_number(text: &str) -> Self {
        if let Ok(n) = text.parse::<i64>() {
            FieldValue::Number(n.into())
        } else if let Ok(n) = text.parse::<u64>() {
            FieldValue::Number(n.into())
        } else {
            text.parse::<f64>().map(FieldValue::number).unwrap_or(FieldValue::Null)
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Text(s) => serde_json::Value::String(s.clone()),
            FieldValue::Number(n) => serde_json::Value::Number(n.clone()),
            FieldValue::Null => serde_json::Value::Null,
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::number(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(value.into())
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// The timestamp assigned to one reconciliation run
///
/// Truncated to microseconds on construction: Postgres `timestamptz` keeps
/// microsecond precision, and a watermark with extra nanoseconds would
/// compare greater than its own stored copy and purge freshly written rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    /// Watermark for a run starting now
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Watermark(at.trunc_subsecs(6))
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// ISO-8601 with an explicit UTC offset, e.g. `2024-05-01T02:00:00.123456+00:00`
    pub fn to_iso8601(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Micros, false)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::String(self.to_iso8601())
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso8601())
    }
}
