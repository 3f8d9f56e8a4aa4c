//! Typed rows and coercion of raw source records.
//!
//! Sources hand back loosely typed JSON objects ([`RawRow`]). Before rows
//! reach the store they are coerced against the dataset schema: every
//! declared column gets a [`Value`] of the declared type (or `Null`), unknown
//! fields are dropped, and placeholder strings such as `"-"` become `Null`.
//! A row whose key columns end up `Null` is rejected with a [`CoerceError`].

use std::{cmp::Ordering, collections::BTreeMap, fmt};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use snafu::prelude::*;

use crate::dataset::{ColumnType, DatasetDescriptor};

/// A loosely typed record as produced by a source.
pub type RawRow = serde_json::Map<String, serde_json::Value>;

/// Strings sources use to mean "no value".
const NULL_MARKERS: [&str; 4] = ["", "-", "--", "null"];

/// A single typed cell.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    /// Missing value.
    #[default]
    Null,
    /// Calendar date.
    Date(NaiveDate),
    /// Naive timestamp.
    Timestamp(NaiveDateTime),
    /// UTF-8 string.
    Str(String),
    /// 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
}

impl Value {
    /// True for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Temporal value as a timestamp; dates map to midnight.
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Date(d) => Some(d.and_time(NaiveTime::MIN)),
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// String payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Whether the value can be stored in a column of type `ty`.
    pub fn conforms_to(&self, ty: ColumnType) -> bool {
        matches!(
            (self, ty),
            (Value::Null, _)
                | (Value::Date(_), ColumnType::Date)
                | (Value::Timestamp(_), ColumnType::Timestamp)
                | (Value::Str(_), ColumnType::Utf8)
                | (Value::Int(_), ColumnType::Int64)
                | (Value::Float(_), ColumnType::Float64)
        )
    }

    /// Ordering between comparable values.
    ///
    /// Numbers compare across integer and float, dates compare with
    /// timestamps at midnight. `Null` and mismatched kinds are incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Date(_) | Value::Timestamp(_), Value::Date(_) | Value::Timestamp(_)) => {
                self.as_datetime().cmp(&other.as_datetime()).into()
            }
            _ => None,
        }
    }

    /// JSON rendering used for output and ledgers.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            Value::Timestamp(ts) => {
                serde_json::Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.3f").to_string())
            }
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%dT%H:%M:%S%.f")),
            Value::Str(s) => write!(f, "{s}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
        }
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Timestamp(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

/// One stored record: column name to typed value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    values: BTreeMap<String, Value>,
}

impl Row {
    /// Empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value.into());
        self
    }

    /// Set a column's value.
    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.values.insert(column.into(), value);
    }

    /// Value of a column, if present.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Value of a column, treating absence as `Null`.
    pub fn value(&self, column: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.values.get(column).unwrap_or(&NULL)
    }

    /// Column/value pairs in column-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Time key of the row under `column`.
    pub fn time_key(&self, column: &str) -> Option<NaiveDateTime> {
        self.get(column).and_then(Value::as_datetime)
    }

    /// Canonical identity of the row over `columns`, used for deduplication.
    pub fn key_of(&self, columns: &[&str]) -> String {
        let mut key = String::new();
        for (i, col) in columns.iter().enumerate() {
            if i > 0 {
                key.push('\u{1f}');
            }
            key.push_str(&self.value(col).to_string());
        }
        key
    }

    /// JSON object rendering.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Reasons a raw record cannot become a typed row.
#[derive(Debug, Snafu, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum CoerceError {
    /// A key column is absent or empty.
    #[snafu(display("Key column {column} is missing"))]
    MissingKey {
        /// Key column name.
        column: String,
    },

    /// A value cannot be read as the declared type.
    #[snafu(display("Column {column} value {raw} is not a valid {expected:?}"))]
    BadValue {
        /// Column name.
        column: String,
        /// Raw value as text.
        raw: String,
        /// Declared column type.
        expected: ColumnType,
    },
}

/// Coerce a raw source record against the dataset schema.
pub fn coerce_row(raw: &RawRow, dataset: &DatasetDescriptor) -> Result<Row, CoerceError> {
    let mut row = Row::new();
    for spec in &dataset.columns {
        let value = match raw.get(&spec.name) {
            Some(v) => coerce_value(v, spec.column_type).context(BadValueSnafu {
                column: spec.name.clone(),
                raw: v.to_string(),
                expected: spec.column_type,
            })?,
            None => Value::Null,
        };
        row.insert(spec.name.clone(), value);
    }

    for key in dataset.key_columns() {
        ensure!(!row.value(key).is_null(), MissingKeySnafu { column: key });
    }
    Ok(row)
}

fn coerce_value(raw: &serde_json::Value, ty: ColumnType) -> Option<Value> {
    use serde_json::Value as Json;

    if let Json::String(s) = raw {
        if NULL_MARKERS.contains(&s.trim()) {
            return Some(Value::Null);
        }
    }

    match (raw, ty) {
        (Json::Null, _) => Some(Value::Null),
        (Json::String(s), ColumnType::Date) => parse_date(s.trim()).map(Value::Date),
        (Json::String(s), ColumnType::Timestamp) => parse_timestamp(s.trim()).map(Value::Timestamp),
        (Json::String(s), ColumnType::Utf8) => Some(Value::Str(s.trim().to_string())),
        (Json::String(s), ColumnType::Int64) => strip_thousands(s).parse().ok().map(Value::Int),
        (Json::String(s), ColumnType::Float64) => strip_thousands(s).parse().ok().map(Value::Float),
        (Json::Number(n), ColumnType::Int64) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map(Value::Int),
        (Json::Number(n), ColumnType::Float64) => n.as_f64().map(Value::Float),
        (Json::Number(n), ColumnType::Utf8) => Some(Value::Str(n.to_string())),
        (Json::Bool(b), ColumnType::Utf8) => Some(Value::Str(b.to_string())),
        _ => None,
    }
}

fn strip_thousands(s: &str) -> String {
    s.trim().replace(',', "")
}

/// Parse `YYYY-MM-DD`, `YYYYMMDD`, or the date part of a timestamp.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y%m%d"))
        .ok()
        .or_else(|| parse_timestamp(s).map(|ts| ts.date()))
}

/// Parse an ISO-like timestamp, accepting a space or `T` separator, or a bare date.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .or_else(|_| NaiveDate::parse_from_str(s, "%Y%m%d"))
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_util::{daily_quotes, date};
    use serde_json::json;

    fn raw(v: serde_json::Value) -> RawRow {
        match v {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected a JSON object"),
        }
    }

    #[test]
    fn coerces_declared_columns_and_drops_unknown_fields() {
        let row = coerce_row(
            &raw(json!({
                "date": "2020-06-01",
                "code": "000001",
                "name": " Ping An ",
                "close": "1,234.5",
                "volume": 1200,
                "extra": "ignored"
            })),
            &daily_quotes(),
        )
        .expect("coerce");

        assert_eq!(row.value("date"), &Value::Date(date(2020, 6, 1)));
        assert_eq!(row.value("name"), &Value::Str("Ping An".to_string()));
        assert_eq!(row.value("close"), &Value::Float(1234.5));
        assert_eq!(row.value("volume"), &Value::Int(1200));
        assert!(row.get("extra").is_none());
    }

    #[test]
    fn placeholder_strings_become_null() {
        let row = coerce_row(
            &raw(json!({"date": "20200601", "code": "000001", "close": "--", "volume": "-"})),
            &daily_quotes(),
        )
        .expect("coerce");

        assert_eq!(row.value("date"), &Value::Date(date(2020, 6, 1)));
        assert!(row.value("close").is_null());
        assert!(row.value("volume").is_null());
        assert!(row.value("name").is_null());
    }

    #[test]
    fn missing_key_column_is_rejected() {
        let err = coerce_row(&raw(json!({"date": "2020-06-01", "close": 1.0})), &daily_quotes())
            .unwrap_err();
        assert_eq!(
            err,
            CoerceError::MissingKey {
                column: "code".to_string()
            }
        );
    }

    #[test]
    fn unparseable_value_is_rejected() {
        let err = coerce_row(
            &raw(json!({"date": "June 1st", "code": "000001"})),
            &daily_quotes(),
        )
        .unwrap_err();
        assert!(matches!(err, CoerceError::BadValue { .. }));
    }

    #[test]
    fn values_compare_across_numeric_and_temporal_kinds() {
        assert_eq!(Value::Int(2).compare(&Value::Float(1.5)), Some(Ordering::Greater));
        let d = Value::Date(date(2020, 6, 1));
        let ts = Value::Timestamp(date(2020, 6, 1).and_hms_opt(9, 0, 0).expect("time"));
        assert_eq!(d.compare(&ts), Some(Ordering::Less));
        assert_eq!(Value::Null.compare(&Value::Int(1)), None);
        assert_eq!(Value::Str("a".into()).compare(&Value::Int(1)), None);
    }

    #[test]
    fn key_of_joins_values_in_column_order() {
        let row = Row::new()
            .with("date", date(2020, 6, 1))
            .with("code", "000001");
        assert_eq!(row.key_of(&["date", "code"]), "2020-06-01\u{1f}000001");
        assert_ne!(row.key_of(&["code", "date"]), row.key_of(&["date", "code"]));
    }

    #[test]
    fn timestamps_accept_both_separators() {
        let expected = date(2020, 6, 1).and_hms_opt(9, 30, 0).expect("time");
        assert_eq!(parse_timestamp("2020-06-01T09:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2020-06-01 09:30"), Some(expected));
        assert_eq!(
            parse_timestamp("2020-06-01"),
            Some(date(2020, 6, 1).and_time(NaiveTime::MIN))
        );
    }
}
