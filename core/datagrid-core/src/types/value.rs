//! Cell values and conversions between the in-memory, SQLite and JSON forms

use super::column_type::ColumnType;
use crate::error::{DgError, DgResult};
use crate::storage::asset::Asset;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Value as JsonValue, json};

/// TEXT values longer than this are truncated on append.
pub const MAX_TEXT_LENGTH: usize = 10_000;

/// One cell of a DataGrid row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    /// Seconds since the Unix epoch
    Datetime(f64),
    Json(JsonValue),
    Vector(Vec<f64>),
    /// Inline asset, only present before the asset has been logged
    Asset(Asset),
    /// Reference to a logged asset
    AssetRef { asset_type: String, asset_id: String },
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Type a column would get from this value alone; `None` for NULL.
    pub fn infer_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Integer(_) => Some(ColumnType::Integer),
            Value::Float(_) => Some(ColumnType::Float),
            Value::Text(_) => Some(ColumnType::Text),
            Value::Datetime(_) => Some(ColumnType::Datetime),
            Value::Json(json) if is_numeric_array(json) => Some(ColumnType::Vector),
            Value::Json(_) => Some(ColumnType::Json),
            Value::Vector(_) => Some(ColumnType::Vector),
            Value::Asset(asset) => Some(ColumnType::asset(asset.asset_type())),
            Value::AssetRef { asset_type, .. } => Some(ColumnType::asset(asset_type)),
        }
    }

    /// Converts along the type lattice; anything converts to TEXT.
    ///
    /// `column` only names the column in the mismatch error.
    pub fn convert_to(&self, target: &ColumnType, column: &str) -> DgResult<Value> {
        if self.infer_type().as_ref() == Some(target) {
            return Ok(match self {
                Value::Json(json) if *target == ColumnType::Vector => {
                    Value::Vector(numeric_array(json).unwrap_or_default())
                }
                Value::Text(text) => Value::Text(truncate(text)),
                other => other.clone(),
            });
        }

        let converted = match (self, target) {
            (Value::Null, _) => Some(Value::Null),
            (_, ColumnType::Text) => Some(Value::Text(truncate(&self.to_text()))),

            (Value::Integer(i), ColumnType::Float) => Some(Value::Float(*i as f64)),
            (Value::Integer(i), ColumnType::Boolean) => Some(Value::Boolean(*i != 0)),
            (Value::Integer(i), ColumnType::Datetime) => Some(Value::Datetime(*i as f64)),
            (Value::Integer(i), ColumnType::RowId) => Some(Value::Integer(*i)),
            (Value::Float(f), ColumnType::Datetime) => Some(Value::Datetime(*f)),
            (Value::Float(f), ColumnType::Integer) if f.fract() == 0.0 && f.is_finite() => {
                Some(Value::Integer(*f as i64))
            }
            (Value::Boolean(b), ColumnType::Integer) => Some(Value::Integer(*b as i64)),

            (Value::Vector(v), ColumnType::Json) => Some(Value::Json(json!(v))),
            (Value::Json(json), ColumnType::Vector) => numeric_array(json).map(Value::Vector),

            (Value::Text(s), ColumnType::Integer) => s.trim().parse().ok().map(Value::Integer),
            (Value::Text(s), ColumnType::Float) => s.trim().parse().ok().map(Value::Float),
            (Value::Text(s), ColumnType::Boolean) => parse_bool(s).map(Value::Boolean),
            (Value::Text(s), ColumnType::Datetime) => {
                parse_datetime(s, DEFAULT_DATETIME_FORMAT).map(Value::Datetime)
            }
            (Value::Text(s), ColumnType::Json) => {
                serde_json::from_str::<JsonValue>(s).ok().map(Value::Json)
            }

            (Value::Asset(asset), ColumnType::Asset(kind)) if asset.asset_type() == kind => {
                Some(self.clone())
            }
            _ => None,
        };

        converted.ok_or_else(|| DgError::TypeMismatch {
            column: column.to_string(),
            value: self.to_text(),
            expected: target.to_string(),
        })
    }

    /// Display form used when a value falls back to TEXT.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => "None".to_string(),
            Value::Boolean(true) => "True".to_string(),
            Value::Boolean(false) => "False".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Text(s) => s.clone(),
            Value::Datetime(ts) => format_datetime(*ts),
            Value::Json(json) => json.to_string(),
            Value::Vector(v) => json!(v).to_string(),
            Value::Asset(asset) => asset.id().to_string(),
            Value::AssetRef { asset_id, .. } => asset_id.clone(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Boolean(b) => Some(*b as i64 as f64),
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) | Value::Datetime(f) => Some(*f),
            _ => None,
        }
    }

    /// Asset id for asset-valued cells.
    pub fn asset_id(&self) -> Option<&str> {
        match self {
            Value::Asset(asset) => Some(asset.id()),
            Value::AssetRef { asset_id, .. } => Some(asset_id),
            _ => None,
        }
    }

    /// Physical representation bound into SQLite statements.
    pub fn to_sql(&self) -> SqlValue {
        match self {
            Value::Null => SqlValue::Null,
            Value::Boolean(b) => SqlValue::Integer(*b as i64),
            Value::Integer(i) => SqlValue::Integer(*i),
            Value::Float(f) | Value::Datetime(f) => {
                if f.is_nan() {
                    SqlValue::Null
                } else {
                    SqlValue::Real(*f)
                }
            }
            Value::Text(s) => SqlValue::Text(s.clone()),
            Value::Json(json) => SqlValue::Text(json.to_string()),
            Value::Vector(v) => SqlValue::Text(json!(v).to_string()),
            Value::Asset(asset) => SqlValue::Text(asset.id().to_string()),
            Value::AssetRef { asset_id, .. } => SqlValue::Text(asset_id.clone()),
        }
    }

    /// Reads a stored cell back according to the column's type.
    pub fn from_sql(column_type: &ColumnType, raw: ValueRef<'_>) -> DgResult<Value> {
        let value = match (column_type, raw) {
            (_, ValueRef::Null) => Value::Null,
            (ColumnType::Boolean, ValueRef::Integer(i)) => Value::Boolean(i != 0),
            (ColumnType::Boolean, ValueRef::Real(f)) => Value::Boolean(f != 0.0),
            (ColumnType::Integer | ColumnType::RowId, ValueRef::Integer(i)) => Value::Integer(i),
            (ColumnType::Integer | ColumnType::RowId, ValueRef::Real(f)) => Value::Float(f),
            (ColumnType::Float, ValueRef::Real(f)) => Value::Float(f),
            (ColumnType::Float, ValueRef::Integer(i)) => Value::Float(i as f64),
            (ColumnType::Datetime, ValueRef::Real(f)) => Value::Datetime(f),
            (ColumnType::Datetime, ValueRef::Integer(i)) => Value::Datetime(i as f64),
            (ColumnType::Json | ColumnType::Vector, ValueRef::Text(bytes)) => {
                let json: JsonValue = serde_json::from_slice(bytes)?;
                match (column_type, numeric_array(&json)) {
                    (ColumnType::Vector, Some(v)) => Value::Vector(v),
                    _ => Value::Json(json),
                }
            }
            (ColumnType::Asset(kind), ValueRef::Text(bytes)) => Value::AssetRef {
                asset_type: kind.clone(),
                asset_id: String::from_utf8_lossy(bytes).into_owned(),
            },
            (_, ValueRef::Text(bytes)) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
            (_, ValueRef::Integer(i)) => Value::Integer(i),
            (_, ValueRef::Real(f)) => Value::Float(f),
            (_, ValueRef::Blob(_)) => {
                return Err(DgError::Serialization(format!(
                    "unexpected BLOB in {} column",
                    column_type
                )));
            }
        };
        Ok(value)
    }

    /// JSON shape handed to the HTTP layer.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Boolean(b) => JsonValue::Bool(*b),
            Value::Integer(i) => json!(i),
            Value::Float(f) | Value::Datetime(f) => float_json(*f),
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Json(json) => json.clone(),
            Value::Vector(v) => json!(v),
            Value::Asset(asset) => asset_reference(asset.asset_type(), asset.id()),
            Value::AssetRef {
                asset_type,
                asset_id,
            } => asset_reference(asset_type, asset_id),
        }
    }

    /// Best-effort value from a JSON input document.
    pub fn from_json(json: JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Boolean(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Value::Text(s),
            other => Value::Json(other),
        }
    }

    /// Heuristic parse applied to text input when the grid enables it.
    pub fn parse_heuristic(text: &str, datetime_format: &str) -> Value {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        if let Some(b) = parse_bool(trimmed) {
            return Value::Boolean(b);
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Value::Integer(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return Value::Float(f);
        }
        if let Some(ts) = parse_datetime(trimmed, datetime_format) {
            return Value::Datetime(ts);
        }
        Value::Text(text.to_string())
    }
}

pub(crate) fn asset_reference(asset_type: &str, asset_id: &str) -> JsonValue {
    json!({
        "type": "asset",
        "assetType": asset_type,
        "assetId": asset_id,
    })
}

/// Default format used to parse DATETIME text.
pub const DEFAULT_DATETIME_FORMAT: &str = "%Y/%m/%d";

/// Parses with `format`, accepting a date-only format as midnight UTC.
pub fn parse_datetime(text: &str, format: &str) -> Option<f64> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
        return Some(dt.and_utc().timestamp_millis() as f64 / 1000.0);
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, format) {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis() as f64 / 1000.0);
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
}

pub fn format_datetime(ts: f64) -> String {
    let millis = (ts * 1000.0).round() as i64;
    match DateTime::from_timestamp_millis(millis) {
        Some(dt) => dt.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string(),
        None => format_float(ts),
    }
}

/// Renders integral floats with a trailing `.0`.
pub fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else if f.is_nan() {
        "nan".to_string()
    } else {
        f.to_string()
    }
}

fn float_json(f: f64) -> JsonValue {
    serde_json::Number::from_f64(f)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim() {
        "True" | "true" | "TRUE" => Some(true),
        "False" | "false" | "FALSE" => Some(false),
        _ => None,
    }
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_TEXT_LENGTH) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn is_numeric_array(json: &JsonValue) -> bool {
    matches!(
        json,
        JsonValue::Array(items) if !items.is_empty() && items.iter().all(JsonValue::is_number)
    )
}

fn numeric_array(json: &JsonValue) -> Option<Vec<f64>> {
    match json {
        JsonValue::Array(items) => items.iter().map(JsonValue::as_f64).collect(),
        _ => None,
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(value: Vec<f64>) -> Self {
        Value::Vector(value)
    }
}

impl From<Asset> for Value {
    fn from(value: Asset) -> Self {
        Value::Asset(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_type() {
        assert_eq!(Value::Null.infer_type(), None);
        assert_eq!(Value::from(3).infer_type(), Some(ColumnType::Integer));
        assert_eq!(Value::Json(json!([1, 2.5])).infer_type(), Some(ColumnType::Vector));
        assert_eq!(Value::Json(json!({"a": 1})).infer_type(), Some(ColumnType::Json));
        assert_eq!(Value::Json(json!([])).infer_type(), Some(ColumnType::Json));
    }

    #[test]
    fn test_convert_along_lattice() {
        assert_eq!(
            Value::from(2).convert_to(&ColumnType::Float, "a").unwrap(),
            Value::Float(2.0)
        );
        assert_eq!(
            Value::from(0).convert_to(&ColumnType::Boolean, "a").unwrap(),
            Value::Boolean(false)
        );
        assert_eq!(
            Value::from(1.5).convert_to(&ColumnType::Text, "a").unwrap(),
            Value::Text("1.5".into())
        );
        assert_eq!(
            Value::Vector(vec![1.0]).convert_to(&ColumnType::Json, "a").unwrap(),
            Value::Json(json!([1.0]))
        );
    }

    #[test]
    fn test_convert_mismatch_names_column() {
        let err = Value::from("abc")
            .convert_to(&ColumnType::Float, "score")
            .unwrap_err();
        match err {
            DgError::TypeMismatch {
                column,
                value,
                expected,
            } => {
                assert_eq!(column, "score");
                assert_eq!(value, "abc");
                assert_eq!(expected, "FLOAT");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_text_truncation() {
        let long = "x".repeat(MAX_TEXT_LENGTH + 10);
        match Value::from(long).convert_to(&ColumnType::Text, "t").unwrap() {
            Value::Text(s) => assert_eq!(s.len(), MAX_TEXT_LENGTH),
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn test_heuristics() {
        let fmt = DEFAULT_DATETIME_FORMAT;
        assert_eq!(Value::parse_heuristic("42", fmt), Value::Integer(42));
        assert_eq!(Value::parse_heuristic("4.5", fmt), Value::Float(4.5));
        assert_eq!(Value::parse_heuristic("True", fmt), Value::Boolean(true));
        assert_eq!(Value::parse_heuristic("", fmt), Value::Null);
        assert_eq!(
            Value::parse_heuristic("1970/01/02", fmt),
            Value::Datetime(86_400.0)
        );
        assert_eq!(Value::parse_heuristic("dog", fmt), Value::Text("dog".into()));
    }

    #[test]
    fn test_sql_round_trip_by_type() {
        let cases = vec![
            (ColumnType::Boolean, Value::Boolean(true)),
            (ColumnType::Integer, Value::Integer(-7)),
            (ColumnType::Float, Value::Float(0.25)),
            (ColumnType::Datetime, Value::Datetime(1_600_000_000.5)),
            (ColumnType::Json, Value::Json(json!({"k": [1, 2]}))),
            (ColumnType::Vector, Value::Vector(vec![1.0, 2.0])),
        ];
        for (column_type, value) in cases {
            let stored = value.to_sql();
            let back = Value::from_sql(&column_type, ValueRef::from(&stored)).unwrap();
            assert_eq!(back, value, "{column_type}");
        }
    }

    #[test]
    fn test_asset_reference_json() {
        let value = Value::AssetRef {
            asset_type: "Image".into(),
            asset_id: "abc".into(),
        };
        assert_eq!(
            value.to_json(),
            json!({"type": "asset", "assetType": "Image", "assetId": "abc"})
        );
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(3.0), "3.0");
        assert_eq!(format_float(0.5), "0.5");
    }
}
