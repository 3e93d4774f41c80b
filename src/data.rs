//! Document values and the JSON helpers used during ingestion.
//!
//! Incoming documents are arbitrary JSON objects. Before inference they are
//! flattened to dotted keys ([`flatten`]); each leaf is then coerced to its
//! mapped kind with [`to_text`], [`to_numeric`], [`to_bool`] or
//! [`parse_time`], and finally turned into a typed [`DataValue`] for the
//! segment library.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TesseraError};

/// A raw JSON document body.
pub type Source = Map<String, Value>;

/// `2006-01-02 15:04:05`
pub const LAYOUT_DATETIME_SPACE: &str = "%Y-%m-%d %H:%M:%S";
/// `2006-01-02T15:04:05`
pub const LAYOUT_DATETIME_T: &str = "%Y-%m-%dT%H:%M:%S";
pub const LAYOUT_RFC3339: &str = "rfc3339";
pub const LAYOUT_RFC3339_NANO: &str = "rfc3339_nano";
/// Numeric epoch, magnitude decides the unit.
pub const LAYOUT_EPOCH_MILLIS: &str = "epoch_millis";

/// Typed value of one indexed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    /// Analyzed full text.
    Text(String),
    /// Exact-match string.
    Keyword(String),
    Numeric(f64),
    Bool(bool),
    DateTime(DateTime<Utc>),
}

impl DataValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DataValue::Text(s) | DataValue::Keyword(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            DataValue::Numeric(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            DataValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        DataValue::Numeric(v)
    }
}

impl From<bool> for DataValue {
    fn from(v: bool) -> Self {
        DataValue::Bool(v)
    }
}

impl From<DateTime<Utc>> for DataValue {
    fn from(dt: DateTime<Utc>) -> Self {
        DataValue::DateTime(dt)
    }
}

/// Flatten nested objects into dotted keys.
///
/// Arrays of scalars are kept as arrays. Arrays whose elements are all
/// objects or arrays are flattened with the element index as a key segment.
/// `null` leaves are dropped.
pub fn flatten(doc: &Source) -> Source {
    let mut out = Map::new();
    for (key, value) in doc {
        flatten_into(&mut out, key, value);
    }
    out
}

fn flatten_into(out: &mut Source, key: &str, value: &Value) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (k, v) in map {
                flatten_into(out, &format!("{key}.{k}"), v);
            }
        }
        Value::Array(items) if items.iter().all(|v| v.is_object() || v.is_array()) => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(out, &format!("{key}.{i}"), v);
            }
        }
        _ => {
            out.insert(key.to_string(), value.clone());
        }
    }
}

/// Interpret an integer epoch by magnitude: nanoseconds above 1e18,
/// microseconds above 1e15, milliseconds above 1e12, seconds otherwise.
pub fn from_epoch(n: i64) -> Option<DateTime<Utc>> {
    if n > 1_000_000_000_000_000_000 {
        Some(DateTime::from_timestamp_nanos(n))
    } else if n > 1_000_000_000_000_000 {
        DateTime::from_timestamp_micros(n)
    } else if n > 1_000_000_000_000 {
        DateTime::from_timestamp_millis(n)
    } else {
        DateTime::from_timestamp(n, 0)
    }
}

/// Parse `"UTC"`, `"Z"`, `""`, `"+08:00"` or `"-0530"` to a fixed offset.
pub fn parse_time_zone(zone: &str) -> Result<FixedOffset> {
    let zone = zone.trim();
    let utc = FixedOffset::east_opt(0).ok_or_else(|| TesseraError::internal("utc offset"))?;
    if zone.is_empty() || zone.eq_ignore_ascii_case("utc") || zone == "Z" {
        return Ok(utc);
    }
    let invalid = || TesseraError::validation(format!("invalid time zone: {zone}"));
    let (sign, rest) = match zone.as_bytes()[0] {
        b'+' => (1, &zone[1..]),
        b'-' => (-1, &zone[1..]),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// Return the layout a string date was written in, if it matches one of the
/// recognized layouts.
pub fn detect_date_layout(value: &str) -> Option<&'static str> {
    if NaiveDateTime::parse_from_str(value, LAYOUT_DATETIME_SPACE).is_ok() {
        return Some(LAYOUT_DATETIME_SPACE);
    }
    if NaiveDateTime::parse_from_str(value, LAYOUT_DATETIME_T).is_ok() {
        return Some(LAYOUT_DATETIME_T);
    }
    if DateTime::parse_from_rfc3339(value).is_ok() {
        let fractional = value
            .split_once('T')
            .is_some_and(|(_, time)| time.contains('.'));
        return Some(if fractional {
            LAYOUT_RFC3339_NANO
        } else {
            LAYOUT_RFC3339
        });
    }
    None
}

/// Parse a date value with an optional stored layout and time zone.
///
/// Numbers are epochs; strings use `format`, or any recognized layout when
/// absent. Naive
/// layouts are read in `time_zone` (UTC when absent).
pub fn parse_time(
    value: &Value,
    format: Option<&str>,
    time_zone: Option<&str>,
) -> Result<DateTime<Utc>> {
    let text = match value {
        Value::Number(n) => {
            let n = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or_default();
            return from_epoch(n)
                .ok_or_else(|| TesseraError::validation(format!("invalid timestamp [{n}]")));
        }
        Value::String(s) => s.as_str(),
        other => {
            return Err(TesseraError::validation(format!(
                "value [{other}] of a date field must be a string or a number"
            )));
        }
    };
    if text.is_empty() {
        return Err(TesseraError::validation("time value is empty"));
    }

    let format = match format.filter(|f| !f.is_empty()) {
        Some(format) => format,
        None => detect_date_layout(text).unwrap_or(LAYOUT_RFC3339),
    };
    let parse_err = |e: chrono::ParseError| {
        TesseraError::validation(format!(
            "time format is [{format}] but the value [{text}] parse err: {e}"
        ))
    };

    match format {
        LAYOUT_EPOCH_MILLIS => {
            let n: i64 = text.trim().parse().map_err(|_| {
                TesseraError::validation(format!(
                    "time format is [epoch_millis] but the value [{text}] can't convert to int"
                ))
            })?;
            from_epoch(n).ok_or_else(|| {
                TesseraError::validation(format!(
                    "time format is [epoch_millis] but the value [{text}] is not a valid timestamp"
                ))
            })
        }
        LAYOUT_RFC3339 | LAYOUT_RFC3339_NANO => Ok(DateTime::parse_from_rfc3339(text)
            .map_err(parse_err)?
            .with_timezone(&Utc)),
        _ if format.contains("%z") || format.contains("%:z") => {
            Ok(DateTime::parse_from_str(text, format)
                .map_err(parse_err)?
                .with_timezone(&Utc))
        }
        _ => {
            let naive = NaiveDateTime::parse_from_str(text, format).map_err(parse_err)?;
            let zone = parse_time_zone(time_zone.unwrap_or_default())?;
            zone.from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| TesseraError::validation(format!("ambiguous time [{text}]")))
        }
    }
}

/// Coerce to a string. Objects and arrays are rejected.
pub fn to_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

/// Coerce to a float. Booleans count as 1 and 0.
pub fn to_numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Null => Some(0.0),
        _ => None,
    }
}

/// Coerce to a boolean. Numbers are true when non-zero.
pub fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.as_str() {
            "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
            "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Source {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_flatten() {
        let flat = flatten(&obj(json!({
            "a": {"b": 1, "c": {"d": "x"}},
            "tags": ["x", "y"],
            "items": [{"n": 1}, {"n": 2}],
            "gone": null
        })));

        assert_eq!(flat["a.b"], json!(1));
        assert_eq!(flat["a.c.d"], json!("x"));
        assert_eq!(flat["tags"], json!(["x", "y"]));
        assert_eq!(flat["items.0.n"], json!(1));
        assert_eq!(flat["items.1.n"], json!(2));
        assert!(!flat.contains_key("gone"));
    }

    #[test]
    fn test_epoch_heuristics() {
        let secs = from_epoch(1_700_000_000).unwrap();
        assert_eq!(from_epoch(1_700_000_000_000).unwrap(), secs);
        assert_eq!(from_epoch(1_700_000_000_000_000).unwrap(), secs);
        assert_eq!(from_epoch(1_700_000_000_000_000_000).unwrap(), secs);
    }

    #[test]
    fn test_detect_layouts() {
        assert_eq!(
            detect_date_layout("2024-01-02 03:04:05"),
            Some(LAYOUT_DATETIME_SPACE)
        );
        assert_eq!(
            detect_date_layout("2024-01-02T03:04:05"),
            Some(LAYOUT_DATETIME_T)
        );
        assert_eq!(
            detect_date_layout("2024-01-02T03:04:05Z"),
            Some(LAYOUT_RFC3339)
        );
        assert_eq!(
            detect_date_layout("2024-01-02T03:04:05.123+08:00"),
            Some(LAYOUT_RFC3339_NANO)
        );
        assert_eq!(detect_date_layout("hello"), None);
        assert_eq!(detect_date_layout("2024-01-02"), None);
    }

    #[test]
    fn test_parse_time_with_zone() {
        let utc = parse_time(&json!("2024-01-02 08:00:00"), Some(LAYOUT_DATETIME_SPACE), None)
            .unwrap();
        let shifted = parse_time(
            &json!("2024-01-02 08:00:00"),
            Some(LAYOUT_DATETIME_SPACE),
            Some("+08:00"),
        )
        .unwrap();
        assert_eq!((utc - shifted).num_hours(), 8);

        let millis = parse_time(&json!("1700000000000"), Some(LAYOUT_EPOCH_MILLIS), None).unwrap();
        assert_eq!(millis.timestamp(), 1_700_000_000);

        assert!(parse_time(&json!("yesterday"), None, None).is_err());
        assert!(parse_time(&json!(true), None, None).is_err());
        assert!(parse_time_zone("Mars/Olympus").is_err());
    }

    #[test]
    fn test_coercions() {
        assert_eq!(to_numeric(&json!("42.5")), Some(42.5));
        assert_eq!(to_numeric(&json!("abc")), None);
        assert_eq!(to_bool(&json!(2)), Some(true));
        assert_eq!(to_bool(&json!("false")), Some(false));
        assert_eq!(to_bool(&json!("maybe")), None);
        assert_eq!(to_text(&json!(7)), Some("7".to_string()));
        assert_eq!(to_text(&json!({"a": 1})), None);
    }
}
