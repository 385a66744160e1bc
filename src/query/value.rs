//! Document value helpers: dotted-path access, ordering, and Extended-JSON
//! normalization.
//!
//! Documents are `serde_json` objects. Identifiers and timestamps are stored
//! in Extended-JSON wrappers (`{"$oid": ..}`, `{"$date": ..}`) so they keep
//! their type inside the store; [`normalize`] flattens them to canonical
//! strings before results leave the executor.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value, json};

/// A stored record.
pub type Document = Map<String, Value>;

/// Date formats accepted when a string is compared against a stored date.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// Wraps a timestamp as an Extended-JSON date.
#[must_use]
pub fn date_value(dt: DateTime<Utc>) -> Value {
    json!({ "$date": dt.to_rfc3339_opts(SecondsFormat::Millis, true) })
}

/// Generates a new Extended-JSON object identifier (24 hex digits).
#[must_use]
pub fn new_object_id() -> Value {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    json!({ "$oid": &hex[..24] })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wrapper {
    ObjectId,
    Date,
    Number,
}

/// Classifies a single-key Extended-JSON wrapper.
fn wrapper_kind(value: &Value) -> Option<Wrapper> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    match obj.keys().next()?.as_str() {
        "$oid" => Some(Wrapper::ObjectId),
        "$date" => Some(Wrapper::Date),
        "$numberLong" | "$numberInt" | "$numberDouble" | "$numberDecimal" => Some(Wrapper::Number),
        _ => None,
    }
}

/// Returns `true` if `value` is an Extended-JSON scalar wrapper.
#[must_use]
pub fn is_wrapper(value: &Value) -> bool {
    wrapper_kind(value).is_some()
}

/// Parses a string as a date or datetime in any accepted format.
#[must_use]
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
        }
    }
    None
}

/// Returns the timestamp held by a `$date` wrapper.
#[must_use]
pub fn as_date(value: &Value) -> Option<DateTime<Utc>> {
    match value.as_object()?.get("$date")? {
        Value::String(s) => parse_datetime(s),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        Value::Object(inner) => inner
            .get("$numberLong")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// Numeric view of a value, unwrapping Extended-JSON numbers.
#[must_use]
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Object(obj) if obj.len() == 1 => obj
            .get("$numberLong")
            .or_else(|| obj.get("$numberInt"))
            .or_else(|| obj.get("$numberDouble"))
            .or_else(|| obj.get("$numberDecimal"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok()),
        _ => None,
    }
}

/// Builds a JSON number, preferring an integer when the value is integral.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        return Value::Number(Number::from(f as i64));
    }
    Number::from_f64(f).map_or(Value::Null, Value::Number)
}

/// Resolves a dotted path. Numeric segments index into arrays.
#[must_use]
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(obj) => obj.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Sets a dotted path, creating intermediate objects.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                set_path(child, rest, value);
            }
        }
    }
}

/// Removes a dotted path if present.
pub fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = doc.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

/// Compares two values of compatible types.
///
/// Returns `None` when the types are not comparable (range operators then
/// do not match). A string compared with a `$date` is coerced to a date.
#[must_use]
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x.partial_cmp(&y);
    }
    let date_a = as_date(a);
    let date_b = as_date(b);
    if date_a.is_some() || date_b.is_some() {
        let x = date_a.or_else(|| a.as_str().and_then(parse_datetime))?;
        let y = date_b.or_else(|| b.as_str().and_then(parse_datetime))?;
        return Some(x.cmp(&y));
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Equality with numeric and date coercion; structural otherwise.
#[must_use]
pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare(a, b).map_or_else(|| a == b, Ordering::is_eq)
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(v) if as_date(v).is_some() => 6,
        Some(v) if as_f64(v).is_some() => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
        Some(Value::Number(_)) => 1,
    }
}

/// Total order used for sorting: null < numbers < strings < objects <
/// arrays < booleans < dates.
#[must_use]
pub fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Some(x), Some(y)) => compare(x, y).unwrap_or_else(|| x.to_string().cmp(&y.to_string())),
        _ => Ordering::Equal,
    }
}

/// Flattens Extended-JSON wrappers into plain JSON: identifiers become their
/// hex string, dates become RFC 3339 strings, wrapped numbers become numbers.
#[must_use]
pub fn normalize(value: Value) -> Value {
    match wrapper_kind(&value) {
        Some(Wrapper::ObjectId) => value
            .get("$oid")
            .cloned()
            .map_or(Value::Null, |v| match v {
                Value::String(_) => v,
                other => Value::String(other.to_string()),
            }),
        Some(Wrapper::Date) => as_date(&value).map_or(Value::Null, |dt| {
            Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        }),
        Some(Wrapper::Number) => as_f64(&value).map_or(Value::Null, number),
        None => match value {
            Value::Object(obj) => {
                Value::Object(obj.into_iter().map(|(k, v)| (k, normalize(v))).collect())
            }
            Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
            other => other,
        },
    }
}
