//! Per-type value coercion applied after extraction.
//!
//! Field mappings and array-entry fields declare a data type; the passes in
//! this module rewrite the AI's raw values into the canonical forms partners
//! expect. Length limits are enforced against the JSON-escaped form of a
//! string, since that is how the value is later embedded in a payload.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::template::{DataType, FieldMapping};

/// Sentinel strings the AI emits for "nothing found". The repair pass blanks
/// exact occurrences; emptiness checks treat them as empty wherever they
/// survive.
pub const SENTINELS: [&str; 3] = ["N/A", "n/a", "null"];

/// Timestamp shape substituted into empty datetime fields.
pub const DATETIME_FALLBACK_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Exact sentinel match, as the repair pass uses.
pub fn is_sentinel_literal(s: &str) -> bool {
    SENTINELS.contains(&s)
}

/// Empty after trimming, or a sentinel.
pub fn is_empty_or_sentinel(s: &str) -> bool {
    let t = s.trim();
    t.is_empty() || SENTINELS.contains(&t)
}

/// Scalar rendering used before token-level coercion. Null renders empty.
pub fn value_to_string(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Null or blank string. Numbers are never empty; zero is a value.
pub fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Canonical boolean token. The truthy lexicon is closed; anything else,
/// absent and empty included, is "False".
pub fn canonical_boolean(v: Option<&Value>) -> &'static str {
    let token = v.map(value_to_string).unwrap_or_default();
    match token.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => "True",
        _ => "False",
    }
}

/// `XXX-XXX-XXXX` from 10 digits, or 11 with a leading country `1`.
/// Anything else collapses to empty.
pub fn format_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let national = match digits.len() {
        10 => digits.as_str(),
        11 if digits.starts_with('1') => &digits[1..],
        _ => return String::new(),
    };
    format!("{}-{}-{}", &national[..3], &national[3..6], &national[6..10])
}

fn escaped_char_len(c: char) -> usize {
    match c {
        '"' | '\\' | '\n' | '\r' | '\t' | '\u{8}' | '\u{c}' => 2,
        c if (c as u32) < 0x20 => 6,
        _ => 1,
    }
}

/// Length of `s` as it would appear inside a JSON string literal.
pub fn escaped_len(s: &str) -> usize {
    s.chars().map(escaped_char_len).sum()
}

/// Longest prefix of `s` whose escaped length fits in `max`. Never splits a
/// character.
pub fn truncate_escaped(s: &str, max: usize) -> String {
    let mut used = 0;
    let mut out = String::new();
    for c in s.chars() {
        let w = escaped_char_len(c);
        if used + w > max {
            break;
        }
        used += w;
        out.push(c);
    }
    out
}

/// Timestamp substituted into empty datetime fields with no hardcoded
/// fallback.
pub fn fallback_timestamp(now: DateTime<Utc>) -> String {
    now.format(DATETIME_FALLBACK_FORMAT).to_string()
}

/// Apply one field mapping's coercion, length limit, and removal flag to the
/// slot `key` of `map`. Called once per terminal the mapping's path fans out
/// to.
pub fn apply_mapping_to_slot(
    map: &mut Map<String, Value>,
    key: &str,
    mapping: &FieldMapping,
    now: DateTime<Utc>,
) {
    match mapping.data_type {
        DataType::String => {
            if let Some(Value::String(s)) = map.get(key)
                && !s.is_empty()
            {
                let upper = s.to_uppercase();
                map.insert(key.to_string(), Value::String(upper));
            }
        }
        DataType::Boolean => {
            let token = canonical_boolean(map.get(key));
            map.insert(key.to_string(), Value::String(token.to_string()));
        }
        DataType::Phone => {
            if let Some(v) = map.get(key) {
                let formatted = format_phone(&value_to_string(v));
                map.insert(key.to_string(), Value::String(formatted));
            }
        }
        DataType::DateTime => {
            let current = map.get(key).map(value_to_string).unwrap_or_default();
            if is_empty_or_sentinel(&current) {
                let fallback = mapping
                    .source
                    .hardcoded_value()
                    .map(str::to_string)
                    .unwrap_or_else(|| fallback_timestamp(now));
                map.insert(key.to_string(), Value::String(fallback));
            }
        }
        // Numbers pass through; postal codes are rewritten structurally by
        // the postal pass.
        DataType::Number | DataType::Integer | DataType::PostalCode => {}
    }

    if let Some(max) = mapping.max_length
        && let Some(Value::String(s)) = map.get(key)
        && escaped_len(s) > max
    {
        let truncated = truncate_escaped(s, max);
        map.insert(key.to_string(), Value::String(truncated));
    }

    if mapping.remove_if_empty && map.get(key).is_none_or(is_empty_value) {
        map.remove(key);
    }
}

/// Coerce one array-entry field value by its declared type. Absent values
/// come through as `None` and coerce the same way empty ones do.
pub fn coerce_entry_value(
    value: Option<&Value>,
    data_type: DataType,
    hardcoded: Option<&str>,
    now: DateTime<Utc>,
) -> Value {
    match data_type {
        DataType::String | DataType::PostalCode => {
            let s = value.map(value_to_string).unwrap_or_default();
            Value::String(s.to_uppercase())
        }
        DataType::Number => {
            let n = value
                .map(value_to_string)
                .and_then(|s| s.trim().parse::<f64>().ok())
                .unwrap_or(0.0);
            serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or_else(|| Value::from(0))
        }
        DataType::Integer => {
            let raw = value.map(value_to_string).unwrap_or_default();
            let n = raw
                .trim()
                .parse::<i64>()
                .ok()
                .or_else(|| raw.trim().parse::<f64>().ok().map(|f| f as i64))
                .unwrap_or(0);
            Value::from(n)
        }
        DataType::Boolean => Value::String(canonical_boolean(value).to_string()),
        DataType::Phone => {
            let s = value.map(value_to_string).unwrap_or_default();
            Value::String(format_phone(&s))
        }
        DataType::DateTime => {
            let s = value.map(value_to_string).unwrap_or_default();
            if is_empty_or_sentinel(&s) {
                let fallback = hardcoded
                    .map(str::to_string)
                    .unwrap_or_else(|| fallback_timestamp(now));
                Value::String(fallback)
            } else {
                Value::String(s)
            }
        }
    }
}
