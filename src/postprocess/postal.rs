//! Structural postal-code normalization.
//!
//! Runs over the whole primary structure, independent of field mappings: any
//! object carrying a `postalCode` beside a `province` or `state` code, and
//! any zone-boundary postal key, gets its code rewritten to the canonical
//! regional form.

use serde_json::Value;

const POSTAL_KEY: &str = "postalCode";
const REGION_KEYS: [&str; 2] = ["province", "state"];
/// Zone boundaries carry postal codes without a sibling region code.
const ZONE_BOUNDARY_KEYS: [&str; 2] = ["fromPostalCode", "toPostalCode"];

/// Canonicalize one postal code. Canadian 6-character alphanumerics group as
/// `"AAA AAA"`; ZIP and ZIP+4 collapse to the first five digits; anything
/// else passes through untouched.
pub fn normalize_postal(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase();
    if cleaned.len() == 6 && cleaned.chars().any(|c| c.is_ascii_alphabetic()) {
        return format!("{} {}", &cleaned[..3], &cleaned[3..]);
    }
    if cleaned.len() >= 5 && cleaned.chars().all(|c| c.is_ascii_digit()) {
        return cleaned[..5].to_string();
    }
    raw.to_string()
}

/// Walk the structure and normalize every qualifying postal field in place.
pub fn apply(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let has_region = REGION_KEYS.iter().any(|k| map.contains_key(*k));
            if has_region
                && let Some(code) = map.get(POSTAL_KEY).and_then(Value::as_str)
            {
                let normalized = normalize_postal(code);
                map.insert(POSTAL_KEY.to_string(), Value::String(normalized));
            }
            for key in ZONE_BOUNDARY_KEYS {
                if let Some(code) = map.get(key).and_then(Value::as_str) {
                    let normalized = normalize_postal(code);
                    map.insert(key.to_string(), Value::String(normalized));
                }
            }
            for (_, child) in map.iter_mut() {
                apply(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                apply(item);
            }
        }
        _ => {}
    }
}
