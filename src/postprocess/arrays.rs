//! Array-entry construction and trace filtering.
//!
//! Array entries build output arrays the AI never emits directly: repeating
//! entries turn side-channel row extractions into N objects, static entries
//! assemble fixed objects from hardcoded and side-channel values, optionally
//! behind a boolean gate. Rows and fields that coerce to nothing are dropped
//! rather than delivered empty.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::ProcessError;
use crate::postprocess::coerce::{
    canonical_boolean, coerce_entry_value, is_empty_or_sentinel, is_empty_value, value_to_string,
};
use crate::postprocess::path::FieldPath;
use crate::template::{ArrayEntryConfig, EntryField, FieldSource};

/// Arrays under this key hold trace entries subject to identity filtering.
const TRACE_ARRAY_KEY: &str = "traceNumbers";
/// The identifying field of one trace entry.
const TRACE_ID_KEY: &str = "traceNumber";

/// Run every enabled array-entry config against the primary structure.
///
/// Repeating entries run first so a populated array can suppress static
/// entries aimed at the same target. The side channel is consulted for rows,
/// extracted fields, and gate verdicts; keys belonging to a gated-out entry
/// are removed from it.
pub fn construct_arrays(
    primary: &mut Value,
    side: &mut Map<String, Value>,
    entries: &[ArrayEntryConfig],
    now: DateTime<Utc>,
) -> Result<(), ProcessError> {
    let enabled: Vec<&ArrayEntryConfig> = entries.iter().filter(|e| e.enabled).collect();

    let mut populated_by_repeating: Vec<String> = Vec::new();
    for entry in enabled.iter().filter(|e| e.repeating) {
        if apply_repeating(primary, side, entry, now)? {
            populated_by_repeating.push(entry.target_array.clone());
        }
    }

    // Static entries grouped per target array, in declaration order of the
    // arrays themselves.
    let mut groups: Vec<(String, Vec<&ArrayEntryConfig>)> = Vec::new();
    for entry in enabled.iter().filter(|e| !e.repeating) {
        match groups.iter_mut().find(|(a, _)| a == &entry.target_array) {
            Some((_, members)) => members.push(entry),
            None => groups.push((entry.target_array.clone(), vec![entry])),
        }
    }

    for (array, mut members) in groups {
        if populated_by_repeating.contains(&array) {
            // Prune the side channel the same way a gated-out entry would be.
            for member in &members {
                remove_entry_keys(side, member);
            }
            continue;
        }
        members.sort_by_key(|e| e.order);

        let mut objects = Vec::new();
        for entry in members {
            if !gate_is_met(side, entry) {
                remove_entry_keys(side, entry);
                continue;
            }
            let row = build_row(&entry.fields, now, |field| {
                side.get(&entry.field_key(&field.name)).cloned()
            });
            if !row_is_empty(&row) {
                objects.push(Value::Object(row));
            }
        }
        if !objects.is_empty() {
            FieldPath::parse(&array)?.inject_first(primary, Value::Array(objects));
        }
    }

    Ok(())
}

/// Returns true when the entry populated its target array with at least one
/// row.
fn apply_repeating(
    primary: &mut Value,
    side: &Map<String, Value>,
    entry: &ArrayEntryConfig,
    now: DateTime<Utc>,
) -> Result<bool, ProcessError> {
    let rows = side
        .get(&entry.target_array)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut survivors = Vec::new();
    for raw_row in rows {
        let row = build_row(&entry.fields, now, |field| {
            raw_row.get(&field.name).cloned()
        });
        if !row_is_empty(&row) {
            survivors.push(Value::Object(row));
        }
    }

    let path = FieldPath::parse(&entry.target_array)?;
    if survivors.is_empty() {
        path.for_each_terminal(primary, &mut |map, key| {
            map.remove(key);
        });
        Ok(false)
    } else {
        path.inject_first(primary, Value::Array(survivors));
        Ok(true)
    }
}

/// An entry with no gate always runs; a declared gate runs only on a truthy
/// side-channel verdict.
fn gate_is_met(side: &Map<String, Value>, entry: &ArrayEntryConfig) -> bool {
    if entry.condition.is_none() {
        return true;
    }
    side.get(&entry.condition_key())
        .is_some_and(|v| canonical_boolean(Some(v)) == "True")
}

fn remove_entry_keys(side: &mut Map<String, Value>, entry: &ArrayEntryConfig) {
    let prefix = format!("{}.{}.", entry.target_array, entry.order);
    side.retain(|k, _| !k.starts_with(&prefix));
}

/// Assemble one output object from an entry's declared fields. Undeclared
/// keys in the source row never carry over.
fn build_row<F>(fields: &[EntryField], now: DateTime<Utc>, mut resolve: F) -> Map<String, Value>
where
    F: FnMut(&EntryField) -> Option<Value>,
{
    let mut row = Map::new();
    for field in fields {
        let source_value = match &field.source {
            FieldSource::Hardcoded { value } => Some(Value::String(value.clone())),
            _ => resolve(field),
        };
        let coerced = coerce_entry_value(
            source_value.as_ref(),
            field.data_type,
            field.source.hardcoded_value(),
            now,
        );
        if field.remove_if_empty && is_empty_value(&coerced) {
            continue;
        }
        row.insert(field.name.clone(), coerced);
    }
    row
}

fn row_is_empty(row: &Map<String, Value>) -> bool {
    row.values().all(is_empty_value)
}

/// Drop trace entries whose identifying value is empty or a sentinel,
/// wherever a trace array appears in the structure.
pub fn filter_trace_entries(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get_mut(TRACE_ARRAY_KEY) {
                items.retain(|item| match item {
                    Value::Object(entry) => entry
                        .get(TRACE_ID_KEY)
                        .is_some_and(|v| !is_empty_or_sentinel(&value_to_string(v))),
                    Value::String(s) => !is_empty_or_sentinel(s),
                    _ => true,
                });
            }
            for (_, child) in map.iter_mut() {
                filter_trace_entries(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                filter_trace_entries(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::DataType;
    use serde_json::json;

    fn extracted(name: &str, data_type: DataType) -> EntryField {
        EntryField {
            name: name.into(),
            source: FieldSource::Extracted {
                instruction: name.into(),
            },
            data_type,
            remove_if_empty: false,
        }
    }

    fn hardcoded(name: &str, value: &str) -> EntryField {
        EntryField {
            name: name.into(),
            source: FieldSource::Hardcoded {
                value: value.into(),
            },
            data_type: DataType::String,
            remove_if_empty: false,
        }
    }

    fn repeating_entry(array: &str, fields: Vec<EntryField>) -> ArrayEntryConfig {
        ArrayEntryConfig {
            target_array: array.into(),
            order: 1,
            enabled: true,
            repeating: true,
            repeat_instruction: Some("one row per line item".into()),
            condition: None,
            fields,
        }
    }

    fn static_entry(array: &str, order: u32, fields: Vec<EntryField>) -> ArrayEntryConfig {
        ArrayEntryConfig {
            target_array: array.into(),
            order,
            enabled: true,
            repeating: false,
            repeat_instruction: None,
            condition: None,
            fields,
        }
    }

    fn side_of(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("side channel must be an object"),
        }
    }

    // ── Repeating entries ───────────────────────────────────────────

    #[test]
    fn repeating_rows_carry_hardcoded_and_extracted_values() {
        let mut primary = json!({"items": []});
        let mut side = side_of(json!({
            "items": [
                {"description": "skids", "weight": "120.5"},
                {"description": "crate", "weight": "80"},
                {"description": "drum", "weight": "15"},
            ]
        }));
        let entry = repeating_entry(
            "items",
            vec![
                hardcoded("uom", "LBS"),
                extracted("description", DataType::String),
                extracted("weight", DataType::Number),
            ],
        );
        construct_arrays(&mut primary, &mut side, &[entry], Utc::now()).unwrap();

        let items = primary["items"].as_array().unwrap();
        assert_eq!(items.len(), 3);
        for item in items {
            assert_eq!(item["uom"], "LBS");
        }
        assert_eq!(items[0]["description"], "SKIDS");
        assert_eq!(items[0]["weight"], 120.5);
        assert_eq!(items[2]["weight"], 15.0);
    }

    #[test]
    fn zero_valued_numeric_row_is_not_empty() {
        // Unparseable numbers default to 0, and 0 is a value: the row stays.
        let mut primary = json!({"items": []});
        let mut side = side_of(json!({
            "items": [{"weight": "n/a", "pieces": ""}]
        }));
        let entry = repeating_entry(
            "items",
            vec![
                extracted("weight", DataType::Number),
                extracted("pieces", DataType::Integer),
            ],
        );
        construct_arrays(&mut primary, &mut side, &[entry], Utc::now()).unwrap();

        let items = primary["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["weight"], 0.0);
        assert_eq!(items[0]["pieces"], 0);
    }

    #[test]
    fn repeating_with_no_surviving_rows_deletes_the_field() {
        // Sentinels were already blanked by the repair pass upstream.
        let mut primary = json!({"items": [{"placeholder": true}]});
        let mut side = side_of(json!({
            "items": [{"description": ""}, {"description": "   "}]
        }));
        let entry = repeating_entry("items", vec![extracted("description", DataType::String)]);
        construct_arrays(&mut primary, &mut side, &[entry], Utc::now()).unwrap();
        assert!(primary.get("items").is_none());
    }

    #[test]
    fn remove_if_empty_drops_the_field_from_its_row() {
        let mut primary = json!({});
        let mut side = side_of(json!({
            "items": [{"description": "crate", "notes": ""}]
        }));
        let mut notes = extracted("notes", DataType::String);
        notes.remove_if_empty = true;
        let entry = repeating_entry(
            "items",
            vec![extracted("description", DataType::String), notes],
        );
        construct_arrays(&mut primary, &mut side, &[entry], Utc::now()).unwrap();

        let row = &primary["items"][0];
        assert_eq!(row["description"], "CRATE");
        assert!(row.get("notes").is_none());
    }

    // ── Static entries and gates ────────────────────────────────────

    #[test]
    fn static_entries_sort_by_order_within_their_array() {
        let mut primary = json!({});
        let mut side = side_of(json!({}));
        let entries = vec![
            static_entry("charges", 2, vec![hardcoded("code", "FUEL")]),
            static_entry("charges", 1, vec![hardcoded("code", "BASE")]),
        ];
        construct_arrays(&mut primary, &mut side, &entries, Utc::now()).unwrap();

        let charges = primary["charges"].as_array().unwrap();
        assert_eq!(charges[0]["code"], "BASE");
        assert_eq!(charges[1]["code"], "FUEL");
    }

    #[test]
    fn met_gate_builds_from_side_channel_fields() {
        let mut primary = json!({});
        let mut side = side_of(json!({
            "charges.1.condition": "yes",
            "charges.1.amount": "45.20",
        }));
        let mut entry = static_entry(
            "charges",
            1,
            vec![
                hardcoded("code", "FUEL"),
                extracted("amount", DataType::Number),
            ],
        );
        entry.condition = Some("is a fuel surcharge listed".into());
        construct_arrays(&mut primary, &mut side, &[entry], Utc::now()).unwrap();

        let charges = primary["charges"].as_array().unwrap();
        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0]["code"], "FUEL");
        assert_eq!(charges[0]["amount"], 45.2);
    }

    #[test]
    fn unmet_gate_contributes_nothing_and_prunes_side_keys() {
        let mut primary = json!({});
        let mut side = side_of(json!({
            "charges.1.condition": "no",
            "charges.1.amount": "45.20",
            "items": [{"description": "crate"}],
        }));
        let mut gated = static_entry("charges", 1, vec![extracted("amount", DataType::Number)]);
        gated.condition = Some("is a fuel surcharge listed".into());
        let sibling = repeating_entry("items", vec![extracted("description", DataType::String)]);

        construct_arrays(&mut primary, &mut side, &[gated, sibling], Utc::now()).unwrap();

        assert!(primary.get("charges").is_none());
        assert!(side.get("charges.1.condition").is_none());
        assert!(side.get("charges.1.amount").is_none());
        // The sibling repeating entry on a different array still ran.
        assert_eq!(primary["items"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn missing_gate_verdict_counts_as_unmet() {
        let mut primary = json!({});
        let mut side = side_of(json!({"charges.1.amount": "45.20"}));
        let mut entry = static_entry("charges", 1, vec![extracted("amount", DataType::Number)]);
        entry.condition = Some("is a fuel surcharge listed".into());
        construct_arrays(&mut primary, &mut side, &[entry], Utc::now()).unwrap();
        assert!(primary.get("charges").is_none());
    }

    #[test]
    fn all_empty_static_entry_is_not_emitted() {
        let mut primary = json!({});
        let mut side = side_of(json!({"charges.1.amount": ""}));
        let entry = static_entry("charges", 1, vec![extracted("amount", DataType::String)]);
        construct_arrays(&mut primary, &mut side, &[entry], Utc::now()).unwrap();
        assert!(primary.get("charges").is_none());
    }

    #[test]
    fn successful_repeating_entry_suppresses_statics_on_same_array() {
        let mut primary = json!({});
        let mut side = side_of(json!({
            "items": [{"description": "crate"}],
            "items.1.filler": "SHOULD NOT APPEAR",
        }));
        let repeating = repeating_entry("items", vec![extracted("description", DataType::String)]);
        let suppressed = static_entry("items", 1, vec![hardcoded("filler", "X")]);

        construct_arrays(&mut primary, &mut side, &[repeating, suppressed], Utc::now()).unwrap();

        let items = primary["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["description"], "CRATE");
        assert!(side.get("items.1.filler").is_none());
    }

    #[test]
    fn disabled_entries_are_ignored() {
        let mut primary = json!({});
        let mut side = side_of(json!({}));
        let mut entry = static_entry("charges", 1, vec![hardcoded("code", "BASE")]);
        entry.enabled = false;
        construct_arrays(&mut primary, &mut side, &[entry], Utc::now()).unwrap();
        assert!(primary.get("charges").is_none());
    }

    // ── Trace filtering ─────────────────────────────────────────────

    #[test]
    fn trace_entries_without_identity_are_dropped() {
        let mut doc = json!({
            "shipment": {
                "traceNumbers": [
                    {"traceNumber": "PRO-445", "kind": "pro"},
                    {"traceNumber": "", "kind": "bol"},
                    {"traceNumber": "N/A", "kind": "po"},
                    {"kind": "orphan"},
                ]
            }
        });
        filter_trace_entries(&mut doc);
        let traces = doc["shipment"]["traceNumbers"].as_array().unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0]["traceNumber"], "PRO-445");
    }
}
