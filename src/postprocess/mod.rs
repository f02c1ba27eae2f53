//! Extraction result processing.
//!
//! Takes the raw model response for one attachment and produces the
//! delivery-ready output: parse and split (wrapper vs bare), sentinel
//! repair, the field-mapping coercion pass, structural postal formatting,
//! array-entry construction, and trace filtering, in that order. The XML
//! family skips everything after structural validation; the mapping DSL only
//! applies to JSON output.

pub mod arrays;
pub mod coerce;
pub mod path;
pub mod postal;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::ProcessError;
use crate::extract::response;
use crate::postprocess::path::FieldPath;
use crate::template::{ExtractionTemplate, OutputFormat};

/// Corrected primary output, ready to serialize for delivery.
#[derive(Debug, Clone)]
pub enum ProcessedPayload {
    Json(Value),
    Xml(String),
}

/// Everything the dispatcher needs for one attachment.
#[derive(Debug, Clone)]
pub struct ProcessedOutput {
    pub payload: ProcessedPayload,
    pub side_channel: Map<String, Value>,
}

impl ProcessedOutput {
    /// The primary output as delivery text.
    pub fn serialized(&self) -> String {
        match &self.payload {
            ProcessedPayload::Json(v) => v.to_string(),
            ProcessedPayload::Xml(s) => s.clone(),
        }
    }
}

/// Run the full processing pipeline for one raw model response.
pub fn process_response(
    template: &ExtractionTemplate,
    raw_response: &str,
    now: DateTime<Utc>,
) -> Result<ProcessedOutput, ProcessError> {
    match template.format {
        OutputFormat::Xml => {
            let markup = response::validate_xml(raw_response)?;
            Ok(ProcessedOutput {
                payload: ProcessedPayload::Xml(markup),
                side_channel: Map::new(),
            })
        }
        OutputFormat::Json => process_json(template, raw_response, now),
    }
}

fn process_json(
    template: &ExtractionTemplate,
    raw_response: &str,
    now: DateTime<Utc>,
) -> Result<ProcessedOutput, ProcessError> {
    let parsed = response::parse_json_response(raw_response, template.has_side_channel());
    let (mut primary, mut side) = parsed.into_parts()?;

    repair_sentinels(&mut primary);
    for (_, value) in side.iter_mut() {
        repair_sentinels(value);
    }

    for mapping in template.field_mappings.iter().filter(|m| !m.workflow_only) {
        let field_path = FieldPath::parse(&mapping.path)?;
        field_path.for_each_terminal(&mut primary, &mut |map, key| {
            coerce::apply_mapping_to_slot(map, key, mapping, now);
        });
    }

    postal::apply(&mut primary);
    arrays::construct_arrays(&mut primary, &mut side, &template.array_entries, now)?;
    arrays::filter_trace_entries(&mut primary);

    Ok(ProcessedOutput {
        payload: ProcessedPayload::Json(primary),
        side_channel: side,
    })
}

/// Recursively blank exact sentinel strings the model uses for "nothing
/// found".
pub fn repair_sentinels(value: &mut Value) {
    match value {
        Value::String(s) => {
            if coerce::is_sentinel_literal(s) {
                s.clear();
            }
        }
        Value::Array(items) => {
            for item in items {
                repair_sentinels(item);
            }
        }
        Value::Object(map) => {
            for (_, child) in map.iter_mut() {
                repair_sentinels(child);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{
        ArrayEntryConfig, DataType, DeliveryMode, EntryField, FieldMapping, FieldSource,
    };
    use serde_json::json;
    use uuid::Uuid;

    fn template(format: OutputFormat) -> ExtractionTemplate {
        ExtractionTemplate {
            id: Uuid::new_v4(),
            name: "bol-standard".into(),
            format,
            body: "{}".into(),
            field_mappings: vec![],
            array_splits: vec![],
            array_entries: vec![],
            delivery: DeliveryMode::Direct,
            partner_route: None,
            sequence_field: None,
        }
    }

    fn mapping(path: &str, data_type: DataType) -> FieldMapping {
        FieldMapping {
            path: path.into(),
            source: FieldSource::Extracted {
                instruction: path.into(),
            },
            data_type,
            max_length: None,
            workflow_only: false,
            remove_if_empty: false,
        }
    }

    #[test]
    fn xml_family_passes_validation_and_nothing_else() {
        let t = template(OutputFormat::Xml);
        let out = process_response(&t, "```xml\n<shipment><qty>n/a</qty></shipment>\n```", Utc::now())
            .unwrap();
        // No repair pass for markup; it ships as validated.
        assert_eq!(out.serialized(), "<shipment><qty>n/a</qty></shipment>");
        assert!(out.side_channel.is_empty());
    }

    #[test]
    fn truncated_xml_fails_with_format_reason() {
        let t = template(OutputFormat::Xml);
        let err = process_response(&t, "<shipment><qty>3", Utc::now()).unwrap_err();
        assert_eq!(err.to_string(), "invalid XML format");
    }

    #[test]
    fn sentinels_are_blanked_before_coercion() {
        let mut t = template(OutputFormat::Json);
        t.field_mappings.push(mapping("notes", DataType::String));
        let out = process_response(&t, r#"{"notes": "N/A", "keep": "n/a"}"#, Utc::now()).unwrap();
        match out.payload {
            ProcessedPayload::Json(v) => {
                assert_eq!(v["notes"], "");
                assert_eq!(v["keep"], "");
            }
            _ => panic!("expected JSON payload"),
        }
    }

    #[test]
    fn mapping_pass_fans_out_and_postal_pass_follows() {
        let mut t = template(OutputFormat::Json);
        t.field_mappings
            .push(mapping("orders.[].consignee.name", DataType::String));
        let raw = r#"{
            "orders": [
                {"consignee": {"name": "acme east", "postalCode": "h1w1s3", "province": "qc"}},
                {"consignee": {"name": "acme west", "postalCode": "90210-1234", "state": "CA"}}
            ]
        }"#;
        let out = process_response(&t, raw, Utc::now()).unwrap();
        match out.payload {
            ProcessedPayload::Json(v) => {
                assert_eq!(v["orders"][0]["consignee"]["name"], "ACME EAST");
                assert_eq!(v["orders"][1]["consignee"]["name"], "ACME WEST");
                assert_eq!(v["orders"][0]["consignee"]["postalCode"], "H1W 1S3");
                assert_eq!(v["orders"][1]["consignee"]["postalCode"], "90210");
            }
            _ => panic!("expected JSON payload"),
        }
    }

    #[test]
    fn wrapper_feeds_arrays_and_sentinel_rows_drop() {
        let mut t = template(OutputFormat::Json);
        t.array_entries.push(ArrayEntryConfig {
            target_array: "items".into(),
            order: 1,
            enabled: true,
            repeating: true,
            repeat_instruction: Some("one row per line".into()),
            condition: None,
            fields: vec![EntryField {
                name: "description".into(),
                source: FieldSource::Extracted {
                    instruction: "item description".into(),
                },
                data_type: DataType::String,
                remove_if_empty: false,
            }],
        });
        let raw = r#"{
            "templateData": {"items": []},
            "workflowOnlyData": {"items": [
                {"description": "crate"},
                {"description": "N/A"}
            ]}
        }"#;
        let out = process_response(&t, raw, Utc::now()).unwrap();
        match out.payload {
            ProcessedPayload::Json(v) => {
                let items = v["items"].as_array().unwrap();
                assert_eq!(items.len(), 1);
                assert_eq!(items[0]["description"], "CRATE");
            }
            _ => panic!("expected JSON payload"),
        }
    }

    #[test]
    fn workflow_only_mappings_are_not_coerced_in_primary() {
        let mut t = template(OutputFormat::Json);
        let mut wf = mapping("internalRef", DataType::String);
        wf.workflow_only = true;
        t.field_mappings.push(wf);
        let raw = r#"{
            "templateData": {"internalRef": "keep as-is"},
            "workflowOnlyData": {"internalRef": "ref-1"}
        }"#;
        let out = process_response(&t, raw, Utc::now()).unwrap();
        match out.payload {
            ProcessedPayload::Json(v) => assert_eq!(v["internalRef"], "keep as-is"),
            _ => panic!("expected JSON payload"),
        }
        assert_eq!(out.side_channel["internalRef"], "ref-1");
    }

    #[test]
    fn unparseable_json_is_a_hard_error() {
        let t = template(OutputFormat::Json);
        let err = process_response(&t, "the document was blank", Utc::now()).unwrap_err();
        assert!(err.to_string().contains("not parseable as json"));
    }

    #[test]
    fn bare_response_with_side_channel_expected_still_processes() {
        let mut t = template(OutputFormat::Json);
        let mut wf = mapping("ref", DataType::String);
        wf.workflow_only = true;
        t.field_mappings.push(wf);
        t.field_mappings.push(mapping("shipper", DataType::String));
        let out = process_response(&t, r#"{"shipper": "acme"}"#, Utc::now()).unwrap();
        match out.payload {
            ProcessedPayload::Json(v) => assert_eq!(v["shipper"], "ACME"),
            _ => panic!("expected JSON payload"),
        }
        assert!(out.side_channel.is_empty());
    }

    #[test]
    fn trace_filter_runs_last() {
        let t = template(OutputFormat::Json);
        let raw = r#"{"traceNumbers": [{"traceNumber": "null"}, {"traceNumber": "PRO-1"}]}"#;
        let out = process_response(&t, raw, Utc::now()).unwrap();
        match out.payload {
            ProcessedPayload::Json(v) => {
                let traces = v["traceNumbers"].as_array().unwrap();
                assert_eq!(traces.len(), 1);
                assert_eq!(traces[0]["traceNumber"], "PRO-1");
            }
            _ => panic!("expected JSON payload"),
        }
    }

    #[test]
    fn repair_is_recursive_through_arrays_and_objects() {
        let mut v = json!({"a": ["N/A", {"b": "null"}], "c": "fine"});
        repair_sentinels(&mut v);
        assert_eq!(v, json!({"a": ["", {"b": ""}], "c": "fine"}));
    }
}
