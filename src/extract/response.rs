//! Raw model-response parsing.
//!
//! The model tends to wrap its output in fenced code blocks and sometimes
//! skips the requested wrapper object. Both are repaired here, before any
//! field-level processing: fences are stripped, then a staged parse decides
//! wrapper vs bare shape. Only an unparseable response is a hard failure.

use serde_json::{Map, Value};

use crate::error::ProcessError;

/// Wrapper key carrying the primary structure.
pub const WRAPPER_PRIMARY_KEY: &str = "templateData";
/// Wrapper key carrying the side-channel values.
pub const WRAPPER_SIDE_KEY: &str = "workflowOnlyData";

/// Outcome of the staged parse. `Wrapper` and `Bare` normalize to the same
/// `(primary, side)` pair downstream.
#[derive(Debug)]
pub enum ParsedResponse {
    Wrapper {
        primary: Value,
        side: Map<String, Value>,
    },
    Bare {
        primary: Value,
    },
    Unparseable {
        reason: String,
    },
}

impl ParsedResponse {
    /// Collapse to the `(primary, side)` pair, or the failure reason.
    pub fn into_parts(self) -> Result<(Value, Map<String, Value>), ProcessError> {
        match self {
            ParsedResponse::Wrapper { primary, side } => Ok((primary, side)),
            ParsedResponse::Bare { primary } => Ok((primary, Map::new())),
            ParsedResponse::Unparseable { reason } => Err(ProcessError::Format {
                format: "json".into(),
                reason,
            }),
        }
    }
}

/// Strip markdown code fences from model output (handles ```json, ```xml,
/// and bare ``` blocks, with or without surrounding prose).
pub fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();

    // Already bare structured output
    if trimmed.starts_with('{') || trimmed.starts_with('[') || trimmed.starts_with('<') {
        return trimmed;
    }

    for marker in ["```json", "```xml", "```"] {
        if let Some(start) = trimmed.find(marker) {
            let after = &trimmed[start + marker.len()..];
            if let Some(end) = after.find("```") {
                return after[..end].trim();
            }
        }
    }

    trimmed
}

/// Parse a JSON-family response. When a wrapper was requested and the
/// response carries one, split it; a missing wrapper degrades silently to a
/// bare primary with an empty side channel.
pub fn parse_json_response(raw: &str, expect_wrapper: bool) -> ParsedResponse {
    let stripped = strip_fences(raw);
    let value: Value = match serde_json::from_str(stripped) {
        Ok(v) => v,
        Err(e) => {
            return ParsedResponse::Unparseable {
                reason: format!("not valid JSON: {e}"),
            };
        }
    };

    if expect_wrapper && value.get(WRAPPER_PRIMARY_KEY).is_some() {
        match value {
            Value::Object(mut map) => {
                let primary = map.remove(WRAPPER_PRIMARY_KEY).unwrap_or(Value::Null);
                let side = match map.remove(WRAPPER_SIDE_KEY) {
                    Some(Value::Object(side)) => side,
                    _ => Map::new(),
                };
                ParsedResponse::Wrapper { primary, side }
            }
            other => ParsedResponse::Bare { primary: other },
        }
    } else {
        ParsedResponse::Bare { primary: value }
    }
}

/// Validate an XML-family response: after fence stripping it must begin with
/// `<` and end with `>`. Returns the stripped markup.
pub fn validate_xml(raw: &str) -> Result<String, ProcessError> {
    let stripped = strip_fences(raw);
    if stripped.len() >= 2 && stripped.starts_with('<') && stripped.ends_with('>') {
        Ok(stripped.to_string())
    } else {
        Err(ProcessError::InvalidXml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_object_passes_through_fence_strip() {
        assert_eq!(strip_fences("  {\"a\": 1}  "), "{\"a\": 1}");
    }

    #[test]
    fn json_fence_with_prose_is_stripped() {
        let raw = "Here is the extraction:\n```json\n{\"a\": 1}\n```\nLet me know!";
        assert_eq!(strip_fences(raw), "{\"a\": 1}");
    }

    #[test]
    fn anonymous_fence_is_stripped() {
        let raw = "```\n<shipment></shipment>\n```";
        assert_eq!(strip_fences(raw), "<shipment></shipment>");
    }

    #[test]
    fn wrapper_response_splits_into_primary_and_side() {
        let raw = r#"{"templateData": {"shipper": "ACME"}, "workflowOnlyData": {"ref": "A1"}}"#;
        match parse_json_response(raw, true) {
            ParsedResponse::Wrapper { primary, side } => {
                assert_eq!(primary["shipper"], "ACME");
                assert_eq!(side["ref"], "A1");
            }
            other => panic!("expected Wrapper, got {other:?}"),
        }
    }

    #[test]
    fn missing_wrapper_degrades_to_bare() {
        let raw = r#"{"shipper": "ACME"}"#;
        match parse_json_response(raw, true) {
            ParsedResponse::Bare { primary } => assert_eq!(primary["shipper"], "ACME"),
            other => panic!("expected Bare, got {other:?}"),
        }
    }

    #[test]
    fn unrequested_wrapper_stays_whole() {
        let raw = r#"{"templateData": {"shipper": "ACME"}}"#;
        match parse_json_response(raw, false) {
            ParsedResponse::Bare { primary } => {
                assert_eq!(primary["templateData"]["shipper"], "ACME");
            }
            other => panic!("expected Bare, got {other:?}"),
        }
    }

    #[test]
    fn wrapper_with_non_object_side_gets_empty_side() {
        let raw = r#"{"templateData": {}, "workflowOnlyData": null}"#;
        match parse_json_response(raw, true) {
            ParsedResponse::Wrapper { side, .. } => assert!(side.is_empty()),
            other => panic!("expected Wrapper, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_unparseable() {
        match parse_json_response("sorry, I could not read the document", true) {
            ParsedResponse::Unparseable { reason } => {
                assert!(reason.contains("not valid JSON"));
            }
            other => panic!("expected Unparseable, got {other:?}"),
        }
    }

    #[test]
    fn into_parts_fills_empty_side_for_bare() {
        let (primary, side) = parse_json_response(r#"{"a": 1}"#, false)
            .into_parts()
            .unwrap();
        assert_eq!(primary, json!({"a": 1}));
        assert!(side.is_empty());
    }

    #[test]
    fn fenced_xml_validates() {
        let raw = "```xml\n<shipment><id>7</id></shipment>\n```";
        let markup = validate_xml(raw).unwrap();
        assert!(markup.starts_with("<shipment>"));
        assert!(markup.ends_with("</shipment>"));
    }

    #[test]
    fn truncated_xml_is_rejected_with_format_reason() {
        let err = validate_xml("<shipment><id>7</id").unwrap_err();
        assert_eq!(err.to_string(), "invalid XML format");
    }
}
