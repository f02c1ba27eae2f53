//! Extraction template model.
//!
//! A template describes one document family end to end: the output shape the
//! AI must fill in, how each field is sourced and typed, how arrays are split
//! and constructed after the fact, and where the finished result goes. Rules
//! ([`crate::pipeline::rules`]) bind inbound email to a template; everything
//! downstream of the match is driven by the template alone.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod prompt;

/// Output families a template can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Xml,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Xml => "xml",
        }
    }
}

/// How a completed extraction leaves the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Straight to the partner endpoint (and file archive).
    Direct,
    /// Hand the bundle to the workflow engine and stop there.
    Workflow,
}

/// Where a field's value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldSource {
    /// A fixed literal the AI is told to emit verbatim.
    Hardcoded { value: String },
    /// Free-form extraction guidance for the AI.
    Extracted { instruction: String },
    /// Positional guidance ("top right box", "line 3 of the table").
    Coordinate { instruction: String },
}

impl FieldSource {
    /// The hardcoded literal, if this source is one.
    pub fn hardcoded_value(&self) -> Option<&str> {
        match self {
            FieldSource::Hardcoded { value } => Some(value),
            _ => None,
        }
    }
}

/// Declared type of a field. Drives both the prompt's formatting guidance and
/// the post-extraction coercion pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Number,
    Integer,
    DateTime,
    Phone,
    Boolean,
    PostalCode,
}

/// One field-mapping row: a dot path into the output shape plus sourcing,
/// typing, and cleanup flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Dot path into the primary output. `[]` segments fan out over arrays.
    pub path: String,
    pub source: FieldSource,
    pub data_type: DataType,
    /// Maximum length measured on the JSON-escaped form of the value.
    #[serde(default)]
    pub max_length: Option<usize>,
    /// Excluded from the primary output; requested in the side channel.
    #[serde(default)]
    pub workflow_only: bool,
    /// Delete the key entirely when the final value is empty.
    #[serde(default)]
    pub remove_if_empty: bool,
}

/// How an array-split count translates into output rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    /// One output row per counted unit.
    PerUnit,
    /// Split the document's quantities evenly across the counted rows.
    Distributed,
}

/// Instructs the AI to multiply an output array by a count read off the
/// document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArraySplitConfig {
    pub target_array: String,
    /// Where on the document the count is found.
    pub count_field: String,
    pub strategy: SplitStrategy,
    /// When the count cannot be located, fall back to a single row instead
    /// of failing the extraction.
    #[serde(default)]
    pub default_to_one: bool,
}

/// One field of an array entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryField {
    pub name: String,
    pub source: FieldSource,
    pub data_type: DataType,
    #[serde(default)]
    pub remove_if_empty: bool,
}

/// Configuration for constructing entries of one output array after
/// extraction. Static entries become at most one object each; a repeating
/// entry becomes as many rows as the document yields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayEntryConfig {
    pub target_array: String,
    /// Position among this array's static entries.
    pub order: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub repeating: bool,
    /// For repeating entries: what one row is and how to find all of them.
    #[serde(default)]
    pub repeat_instruction: Option<String>,
    /// Gate question the AI answers true/false; unmet gates drop the entry.
    #[serde(default)]
    pub condition: Option<String>,
    pub fields: Vec<EntryField>,
}

fn default_true() -> bool {
    true
}

impl ArrayEntryConfig {
    /// Side-channel key carrying one field of this entry.
    pub fn field_key(&self, field: &str) -> String {
        format!("{}.{}.{}", self.target_array, self.order, field)
    }

    /// Side-channel key carrying this entry's gate verdict.
    pub fn condition_key(&self) -> String {
        format!("{}.{}.condition", self.target_array, self.order)
    }
}

/// A complete processing template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionTemplate {
    pub id: Uuid,
    pub name: String,
    pub format: OutputFormat,
    /// Literal output shape the AI fills in (a JSON skeleton or XML markup).
    pub body: String,
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub array_splits: Vec<ArraySplitConfig>,
    #[serde(default)]
    pub array_entries: Vec<ArrayEntryConfig>,
    pub delivery: DeliveryMode,
    /// Partner endpoint route for direct delivery, joined to the partner
    /// base URL.
    #[serde(default)]
    pub partner_route: Option<String>,
    /// Dot path where the run's sequence id is injected before direct
    /// delivery.
    #[serde(default)]
    pub sequence_field: Option<String>,
}

impl ExtractionTemplate {
    /// Whether any part of this template requests side-channel data, which
    /// decides if the AI is asked for the two-part wrapper object.
    pub fn has_side_channel(&self) -> bool {
        self.field_mappings.iter().any(|m| m.workflow_only)
            || self.array_entries.iter().any(|e| e.enabled)
    }

    /// Enabled array entries, in declaration order.
    pub fn enabled_entries(&self) -> impl Iterator<Item = &ArrayEntryConfig> {
        self.array_entries.iter().filter(|e| e.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_template() -> ExtractionTemplate {
        ExtractionTemplate {
            id: Uuid::new_v4(),
            name: "bol-standard".into(),
            format: OutputFormat::Json,
            body: "{\"shipper\": \"\"}".into(),
            field_mappings: vec![],
            array_splits: vec![],
            array_entries: vec![],
            delivery: DeliveryMode::Direct,
            partner_route: None,
            sequence_field: None,
        }
    }

    #[test]
    fn side_channel_off_for_plain_template() {
        assert!(!minimal_template().has_side_channel());
    }

    #[test]
    fn workflow_only_mapping_turns_side_channel_on() {
        let mut t = minimal_template();
        t.field_mappings.push(FieldMapping {
            path: "internalRef".into(),
            source: FieldSource::Extracted {
                instruction: "reference number".into(),
            },
            data_type: DataType::String,
            max_length: None,
            workflow_only: true,
            remove_if_empty: false,
        });
        assert!(t.has_side_channel());
    }

    #[test]
    fn disabled_entry_does_not_turn_side_channel_on() {
        let mut t = minimal_template();
        t.array_entries.push(ArrayEntryConfig {
            target_array: "charges".into(),
            order: 1,
            enabled: false,
            repeating: false,
            repeat_instruction: None,
            condition: None,
            fields: vec![],
        });
        assert!(!t.has_side_channel());
    }

    #[test]
    fn entry_keys_follow_array_order_field_scheme() {
        let e = ArrayEntryConfig {
            target_array: "charges".into(),
            order: 2,
            enabled: true,
            repeating: false,
            repeat_instruction: None,
            condition: Some("is a fuel surcharge listed".into()),
            fields: vec![],
        };
        assert_eq!(e.field_key("amount"), "charges.2.amount");
        assert_eq!(e.condition_key(), "charges.2.condition");
    }

    #[test]
    fn template_round_trips_through_json() {
        let mut t = minimal_template();
        t.field_mappings.push(FieldMapping {
            path: "shipper.name".into(),
            source: FieldSource::Hardcoded {
                value: "ACME".into(),
            },
            data_type: DataType::String,
            max_length: Some(30),
            workflow_only: false,
            remove_if_empty: false,
        });
        let json = serde_json::to_string(&t).unwrap();
        let back: ExtractionTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, t.name);
        assert_eq!(back.field_mappings.len(), 1);
        assert_eq!(
            back.field_mappings[0].source.hardcoded_value(),
            Some("ACME")
        );
    }
}
