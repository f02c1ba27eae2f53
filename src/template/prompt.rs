//! Extraction prompt assembly.
//!
//! Renders one instruction document per template for the AI call: the
//! literal output shape plus field sourcing, array split/entry directions,
//! and formatting rules. Mapping instructions only apply to the JSON family;
//! XML templates ship the markup shape and little else.

use crate::template::{
    ArrayEntryConfig, DataType, EntryField, ExtractionTemplate, FieldMapping, FieldSource,
    OutputFormat, SplitStrategy,
};

/// A rendered extraction request.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub text: String,
    /// Whether the model was asked for the `{templateData, workflowOnlyData}`
    /// wrapper instead of the bare template.
    pub wants_wrapper: bool,
}

/// Build the extraction request for one template.
pub fn build_prompt(template: &ExtractionTemplate) -> Prompt {
    let wants_wrapper = template.has_side_channel();
    let mut text = String::with_capacity(2048);

    text.push_str(
        "You are a document data extraction engine. Read the attached PDF and fill in the \
         template below with values taken from the document. Use an empty string for anything \
         the document does not provide.\n\n",
    );
    text.push_str("Template:\n");
    text.push_str(&template.body);
    text.push_str("\n\n");

    if template.format == OutputFormat::Json {
        push_mapping_section(&mut text, template);
        push_split_section(&mut text, template);
        push_entry_sections(&mut text, template);
        if has_postal_field(template) {
            text.push_str(postal_rules_block());
        }
    }

    push_output_contract(&mut text, template, wants_wrapper);

    Prompt {
        text,
        wants_wrapper,
    }
}

// ── Sections ────────────────────────────────────────────────────────

fn push_mapping_section(text: &mut String, template: &ExtractionTemplate) {
    let mappings: Vec<&FieldMapping> = template
        .field_mappings
        .iter()
        .filter(|m| !m.workflow_only)
        .collect();
    if !mappings.is_empty() {
        text.push_str("Field instructions:\n");
        for mapping in mappings {
            text.push_str(&format!(
                "- \"{}\": {}. Format: {}.\n",
                mapping.path,
                describe_source(&mapping.source),
                data_type_rule(mapping.data_type)
            ));
        }
        text.push('\n');
    }

    let workflow_only: Vec<&FieldMapping> = template
        .field_mappings
        .iter()
        .filter(|m| m.workflow_only)
        .collect();
    if !workflow_only.is_empty() {
        text.push_str(
            "Additional values, NOT part of the template: extract each of the following and \
             place it in the separate workflowOnlyData object under the key shown. Never put \
             these inside the template itself.\n",
        );
        for mapping in workflow_only {
            text.push_str(&format!(
                "- \"{}\": {}. Format: {}.\n",
                mapping.path,
                describe_source(&mapping.source),
                data_type_rule(mapping.data_type)
            ));
        }
        text.push('\n');
    }
}

fn push_split_section(text: &mut String, template: &ExtractionTemplate) {
    for split in &template.array_splits {
        let strategy = match split.strategy {
            SplitStrategy::PerUnit => "create one entry per counted unit",
            SplitStrategy::Distributed => {
                "distribute the document's quantities evenly across the entries"
            }
        };
        text.push_str(&format!(
            "The array \"{}\" must contain exactly as many entries as the count given by {}; {}.",
            split.target_array, split.count_field, strategy
        ));
        if split.default_to_one {
            text.push_str(" If the count is missing or zero, produce exactly one entry.");
        }
        text.push_str("\n\n");
    }
}

fn push_entry_sections(text: &mut String, template: &ExtractionTemplate) {
    let enabled: Vec<&ArrayEntryConfig> = template.enabled_entries().collect();
    if enabled.is_empty() {
        return;
    }

    let unconditional: Vec<&&ArrayEntryConfig> = enabled
        .iter()
        .filter(|e| !e.repeating && e.condition.is_none())
        .collect();
    if !unconditional.is_empty() {
        text.push_str(
            "Fixed values to extract into workflowOnlyData, one key per value as shown:\n",
        );
        for entry in &unconditional {
            push_entry_fields(text, entry);
        }
        text.push('\n');
    }

    let gated: Vec<&&ArrayEntryConfig> = enabled
        .iter()
        .filter(|e| !e.repeating && e.condition.is_some())
        .collect();
    for entry in gated {
        let condition = entry.condition.as_deref().unwrap_or_default();
        text.push_str(&format!(
            "Answer this question about the document: {}. Put \"true\" or \"false\" in \
             workflowOnlyData under the key \"{}\".",
            condition,
            entry.condition_key()
        ));
        text.push_str(" Only if the answer is true, also extract:\n");
        push_entry_fields(text, entry);
        text.push('\n');
    }

    for entry in enabled.iter().filter(|e| e.repeating) {
        let what = entry
            .repeat_instruction
            .as_deref()
            .unwrap_or("every matching row in the document");
        text.push_str(&format!(
            "Extract {} as an array of objects in workflowOnlyData under the key \"{}\". \
             Each object has these fields:\n",
            what, entry.target_array
        ));
        for field in &entry.fields {
            text.push_str(&format!(
                "- \"{}\": {}. Format: {}.\n",
                field.name,
                describe_entry_source(field),
                data_type_rule(field.data_type)
            ));
        }
        text.push('\n');
    }
}

fn push_entry_fields(text: &mut String, entry: &ArrayEntryConfig) {
    for field in &entry.fields {
        text.push_str(&format!(
            "- \"{}\": {}. Format: {}.\n",
            entry.field_key(&field.name),
            describe_entry_source(field),
            data_type_rule(field.data_type)
        ));
    }
}

fn push_output_contract(text: &mut String, template: &ExtractionTemplate, wants_wrapper: bool) {
    match (template.format, wants_wrapper) {
        (OutputFormat::Json, true) => text.push_str(
            "Respond with ONLY a single JSON object of the form \
             {\"templateData\": <the completed template>, \"workflowOnlyData\": \
             <the additional values>}. No commentary, no code fences.",
        ),
        (OutputFormat::Json, false) => text.push_str(
            "Respond with ONLY the completed template as a single JSON document. \
             No commentary, no code fences.",
        ),
        (OutputFormat::Xml, _) => text.push_str(
            "Respond with ONLY the completed XML document. No commentary, no code fences.",
        ),
    }
}

// ── Wording helpers ─────────────────────────────────────────────────

fn describe_source(source: &FieldSource) -> String {
    match source {
        FieldSource::Hardcoded { value } => {
            format!("always output exactly \"{value}\", regardless of the document")
        }
        FieldSource::Extracted { instruction } => instruction.clone(),
        FieldSource::Coordinate { instruction } => {
            format!("read the value located at {instruction}")
        }
    }
}

fn describe_entry_source(field: &EntryField) -> String {
    describe_source(&field.source)
}

fn data_type_rule(data_type: DataType) -> &'static str {
    match data_type {
        DataType::String => "plain text",
        DataType::Number => "a decimal number",
        DataType::Integer => "a whole number",
        DataType::DateTime => "a timestamp written yyyy-MM-ddThh:mm:ss",
        DataType::Phone => "a phone number written XXX-XXX-XXXX",
        DataType::Boolean => "the token \"True\" or \"False\"",
        DataType::PostalCode => "a postal or ZIP code",
    }
}

fn has_postal_field(template: &ExtractionTemplate) -> bool {
    template
        .field_mappings
        .iter()
        .any(|m| m.data_type == DataType::PostalCode)
        || template
            .array_entries
            .iter()
            .flat_map(|e| e.fields.iter())
            .any(|f| f.data_type == DataType::PostalCode)
}

fn postal_rules_block() -> &'static str {
    "Postal code rules:\n\
     - Canadian postal codes are six characters grouped as \"AAA AAA\" (e.g. \"H1W 1S3\").\n\
     - US ZIP codes are the five-digit form; drop any +4 suffix.\n\
     - Province and state codes are the two-letter abbreviation, uppercase.\n\n"
}
