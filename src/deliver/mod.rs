//! Delivery dispatch: direct partner delivery or workflow handoff.
//!
//! Direct mode draws a sequence id, injects it where the template asks,
//! posts JSON payloads to the partner endpoint, and archives the source
//! document (plus corrected markup for XML templates) through the transfer
//! gateway. Workflow mode packages everything for the external engine and
//! stops there.

pub mod partner;
pub mod transfer;
pub mod workflow;

pub use partner::{HttpPartnerClient, PartnerGateway};
pub use transfer::{FileKind, FileTransfer, HttpFileTransfer};
pub use workflow::{HttpWorkflowEngine, WorkflowBundle, WorkflowEngine};

use std::sync::Arc;

use tracing::warn;

use crate::error::DeliveryError;
use crate::mail::PdfAttachment;
use crate::postprocess::path::FieldPath;
use crate::postprocess::{ProcessedOutput, ProcessedPayload};
use crate::store::RecordStore;
use crate::template::{DeliveryMode, ExtractionTemplate, OutputFormat};

/// What a completed dispatch produced.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    /// Sequence id drawn for direct deliveries.
    pub sequence_id: Option<i64>,
    /// Partner response body or workflow execution reference.
    pub reference: Option<String>,
}

pub struct DeliveryDispatcher {
    store: Arc<dyn RecordStore>,
    partner: Option<Arc<dyn PartnerGateway>>,
    transfer: Option<Arc<dyn FileTransfer>>,
    workflow: Option<Arc<dyn WorkflowEngine>>,
}

impl DeliveryDispatcher {
    pub fn new(
        store: Arc<dyn RecordStore>,
        partner: Option<Arc<dyn PartnerGateway>>,
        transfer: Option<Arc<dyn FileTransfer>>,
        workflow: Option<Arc<dyn WorkflowEngine>>,
    ) -> Self {
        Self {
            store,
            partner,
            transfer,
            workflow,
        }
    }

    /// Route one processed attachment per the template's delivery mode.
    pub async fn dispatch(
        &self,
        template: &ExtractionTemplate,
        output: &mut ProcessedOutput,
        attachment: &PdfAttachment,
        trigger_address: &str,
    ) -> Result<DeliveryReport, DeliveryError> {
        match template.delivery {
            DeliveryMode::Workflow => {
                self.dispatch_workflow(template, output, attachment, trigger_address)
                    .await
            }
            DeliveryMode::Direct => self.dispatch_direct(template, output, attachment).await,
        }
    }

    async fn dispatch_workflow(
        &self,
        template: &ExtractionTemplate,
        output: &ProcessedOutput,
        attachment: &PdfAttachment,
        trigger_address: &str,
    ) -> Result<DeliveryReport, DeliveryError> {
        let Some(engine) = &self.workflow else {
            return Err(DeliveryError::Workflow(
                "no workflow engine configured".into(),
            ));
        };

        let payload = output.serialized();
        let reference = engine
            .start_execution(WorkflowBundle {
                template_id: template.id,
                payload: &payload,
                side_channel: &output.side_channel,
                attachment,
                trigger_address,
            })
            .await?;

        Ok(DeliveryReport {
            sequence_id: None,
            reference: Some(reference),
        })
    }

    async fn dispatch_direct(
        &self,
        template: &ExtractionTemplate,
        output: &mut ProcessedOutput,
        attachment: &PdfAttachment,
    ) -> Result<DeliveryReport, DeliveryError> {
        let sequence_id = self
            .store
            .next_sequence_id()
            .await
            .map_err(|e| DeliveryError::Sequence(e.to_string()))?;

        let mut reference = None;
        if let ProcessedPayload::Json(payload) = &mut output.payload {
            if let Some(field) = &template.sequence_field {
                inject_sequence_id(payload, field, sequence_id);
            }

            let route =
                template
                    .partner_route
                    .as_deref()
                    .ok_or_else(|| DeliveryError::MissingRoute {
                        template: template.name.clone(),
                    })?;
            let Some(partner) = &self.partner else {
                return Err(DeliveryError::PartnerRequest {
                    route: route.to_string(),
                    reason: "no partner endpoint configured".into(),
                });
            };
            reference = Some(partner.post_payload(route, payload).await?);
        }

        self.archive(template, output, attachment).await?;

        Ok(DeliveryReport {
            sequence_id: Some(sequence_id),
            reference,
        })
    }

    /// Archive the source PDF and, for XML templates, the corrected markup.
    ///
    /// Skipped with a warning when no transfer gateway is configured; an
    /// upload failure against a configured gateway is a real error.
    async fn archive(
        &self,
        template: &ExtractionTemplate,
        output: &ProcessedOutput,
        attachment: &PdfAttachment,
    ) -> Result<(), DeliveryError> {
        let Some(transfer) = &self.transfer else {
            warn!(
                filename = %attachment.filename,
                "No file transfer configured; skipping archive"
            );
            return Ok(());
        };

        transfer
            .upload(FileKind::SourcePdf, &attachment.filename, &attachment.bytes)
            .await?;

        if template.format == OutputFormat::Xml
            && let ProcessedPayload::Xml(markup) = &output.payload
        {
            transfer
                .upload(
                    FileKind::CorrectedMarkup,
                    &markup_filename(&attachment.filename),
                    markup.as_bytes(),
                )
                .await?;
        }
        Ok(())
    }
}

/// Place the sequence id at the template's declared dot path, descending
/// into the first element wherever the path crosses an array.
fn inject_sequence_id(payload: &mut serde_json::Value, field: &str, sequence_id: i64) {
    match FieldPath::parse(field) {
        Ok(path) => path.inject_first(payload, serde_json::Value::from(sequence_id)),
        Err(e) => warn!(field, error = %e, "Sequence field path is malformed; id not injected"),
    }
}

/// Corrected-markup filename derived from the source attachment.
fn markup_filename(pdf_filename: &str) -> String {
    match pdf_filename.rsplit_once('.') {
        Some((stem, _)) => format!("{stem}.xml"),
        None => format!("{pdf_filename}.xml"),
    }
}
