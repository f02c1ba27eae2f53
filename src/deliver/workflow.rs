//! Workflow engine handoff for workflow-mode templates.
//!
//! The engine itself is an external collaborator; this module packages the
//! processed bundle and starts one execution, returning the engine's
//! execution-log reference.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use secrecy::ExposeSecret;
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::config::WorkflowSettings;
use crate::error::DeliveryError;
use crate::mail::PdfAttachment;

/// Trigger source tag stamped onto every bundle this pipeline produces.
pub const TRIGGER_SOURCE_EMAIL: &str = "email";

/// Everything the engine needs to start one execution.
pub struct WorkflowBundle<'a> {
    pub template_id: Uuid,
    /// Corrected primary structure, serialized.
    pub payload: &'a str,
    pub side_channel: &'a Map<String, Value>,
    pub attachment: &'a PdfAttachment,
    /// Mailbox address the triggering email arrived at.
    pub trigger_address: &'a str,
}

#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Hand the bundle off. Returns an execution-log reference.
    async fn start_execution(&self, bundle: WorkflowBundle<'_>) -> Result<String, DeliveryError>;
}

pub struct HttpWorkflowEngine {
    http: reqwest::Client,
    settings: WorkflowSettings,
}

impl HttpWorkflowEngine {
    pub fn new(settings: WorkflowSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }
}

/// Wire shape of the execution-start request.
fn bundle_body(bundle: &WorkflowBundle<'_>) -> Value {
    serde_json::json!({
        "templateId": bundle.template_id,
        "trigger": {
            "source": TRIGGER_SOURCE_EMAIL,
            "address": bundle.trigger_address,
        },
        "payload": bundle.payload,
        "workflowData": bundle.side_channel,
        "attachment": {
            "filename": bundle.attachment.filename,
            "pageCount": bundle.attachment.page_count,
            "contentBase64": BASE64_STANDARD.encode(&bundle.attachment.bytes),
        },
    })
}

/// Pull the execution reference out of the engine's response, falling back
/// to the raw body.
fn execution_reference(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body)
        && let Some(reference) = value
            .get("executionId")
            .or_else(|| value.get("id"))
            .and_then(Value::as_str)
    {
        return reference.to_string();
    }
    body.trim().to_string()
}

#[async_trait]
impl WorkflowEngine for HttpWorkflowEngine {
    async fn start_execution(&self, bundle: WorkflowBundle<'_>) -> Result<String, DeliveryError> {
        debug!(
            template_id = %bundle.template_id,
            filename = %bundle.attachment.filename,
            "Starting workflow execution"
        );

        let response = self
            .http
            .post(&self.settings.endpoint)
            .bearer_auth(self.settings.api_key.expose_secret())
            .json(&bundle_body(&bundle))
            .send()
            .await
            .map_err(|e| DeliveryError::Workflow(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(DeliveryError::Workflow(format!("HTTP {status}: {body}")));
        }

        Ok(execution_reference(&body))
    }
}
