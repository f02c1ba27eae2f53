//! Unified `RecordStore` trait: one async interface for the run ledger and
//! for pipeline configuration.
//!
//! Everything the pipeline reads or writes goes through this trait so the
//! orchestrator can run against an in-memory database in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::{AiSettings, MailSettings, PartnerSettings, TransferSettings, WorkflowSettings};
use crate::error::StoreError;
use crate::template::ExtractionTemplate;

// ── Audit rows ──────────────────────────────────────────────────────

/// Outcome of one polling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Run is still in flight.
    Running,
    /// Run finished; individual emails may still have failed.
    Success,
    /// Run aborted before finishing its mailbox.
    Failed,
}

/// One mailbox poll, from start to finish.
#[derive(Debug, Clone, Serialize)]
pub struct PollingRun {
    pub id: Uuid,
    pub provider: String,
    pub mailbox: String,
    pub status: RunStatus,
    pub emails_found: u32,
    pub emails_processed: u32,
    pub emails_failed: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl PollingRun {
    /// A fresh in-flight run row.
    pub fn begin(provider: &str, mailbox: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            mailbox: mailbox.to_string(),
            status: RunStatus::Running,
            emails_found: 0,
            emails_processed: 0,
            emails_failed: 0,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
        }
    }

    /// Stamp the terminal status and timing fields.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
        self.finished_at = Some(now);
    }
}

/// Terminal state of one email within a run.
///
/// Skipped emails (no attachments, no matching rule, duplicates) are recorded
/// as `Failed` with the skip reason in `error`, so the ledger shows every
/// candidate the poll considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailStatus {
    Processed,
    Failed,
}

/// Audit row for one handled email.
#[derive(Debug, Clone)]
pub struct ProcessedEmailRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Provider-native message id, the idempotency key across runs.
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub rule_id: Option<Uuid>,
    pub template_id: Option<Uuid>,
    pub attachment_count: u32,
    pub attachment_names: Vec<String>,
    pub page_counts: Vec<u32>,
    pub status: EmailStatus,
    pub error: Option<String>,
    /// Sequence id handed out for direct delivery, when one was drawn.
    pub sequence_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of one attachment's extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStatus {
    /// Row created, model not called yet.
    Pending,
    /// Model output processed, not yet delivered.
    Extracted,
    /// Handed off to the partner or workflow engine.
    Delivered,
    Failed,
}

/// Audit row for one attachment.
#[derive(Debug, Clone)]
pub struct ExtractionRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub message_id: String,
    pub template_id: Uuid,
    pub filename: String,
    pub page_count: u32,
    pub status: ExtractionStatus,
    /// Serialized processed payload, present from `Extracted` onward.
    pub payload: Option<String>,
    /// Partner response body or workflow execution reference.
    pub delivery_reference: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExtractionRecord {
    /// A fresh pending row for one attachment.
    pub fn begin(run_id: Uuid, message_id: &str, template_id: Uuid, filename: &str, page_count: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            run_id,
            message_id: message_id.to_string(),
            template_id,
            filename: filename.to_string(),
            page_count,
            status: ExtractionStatus::Pending,
            payload: None,
            delivery_reference: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Routing configuration ───────────────────────────────────────────

/// Pattern rule that routes an email to a template.
///
/// Patterns are case-insensitive substring matches; an empty pattern matches
/// everything.
#[derive(Debug, Clone)]
pub struct ProcessingRule {
    pub id: Uuid,
    pub name: String,
    pub sender_pattern: String,
    pub subject_pattern: String,
    /// Higher wins. Ties resolve in stored order.
    pub priority: i32,
    pub enabled: bool,
    pub template_id: Uuid,
}

// ── Trait ───────────────────────────────────────────────────────────

/// Backend-agnostic store covering the run ledger, routing configuration,
/// and the sequence counter.
#[async_trait]
pub trait RecordStore: Send + Sync {
    // ── Runs ────────────────────────────────────────────────────────

    /// Insert a freshly started run.
    async fn insert_run(&self, run: &PollingRun) -> Result<(), StoreError>;

    /// Write a run's terminal status, counts, and timing.
    async fn finish_run(&self, run: &PollingRun) -> Result<(), StoreError>;

    /// Most recent runs first, up to `limit`.
    async fn list_recent_runs(&self, limit: usize) -> Result<Vec<PollingRun>, StoreError>;

    // ── Emails ──────────────────────────────────────────────────────

    /// Record one email's terminal outcome.
    async fn insert_processed_email(
        &self,
        record: &ProcessedEmailRecord,
    ) -> Result<(), StoreError>;

    /// The prior successful record for a message id, if any.
    ///
    /// Failed records do not count: a message that previously failed is
    /// eligible for another attempt.
    async fn get_processed_success(
        &self,
        message_id: &str,
    ) -> Result<Option<ProcessedEmailRecord>, StoreError>;

    // ── Extractions ─────────────────────────────────────────────────

    /// Insert a pending extraction row for one attachment.
    async fn insert_extraction(&self, record: &ExtractionRecord) -> Result<(), StoreError>;

    /// Attach the processed payload and advance the row to `Extracted`.
    async fn mark_extraction_extracted(&self, id: Uuid, payload: &str)
    -> Result<(), StoreError>;

    /// Advance the row to `Delivered`, keeping the delivery reference.
    async fn mark_extraction_delivered(
        &self,
        id: Uuid,
        reference: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Terminal failure for the row.
    async fn mark_extraction_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    /// All extraction rows of one run, oldest first.
    async fn list_extractions_for_run(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<ExtractionRecord>, StoreError>;

    // ── Mailboxes ───────────────────────────────────────────────────

    /// Every configured mailbox, enabled or not.
    async fn list_mail_settings(&self) -> Result<Vec<MailSettings>, StoreError>;

    /// Insert or replace a mailbox configuration, keyed by address.
    async fn save_mail_settings(&self, settings: &MailSettings) -> Result<(), StoreError>;

    /// Advance a mailbox's last-check watermark.
    async fn update_last_check(
        &self,
        mailbox: &str,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // ── Rules and templates ─────────────────────────────────────────

    /// All rules, highest priority first with stored order breaking ties.
    async fn list_rules(&self) -> Result<Vec<ProcessingRule>, StoreError>;

    async fn save_rule(&self, rule: &ProcessingRule) -> Result<(), StoreError>;

    async fn get_template(&self, id: Uuid) -> Result<Option<ExtractionTemplate>, StoreError>;

    async fn save_template(&self, template: &ExtractionTemplate) -> Result<(), StoreError>;

    // ── Delivery configuration ──────────────────────────────────────

    async fn get_partner_settings(&self) -> Result<Option<PartnerSettings>, StoreError>;

    async fn save_partner_settings(&self, settings: &PartnerSettings) -> Result<(), StoreError>;

    async fn get_transfer_settings(&self) -> Result<Option<TransferSettings>, StoreError>;

    async fn save_transfer_settings(&self, settings: &TransferSettings)
    -> Result<(), StoreError>;

    async fn get_workflow_settings(&self) -> Result<Option<WorkflowSettings>, StoreError>;

    async fn save_workflow_settings(&self, settings: &WorkflowSettings)
    -> Result<(), StoreError>;

    async fn get_ai_settings(&self) -> Result<Option<AiSettings>, StoreError>;

    async fn save_ai_settings(&self, settings: &AiSettings) -> Result<(), StoreError>;

    // ── Sequence counter ────────────────────────────────────────────

    /// Draw the next sequence id.
    ///
    /// Must be atomic: concurrent callers each get a distinct id and no id
    /// is ever handed out twice, even across restarts.
    async fn next_sequence_id(&self) -> Result<i64, StoreError>;
}
