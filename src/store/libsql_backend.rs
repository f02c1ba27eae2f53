//! libSQL backend: async `RecordStore` implementation.
//!
//! Audit rows (runs, emails, extractions) use flat columns; template child
//! configs and list-valued audit fields are stored as JSON text. Partner,
//! transfer, and model settings live in a key/value table as JSON blobs.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{AiSettings, MailSettings, PartnerSettings, TransferSettings, WorkflowSettings};
use crate::error::StoreError;
use crate::mail::{MailProviderKind, PostProcessAction};
use crate::store::migrations;
use crate::store::traits::{
    EmailStatus, ExtractionRecord, ExtractionStatus, PollingRun, ProcessedEmailRecord,
    ProcessingRule, RecordStore, RunStatus,
};
use crate::template::{DeliveryMode, ExtractionTemplate, OutputFormat};

/// Name of the single counter row backing `next_sequence_id`.
const SEQUENCE_COUNTER: &str = "parseit";

const PARTNER_SETTINGS_KEY: &str = "partner";
const TRANSFER_SETTINGS_KEY: &str = "transfer";
const WORKFLOW_SETTINGS_KEY: &str = "workflow";
const AI_SETTINGS_KEY: &str = "ai";

/// libSQL store.
///
/// Holds a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut rows = self
            .conn()
            .query("SELECT value FROM app_settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| StoreError::Query(format!("get_setting: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("put_setting: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn run_status_to_str(status: &RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Success => "success",
        RunStatus::Failed => "failed",
    }
}

fn str_to_run_status(s: &str) -> RunStatus {
    match s {
        "success" => RunStatus::Success,
        "failed" => RunStatus::Failed,
        _ => RunStatus::Running,
    }
}

fn email_status_to_str(status: &EmailStatus) -> &'static str {
    match status {
        EmailStatus::Processed => "processed",
        EmailStatus::Failed => "failed",
    }
}

fn str_to_email_status(s: &str) -> EmailStatus {
    match s {
        "processed" => EmailStatus::Processed,
        _ => EmailStatus::Failed,
    }
}

fn extraction_status_to_str(status: &ExtractionStatus) -> &'static str {
    match status {
        ExtractionStatus::Pending => "pending",
        ExtractionStatus::Extracted => "extracted",
        ExtractionStatus::Delivered => "delivered",
        ExtractionStatus::Failed => "failed",
    }
}

fn str_to_extraction_status(s: &str) -> ExtractionStatus {
    match s {
        "extracted" => ExtractionStatus::Extracted,
        "delivered" => ExtractionStatus::Delivered,
        "failed" => ExtractionStatus::Failed,
        _ => ExtractionStatus::Pending,
    }
}

fn delivery_to_str(mode: &DeliveryMode) -> &'static str {
    match mode {
        DeliveryMode::Direct => "direct",
        DeliveryMode::Workflow => "workflow",
    }
}

fn str_to_delivery(s: &str) -> DeliveryMode {
    match s {
        "workflow" => DeliveryMode::Workflow,
        _ => DeliveryMode::Direct,
    }
}

fn str_to_format(s: &str) -> OutputFormat {
    match s {
        "xml" => OutputFormat::Xml,
        _ => OutputFormat::Json,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<i64>` to libsql Value.
fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

fn json_list<T: serde::Serialize>(items: &[T]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".into())
}

fn parse_json_list<T: serde::de::DeserializeOwned>(s: &str) -> Vec<T> {
    serde_json::from_str(s).unwrap_or_default()
}

// ── Row mappers ─────────────────────────────────────────────────────

const RUN_COLUMNS: &str = "id, provider, mailbox, status, emails_found, emails_processed, \
     emails_failed, error, started_at, finished_at, duration_ms";

fn row_to_run(row: &libsql::Row) -> Result<PollingRun, libsql::Error> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(3)?;
    let started_str: String = row.get(8)?;
    let finished_str: Option<String> = row.get(9).ok();

    Ok(PollingRun {
        id: parse_uuid(&id_str),
        provider: row.get(1)?,
        mailbox: row.get(2)?,
        status: str_to_run_status(&status_str),
        emails_found: row.get::<i64>(4)? as u32,
        emails_processed: row.get::<i64>(5)? as u32,
        emails_failed: row.get::<i64>(6)? as u32,
        error: row.get(7).ok(),
        started_at: parse_datetime(&started_str),
        finished_at: parse_optional_datetime(&finished_str),
        duration_ms: row.get(10).ok(),
    })
}

const EMAIL_COLUMNS: &str = "id, run_id, message_id, sender, subject, received_at, rule_id, \
     template_id, attachment_count, attachment_names, page_counts, status, error, sequence_id, \
     created_at";

fn row_to_email(row: &libsql::Row) -> Result<ProcessedEmailRecord, libsql::Error> {
    let id_str: String = row.get(0)?;
    let run_id_str: String = row.get(1)?;
    let received_str: String = row.get(5)?;
    let names_str: String = row.get(9)?;
    let pages_str: String = row.get(10)?;
    let status_str: String = row.get(11)?;
    let created_str: String = row.get(14)?;

    Ok(ProcessedEmailRecord {
        id: parse_uuid(&id_str),
        run_id: parse_uuid(&run_id_str),
        message_id: row.get(2)?,
        sender: row.get(3)?,
        subject: row.get(4)?,
        received_at: parse_datetime(&received_str),
        rule_id: row.get::<String>(6).ok().map(|s| parse_uuid(&s)),
        template_id: row.get::<String>(7).ok().map(|s| parse_uuid(&s)),
        attachment_count: row.get::<i64>(8)? as u32,
        attachment_names: parse_json_list(&names_str),
        page_counts: parse_json_list(&pages_str),
        status: str_to_email_status(&status_str),
        error: row.get(12).ok(),
        sequence_id: row.get(13).ok(),
        created_at: parse_datetime(&created_str),
    })
}

const EXTRACTION_COLUMNS: &str = "id, run_id, message_id, template_id, filename, page_count, \
     status, payload, delivery_reference, error, created_at, updated_at";

fn row_to_extraction(row: &libsql::Row) -> Result<ExtractionRecord, libsql::Error> {
    let id_str: String = row.get(0)?;
    let run_id_str: String = row.get(1)?;
    let template_id_str: String = row.get(3)?;
    let status_str: String = row.get(6)?;
    let created_str: String = row.get(10)?;
    let updated_str: String = row.get(11)?;

    Ok(ExtractionRecord {
        id: parse_uuid(&id_str),
        run_id: parse_uuid(&run_id_str),
        message_id: row.get(2)?,
        template_id: parse_uuid(&template_id_str),
        filename: row.get(4)?,
        page_count: row.get::<i64>(5)? as u32,
        status: str_to_extraction_status(&status_str),
        payload: row.get(7).ok(),
        delivery_reference: row.get(8).ok(),
        error: row.get(9).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const RULE_COLUMNS: &str =
    "id, name, sender_pattern, subject_pattern, priority, enabled, template_id";

fn row_to_rule(row: &libsql::Row) -> Result<ProcessingRule, libsql::Error> {
    let id_str: String = row.get(0)?;
    let template_id_str: String = row.get(6)?;
    let enabled: i64 = row.get(5)?;

    Ok(ProcessingRule {
        id: parse_uuid(&id_str),
        name: row.get(1)?,
        sender_pattern: row.get(2)?,
        subject_pattern: row.get(3)?,
        priority: row.get::<i64>(4)? as i32,
        enabled: enabled != 0,
        template_id: parse_uuid(&template_id_str),
    })
}

const TEMPLATE_COLUMNS: &str = "id, name, format, body, field_mappings, array_splits, \
     array_entries, delivery, partner_route, sequence_field";

fn row_to_template(row: &libsql::Row) -> Result<ExtractionTemplate, StoreError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("template id: {e}")))?;
    let name: String = row
        .get(1)
        .map_err(|e| StoreError::Query(format!("template name: {e}")))?;
    let format_str: String = row
        .get(2)
        .map_err(|e| StoreError::Query(format!("template format: {e}")))?;
    let body: String = row
        .get(3)
        .map_err(|e| StoreError::Query(format!("template body: {e}")))?;
    let mappings_str: String = row
        .get(4)
        .map_err(|e| StoreError::Query(format!("template field_mappings: {e}")))?;
    let splits_str: String = row
        .get(5)
        .map_err(|e| StoreError::Query(format!("template array_splits: {e}")))?;
    let entries_str: String = row
        .get(6)
        .map_err(|e| StoreError::Query(format!("template array_entries: {e}")))?;
    let delivery_str: String = row
        .get(7)
        .map_err(|e| StoreError::Query(format!("template delivery: {e}")))?;

    // Child configs are JSON columns; a corrupt value is a hard error rather
    // than a silently empty template.
    let field_mappings = serde_json::from_str(&mappings_str)
        .map_err(|e| StoreError::Serialization(format!("template '{name}' field_mappings: {e}")))?;
    let array_splits = serde_json::from_str(&splits_str)
        .map_err(|e| StoreError::Serialization(format!("template '{name}' array_splits: {e}")))?;
    let array_entries = serde_json::from_str(&entries_str)
        .map_err(|e| StoreError::Serialization(format!("template '{name}' array_entries: {e}")))?;

    Ok(ExtractionTemplate {
        id: parse_uuid(&id_str),
        name,
        format: str_to_format(&format_str),
        body,
        field_mappings,
        array_splits,
        array_entries,
        delivery: str_to_delivery(&delivery_str),
        partner_route: row.get(8).ok(),
        sequence_field: row.get(9).ok(),
    })
}

const MAIL_COLUMNS: &str = "mailbox, enabled, provider, tenant_id, client_id, client_secret, \
     refresh_token, poll_interval_minutes, check_all_messages, last_check, success_action, \
     success_folder, failure_action, failure_folder";

fn row_to_mail_settings(row: &libsql::Row) -> Result<MailSettings, libsql::Error> {
    let enabled: i64 = row.get(1)?;
    let provider_str: String = row.get(2)?;
    let secret: String = row.get(5)?;
    let refresh: Option<String> = row.get(6).ok();
    let check_all: i64 = row.get(8)?;
    let last_check_str: Option<String> = row.get(9).ok();
    let success_str: String = row.get(10)?;
    let failure_str: String = row.get(12)?;

    Ok(MailSettings {
        enabled: enabled != 0,
        provider: MailProviderKind::parse(&provider_str).unwrap_or(MailProviderKind::Graph),
        mailbox: row.get(0)?,
        tenant_id: row.get(3).ok(),
        client_id: row.get(4)?,
        client_secret: SecretString::from(secret),
        refresh_token: refresh.map(SecretString::from),
        poll_interval_minutes: row.get::<i64>(7)? as u32,
        check_all_messages: check_all != 0,
        last_check: parse_optional_datetime(&last_check_str),
        success_action: PostProcessAction::parse(&success_str).unwrap_or(PostProcessAction::None),
        success_folder: row.get(11).ok(),
        failure_action: PostProcessAction::parse(&failure_str).unwrap_or(PostProcessAction::None),
        failure_folder: row.get(13).ok(),
    })
}

// ── Settings blobs ──────────────────────────────────────────────────

/// Deserialization helpers for the JSON settings blobs. Secret fields come
/// back as plain strings and are wrapped on conversion.
#[derive(serde::Deserialize)]
struct PartnerSettingsRaw {
    base_url: String,
    api_key: String,
    #[serde(default)]
    token_route: Option<String>,
}

impl From<PartnerSettingsRaw> for PartnerSettings {
    fn from(raw: PartnerSettingsRaw) -> Self {
        PartnerSettings {
            base_url: raw.base_url,
            api_key: SecretString::from(raw.api_key),
            token_route: raw.token_route,
        }
    }
}

fn partner_settings_json(settings: &PartnerSettings) -> String {
    serde_json::json!({
        "base_url": settings.base_url,
        "api_key": settings.api_key.expose_secret(),
        "token_route": settings.token_route,
    })
    .to_string()
}

#[derive(serde::Deserialize)]
struct TransferSettingsRaw {
    base_url: String,
    api_key: String,
    pdf_upload_path: String,
    markup_upload_path: String,
}

impl From<TransferSettingsRaw> for TransferSettings {
    fn from(raw: TransferSettingsRaw) -> Self {
        TransferSettings {
            base_url: raw.base_url,
            api_key: SecretString::from(raw.api_key),
            pdf_upload_path: raw.pdf_upload_path,
            markup_upload_path: raw.markup_upload_path,
        }
    }
}

fn transfer_settings_json(settings: &TransferSettings) -> String {
    serde_json::json!({
        "base_url": settings.base_url,
        "api_key": settings.api_key.expose_secret(),
        "pdf_upload_path": settings.pdf_upload_path,
        "markup_upload_path": settings.markup_upload_path,
    })
    .to_string()
}

#[derive(serde::Deserialize)]
struct WorkflowSettingsRaw {
    endpoint: String,
    api_key: String,
}

impl From<WorkflowSettingsRaw> for WorkflowSettings {
    fn from(raw: WorkflowSettingsRaw) -> Self {
        WorkflowSettings {
            endpoint: raw.endpoint,
            api_key: SecretString::from(raw.api_key),
        }
    }
}

fn workflow_settings_json(settings: &WorkflowSettings) -> String {
    serde_json::json!({
        "endpoint": settings.endpoint,
        "api_key": settings.api_key.expose_secret(),
    })
    .to_string()
}

#[derive(serde::Deserialize)]
struct AiSettingsRaw {
    model: String,
    api_key: String,
    max_tokens: u32,
}

impl From<AiSettingsRaw> for AiSettings {
    fn from(raw: AiSettingsRaw) -> Self {
        AiSettings {
            model: raw.model,
            api_key: SecretString::from(raw.api_key),
            max_tokens: raw.max_tokens,
        }
    }
}

fn ai_settings_json(settings: &AiSettings) -> String {
    serde_json::json!({
        "model": settings.model,
        "api_key": settings.api_key.expose_secret(),
        "max_tokens": settings.max_tokens,
    })
    .to_string()
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl RecordStore for LibSqlStore {
    // ── Runs ────────────────────────────────────────────────────────

    async fn insert_run(&self, run: &PollingRun) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO polling_runs (id, provider, mailbox, status, emails_found, \
                 emails_processed, emails_failed, error, started_at, finished_at, duration_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    run.id.to_string(),
                    run.provider.clone(),
                    run.mailbox.clone(),
                    run_status_to_str(&run.status),
                    i64::from(run.emails_found),
                    i64::from(run.emails_processed),
                    i64::from(run.emails_failed),
                    opt_text_owned(run.error.clone()),
                    run.started_at.to_rfc3339(),
                    opt_text_owned(run.finished_at.map(|t| t.to_rfc3339())),
                    opt_int(run.duration_ms),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_run: {e}")))?;

        debug!(run_id = %run.id, mailbox = %run.mailbox, "Run inserted");
        Ok(())
    }

    async fn finish_run(&self, run: &PollingRun) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE polling_runs SET status = ?1, emails_found = ?2, emails_processed = ?3, \
                 emails_failed = ?4, error = ?5, finished_at = ?6, duration_ms = ?7 WHERE id = ?8",
                params![
                    run_status_to_str(&run.status),
                    i64::from(run.emails_found),
                    i64::from(run.emails_processed),
                    i64::from(run.emails_failed),
                    opt_text_owned(run.error.clone()),
                    opt_text_owned(run.finished_at.map(|t| t.to_rfc3339())),
                    opt_int(run.duration_ms),
                    run.id.to_string(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("finish_run: {e}")))?;

        debug!(run_id = %run.id, status = ?run.status, "Run finished");
        Ok(())
    }

    async fn list_recent_runs(&self, limit: usize) -> Result<Vec<PollingRun>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM polling_runs ORDER BY started_at DESC LIMIT ?1"),
                params![limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_recent_runs: {e}")))?;

        let mut runs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_run(&row) {
                Ok(run) => runs.push(run),
                Err(e) => tracing::warn!("Skipping run row: {e}"),
            }
        }
        Ok(runs)
    }

    // ── Emails ──────────────────────────────────────────────────────

    async fn insert_processed_email(
        &self,
        record: &ProcessedEmailRecord,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO processed_emails (id, run_id, message_id, sender, subject, \
                 received_at, rule_id, template_id, attachment_count, attachment_names, \
                 page_counts, status, error, sequence_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    record.id.to_string(),
                    record.run_id.to_string(),
                    record.message_id.clone(),
                    record.sender.clone(),
                    record.subject.clone(),
                    record.received_at.to_rfc3339(),
                    opt_text_owned(record.rule_id.map(|u| u.to_string())),
                    opt_text_owned(record.template_id.map(|u| u.to_string())),
                    i64::from(record.attachment_count),
                    json_list(&record.attachment_names),
                    json_list(&record.page_counts),
                    email_status_to_str(&record.status),
                    opt_text_owned(record.error.clone()),
                    opt_int(record.sequence_id),
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_processed_email: {e}")))?;

        debug!(message_id = %record.message_id, status = ?record.status, "Email recorded");
        Ok(())
    }

    async fn get_processed_success(
        &self,
        message_id: &str,
    ) -> Result<Option<ProcessedEmailRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EMAIL_COLUMNS} FROM processed_emails \
                     WHERE message_id = ?1 AND status = 'processed' \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![message_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_processed_success: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_email(&row)
                    .map_err(|e| StoreError::Query(format!("get_processed_success row: {e}")))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_processed_success: {e}"))),
        }
    }

    // ── Extractions ─────────────────────────────────────────────────

    async fn insert_extraction(&self, record: &ExtractionRecord) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO extractions (id, run_id, message_id, template_id, filename, \
                 page_count, status, payload, delivery_reference, error, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.id.to_string(),
                    record.run_id.to_string(),
                    record.message_id.clone(),
                    record.template_id.to_string(),
                    record.filename.clone(),
                    i64::from(record.page_count),
                    extraction_status_to_str(&record.status),
                    opt_text_owned(record.payload.clone()),
                    opt_text_owned(record.delivery_reference.clone()),
                    opt_text_owned(record.error.clone()),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_extraction: {e}")))?;
        Ok(())
    }

    async fn mark_extraction_extracted(
        &self,
        id: Uuid,
        payload: &str,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE extractions SET status = 'extracted', payload = ?1, updated_at = ?2 \
                 WHERE id = ?3",
                params![payload, Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("mark_extraction_extracted: {e}")))?;
        Ok(())
    }

    async fn mark_extraction_delivered(
        &self,
        id: Uuid,
        reference: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE extractions SET status = 'delivered', delivery_reference = ?1, \
                 updated_at = ?2 WHERE id = ?3",
                params![
                    opt_text_owned(reference.map(String::from)),
                    Utc::now().to_rfc3339(),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("mark_extraction_delivered: {e}")))?;
        Ok(())
    }

    async fn mark_extraction_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE extractions SET status = 'failed', error = ?1, updated_at = ?2 \
                 WHERE id = ?3",
                params![error, Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("mark_extraction_failed: {e}")))?;
        Ok(())
    }

    async fn list_extractions_for_run(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<ExtractionRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EXTRACTION_COLUMNS} FROM extractions WHERE run_id = ?1 \
                     ORDER BY created_at ASC"
                ),
                params![run_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_extractions_for_run: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_extraction(&row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping extraction row: {e}"),
            }
        }
        Ok(records)
    }

    // ── Mailboxes ───────────────────────────────────────────────────

    async fn list_mail_settings(&self) -> Result<Vec<MailSettings>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MAIL_COLUMNS} FROM mail_settings ORDER BY mailbox"),
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_mail_settings: {e}")))?;

        let mut settings = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_mail_settings(&row) {
                Ok(s) => settings.push(s),
                Err(e) => tracing::warn!("Skipping mail settings row: {e}"),
            }
        }
        Ok(settings)
    }

    async fn save_mail_settings(&self, settings: &MailSettings) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO mail_settings (mailbox, enabled, provider, tenant_id, client_id, \
                 client_secret, refresh_token, poll_interval_minutes, check_all_messages, \
                 last_check, success_action, success_folder, failure_action, failure_folder, \
                 updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15) \
                 ON CONFLICT(mailbox) DO UPDATE SET \
                 enabled = excluded.enabled, provider = excluded.provider, \
                 tenant_id = excluded.tenant_id, client_id = excluded.client_id, \
                 client_secret = excluded.client_secret, refresh_token = excluded.refresh_token, \
                 poll_interval_minutes = excluded.poll_interval_minutes, \
                 check_all_messages = excluded.check_all_messages, \
                 last_check = excluded.last_check, success_action = excluded.success_action, \
                 success_folder = excluded.success_folder, \
                 failure_action = excluded.failure_action, \
                 failure_folder = excluded.failure_folder, updated_at = excluded.updated_at",
                params![
                    settings.mailbox.clone(),
                    i64::from(settings.enabled),
                    settings.provider.as_str(),
                    opt_text_owned(settings.tenant_id.clone()),
                    settings.client_id.clone(),
                    settings.client_secret.expose_secret(),
                    opt_text_owned(
                        settings
                            .refresh_token
                            .as_ref()
                            .map(|t| t.expose_secret().to_string())
                    ),
                    i64::from(settings.poll_interval_minutes),
                    i64::from(settings.check_all_messages),
                    opt_text_owned(settings.last_check.map(|t| t.to_rfc3339())),
                    settings.success_action.as_str(),
                    opt_text_owned(settings.success_folder.clone()),
                    settings.failure_action.as_str(),
                    opt_text_owned(settings.failure_folder.clone()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("save_mail_settings: {e}")))?;
        Ok(())
    }

    async fn update_last_check(
        &self,
        mailbox: &str,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE mail_settings SET last_check = ?1, updated_at = ?2 WHERE mailbox = ?3",
                params![checked_at.to_rfc3339(), Utc::now().to_rfc3339(), mailbox],
            )
            .await
            .map_err(|e| StoreError::Query(format!("update_last_check: {e}")))?;

        debug!(mailbox, %checked_at, "Last-check watermark advanced");
        Ok(())
    }

    // ── Rules and templates ─────────────────────────────────────────

    async fn list_rules(&self) -> Result<Vec<ProcessingRule>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM processing_rules \
                     ORDER BY priority DESC, created_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_rules: {e}")))?;

        let mut rules = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_rule(&row) {
                Ok(rule) => rules.push(rule),
                Err(e) => tracing::warn!("Skipping rule row: {e}"),
            }
        }
        Ok(rules)
    }

    async fn save_rule(&self, rule: &ProcessingRule) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO processing_rules (id, name, sender_pattern, subject_pattern, \
                 priority, enabled, template_id, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(id) DO UPDATE SET \
                 name = excluded.name, sender_pattern = excluded.sender_pattern, \
                 subject_pattern = excluded.subject_pattern, priority = excluded.priority, \
                 enabled = excluded.enabled, template_id = excluded.template_id, \
                 updated_at = excluded.updated_at",
                params![
                    rule.id.to_string(),
                    rule.name.clone(),
                    rule.sender_pattern.clone(),
                    rule.subject_pattern.clone(),
                    i64::from(rule.priority),
                    i64::from(rule.enabled),
                    rule.template_id.to_string(),
                    now.clone(),
                    now,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("save_rule: {e}")))?;
        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<ExtractionTemplate>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_template: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_template(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_template: {e}"))),
        }
    }

    async fn save_template(&self, template: &ExtractionTemplate) -> Result<(), StoreError> {
        let field_mappings = serde_json::to_string(&template.field_mappings)
            .map_err(|e| StoreError::Serialization(format!("field_mappings: {e}")))?;
        let array_splits = serde_json::to_string(&template.array_splits)
            .map_err(|e| StoreError::Serialization(format!("array_splits: {e}")))?;
        let array_entries = serde_json::to_string(&template.array_entries)
            .map_err(|e| StoreError::Serialization(format!("array_entries: {e}")))?;

        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO templates (id, name, format, body, field_mappings, array_splits, \
                 array_entries, delivery, partner_route, sequence_field, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                 ON CONFLICT(id) DO UPDATE SET \
                 name = excluded.name, format = excluded.format, body = excluded.body, \
                 field_mappings = excluded.field_mappings, array_splits = excluded.array_splits, \
                 array_entries = excluded.array_entries, delivery = excluded.delivery, \
                 partner_route = excluded.partner_route, \
                 sequence_field = excluded.sequence_field, updated_at = excluded.updated_at",
                params![
                    template.id.to_string(),
                    template.name.clone(),
                    template.format.as_str(),
                    template.body.clone(),
                    field_mappings,
                    array_splits,
                    array_entries,
                    delivery_to_str(&template.delivery),
                    opt_text_owned(template.partner_route.clone()),
                    opt_text_owned(template.sequence_field.clone()),
                    now.clone(),
                    now,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("save_template: {e}")))?;
        Ok(())
    }

    // ── Delivery configuration ──────────────────────────────────────

    async fn get_partner_settings(&self) -> Result<Option<PartnerSettings>, StoreError> {
        match self.get_setting(PARTNER_SETTINGS_KEY).await? {
            Some(value) => {
                let raw: PartnerSettingsRaw = serde_json::from_str(&value)
                    .map_err(|e| StoreError::Serialization(format!("partner settings: {e}")))?;
                Ok(Some(raw.into()))
            }
            None => Ok(None),
        }
    }

    async fn save_partner_settings(&self, settings: &PartnerSettings) -> Result<(), StoreError> {
        self.put_setting(PARTNER_SETTINGS_KEY, &partner_settings_json(settings))
            .await
    }

    async fn get_transfer_settings(&self) -> Result<Option<TransferSettings>, StoreError> {
        match self.get_setting(TRANSFER_SETTINGS_KEY).await? {
            Some(value) => {
                let raw: TransferSettingsRaw = serde_json::from_str(&value)
                    .map_err(|e| StoreError::Serialization(format!("transfer settings: {e}")))?;
                Ok(Some(raw.into()))
            }
            None => Ok(None),
        }
    }

    async fn save_transfer_settings(
        &self,
        settings: &TransferSettings,
    ) -> Result<(), StoreError> {
        self.put_setting(TRANSFER_SETTINGS_KEY, &transfer_settings_json(settings))
            .await
    }

    async fn get_workflow_settings(&self) -> Result<Option<WorkflowSettings>, StoreError> {
        match self.get_setting(WORKFLOW_SETTINGS_KEY).await? {
            Some(value) => {
                let raw: WorkflowSettingsRaw = serde_json::from_str(&value)
                    .map_err(|e| StoreError::Serialization(format!("workflow settings: {e}")))?;
                Ok(Some(raw.into()))
            }
            None => Ok(None),
        }
    }

    async fn save_workflow_settings(
        &self,
        settings: &WorkflowSettings,
    ) -> Result<(), StoreError> {
        self.put_setting(WORKFLOW_SETTINGS_KEY, &workflow_settings_json(settings))
            .await
    }

    async fn get_ai_settings(&self) -> Result<Option<AiSettings>, StoreError> {
        match self.get_setting(AI_SETTINGS_KEY).await? {
            Some(value) => {
                let raw: AiSettingsRaw = serde_json::from_str(&value)
                    .map_err(|e| StoreError::Serialization(format!("ai settings: {e}")))?;
                Ok(Some(raw.into()))
            }
            None => Ok(None),
        }
    }

    async fn save_ai_settings(&self, settings: &AiSettings) -> Result<(), StoreError> {
        self.put_setting(AI_SETTINGS_KEY, &ai_settings_json(settings))
            .await
    }

    // ── Sequence counter ────────────────────────────────────────────

    async fn next_sequence_id(&self) -> Result<i64, StoreError> {
        // Single-statement upsert so concurrent callers serialize inside
        // SQLite and every caller sees a distinct value.
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO sequence_counters (name, value) VALUES (?1, 1) \
                 ON CONFLICT(name) DO UPDATE SET value = value + 1 \
                 RETURNING value",
                params![SEQUENCE_COUNTER],
            )
            .await
            .map_err(|e| StoreError::Query(format!("next_sequence_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| StoreError::Query(format!("next_sequence_id row: {e}"))),
            Ok(None) => Err(StoreError::Query(
                "next_sequence_id: no value returned".into(),
            )),
            Err(e) => Err(StoreError::Query(format!("next_sequence_id: {e}"))),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::PostProcessAction;
    use crate::template::{DataType, FieldMapping, FieldSource};

    async fn test_db() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn new_local_creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("dir").join("parseit.db");
        let store = LibSqlStore::new_local(&db_path).await.unwrap();
        assert!(db_path.exists());

        // Schema is in place on the fresh file.
        assert_eq!(store.next_sequence_id().await.unwrap(), 1);
    }

    fn make_template() -> ExtractionTemplate {
        ExtractionTemplate {
            id: Uuid::new_v4(),
            name: "bol-standard".into(),
            format: OutputFormat::Json,
            body: "{\"shipper\": \"\"}".into(),
            field_mappings: vec![FieldMapping {
                path: "shipper.phone".into(),
                source: FieldSource::Extracted {
                    instruction: "Phone number near the shipper block".into(),
                },
                data_type: DataType::Phone,
                max_length: Some(12),
                workflow_only: false,
                remove_if_empty: true,
            }],
            array_splits: Vec::new(),
            array_entries: Vec::new(),
            delivery: DeliveryMode::Direct,
            partner_route: Some("/api/orders".into()),
            sequence_field: Some("orderId".into()),
        }
    }

    fn make_rule(template_id: Uuid, priority: i32) -> ProcessingRule {
        ProcessingRule {
            id: Uuid::new_v4(),
            name: "acme".into(),
            sender_pattern: "acme.com".into(),
            subject_pattern: String::new(),
            priority,
            enabled: true,
            template_id,
        }
    }

    fn make_mail_settings(mailbox: &str) -> MailSettings {
        MailSettings {
            enabled: true,
            provider: MailProviderKind::Graph,
            mailbox: mailbox.into(),
            tenant_id: Some("tenant-1".into()),
            client_id: "client-1".into(),
            client_secret: SecretString::from("hunter2"),
            refresh_token: None,
            poll_interval_minutes: 5,
            check_all_messages: false,
            last_check: None,
            success_action: PostProcessAction::MarkRead,
            success_folder: None,
            failure_action: PostProcessAction::MoveToFolder,
            failure_folder: Some("Failed".into()),
        }
    }

    fn make_email(run_id: Uuid, message_id: &str, status: EmailStatus) -> ProcessedEmailRecord {
        ProcessedEmailRecord {
            id: Uuid::new_v4(),
            run_id,
            message_id: message_id.into(),
            sender: "ops@acme.com".into(),
            subject: "BOL 4417".into(),
            received_at: Utc::now(),
            rule_id: None,
            template_id: None,
            attachment_count: 1,
            attachment_names: vec!["bol.pdf".into()],
            page_counts: vec![2],
            status,
            error: None,
            sequence_id: None,
            created_at: Utc::now(),
        }
    }

    // ── Runs ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_finish_run() {
        let store = test_db().await;
        let mut run = PollingRun::begin("graph", "intake@example.com");
        store.insert_run(&run).await.unwrap();

        run.emails_found = 3;
        run.emails_processed = 2;
        run.emails_failed = 1;
        run.finish(RunStatus::Success, None);
        store.finish_run(&run).await.unwrap();

        let runs = store.list_recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, run.id);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].emails_found, 3);
        assert_eq!(runs[0].emails_failed, 1);
        assert!(runs[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn recent_runs_ordered_and_limited() {
        let store = test_db().await;
        for i in 0..3 {
            let mut run = PollingRun::begin("graph", "intake@example.com");
            run.started_at = Utc::now() - chrono::Duration::minutes(10 - i);
            store.insert_run(&run).await.unwrap();
        }

        let runs = store.list_recent_runs(2).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].started_at > runs[1].started_at);
    }

    // ── Emails ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn processed_success_lookup_ignores_failures() {
        let store = test_db().await;
        let run = PollingRun::begin("graph", "intake@example.com");
        store.insert_run(&run).await.unwrap();

        let mut failed = make_email(run.id, "msg-1", EmailStatus::Failed);
        failed.error = Some("no matching rule".into());
        store.insert_processed_email(&failed).await.unwrap();

        assert!(store.get_processed_success("msg-1").await.unwrap().is_none());

        let ok = make_email(run.id, "msg-1", EmailStatus::Processed);
        store.insert_processed_email(&ok).await.unwrap();

        let found = store.get_processed_success("msg-1").await.unwrap().unwrap();
        assert_eq!(found.status, EmailStatus::Processed);
        assert_eq!(found.attachment_names, vec!["bol.pdf".to_string()]);
        assert_eq!(found.page_counts, vec![2]);
    }

    // ── Extractions ─────────────────────────────────────────────────

    #[tokio::test]
    async fn extraction_lifecycle() {
        let store = test_db().await;
        let run = PollingRun::begin("graph", "intake@example.com");
        store.insert_run(&run).await.unwrap();

        let record = ExtractionRecord::begin(run.id, "msg-1", Uuid::new_v4(), "bol.pdf", 2);
        store.insert_extraction(&record).await.unwrap();

        store
            .mark_extraction_extracted(record.id, "{\"shipper\":\"ACME\"}")
            .await
            .unwrap();
        store
            .mark_extraction_delivered(record.id, Some("exec-42"))
            .await
            .unwrap();

        let rows = store.list_extractions_for_run(run.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ExtractionStatus::Delivered);
        assert_eq!(rows[0].payload.as_deref(), Some("{\"shipper\":\"ACME\"}"));
        assert_eq!(rows[0].delivery_reference.as_deref(), Some("exec-42"));
    }

    #[tokio::test]
    async fn extraction_failure_keeps_error() {
        let store = test_db().await;
        let run = PollingRun::begin("graph", "intake@example.com");
        store.insert_run(&run).await.unwrap();

        let record = ExtractionRecord::begin(run.id, "msg-1", Uuid::new_v4(), "bol.pdf", 1);
        store.insert_extraction(&record).await.unwrap();
        store
            .mark_extraction_failed(record.id, "invalid XML format")
            .await
            .unwrap();

        let rows = store.list_extractions_for_run(run.id).await.unwrap();
        assert_eq!(rows[0].status, ExtractionStatus::Failed);
        assert_eq!(rows[0].error.as_deref(), Some("invalid XML format"));
    }

    // ── Mailboxes ───────────────────────────────────────────────────

    #[tokio::test]
    async fn mail_settings_roundtrip() {
        let store = test_db().await;
        store
            .save_mail_settings(&make_mail_settings("intake@example.com"))
            .await
            .unwrap();

        let all = store.list_mail_settings().await.unwrap();
        assert_eq!(all.len(), 1);
        let s = &all[0];
        assert_eq!(s.mailbox, "intake@example.com");
        assert_eq!(s.provider, MailProviderKind::Graph);
        assert_eq!(s.client_secret.expose_secret(), "hunter2");
        assert_eq!(s.failure_action, PostProcessAction::MoveToFolder);
        assert_eq!(s.failure_folder.as_deref(), Some("Failed"));
        assert!(s.last_check.is_none());
    }

    #[tokio::test]
    async fn save_mail_settings_upserts_by_mailbox() {
        let store = test_db().await;
        let mut settings = make_mail_settings("intake@example.com");
        store.save_mail_settings(&settings).await.unwrap();

        settings.poll_interval_minutes = 15;
        store.save_mail_settings(&settings).await.unwrap();

        let all = store.list_mail_settings().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].poll_interval_minutes, 15);
    }

    #[tokio::test]
    async fn last_check_watermark_advances() {
        let store = test_db().await;
        store
            .save_mail_settings(&make_mail_settings("intake@example.com"))
            .await
            .unwrap();

        let checked_at: DateTime<Utc> = "2026-03-01T08:30:00Z".parse().unwrap();
        store
            .update_last_check("intake@example.com", checked_at)
            .await
            .unwrap();

        let all = store.list_mail_settings().await.unwrap();
        assert_eq!(all[0].last_check, Some(checked_at));
    }

    // ── Rules and templates ─────────────────────────────────────────

    #[tokio::test]
    async fn rules_listed_by_priority() {
        let store = test_db().await;
        let template = make_template();
        store.save_template(&template).await.unwrap();

        store.save_rule(&make_rule(template.id, 1)).await.unwrap();
        store.save_rule(&make_rule(template.id, 10)).await.unwrap();
        store.save_rule(&make_rule(template.id, 5)).await.unwrap();

        let rules = store.list_rules().await.unwrap();
        let priorities: Vec<i32> = rules.iter().map(|r| r.priority).collect();
        assert_eq!(priorities, vec![10, 5, 1]);
    }

    #[tokio::test]
    async fn template_roundtrip_preserves_child_configs() {
        let store = test_db().await;
        let template = make_template();
        store.save_template(&template).await.unwrap();

        let fetched = store.get_template(template.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "bol-standard");
        assert_eq!(fetched.format, OutputFormat::Json);
        assert_eq!(fetched.delivery, DeliveryMode::Direct);
        assert_eq!(fetched.field_mappings.len(), 1);
        assert_eq!(fetched.field_mappings[0].path, "shipper.phone");
        assert_eq!(fetched.field_mappings[0].max_length, Some(12));
        assert!(fetched.field_mappings[0].remove_if_empty);
        assert_eq!(fetched.partner_route.as_deref(), Some("/api/orders"));
        assert_eq!(fetched.sequence_field.as_deref(), Some("orderId"));
    }

    #[tokio::test]
    async fn get_template_not_found() {
        let store = test_db().await;
        assert!(store.get_template(Uuid::new_v4()).await.unwrap().is_none());
    }

    // ── Settings blobs ──────────────────────────────────────────────

    #[tokio::test]
    async fn partner_settings_roundtrip() {
        let store = test_db().await;
        assert!(store.get_partner_settings().await.unwrap().is_none());

        store
            .save_partner_settings(&PartnerSettings {
                base_url: "https://partner.example.com".into(),
                api_key: SecretString::from("key-1"),
                token_route: Some("/auth/token".into()),
            })
            .await
            .unwrap();

        let fetched = store.get_partner_settings().await.unwrap().unwrap();
        assert_eq!(fetched.base_url, "https://partner.example.com");
        assert_eq!(fetched.api_key.expose_secret(), "key-1");
        assert_eq!(fetched.token_route.as_deref(), Some("/auth/token"));
    }

    #[tokio::test]
    async fn ai_settings_roundtrip() {
        let store = test_db().await;
        store
            .save_ai_settings(&AiSettings {
                model: "claude-sonnet-4".into(),
                api_key: SecretString::from("sk-test"),
                max_tokens: 8192,
            })
            .await
            .unwrap();

        let fetched = store.get_ai_settings().await.unwrap().unwrap();
        assert_eq!(fetched.model, "claude-sonnet-4");
        assert_eq!(fetched.max_tokens, 8192);
    }

    #[tokio::test]
    async fn workflow_settings_roundtrip() {
        let store = test_db().await;
        store
            .save_workflow_settings(&WorkflowSettings {
                endpoint: "https://flows.example.com/api/executions".into(),
                api_key: SecretString::from("flow-key"),
            })
            .await
            .unwrap();

        let fetched = store.get_workflow_settings().await.unwrap().unwrap();
        assert_eq!(fetched.endpoint, "https://flows.example.com/api/executions");
        assert_eq!(fetched.api_key.expose_secret(), "flow-key");
    }

    #[tokio::test]
    async fn transfer_settings_roundtrip() {
        let store = test_db().await;
        store
            .save_transfer_settings(&TransferSettings {
                base_url: "https://files.example.com".into(),
                api_key: SecretString::from("transfer-key"),
                pdf_upload_path: "/inbound/pdf".into(),
                markup_upload_path: "/inbound/markup".into(),
            })
            .await
            .unwrap();

        let fetched = store.get_transfer_settings().await.unwrap().unwrap();
        assert_eq!(fetched.pdf_upload_path, "/inbound/pdf");
        assert_eq!(fetched.markup_upload_path, "/inbound/markup");
    }

    // ── Sequence counter ────────────────────────────────────────────

    #[tokio::test]
    async fn sequence_ids_are_monotonic() {
        let store = test_db().await;
        assert_eq!(store.next_sequence_id().await.unwrap(), 1);
        assert_eq!(store.next_sequence_id().await.unwrap(), 2);
        assert_eq!(store.next_sequence_id().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn concurrent_sequence_ids_are_distinct() {
        let store = Arc::new(test_db().await);

        let (a, b, c) = tokio::join!(
            store.next_sequence_id(),
            store.next_sequence_id(),
            store.next_sequence_id()
        );

        let mut ids = vec![a.unwrap(), b.unwrap(), c.unwrap()];
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
