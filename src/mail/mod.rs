//! Mail provider adapters.
//!
//! One capability trait over two provider ecosystems: Microsoft 365 mail via
//! the Graph REST API and Gmail via the Gmail REST API. Adapters are stateless
//! beyond their HTTP client; `authenticate` runs fresh on every call with no
//! cross-run token caching, which keeps failure recovery trivial at the cost
//! of one token round-trip per run.

pub mod gmail;
pub mod graph;
pub mod pdf;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::MailSettings;
use crate::error::{AuthError, ConfigError, MailError};

/// A short-lived provider access token.
#[derive(Clone)]
pub struct AccessToken(SecretString);

impl AccessToken {
    pub fn new(raw: impl Into<String>) -> Self {
        AccessToken(SecretString::from(raw.into()))
    }

    /// The `Authorization` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0.expose_secret())
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(..)")
    }
}

/// Which mail ecosystem a mailbox lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailProviderKind {
    Graph,
    Gmail,
}

impl MailProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MailProviderKind::Graph => "graph",
            MailProviderKind::Gmail => "gmail",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_ascii_lowercase().as_str() {
            "graph" | "microsoft" | "outlook" => Ok(MailProviderKind::Graph),
            "gmail" | "google" => Ok(MailProviderKind::Gmail),
            other => Err(ConfigError::InvalidValue {
                key: "provider".into(),
                message: format!("unknown mail provider '{other}'"),
            }),
        }
    }
}

/// One candidate email, fetched fresh each run and never persisted as-is.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    /// Provider-native message id.
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
}

/// One downloaded PDF attachment, owned by the run that fetched it.
#[derive(Debug, Clone)]
pub struct PdfAttachment {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub page_count: u32,
}

/// Mutation applied to a source email after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProcessAction {
    None,
    MarkRead,
    MoveToFolder,
    Archive,
    Delete,
}

impl PostProcessAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostProcessAction::None => "none",
            PostProcessAction::MarkRead => "mark_read",
            PostProcessAction::MoveToFolder => "move_to_folder",
            PostProcessAction::Archive => "archive",
            PostProcessAction::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "none" => Ok(PostProcessAction::None),
            "mark_read" => Ok(PostProcessAction::MarkRead),
            "move_to_folder" => Ok(PostProcessAction::MoveToFolder),
            "archive" => Ok(PostProcessAction::Archive),
            "delete" => Ok(PostProcessAction::Delete),
            other => Err(ConfigError::InvalidValue {
                key: "post_process_action".into(),
                message: format!("unknown action '{other}'"),
            }),
        }
    }
}

/// Capability contract shared by both provider adapters.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Short provider tag used in logs and audit records.
    fn provider_name(&self) -> &'static str;

    /// Obtain a fresh access token. Runs per call; never cached.
    async fn authenticate(&self) -> Result<AccessToken, AuthError>;

    /// Unread messages with attachments, optionally limited to those
    /// received after `since`.
    async fn list_candidate_emails(
        &self,
        token: &AccessToken,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EmailMessage>, MailError>;

    async fn get_message_details(
        &self,
        token: &AccessToken,
        message_id: &str,
    ) -> Result<EmailMessage, MailError>;

    /// Download every attachment whose filename ends in `.pdf`, with page
    /// counts computed from the raw bytes.
    async fn find_pdf_attachments(
        &self,
        token: &AccessToken,
        message_id: &str,
    ) -> Result<Vec<PdfAttachment>, MailError>;

    /// Apply the configured housekeeping mutation. Move targets that do not
    /// exist yet are created.
    async fn apply_post_process_action(
        &self,
        token: &AccessToken,
        message_id: &str,
        action: PostProcessAction,
        folder: Option<&str>,
    ) -> Result<(), MailError>;
}

/// Build the adapter for the configured provider.
pub fn create_provider(settings: &MailSettings) -> Result<Arc<dyn MailProvider>, ConfigError> {
    match settings.provider {
        MailProviderKind::Graph => Ok(Arc::new(graph::GraphProvider::new(settings)?)),
        MailProviderKind::Gmail => Ok(Arc::new(gmail::GmailProvider::new(settings)?)),
    }
}

/// Case-insensitive `.pdf` suffix check used by both adapters.
pub fn is_pdf_filename(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".pdf")
}
