//! Run configuration.
//!
//! Everything a polling run needs is read from the record store at run
//! start: mailbox credentials and polling policy, partner and file-gateway
//! endpoints, and the active AI model. The host's own knobs (database path,
//! bind address) come from the environment.

use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::mail::{MailProviderKind, PostProcessAction};

/// Polling cadence when the stored settings give none.
pub const DEFAULT_POLL_INTERVAL_MINUTES: u32 = 5;

/// Mailbox access and polling policy for one monitored account.
#[derive(Debug, Clone)]
pub struct MailSettings {
    pub enabled: bool,
    pub provider: MailProviderKind,
    /// Mailbox address (Graph) or label (Gmail).
    pub mailbox: String,
    /// Directory tenant for Microsoft 365 mailboxes.
    pub tenant_id: Option<String>,
    pub client_id: String,
    pub client_secret: SecretString,
    /// OAuth refresh token for Gmail mailboxes.
    pub refresh_token: Option<SecretString>,
    pub poll_interval_minutes: u32,
    /// Ignore the last-check cutoff and consider every unread message.
    pub check_all_messages: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub success_action: PostProcessAction,
    pub success_folder: Option<String>,
    pub failure_action: PostProcessAction,
    pub failure_folder: Option<String>,
}

impl MailSettings {
    /// The received-after cutoff for the candidate listing, honoring the
    /// check-all override.
    pub fn effective_since(&self) -> Option<DateTime<Utc>> {
        if self.check_all_messages {
            None
        } else {
            self.last_check
        }
    }

    /// The housekeeping action and folder for an email's overall outcome.
    pub fn action_for_outcome(&self, success: bool) -> (PostProcessAction, Option<&str>) {
        if success {
            (self.success_action, self.success_folder.as_deref())
        } else {
            (self.failure_action, self.failure_folder.as_deref())
        }
    }

    /// Whether the polling interval has elapsed since the last check.
    /// A mailbox that has never been checked is always due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_check {
            None => true,
            Some(checked_at) => {
                now.signed_duration_since(checked_at)
                    >= chrono::Duration::minutes(i64::from(self.poll_interval_minutes))
            }
        }
    }
}

/// Partner delivery endpoint for direct-mode templates.
#[derive(Debug, Clone)]
pub struct PartnerSettings {
    pub base_url: String,
    pub api_key: SecretString,
    /// Token-exchange route under the base URL. When absent, the api key
    /// itself is presented as the bearer.
    pub token_route: Option<String>,
}

/// File-transfer gateway used for archiving.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub base_url: String,
    pub api_key: SecretString,
    /// Destination directory for source PDFs.
    pub pdf_upload_path: String,
    /// Destination directory for corrected markup output.
    pub markup_upload_path: String,
}

/// Workflow engine endpoint for workflow-mode templates.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    /// Full execution-start endpoint URL.
    pub endpoint: String,
    pub api_key: SecretString,
}

/// The active extraction model.
#[derive(Debug, Clone)]
pub struct AiSettings {
    pub model: String,
    pub api_key: SecretString,
    pub max_tokens: u32,
}

/// Host-process knobs, read from the environment with defaults.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub db_path: String,
    pub bind_addr: String,
    /// Directory for the daily-rolling log file; console only when unset.
    pub log_dir: Option<String>,
}

impl HostConfig {
    pub fn from_env() -> HostConfig {
        HostConfig {
            db_path: std::env::var("PARSEIT_DB_PATH").unwrap_or_else(|_| "parseit.db".to_string()),
            bind_addr: std::env::var("PARSEIT_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8085".to_string()),
            log_dir: std::env::var("PARSEIT_LOG_DIR").ok(),
        }
    }
}
