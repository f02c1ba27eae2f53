//! Microsoft 365 mail adapter over the Graph REST API.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::MailSettings;
use crate::error::{AuthError, ConfigError, MailError};
use crate::mail::{
    AccessToken, EmailMessage, MailProvider, PdfAttachment, PostProcessAction, is_pdf_filename,
    pdf,
};

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
const LOGIN_BASE: &str = "https://login.microsoftonline.com";
/// Upper bound per listing request; anything beyond is picked up next run.
const LIST_PAGE_SIZE: u32 = 50;

/// Adapter for one monitored Microsoft 365 mailbox, authenticating with
/// client credentials against the directory tenant.
pub struct GraphProvider {
    http: reqwest::Client,
    tenant_id: String,
    client_id: String,
    client_secret: SecretString,
    mailbox: String,
}

impl GraphProvider {
    pub fn new(settings: &MailSettings) -> Result<Self, ConfigError> {
        let tenant_id = settings
            .tenant_id
            .clone()
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "tenant_id".into(),
                hint: "Microsoft 365 mailboxes need the directory tenant id".into(),
            })?;
        Ok(GraphProvider {
            http: reqwest::Client::new(),
            tenant_id,
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            mailbox: settings.mailbox.clone(),
        })
    }

    fn mailbox_url(&self, tail: &str) -> String {
        format!("{GRAPH_BASE}/users/{}/{tail}", self.mailbox)
    }

    fn request_err(&self, reason: impl Into<String>) -> MailError {
        MailError::RequestFailed {
            provider: "graph".into(),
            reason: reason.into(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        token: &AccessToken,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, MailError> {
        let resp = self
            .http
            .get(url)
            .query(query)
            .header("Authorization", token.bearer())
            .send()
            .await
            .map_err(|e| self.request_err(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(self.request_err(format!("GET {url} -> {status}: {body}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| MailError::InvalidResponse {
                provider: "graph".into(),
                reason: e.to_string(),
            })
    }

    async fn send_mutation(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<(), MailError> {
        let resp = request
            .send()
            .await
            .map_err(|e| self.request_err(format!("{what}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(self.request_err(format!("{what} -> {status}: {body}")));
        }
        Ok(())
    }

    /// Look up a mail folder by display name under the mailbox, creating it
    /// when absent. Returns the folder id.
    async fn ensure_folder(&self, token: &AccessToken, name: &str) -> Result<String, MailError> {
        let escaped = name.replace('\'', "''");
        let url = self.mailbox_url("mailFolders");
        let list: FolderList = self
            .get_json(
                token,
                &url,
                &[("$filter", format!("displayName eq '{escaped}'"))],
            )
            .await?;
        if let Some(folder) = list.value.into_iter().next() {
            return Ok(folder.id);
        }

        debug!(folder = %name, "Creating mail folder");
        let resp = self
            .http
            .post(&url)
            .header("Authorization", token.bearer())
            .json(&serde_json::json!({ "displayName": name }))
            .send()
            .await
            .map_err(|e| self.request_err(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(self.request_err(format!("create folder -> {status}: {body}")));
        }
        let folder: Folder = resp.json().await.map_err(|e| MailError::InvalidResponse {
            provider: "graph".into(),
            reason: e.to_string(),
        })?;
        Ok(folder.id)
    }

    async fn move_to(&self, token: &AccessToken, message_id: &str, destination_id: &str) -> Result<(), MailError> {
        let url = self.mailbox_url(&format!("messages/{message_id}/move"));
        self.send_mutation(
            self.http
                .post(&url)
                .header("Authorization", token.bearer())
                .json(&serde_json::json!({ "destinationId": destination_id })),
            "move message",
        )
        .await
    }
}

#[async_trait]
impl MailProvider for GraphProvider {
    fn provider_name(&self) -> &'static str {
        "graph"
    }

    async fn authenticate(&self) -> Result<AccessToken, AuthError> {
        let url = format!("{LOGIN_BASE}/{}/oauth2/v2.0/token", self.tenant_id);
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("scope", "https://graph.microsoft.com/.default"),
            ("grant_type", "client_credentials"),
        ];
        let resp = self
            .http
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::TokenRequest {
                provider: "graph".into(),
                reason: e.to_string(),
            })?;
        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(AuthError::Rejected {
                provider: "graph".into(),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::TokenRequest {
                provider: "graph".into(),
                reason: format!("{status}: {body}"),
            });
        }
        let token: TokenResponse = resp.json().await.map_err(|e| AuthError::TokenResponse {
            provider: "graph".into(),
            reason: e.to_string(),
        })?;
        Ok(AccessToken::new(token.access_token))
    }

    async fn list_candidate_emails(
        &self,
        token: &AccessToken,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EmailMessage>, MailError> {
        let url = self.mailbox_url("mailFolders/inbox/messages");
        let query = [
            ("$filter", list_filter(since)),
            ("$select", "id,subject,from,receivedDateTime".to_string()),
            ("$top", LIST_PAGE_SIZE.to_string()),
        ];
        let list: MessageList = self.get_json(token, &url, &query).await?;
        Ok(list.value.into_iter().map(EmailMessage::from).collect())
    }

    async fn get_message_details(
        &self,
        token: &AccessToken,
        message_id: &str,
    ) -> Result<EmailMessage, MailError> {
        let url = self.mailbox_url(&format!("messages/{message_id}"));
        let query = [("$select", "id,subject,from,receivedDateTime".to_string())];
        let message: GraphMessage = self.get_json(token, &url, &query).await?;
        Ok(message.into())
    }

    async fn find_pdf_attachments(
        &self,
        token: &AccessToken,
        message_id: &str,
    ) -> Result<Vec<PdfAttachment>, MailError> {
        let url = self.mailbox_url(&format!("messages/{message_id}/attachments"));
        let list: AttachmentList = self.get_json(token, &url, &[]).await?;

        let mut attachments = Vec::new();
        for raw in list.value {
            if !is_pdf_filename(&raw.name) {
                continue;
            }
            let Some(content) = raw.content_bytes else {
                // Item and reference attachments carry no inline bytes.
                debug!(filename = %raw.name, "Skipping attachment without inline content");
                continue;
            };
            let bytes = BASE64_STANDARD
                .decode(content.as_bytes())
                .map_err(|e| MailError::Decode(format!("{}: {e}", raw.name)))?;
            let page_count = pdf::page_count(&bytes);
            attachments.push(PdfAttachment {
                filename: raw.name,
                bytes,
                page_count,
            });
        }
        Ok(attachments)
    }

    async fn apply_post_process_action(
        &self,
        token: &AccessToken,
        message_id: &str,
        action: PostProcessAction,
        folder: Option<&str>,
    ) -> Result<(), MailError> {
        let wrap = |e: MailError| MailError::PostProcess {
            action: action.as_str().into(),
            message_id: message_id.into(),
            reason: e.to_string(),
        };
        match action {
            PostProcessAction::None => Ok(()),
            PostProcessAction::MarkRead => {
                let url = self.mailbox_url(&format!("messages/{message_id}"));
                self.send_mutation(
                    self.http
                        .patch(&url)
                        .header("Authorization", token.bearer())
                        .json(&serde_json::json!({ "isRead": true })),
                    "mark read",
                )
                .await
                .map_err(wrap)
            }
            PostProcessAction::MoveToFolder => {
                let Some(name) = folder else {
                    warn!(message_id = %message_id, "Move action configured without a folder");
                    return Ok(());
                };
                let destination = self.ensure_folder(token, name).await.map_err(wrap)?;
                self.move_to(token, message_id, &destination).await.map_err(wrap)
            }
            PostProcessAction::Archive => self
                .move_to(token, message_id, "archive")
                .await
                .map_err(wrap),
            PostProcessAction::Delete => {
                let url = self.mailbox_url(&format!("messages/{message_id}"));
                self.send_mutation(
                    self.http
                        .delete(&url)
                        .header("Authorization", token.bearer()),
                    "delete message",
                )
                .await
                .map_err(wrap)
            }
        }
    }
}

/// OData filter for the candidate listing.
fn list_filter(since: Option<DateTime<Utc>>) -> String {
    let mut filter = String::from("isRead eq false and hasAttachments eq true");
    if let Some(ts) = since {
        filter.push_str(" and receivedDateTime gt ");
        filter.push_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    filter
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    value: Vec<GraphMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    from: Option<GraphRecipient>,
    #[serde(default)]
    received_date_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    #[serde(default)]
    email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    #[serde(default)]
    address: String,
}

impl From<GraphMessage> for EmailMessage {
    fn from(m: GraphMessage) -> Self {
        EmailMessage {
            id: m.id,
            sender: m
                .from
                .and_then(|r| r.email_address)
                .map(|a| a.address)
                .unwrap_or_default(),
            subject: m.subject.unwrap_or_default(),
            received_at: m.received_date_time.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AttachmentList {
    #[serde(default)]
    value: Vec<GraphAttachment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphAttachment {
    #[serde(default)]
    name: String,
    #[serde(default)]
    content_bytes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FolderList {
    #[serde(default)]
    value: Vec<Folder>,
}

#[derive(Debug, Deserialize)]
struct Folder {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_without_since_checks_unread_with_attachments() {
        assert_eq!(
            list_filter(None),
            "isRead eq false and hasAttachments eq true"
        );
    }

    #[test]
    fn filter_with_since_appends_received_bound() {
        let since = "2024-06-01T10:30:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(
            list_filter(Some(since)),
            "isRead eq false and hasAttachments eq true and receivedDateTime gt 2024-06-01T10:30:00Z"
        );
    }

    #[test]
    fn message_wire_shape_converts() {
        let raw = r#"{
            "id": "AAMkAG=",
            "subject": "PO 4411",
            "from": {"emailAddress": {"address": "orders@acme.com", "name": "ACME Orders"}},
            "receivedDateTime": "2024-06-01T10:30:00Z"
        }"#;
        let parsed: GraphMessage = serde_json::from_str(raw).unwrap();
        let msg = EmailMessage::from(parsed);
        assert_eq!(msg.id, "AAMkAG=");
        assert_eq!(msg.sender, "orders@acme.com");
        assert_eq!(msg.subject, "PO 4411");
        assert_eq!(msg.received_at.to_rfc3339(), "2024-06-01T10:30:00+00:00");
    }

    #[test]
    fn message_without_sender_or_subject_converts_empty() {
        let parsed: GraphMessage = serde_json::from_str(r#"{"id": "x"}"#).unwrap();
        let msg = EmailMessage::from(parsed);
        assert_eq!(msg.sender, "");
        assert_eq!(msg.subject, "");
    }

    #[test]
    fn attachment_list_parses_content_bytes() {
        let raw = r##"{"value": [
            {"@odata.type": "#microsoft.graph.fileAttachment", "name": "bol.pdf", "contentBytes": "JVBERg=="},
            {"@odata.type": "#microsoft.graph.itemAttachment", "name": "fwd.eml"}
        ]}"##;
        let list: AttachmentList = serde_json::from_str(raw).unwrap();
        assert_eq!(list.value.len(), 2);
        assert_eq!(list.value[0].name, "bol.pdf");
        assert_eq!(list.value[0].content_bytes.as_deref(), Some("JVBERg=="));
        assert!(list.value[1].content_bytes.is_none());
    }
}
