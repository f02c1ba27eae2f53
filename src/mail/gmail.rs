//! Gmail adapter over the Gmail REST API.
//!
//! Authenticates with an OAuth refresh-token grant for the monitored
//! account; the `mailbox` setting names an optional label restricting the
//! search. Gmail has no folders, so move targets become labels and archive
//! means dropping `INBOX`.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::config::MailSettings;
use crate::error::{AuthError, ConfigError, MailError};
use crate::mail::{
    AccessToken, EmailMessage, MailProvider, PdfAttachment, PostProcessAction, is_pdf_filename,
    pdf,
};

const GMAIL_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const LIST_PAGE_SIZE: u32 = 50;

pub struct GmailProvider {
    http: reqwest::Client,
    client_id: String,
    client_secret: SecretString,
    refresh_token: SecretString,
    /// Label restricting the search; empty means the whole mailbox.
    label: String,
}

impl GmailProvider {
    pub fn new(settings: &MailSettings) -> Result<Self, ConfigError> {
        let refresh_token =
            settings
                .refresh_token
                .clone()
                .ok_or_else(|| ConfigError::MissingRequired {
                    key: "refresh_token".into(),
                    hint: "Gmail mailboxes need an OAuth refresh token".into(),
                })?;
        Ok(GmailProvider {
            http: reqwest::Client::new(),
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            refresh_token,
            label: settings.mailbox.clone(),
        })
    }

    fn request_err(&self, reason: impl Into<String>) -> MailError {
        MailError::RequestFailed {
            provider: "gmail".into(),
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
                provider: "gmail".into(),
                reason: e.to_string(),
            })
    }

    async fn post_ok(
        &self,
        token: &AccessToken,
        url: &str,
        body: &serde_json::Value,
        what: &str,
    ) -> Result<(), MailError> {
        let resp = self
            .http
            .post(url)
            .header("Authorization", token.bearer())
            .json(body)
            .send()
            .await
            .map_err(|e| self.request_err(format!("{what}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(self.request_err(format!("{what} -> {status}: {text}")));
        }
        Ok(())
    }

    async fn fetch_message(
        &self,
        token: &AccessToken,
        message_id: &str,
        format: &str,
    ) -> Result<GmailMessage, MailError> {
        let url = format!("{GMAIL_BASE}/messages/{message_id}");
        let mut query = vec![("format", format.to_string())];
        if format == "metadata" {
            query.push(("metadataHeaders", "From".to_string()));
            query.push(("metadataHeaders", "Subject".to_string()));
        }
        self.get_json(token, &url, &query).await
    }

    async fn modify_labels(
        &self,
        token: &AccessToken,
        message_id: &str,
        add: &[&str],
        remove: &[&str],
    ) -> Result<(), MailError> {
        let url = format!("{GMAIL_BASE}/messages/{message_id}/modify");
        self.post_ok(
            token,
            &url,
            &serde_json::json!({ "addLabelIds": add, "removeLabelIds": remove }),
            "modify labels",
        )
        .await
    }

    /// Look up a user label by name, creating it when absent. Returns the
    /// label id.
    async fn ensure_label(&self, token: &AccessToken, name: &str) -> Result<String, MailError> {
        let url = format!("{GMAIL_BASE}/labels");
        let list: LabelList = self.get_json(token, &url, &[]).await?;
        if let Some(label) = list.labels.into_iter().find(|l| l.name == name) {
            return Ok(label.id);
        }

        debug!(label = %name, "Creating label");
        let resp = self
            .http
            .post(&url)
            .header("Authorization", token.bearer())
            .json(&serde_json::json!({
                "name": name,
                "labelListVisibility": "labelShow",
                "messageListVisibility": "show",
            }))
            .send()
            .await
            .map_err(|e| self.request_err(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(self.request_err(format!("create label -> {status}: {body}")));
        }
        let label: Label = resp.json().await.map_err(|e| MailError::InvalidResponse {
            provider: "gmail".into(),
            reason: e.to_string(),
        })?;
        Ok(label.id)
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn provider_name(&self) -> &'static str {
        "gmail"
    }

    async fn authenticate(&self) -> Result<AccessToken, AuthError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("refresh_token", self.refresh_token.expose_secret()),
            ("grant_type", "refresh_token"),
        ];
        let resp = self
            .http
            .post(TOKEN_URL)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::TokenRequest {
                provider: "gmail".into(),
                reason: e.to_string(),
            })?;
        let status = resp.status();
        if status.as_u16() == 400 || status.as_u16() == 401 {
            return Err(AuthError::Rejected {
                provider: "gmail".into(),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::TokenRequest {
                provider: "gmail".into(),
                reason: format!("{status}: {body}"),
            });
        }
        let token: TokenResponse = resp.json().await.map_err(|e| AuthError::TokenResponse {
            provider: "gmail".into(),
            reason: e.to_string(),
        })?;
        Ok(AccessToken::new(token.access_token))
    }

    async fn list_candidate_emails(
        &self,
        token: &AccessToken,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EmailMessage>, MailError> {
        let label = (!self.label.is_empty()).then_some(self.label.as_str());
        let url = format!("{GMAIL_BASE}/messages");
        let query = [
            ("q", search_query(label, since)),
            ("maxResults", LIST_PAGE_SIZE.to_string()),
        ];
        let ids: MessageIdList = self.get_json(token, &url, &query).await?;

        let mut messages = Vec::with_capacity(ids.messages.len());
        for m in ids.messages {
            let details = self.fetch_message(token, &m.id, "metadata").await?;
            messages.push(details.into());
        }
        Ok(messages)
    }

    async fn get_message_details(
        &self,
        token: &AccessToken,
        message_id: &str,
    ) -> Result<EmailMessage, MailError> {
        let message = self.fetch_message(token, message_id, "metadata").await?;
        Ok(message.into())
    }

    async fn find_pdf_attachments(
        &self,
        token: &AccessToken,
        message_id: &str,
    ) -> Result<Vec<PdfAttachment>, MailError> {
        let message = self.fetch_message(token, message_id, "full").await?;
        let mut parts = Vec::new();
        if let Some(payload) = &message.payload {
            collect_pdf_parts(payload, &mut parts);
        }

        let mut attachments = Vec::with_capacity(parts.len());
        for (filename, content) in parts {
            let data = match content {
                PartContent::Inline(data) => data,
                PartContent::Reference(attachment_id) => {
                    let url =
                        format!("{GMAIL_BASE}/messages/{message_id}/attachments/{attachment_id}");
                    let body: AttachmentBody = self.get_json(token, &url, &[]).await?;
                    body.data.ok_or_else(|| MailError::AttachmentFetch {
                        filename: filename.clone(),
                        reason: "attachment body carried no data".into(),
                    })?
                }
            };
            let bytes = decode_web_safe(&data)
                .map_err(|e| MailError::Decode(format!("{filename}: {e}")))?;
            let page_count = pdf::page_count(&bytes);
            attachments.push(PdfAttachment {
                filename,
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
            PostProcessAction::MarkRead => self
                .modify_labels(token, message_id, &[], &["UNREAD"])
                .await
                .map_err(wrap),
            PostProcessAction::MoveToFolder => {
                let Some(name) = folder else {
                    debug!(message_id = %message_id, "Move action configured without a label");
                    return Ok(());
                };
                let label_id = self.ensure_label(token, name).await.map_err(wrap)?;
                self.modify_labels(token, message_id, &[label_id.as_str()], &["INBOX"])
                    .await
                    .map_err(wrap)
            }
            PostProcessAction::Archive => self
                .modify_labels(token, message_id, &[], &["INBOX"])
                .await
                .map_err(wrap),
            PostProcessAction::Delete => {
                let url = format!("{GMAIL_BASE}/messages/{message_id}/trash");
                self.post_ok(token, &url, &serde_json::json!({}), "trash message")
                    .await
                    .map_err(wrap)
            }
        }
    }
}

/// Gmail search query for the candidate listing. `after:` takes epoch
/// seconds.
fn search_query(label: Option<&str>, since: Option<DateTime<Utc>>) -> String {
    let mut q = String::from("is:unread has:attachment");
    if let Some(label) = label {
        q.push_str(&format!(" label:{label}"));
    }
    if let Some(ts) = since {
        q.push_str(&format!(" after:{}", ts.timestamp()));
    }
    q
}

/// `"Name <addr>"` header forms collapse to the bare address.
fn parse_address(raw: &str) -> String {
    if let (Some(start), Some(end)) = (raw.find('<'), raw.rfind('>'))
        && end > start
    {
        return raw[start + 1..end].trim().to_string();
    }
    raw.trim().to_string()
}

/// Decode Gmail's web-safe base64, padded or not.
fn decode_web_safe(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(data.trim_end_matches('='))
}

enum PartContent {
    Inline(String),
    Reference(String),
}

fn collect_pdf_parts(part: &MessagePart, out: &mut Vec<(String, PartContent)>) {
    if is_pdf_filename(&part.filename)
        && let Some(body) = &part.body
    {
        if let Some(data) = &body.data {
            out.push((part.filename.clone(), PartContent::Inline(data.clone())));
        } else if let Some(id) = &body.attachment_id {
            out.push((part.filename.clone(), PartContent::Reference(id.clone())));
        }
    }
    for child in &part.parts {
        collect_pdf_parts(child, out);
    }
}

fn header_value<'a>(part: &'a MessagePart, name: &str) -> Option<&'a str> {
    part.headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct MessageIdList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    /// Epoch milliseconds, as a string.
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<MessagePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    filename: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartBody {
    #[serde(default)]
    attachment_id: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachmentBody {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
struct Label {
    id: String,
    name: String,
}

impl From<GmailMessage> for EmailMessage {
    fn from(m: GmailMessage) -> Self {
        let received_at = m
            .internal_date
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        let (sender, subject) = match &m.payload {
            Some(payload) => (
                header_value(payload, "From")
                    .map(parse_address)
                    .unwrap_or_default(),
                header_value(payload, "Subject")
                    .unwrap_or_default()
                    .to_string(),
            ),
            None => (String::new(), String::new()),
        };
        EmailMessage {
            id: m.id,
            sender,
            subject,
            received_at,
        }
    }
}
