//! Extraction model client.
//!
//! The model receives the PDF itself plus the rendered prompt and returns
//! the raw completion text. Parsing and repair happen downstream, so this
//! layer stays a thin transport wrapper behind the `ExtractionModel` trait.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AiSettings;
use crate::error::AiError;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const PDF_MEDIA_TYPE: &str = "application/pdf";

// ── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over the document-understanding model so the pipeline can be
/// driven by a mock in tests.
#[async_trait]
pub trait ExtractionModel: Send + Sync {
    /// Submit one PDF with its prompt and return the raw completion text.
    async fn extract(
        &self,
        document: &[u8],
        filename: &str,
        prompt: &str,
    ) -> Result<String, AiError>;
}

// ── Anthropic client ────────────────────────────────────────────────────────

/// Calls the Anthropic Messages API with the PDF attached as a base64
/// document block.
pub struct AnthropicExtractor {
    http: reqwest::Client,
    model: String,
    api_key: SecretString,
    max_tokens: u32,
}

impl AnthropicExtractor {
    pub fn new(settings: &AiSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
            max_tokens: settings.max_tokens,
        }
    }
}

#[async_trait]
impl ExtractionModel for AnthropicExtractor {
    async fn extract(
        &self,
        document: &[u8],
        filename: &str,
        prompt: &str,
    ) -> Result<String, AiError> {
        debug!(
            filename,
            model = %self.model,
            document_bytes = document.len(),
            "Requesting extraction"
        );

        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![RequestMessage {
                role: "user",
                content: vec![
                    ContentBlock::Document {
                        source: DocumentSource {
                            source_type: "base64",
                            media_type: PDF_MEDIA_TYPE,
                            data: BASE64_STANDARD.encode(document),
                        },
                    },
                    ContentBlock::Text { text: prompt },
                ],
            }],
        };

        let response = self
            .http
            .post(MESSAGES_URL)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| AiError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::RequestFailed(format!("{status}: {body}")));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| AiError::InvalidResponse(e.to_string()))?;

        let text = collect_text(&parsed);
        if text.trim().is_empty() {
            return Err(AiError::EmptyResponse);
        }

        debug!(filename, response_chars = text.len(), "Extraction complete");
        Ok(text)
    }
}

/// Concatenate the text blocks of a completion, ignoring any other block kinds.
fn collect_text(response: &MessagesResponse) -> String {
    response
        .content
        .iter()
        .filter(|block| block.block_type == "text")
        .map(|block| block.text.as_str())
        .collect()
}

// ── Wire types ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<RequestMessage<'a>>,
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'static str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock<'a> {
    Document { source: DocumentSource<'a> },
    Text { text: &'a str },
}

#[derive(Serialize)]
struct DocumentSource<'a> {
    #[serde(rename = "type")]
    source_type: &'static str,
    media_type: &'a str,
    data: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type", default)]
    block_type: String,
    #[serde(default)]
    text: String,
}
