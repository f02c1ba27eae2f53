//! File-transfer gateway used to archive delivered documents.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::debug;

use crate::config::TransferSettings;
use crate::error::DeliveryError;

/// What an upload carries; selects the destination path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// The original emailed PDF.
    SourcePdf,
    /// Corrected markup produced by XML-family templates.
    CorrectedMarkup,
}

/// Opaque upload call onto the archive target.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    async fn upload(
        &self,
        kind: FileKind,
        filename: &str,
        bytes: &[u8],
    ) -> Result<(), DeliveryError>;
}

/// HTTP multipart gateway.
pub struct HttpFileTransfer {
    http: reqwest::Client,
    settings: TransferSettings,
}

impl HttpFileTransfer {
    pub fn new(settings: TransferSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn destination(&self, kind: FileKind) -> &str {
        match kind {
            FileKind::SourcePdf => &self.settings.pdf_upload_path,
            FileKind::CorrectedMarkup => &self.settings.markup_upload_path,
        }
    }
}

fn content_type(kind: FileKind) -> &'static str {
    match kind {
        FileKind::SourcePdf => "application/pdf",
        FileKind::CorrectedMarkup => "application/xml",
    }
}

#[async_trait]
impl FileTransfer for HttpFileTransfer {
    async fn upload(
        &self,
        kind: FileKind,
        filename: &str,
        bytes: &[u8],
    ) -> Result<(), DeliveryError> {
        let url = format!("{}{}", self.settings.base_url, self.destination(kind));
        let transfer_err = |reason: String| DeliveryError::Transfer {
            filename: filename.to_string(),
            reason,
        };

        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str(content_type(kind))
            .map_err(|e| transfer_err(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        debug!(filename, kind = ?kind, bytes = bytes.len(), "Uploading file");

        let response = self
            .http
            .post(&url)
            .header("x-api-key", self.settings.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| transfer_err(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(transfer_err(format!("HTTP {status}: {body}")));
        }
        Ok(())
    }
}
