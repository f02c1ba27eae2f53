//! Error types for ParseIt.

use thiserror::Error;

/// Top-level error type for the pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Mail provider error: {0}")]
    Mail(#[from] MailError),

    #[error("AI extraction error: {0}")]
    Ai(#[from] AiError),

    #[error("Result processing error: {0}")]
    Process(#[from] ProcessError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration-related errors. Always fatal for the run that hit them.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required setting: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Credential acquisition errors. Fatal: without a token nothing downstream
/// can run.
///
/// `Clone` because token fetches are shared between concurrent waiters, and
/// every waiter gets the same outcome.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("Token request to {provider} failed: {reason}")]
    TokenRequest { provider: String, reason: String },

    #[error("Token response from {provider} malformed: {reason}")]
    TokenResponse { provider: String, reason: String },

    #[error("Credentials rejected by {provider}")]
    Rejected { provider: String },
}

/// Mail provider errors.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} returned malformed data: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Attachment {filename} could not be downloaded: {reason}")]
    AttachmentFetch { filename: String, reason: String },

    #[error("Attachment content could not be decoded: {0}")]
    Decode(String),

    #[error("Post-process action {action} failed for message {message_id}: {reason}")]
    PostProcess {
        action: String,
        message_id: String,
        reason: String,
    },
}

/// AI model call errors.
#[derive(Debug, Error)]
pub enum AiError {
    #[error("Model request failed: {0}")]
    RequestFailed(String),

    #[error("Model response malformed: {0}")]
    InvalidResponse(String),

    #[error("Model returned no usable content")]
    EmptyResponse,
}

/// Extraction result processing errors. Per-attachment: one bad result never
/// aborts the rest of the run.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("invalid XML format")]
    InvalidXml,

    #[error("Model output is not parseable as {format}: {reason}")]
    Format { format: String, reason: String },

    #[error("Field path {path} is malformed: {reason}")]
    BadPath { path: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Delivery errors. Per-attachment, like [`ProcessError`].
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Partner endpoint {route} rejected the payload: {status} {body}")]
    PartnerRejected {
        route: String,
        status: u16,
        body: String,
    },

    #[error("Partner request to {route} failed: {reason}")]
    PartnerRequest { route: String, reason: String },

    #[error("File transfer of {filename} failed: {reason}")]
    Transfer { filename: String, reason: String },

    #[error("Workflow handoff failed: {0}")]
    Workflow(String),

    #[error("Template {template} declares no partner route for direct delivery")]
    MissingRoute { template: String },

    #[error("Sequence id could not be drawn: {0}")]
    Sequence(String),
}

/// Record store errors. The orchestrator logs audit-write failures and keeps
/// going; everything else treats these as hard errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
