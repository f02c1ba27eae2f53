//! Per-run collaborator construction.
//!
//! A run resolves its collaborators from stored settings during config
//! load, so configuration edits take effect on the next run without a
//! restart. The factory trait is the seam tests use to substitute canned
//! adapters for the real HTTP clients.

use std::sync::Arc;

use crate::auth::TokenCache;
use crate::config::{
    AiSettings, MailSettings, PartnerSettings, TransferSettings, WorkflowSettings,
};
use crate::deliver::{
    FileTransfer, HttpFileTransfer, HttpPartnerClient, HttpWorkflowEngine, PartnerGateway,
    WorkflowEngine,
};
use crate::error::ConfigError;
use crate::extract::{AnthropicExtractor, ExtractionModel};
use crate::mail::{self, MailProvider};

/// Builds the external-service adapters a run needs.
pub trait AdapterFactory: Send + Sync {
    fn mail(&self, settings: &MailSettings) -> Result<Arc<dyn MailProvider>, ConfigError>;

    fn model(&self, settings: &AiSettings) -> Arc<dyn ExtractionModel>;

    fn partner(&self, settings: &PartnerSettings) -> Arc<dyn PartnerGateway>;

    fn transfer(&self, settings: &TransferSettings) -> Arc<dyn FileTransfer>;

    fn workflow(&self, settings: &WorkflowSettings) -> Arc<dyn WorkflowEngine>;
}

/// Factory backed by the real HTTP adapters.
///
/// Holds the partner token cache, which outlives the per-run clients so
/// bearer tokens survive between runs.
pub struct HttpAdapterFactory {
    tokens: Arc<TokenCache>,
}

impl HttpAdapterFactory {
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(TokenCache::default()),
        }
    }
}

impl Default for HttpAdapterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterFactory for HttpAdapterFactory {
    fn mail(&self, settings: &MailSettings) -> Result<Arc<dyn MailProvider>, ConfigError> {
        mail::create_provider(settings)
    }

    fn model(&self, settings: &AiSettings) -> Arc<dyn ExtractionModel> {
        Arc::new(AnthropicExtractor::new(settings))
    }

    fn partner(&self, settings: &PartnerSettings) -> Arc<dyn PartnerGateway> {
        Arc::new(HttpPartnerClient::new(
            settings.clone(),
            Arc::clone(&self.tokens),
        ))
    }

    fn transfer(&self, settings: &TransferSettings) -> Arc<dyn FileTransfer> {
        Arc::new(HttpFileTransfer::new(settings.clone()))
    }

    fn workflow(&self, settings: &WorkflowSettings) -> Arc<dyn WorkflowEngine> {
        Arc::new(HttpWorkflowEngine::new(settings.clone()))
    }
}
