//! Partner API client for direct deliveries.
//!
//! The partner presents a bearer-token surface. When a token route is
//! configured the api key is exchanged for a short-lived bearer through the
//! shared [`TokenCache`]; otherwise the api key itself is presented.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::auth::TokenCache;
use crate::config::PartnerSettings;
use crate::error::{AuthError, DeliveryError};

/// Seam for direct-mode payload posts, mockable in tests.
#[async_trait]
pub trait PartnerGateway: Send + Sync {
    /// POST the corrected payload to `route` under the partner base URL.
    ///
    /// Returns the response body, which the caller records as the delivery
    /// reference.
    async fn post_payload(
        &self,
        route: &str,
        payload: &serde_json::Value,
    ) -> Result<String, DeliveryError>;
}

pub struct HttpPartnerClient {
    http: reqwest::Client,
    settings: PartnerSettings,
    tokens: Arc<TokenCache>,
}

impl HttpPartnerClient {
    pub fn new(settings: PartnerSettings, tokens: Arc<TokenCache>) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
            tokens,
        }
    }

    /// The bearer for the next request.
    async fn bearer(&self) -> Result<SecretString, AuthError> {
        let Some(route) = &self.settings.token_route else {
            return Ok(self.settings.api_key.clone());
        };

        let url = format!("{}{}", self.settings.base_url, route);
        let http = self.http.clone();
        let api_key = self.settings.api_key.clone();
        self.tokens
            .get_or_fetch(&self.settings.base_url, move || {
                fetch_token(http, url, api_key).boxed()
            })
            .await
    }
}

/// Exchange the api key for a bearer token at the partner's token route.
async fn fetch_token(
    http: reqwest::Client,
    url: String,
    api_key: SecretString,
) -> Result<SecretString, AuthError> {
    let response = http
        .post(&url)
        .json(&serde_json::json!({ "apiKey": api_key.expose_secret() }))
        .send()
        .await
        .map_err(|e| AuthError::TokenRequest {
            provider: "partner".into(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(AuthError::Rejected {
            provider: "partner".into(),
        });
    }
    if !status.is_success() {
        return Err(AuthError::TokenRequest {
            provider: "partner".into(),
            reason: format!("HTTP {status}"),
        });
    }

    let body: TokenResponse = response.json().await.map_err(|e| AuthError::TokenResponse {
        provider: "partner".into(),
        reason: e.to_string(),
    })?;
    Ok(SecretString::from(body.token))
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token", alias = "accessToken")]
    token: String,
}

#[async_trait]
impl PartnerGateway for HttpPartnerClient {
    async fn post_payload(
        &self,
        route: &str,
        payload: &serde_json::Value,
    ) -> Result<String, DeliveryError> {
        let bearer = self
            .bearer()
            .await
            .map_err(|e| DeliveryError::PartnerRequest {
                route: route.to_string(),
                reason: e.to_string(),
            })?;

        let url = format!("{}{}", self.settings.base_url, route);
        debug!(route, "Posting payload to partner");

        let response = self
            .http
            .post(&url)
            .bearer_auth(bearer.expose_secret())
            .json(payload)
            .send()
            .await
            .map_err(|e| DeliveryError::PartnerRequest {
                route: route.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            // The cached bearer may have expired server-side.
            self.tokens.invalidate(&self.settings.base_url).await;
        }
        if !status.is_success() {
            warn!(route, status = status.as_u16(), "Partner rejected payload");
            return Err(DeliveryError::PartnerRejected {
                route: route.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(body)
    }
}
