//! Keyed token cache with single-flight fetches.
//!
//! Partner tokens are expensive to mint and the pipeline may want one from
//! several attachments at once. The cache keeps one slot per key; concurrent
//! requests for the same key share a single in-flight fetch, and a token is
//! trusted without revalidation for a configurable window after the last
//! successful fetch.
//!
//! Slots lock independently, so a slow fetch for one key never blocks
//! another key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, Shared};
use secrecy::SecretString;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AuthError;

/// Default trust window for a cached token.
pub const DEFAULT_REVALIDATION_INTERVAL: Duration = Duration::from_secs(300);

type TokenFuture = Shared<BoxFuture<'static, Result<SecretString, AuthError>>>;

struct CachedToken {
    token: SecretString,
    last_validated: Instant,
}

#[derive(Default)]
struct TokenSlot {
    cached: Option<CachedToken>,
    in_flight: Option<TokenFuture>,
}

/// Single-flight token cache keyed by an arbitrary string (one key per
/// token-issuing endpoint).
pub struct TokenCache {
    revalidate_after: Duration,
    slots: Mutex<HashMap<String, Arc<Mutex<TokenSlot>>>>,
}

impl TokenCache {
    pub fn new(revalidate_after: Duration) -> Self {
        Self {
            revalidate_after,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached token for `key`, or run `fetch` to mint one.
    ///
    /// When a fetch is already in flight for the key, the caller awaits that
    /// same fetch instead of starting another. Failed fetches are never
    /// cached; the next caller retries.
    pub async fn get_or_fetch<F>(&self, key: &str, fetch: F) -> Result<SecretString, AuthError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<SecretString, AuthError>>,
    {
        let slot = self.slot(key).await;

        let future = {
            let mut slot = slot.lock().await;

            if let Some(cached) = &slot.cached
                && cached.last_validated.elapsed() < self.revalidate_after
            {
                return Ok(cached.token.clone());
            }

            match &slot.in_flight {
                Some(in_flight) => in_flight.clone(),
                None => {
                    debug!(key, "Fetching token");
                    let shared = futures::FutureExt::shared(fetch());
                    slot.in_flight = Some(shared.clone());
                    shared
                }
            }
        };

        let result = future.await;

        // Every waiter performs the same idempotent bookkeeping.
        let mut slot = slot.lock().await;
        slot.in_flight = None;
        if let Ok(token) = &result {
            slot.cached = Some(CachedToken {
                token: token.clone(),
                last_validated: Instant::now(),
            });
        }

        result
    }

    /// Drop the cached token for `key`, forcing the next caller to fetch.
    ///
    /// Called when a downstream request comes back 401 on a token we trusted.
    pub async fn invalidate(&self, key: &str) {
        let slot = self.slot(key).await;
        let mut slot = slot.lock().await;
        slot.cached = None;
        debug!(key, "Token invalidated");
    }

    async fn slot(&self, key: &str) -> Arc<Mutex<TokenSlot>> {
        let mut slots = self.slots.lock().await;
        slots.entry(key.to_string()).or_default().clone()
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(DEFAULT_REVALIDATION_INTERVAL)
    }
}
