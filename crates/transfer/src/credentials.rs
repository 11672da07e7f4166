//! Temporary credential cache shared across upload sessions.
//!
//! One cached credential set per endpoint. Concurrent callers that miss
//! the cache while a fetch is running all await that same fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use partwise_storage::{CredentialProvider, Credentials};
use tracing::debug;

use crate::config::TransferConfig;
use crate::error::ClassifiedError;

type SharedFetch = Shared<BoxFuture<'static, Result<Credentials, ClassifiedError>>>;

#[derive(Default)]
struct Entry {
    cached: Option<Credentials>,
    inflight: Option<(u64, SharedFetch)>,
}

/// Deduplicating credential cache.
pub struct CredentialCache {
    provider: Arc<dyn CredentialProvider>,
    margin: chrono::Duration,
    entries: Mutex<HashMap<String, Entry>>,
    generation: AtomicU64,
}

impl CredentialCache {
    /// Credentials within `margin` of their expiry are refetched.
    pub fn new(provider: Arc<dyn CredentialProvider>, margin: chrono::Duration) -> Self {
        Self {
            provider,
            margin,
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Uses the expiry margin from `config`.
    pub fn from_config(provider: Arc<dyn CredentialProvider>, config: &TransferConfig) -> Self {
        Self::new(provider, config.credential_margin())
    }

    /// Returns credentials for `endpoint`, fetching them if the cached set
    /// is missing, close to expiry, or `force_refresh` is set.
    pub async fn get(
        &self,
        endpoint: &str,
        force_refresh: bool,
    ) -> Result<Credentials, ClassifiedError> {
        let (generation, fetch) = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(endpoint.to_string()).or_default();

            if !force_refresh
                && let Some(creds) = &entry.cached
                && creds.is_fresh(self.margin)
            {
                return Ok(creds.clone());
            }

            match &entry.inflight {
                Some((generation, fetch)) => (*generation, fetch.clone()),
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    debug!(endpoint, generation, force_refresh, "fetching credentials");
                    let fetch = self.start_fetch(endpoint);
                    entry.inflight = Some((generation, fetch.clone()));
                    (generation, fetch)
                }
            }
        };

        let result = fetch.await;

        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(endpoint)
            && entry
                .inflight
                .as_ref()
                .is_some_and(|(current, _)| *current == generation)
        {
            entry.inflight = None;
            if let Ok(creds) = &result {
                entry.cached = Some(creds.clone());
            }
        }
        result
    }

    /// Drops the cached set for `endpoint`.
    pub fn invalidate(&self, endpoint: &str) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(endpoint) {
            entry.cached = None;
        }
    }

    fn start_fetch(&self, endpoint: &str) -> SharedFetch {
        let provider = Arc::clone(&self.provider);
        let endpoint = endpoint.to_string();
        async move {
            provider
                .fetch(&endpoint)
                .await
                .map_err(ClassifiedError::from)
        }
        .boxed()
        .shared()
    }
}

/// A cache bound to the endpoint one engine uploads to.
#[derive(Clone)]
pub struct CredentialBinding {
    pub cache: Arc<CredentialCache>,
    pub endpoint: String,
}

impl CredentialBinding {
    pub fn new(cache: Arc<CredentialCache>, endpoint: impl Into<String>) -> Self {
        Self {
            cache,
            endpoint: endpoint.into(),
        }
    }

    pub async fn get(&self, force_refresh: bool) -> Result<Credentials, ClassifiedError> {
        self.cache.get(&self.endpoint, force_refresh).await
    }
}
