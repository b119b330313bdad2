//! Fetch coordination: cache lookup, request coalescing and route selection.
//!
//! A resolve goes through three gates. A fresh, resolved cache entry answers
//! immediately. Otherwise the caller joins the single in-flight fetch for the
//! post (or starts it). The leader re-checks the cache, fetches through the
//! configured route, normalizes media hosts, and writes the result back
//! before waking the followers.
//!
//! Unresolved results are never cached.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::extract::Extractor;
use crate::flight::SingleFlight;
use crate::origin::Origin;
use crate::store::CacheStore;
use crate::types::{validate_post_id, FetchError, FetchResult, PostRecord};

/// Media host every stored URL is rewritten to.
pub const DEFAULT_MEDIA_HOST: &str = "scontent.cdninstagram.com";

/// Anything that can produce a post record for an id.
#[async_trait]
pub trait PostSource: Send + Sync {
    async fn fetch_post(&self, post_id: &str) -> FetchResult<PostRecord>;
}

/// Fetch and extract in this process.
pub struct LocalFetcher {
    origin: Arc<dyn Origin>,
    extractor: Extractor,
}

impl LocalFetcher {
    pub fn new(origin: Arc<dyn Origin>, extractor: Extractor) -> Self {
        Self { origin, extractor }
    }
}

#[async_trait]
impl PostSource for LocalFetcher {
    async fn fetch_post(&self, post_id: &str) -> FetchResult<PostRecord> {
        // A dead embed endpoint still leaves the structured query; the
        // document strategies fall through on an empty body.
        let document = match self.origin.fetch_document(post_id).await {
            Ok(document) => document,
            Err(FetchError::Transport(e)) => {
                warn!(post_id, error = %e, "embed document unavailable, extracting without it");
                String::new()
            }
            Err(e) => return Err(e),
        };
        self.extractor
            .extract(post_id, &document, self.origin.as_ref())
            .await
    }
}

/// Which side fetches, and in what order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchRoute {
    LocalOnly,
    #[default]
    LocalThenRemote,
    RemoteThenLocal,
    RemoteOnly,
}

impl FromStr for FetchRoute {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-only" | "local" => Ok(Self::LocalOnly),
            "local-then-remote" => Ok(Self::LocalThenRemote),
            "remote-then-local" => Ok(Self::RemoteThenLocal),
            "remote-only" | "remote" => Ok(Self::RemoteOnly),
            other => Err(format!(
                "unknown route {other:?} (expected local-only, local-then-remote, remote-then-local, remote-only)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Lifetime of a cached record.
    pub ttl: Duration,
    pub route: FetchRoute,
    /// Host media URLs are rewritten to; `None` keeps them untouched.
    pub media_host: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            route: FetchRoute::default(),
            media_host: Some(DEFAULT_MEDIA_HOST.to_string()),
        }
    }
}

/// Entry point for resolving posts. Cheap to clone.
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<CacheStore>,
    local: Arc<dyn PostSource>,
    remote: Option<Arc<dyn PostSource>>,
    flights: SingleFlight<String, PostRecord, FetchError>,
    config: CoordinatorConfig,
}

impl FetchCoordinator {
    pub fn new(
        store: Arc<CacheStore>,
        local: Arc<dyn PostSource>,
        remote: Option<Arc<dyn PostSource>>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                local,
                remote,
                flights: SingleFlight::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    /// Number of posts currently being fetched.
    pub fn in_flight(&self) -> usize {
        self.inner.flights.in_flight()
    }

    /// Resolve a post from cache or by fetching it.
    pub async fn resolve(&self, post_id: &str) -> FetchResult<PostRecord> {
        validate_post_id(post_id)?;

        if let Some(record) = self.inner.cached(post_id).await {
            debug!(post_id, "cache hit");
            return Ok(record);
        }

        let inner = Arc::clone(&self.inner);
        let id = post_id.to_string();
        self.inner
            .flights
            .run(post_id.to_string(), move || async move { inner.lead(id).await })
            .await
    }
}

impl Inner {
    /// Fresh, resolved cache entry. Read failures count as a miss.
    async fn cached(&self, post_id: &str) -> Option<PostRecord> {
        let store = Arc::clone(&self.store);
        let id = post_id.to_string();
        let lookup = tokio::task::spawn_blocking(move || store.get(&id)).await;

        match lookup {
            Ok(Ok(Some(cached))) if !cached.is_expired(Utc::now()) && cached.record.is_resolved() => {
                Some(cached.record)
            }
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                warn!(post_id, error = %e, "cache read failed, treating as miss");
                None
            }
            Err(e) => {
                warn!(post_id, error = %e, "cache read task failed");
                None
            }
        }
    }

    async fn lead(self: Arc<Self>, post_id: String) -> FetchResult<PostRecord> {
        // Another leader may have finished between our miss and now.
        if let Some(record) = self.cached(&post_id).await {
            return Ok(record);
        }

        let mut record = self.fetch_routed(&post_id).await?;
        if !record.is_resolved() {
            return Err(FetchError::NotFound(post_id));
        }
        record.post_id.clone_from(&post_id);
        if let Some(host) = &self.config.media_host {
            record.rewrite_media_host(host)?;
        }

        if let Err(e) = self.persist(&post_id, &record).await {
            warn!(post_id = %post_id, error = %e, "returning uncached record");
        }
        Ok(record)
    }

    async fn persist(&self, post_id: &str, record: &PostRecord) -> FetchResult<()> {
        let store = Arc::clone(&self.store);
        let id = post_id.to_string();
        let owned = record.clone();
        let ttl = self.config.ttl;
        let expires_at = tokio::task::spawn_blocking(move || store.put(&id, &owned, ttl))
            .await?
            .map_err(|e| FetchError::CacheWrite(e.to_string()))?;
        debug!(post_id, %expires_at, "cached record");
        Ok(())
    }

    async fn fetch_routed(&self, post_id: &str) -> FetchResult<PostRecord> {
        let remote = self.remote.as_deref();
        match self.config.route {
            FetchRoute::LocalOnly => self.local.fetch_post(post_id).await,

            FetchRoute::RemoteOnly => match remote {
                Some(remote) => remote.fetch_post(post_id).await,
                None => Err(FetchError::RemoteUnavailable(
                    "no remote pool configured".to_string(),
                )),
            },

            FetchRoute::LocalThenRemote => {
                let local_err = match self.local.fetch_post(post_id).await {
                    Ok(record) => return Ok(record),
                    Err(e) => e,
                };
                let Some(remote) = remote else {
                    return Err(local_err);
                };
                info!(post_id, error = %local_err, "local fetch failed, trying remote");
                match remote.fetch_post(post_id).await {
                    Ok(record) => Ok(record),
                    Err(remote_err) => {
                        debug!(post_id, error = %remote_err, "remote fallback failed");
                        Err(local_err)
                    }
                }
            }

            FetchRoute::RemoteThenLocal => {
                if let Some(remote) = remote {
                    match remote.fetch_post(post_id).await {
                        Ok(record) => return Ok(record),
                        Err(e) => info!(post_id, error = %e, "remote fetch failed, trying local"),
                    }
                }
                self.local.fetch_post(post_id).await
            }
        }
    }
}
