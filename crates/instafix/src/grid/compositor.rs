//! Builds collages on demand and keeps the results in the grid cache.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use image::DynamicImage;
use tracing::{debug, info, warn};

use super::cache::GridCache;
use super::compose::{self, GRID_JPEG_QUALITY};
use super::GridError;
use crate::flight::SingleFlight;
use crate::types::{validate_post_id, MediaItem};

#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Directory holding `<post_id>.jpeg` files.
    pub dir: PathBuf,
    pub max_entries: usize,
    pub max_bytes: u64,
    /// Per-image download timeout.
    pub download_timeout: Duration,
    pub download_concurrency: usize,
    pub jpeg_quality: u8,
}

impl GridConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_entries: 10_000,
            max_bytes: 25 * 1024 * 1024 * 1024,
            download_timeout: Duration::from_secs(10),
            download_concurrency: 4,
            jpeg_quality: GRID_JPEG_QUALITY,
        }
    }
}

/// Cheap to clone; clones share the cache and in-flight builds.
#[derive(Clone)]
pub struct GridCompositor {
    inner: Arc<Inner>,
}

struct Inner {
    config: GridConfig,
    cache: Mutex<GridCache>,
    client: reqwest::Client,
    builds: SingleFlight<String, Bytes, GridError>,
}

impl GridCompositor {
    pub fn new(config: GridConfig) -> Result<Self, GridError> {
        let cache = GridCache::open(config.dir.clone(), config.max_entries, config.max_bytes)?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("instafix/", env!("CARGO_PKG_VERSION")))
            .timeout(config.download_timeout)
            .build()
            .unwrap_or_default();

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                cache: Mutex::new(cache),
                client,
                builds: SingleFlight::new(),
            }),
        })
    }

    pub fn config(&self) -> &GridConfig {
        &self.inner.config
    }

    /// Return the collage for a post, building it from `media` on a miss.
    ///
    /// Only image media take part. Concurrent calls for one post share a
    /// single build.
    pub async fn build_or_fetch_cached(
        &self,
        post_id: &str,
        media: &[MediaItem],
    ) -> Result<Bytes, GridError> {
        validate_post_id(post_id).map_err(|e| GridError::InvalidPostId(e.to_string()))?;

        if let Some(cached) = self.inner.cached(post_id).await? {
            debug!(post_id, "grid cache hit");
            return Ok(cached);
        }

        let urls: Vec<String> = media
            .iter()
            .filter(|m| m.is_image())
            .map(|m| m.url.clone())
            .collect();
        if urls.len() < 2 {
            return Err(GridError::NotEnoughImages(urls.len()));
        }

        let inner = Arc::clone(&self.inner);
        let key = post_id.to_string();
        self.inner
            .builds
            .run(key.clone(), move || async move { inner.build(key, urls).await })
            .await
    }

    /// Evict collages until the byte budget holds. Returns evicted count.
    pub fn enforce_budget(&self) -> Result<usize, GridError> {
        Ok(self.inner.lock_cache()?.enforce_budget())
    }

    pub fn cached_entries(&self) -> Result<usize, GridError> {
        Ok(self.inner.lock_cache()?.len())
    }

    pub fn cached_bytes(&self) -> Result<u64, GridError> {
        Ok(self.inner.lock_cache()?.total_bytes())
    }

    pub fn in_flight(&self) -> usize {
        self.inner.builds.in_flight()
    }
}

impl Inner {
    fn lock_cache(&self) -> Result<MutexGuard<'_, GridCache>, GridError> {
        self.cache
            .lock()
            .map_err(|_| GridError::Internal("grid cache lock poisoned".to_string()))
    }

    async fn cached(&self, post_id: &str) -> Result<Option<Bytes>, GridError> {
        let path = {
            let mut cache = self.lock_cache()?;
            cache.get(post_id)
        };
        let Some(path) = path else {
            return Ok(None);
        };
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(post_id, path = %path.display(), "grid file vanished, rebuilding");
                self.lock_cache()?.invalidate(post_id);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn build(self: Arc<Self>, post_id: String, urls: Vec<String>) -> Result<Bytes, GridError> {
        // Another build may have finished between the caller's miss and now.
        if let Some(cached) = self.cached(&post_id).await? {
            return Ok(cached);
        }

        // Owned urls and handles: the build runs inside a spawned task.
        let blobs: Vec<Option<Bytes>> = stream::iter(urls.clone())
            .map(|url| {
                let this = Arc::clone(&self);
                async move { this.download(&url).await }
            })
            .buffered(self.config.download_concurrency.max(1))
            .collect()
            .await;

        let quality = self.config.jpeg_quality;
        let jpeg = tokio::task::spawn_blocking(move || render(blobs, quality)).await??;
        let jpeg = Bytes::from(jpeg);

        let inner = Arc::clone(&self);
        let id = post_id.clone();
        let data = jpeg.clone();
        tokio::task::spawn_blocking(move || {
            let mut cache = inner.lock_cache()?;
            cache.insert(&id, &data)
        })
        .await??;

        info!(post_id, bytes = jpeg.len(), images = urls.len(), "built grid");
        Ok(jpeg)
    }

    /// Fetch one image. Failures are logged and yield `None`.
    async fn download(&self, url: &str) -> Option<Bytes> {
        match self.fetch_image(url).await {
            Ok(body) => Some(body),
            Err(e) => {
                warn!(url, error = %e, "grid image download failed");
                None
            }
        }
    }

    async fn fetch_image(&self, url: &str) -> Result<Bytes, reqwest::Error> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await
    }
}

/// Decode the downloaded images in order, compose them and encode the canvas.
fn render(blobs: Vec<Option<Bytes>>, quality: u8) -> Result<Vec<u8>, GridError> {
    let images: Vec<DynamicImage> = blobs
        .into_iter()
        .enumerate()
        .filter_map(|(i, blob)| {
            let blob = blob?;
            match image::load_from_memory(&blob) {
                Ok(img) => Some(img),
                Err(e) => {
                    warn!(index = i, error = %e, "skipping undecodable grid image");
                    None
                }
            }
        })
        .collect();

    let canvas = compose::compose(&images)?;
    compose::encode_jpeg(&canvas, quality)
}
