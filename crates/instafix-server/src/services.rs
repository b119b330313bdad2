//! Service wiring: everything a subcommand needs, built once from settings.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use instafix::{
    CacheStore, Extractor, FetchCoordinator, GridCompositor, HttpOrigin, LocalFetcher, PostSource,
    RemoteError, RemoteListener, RemotePool,
};

use crate::config::Settings;

pub struct Services {
    pub store: Arc<CacheStore>,
    pub coordinator: FetchCoordinator,
    pub remote: Option<Arc<RemotePool>>,
    pub grid: GridCompositor,
    pub shutdown: CancellationToken,
    listener: Option<ListenerTask>,
}

struct ListenerTask {
    addr: SocketAddr,
    handle: JoinHandle<Result<(), RemoteError>>,
}

impl Services {
    /// Open the cache, build the fetch path and the grid compositor.
    ///
    /// The remote pool is created when a listener is configured but the
    /// socket is only bound by [`Services::start_remote_listener`].
    pub fn build(settings: &Settings) -> anyhow::Result<Self> {
        let cache_path = settings.cache_path();
        let store = Arc::new(
            CacheStore::open(&cache_path)
                .with_context(|| format!("opening cache at {}", cache_path.display()))?,
        );

        let remote = settings
            .remote_config()
            .context("remote listener settings")?
            .map(RemotePool::new);

        let remote_source = remote
            .as_ref()
            .map(|pool| Arc::clone(pool) as Arc<dyn PostSource>);
        let coordinator = FetchCoordinator::new(
            Arc::clone(&store),
            local_source(settings),
            remote_source,
            settings.coordinator_config(),
        );

        let grid_config = settings.grid_config();
        let grid = GridCompositor::new(grid_config.clone())
            .with_context(|| format!("opening grid cache at {}", grid_config.dir.display()))?;

        tracing::debug!(
            "services ready: cache={} grid={} route={:?} remote={}",
            cache_path.display(),
            grid_config.dir.display(),
            coordinator.config().route,
            remote.is_some()
        );

        Ok(Self {
            store,
            coordinator,
            remote,
            grid,
            shutdown: CancellationToken::new(),
            listener: None,
        })
    }

    /// Bind the remote worker listener and start accepting workers.
    /// Returns the bound address, or `None` when no listener is configured.
    pub async fn start_remote_listener(&mut self, settings: &Settings) -> anyhow::Result<Option<SocketAddr>> {
        let (Some(pool), Some(addr)) = (&self.remote, &settings.remote_listen) else {
            return Ok(None);
        };
        if let Some(running) = &self.listener {
            return Ok(Some(running.addr));
        }

        let listener = RemoteListener::bind(addr, Arc::clone(pool))
            .await
            .with_context(|| format!("binding remote listener on {addr}"))?;
        let bound = listener.local_addr()?;
        let handle = tokio::spawn(listener.run(self.shutdown.child_token()));
        self.listener = Some(ListenerTask {
            addr: bound,
            handle,
        });
        Ok(Some(bound))
    }

    /// Signal every background task and wait for the listener to stop.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(listener) = self.listener.take() {
            match listener.handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("remote listener stopped with error: {e}"),
                Err(e) => tracing::warn!("remote listener task failed: {e}"),
            }
        }
    }
}

/// Fetch path that runs in this process: HTTP origin plus the extractor chain.
pub fn local_source(settings: &Settings) -> Arc<dyn PostSource> {
    let origin = Arc::new(HttpOrigin::new(settings.origin_config()));
    Arc::new(LocalFetcher::new(origin, Extractor::new()))
}
