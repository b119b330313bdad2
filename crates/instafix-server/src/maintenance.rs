//! Background maintenance loop.
//!
//! Sweeps expired posts out of the cache store and keeps the grid cache
//! within its byte budget while the daemon is running.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use instafix::{CacheStore, GridCompositor};

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired_removed: usize,
    pub cache_entries_after: usize,
    pub grids_evicted: usize,
}

/// Spawn the maintenance loop until `shutdown` fires.
pub fn spawn(
    store: Arc<CacheStore>,
    grid: GridCompositor,
    tick_every: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("maintenance loop started: tick={}s", tick_every.as_secs());
        let mut ticker = tokio::time::interval(tick_every);
        let mut tick_count: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("maintenance loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    tick_count = tick_count.saturating_add(1);
                    let report = run_once(&store, &grid).await;
                    tracing::debug!(
                        "maintenance tick {tick_count}: cache_entries={} expired={} grids_evicted={}",
                        report.cache_entries_after,
                        report.expired_removed,
                        report.grids_evicted
                    );
                }
            }
        }
    })
}

/// One pass: sweep the cache store, then enforce the grid budget.
/// Failures are logged and counted as zero.
pub async fn run_once(store: &Arc<CacheStore>, grid: &GridCompositor) -> MaintenanceReport {
    let store = Arc::clone(store);
    let swept = tokio::task::spawn_blocking(move || {
        let removed = store.sweep(Utc::now())?;
        let remaining = store.len()?;
        Ok::<_, instafix::StoreError>((removed, remaining))
    })
    .await;

    let mut report = MaintenanceReport::default();
    match swept {
        Ok(Ok((removed, remaining))) => {
            if removed > 0 {
                tracing::info!("maintenance sweep removed {removed} expired post(s)");
            }
            report.expired_removed = removed;
            report.cache_entries_after = remaining;
        }
        Ok(Err(e)) => tracing::warn!("maintenance sweep failed: {e}"),
        Err(e) => tracing::warn!("maintenance sweep task failed: {e}"),
    }

    let grid = grid.clone();
    match tokio::task::spawn_blocking(move || grid.enforce_budget()).await {
        Ok(Ok(evicted)) => {
            if evicted > 0 {
                tracing::info!("maintenance evicted {evicted} grid collage(s)");
            }
            report.grids_evicted = evicted;
        }
        Ok(Err(e)) => tracing::warn!("maintenance grid eviction failed: {e}"),
        Err(e) => tracing::warn!("maintenance grid eviction task failed: {e}"),
    }

    report
}
