//! Manager (spec §4.5): owns configuration, the Store, and the per-path
//! Prefetcher table; runs the three periodic background tasks and
//! publishes stats.
//!
//! The spawn-three-background-loops-and-join-on-shutdown shape mirrors
//! the teacher's worker/task infrastructure (`api2/node/tasks.rs` tracks
//! and joins its spawned tasks the same way); `Stop()` does not return
//! before the final `SaveCatalog` completes, per spec §9.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SegmentCacheConfig;

use super::assembler::SegmentCachedFile;
use super::coalescer::Coalescer;
use super::entry::{validate_entries, SegmentEntry};
use super::error::CacheError;
use super::fetcher::SegmentFetcher;
use super::metrics::CacheStats;
use super::prefetcher::{Prefetcher, PrefetcherParams};
use super::store::Store;

struct PathState {
    prefetcher: Arc<Prefetcher>,
    open_count: usize,
}

struct Background {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Owns the Store and the per-path Prefetcher table; the single entry
/// point the embedding application (WebDAV/FUSE layer, out of scope
/// here) uses to open and close segment-cached files.
pub struct Manager {
    config: SegmentCacheConfig,
    store: Arc<Store>,
    coalescer: Arc<Coalescer>,
    paths: Mutex<HashMap<String, PathState>>,
    active_files: AtomicUsize,
    background: Mutex<Option<Background>>,
}

impl Manager {
    pub async fn new(config: SegmentCacheConfig) -> Result<Arc<Self>, CacheError> {
        let store = Store::startup(
            config.cache_path.clone(),
            config.max_size_bytes,
            config.expiry,
        )
        .await?;
        Ok(Arc::new(Self {
            config,
            store,
            coalescer: Arc::new(Coalescer::new()),
            paths: Mutex::new(HashMap::new()),
            active_files: AtomicUsize::new(0),
            background: Mutex::new(None),
        }))
    }

    /// Gets-or-creates the Prefetcher for `path`, shares it across
    /// concurrent opens, and returns a fresh Assembler over `entries`
    /// (spec §4.5 `Open`).
    ///
    /// Rejects `entries` that fail the layout invariant before they ever
    /// reach the Assembler or Prefetcher: a gapped or out-of-order list
    /// from a misbehaving `SegmentEntryProvider` would otherwise corrupt
    /// `read_at`'s slice arithmetic instead of failing cleanly here.
    pub async fn open(
        &self,
        path: &str,
        entries: Vec<SegmentEntry>,
        file_size: u64,
        fetcher: Arc<dyn SegmentFetcher>,
    ) -> Result<SegmentCachedFile, CacheError> {
        validate_entries(&entries, file_size).map_err(CacheError::InvalidSegmentLayout)?;

        let entries = Arc::new(entries);
        let mut paths = self.paths.lock().await;
        let state = paths.entry(path.to_string()).or_insert_with(|| {
            let prefetcher = Arc::new(Prefetcher::new(
                PrefetcherParams::from(&self.config),
                entries.clone(),
                self.store.clone(),
                self.coalescer.clone(),
                fetcher.clone(),
            ));
            PathState {
                prefetcher,
                open_count: 0,
            }
        });
        state.open_count += 1;
        let prefetcher = state.prefetcher.clone();
        drop(paths);

        self.active_files.fetch_add(1, Ordering::SeqCst);

        Ok(SegmentCachedFile::new(
            entries,
            file_size,
            self.store.clone(),
            self.coalescer.clone(),
            prefetcher,
            fetcher,
            Arc::new(super::fetcher::NullProgressSink),
            self.config.fetch_timeout,
        ))
    }

    /// Decrements the active-file counter; Prefetcher teardown is
    /// deferred to the idle monitor (spec §4.5 `Close`).
    pub async fn close(&self, path: &str) {
        self.active_files.fetch_sub(1, Ordering::SeqCst);
        let mut paths = self.paths.lock().await;
        if let Some(state) = paths.get_mut(path) {
            state.open_count = state.open_count.saturating_sub(1);
        }
    }

    /// Launches the three background tasks (spec §4.5 `Start`).
    pub async fn start(self: &Arc<Self>) {
        let token = CancellationToken::new();
        let mut handles = Vec::with_capacity(3);

        handles.push(tokio::spawn(Self::eviction_loop(self.clone(), token.clone())));
        handles.push(tokio::spawn(Self::catalog_flush_loop(self.clone(), token.clone())));
        handles.push(tokio::spawn(Self::idle_monitor_loop(self.clone(), token.clone())));

        *self.background.lock().await = Some(Background { token, handles });
    }

    async fn eviction_loop(manager: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(manager.config.eviction_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {
                    manager.store.cleanup().await;
                    manager.store.evict().await;
                }
            }
        }
    }

    async fn catalog_flush_loop(manager: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(manager.config.catalog_flush_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {
                    if let Err(err) = manager.store.save_catalog().await {
                        warn!("periodic catalog flush failed: {err}");
                    }
                }
            }
        }
    }

    async fn idle_monitor_loop(manager: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(manager.config.idle_threshold);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {
                    manager.reap_idle_prefetchers().await;
                }
            }
        }
    }

    async fn reap_idle_prefetchers(&self) {
        let mut paths = self.paths.lock().await;
        let idle_threshold = self.config.idle_threshold;
        let mut to_remove = Vec::new();
        for (path, state) in paths.iter() {
            if state.open_count == 0 && state.prefetcher.is_idle_since(idle_threshold) {
                to_remove.push(path.clone());
            }
        }
        for path in to_remove {
            if let Some(state) = paths.remove(&path) {
                state.prefetcher.stop().await;
                info!("reaped idle prefetcher for {path}");
            }
        }
    }

    /// Cancels and joins the background tasks, then performs a final
    /// `SaveCatalog` (spec §4.5 `Stop`: "must not return before the
    /// final SaveCatalog completes").
    pub async fn stop(&self) {
        if let Some(background) = self.background.lock().await.take() {
            background.token.cancel();
            for handle in background.handles {
                let _ = handle.await;
            }
        }
        if let Err(err) = self.store.save_catalog().await {
            warn!("final catalog flush on stop failed: {err}");
        }
    }

    /// Snapshot of `(hits, misses, totalSize, itemCount, activeFiles)`.
    pub async fn stats(&self) -> CacheStats {
        let (hits, misses) = self.store.hit_miss_counts();
        CacheStats {
            hits,
            misses,
            total_size: self.store.total_size().await,
            item_count: self.store.item_count().await,
            active_files: self.active_files.load(Ordering::SeqCst),
        }
    }

    /// Direct access to the shared Store, for callers that need to
    /// drive eviction/expiry/catalog persistence outside the background
    /// loops (e.g. tests, or a management CLI).
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Current Prefetcher state for `path`, if a Prefetcher exists for
    /// it (diagnostic/testing use).
    pub async fn prefetcher_state(&self, path: &str) -> Option<PrefetchState> {
        self.paths
            .lock()
            .await
            .get(path)
            .map(|state| state.prefetcher.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segcache::entry::MessageId;
    use crate::segcache::fetcher::test_doubles::MapFetcher;
    use std::collections::HashMap;
    use std::time::Duration;

    fn entries(n: usize, seg_len: u64) -> Vec<SegmentEntry> {
        (0..n)
            .map(|i| SegmentEntry {
                message_id: MessageId::new(format!("seg-{i}")),
                file_start: i as u64 * seg_len,
                file_end: (i as u64 + 1) * seg_len,
                groups: vec![],
            })
            .collect()
    }

    #[tokio::test]
    async fn open_shares_prefetcher_across_concurrent_opens() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SegmentCacheConfig::default();
        config.cache_path = dir.path().to_path_buf();
        let manager = Manager::new(config).await.unwrap();

        let entries = entries(10, 100);
        let segs: HashMap<MessageId, Vec<u8>> = entries
            .iter()
            .map(|e| (e.message_id.clone(), vec![0u8; 100]))
            .collect();
        let fetcher: Arc<dyn SegmentFetcher> = Arc::new(MapFetcher::new(segs));

        let f1 = manager
            .open("/movie.mkv", entries.clone(), 1000, fetcher.clone())
            .await
            .unwrap();
        let f2 = manager
            .open("/movie.mkv", entries, 1000, fetcher)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(f1.prefetcher(), f2.prefetcher()));

        let stats = manager.stats().await;
        assert_eq!(stats.active_files, 2);

        manager.close("/movie.mkv").await;
        manager.close("/movie.mkv").await;
        let stats = manager.stats().await;
        assert_eq!(stats.active_files, 0);
    }

    #[tokio::test]
    async fn open_rejects_gapped_segment_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SegmentCacheConfig::default();
        config.cache_path = dir.path().to_path_buf();
        let manager = Manager::new(config).await.unwrap();

        let mut entries = entries(3, 100);
        entries[1].file_start += 10; // open a gap between segments 0 and 1
        entries[1].file_end += 10;
        let fetcher: Arc<dyn SegmentFetcher> =
            Arc::new(MapFetcher::new(HashMap::new()));

        let err = manager
            .open("/broken.mkv", entries, 300, fetcher)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidSegmentLayout(_)));
    }

    #[tokio::test]
    async fn stop_flushes_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SegmentCacheConfig::default();
        config.cache_path = dir.path().to_path_buf();
        config.catalog_flush_interval = Duration::from_millis(20);
        config.eviction_interval = Duration::from_secs(3600);
        config.idle_threshold = Duration::from_secs(3600);
        let manager = Manager::new(config).await.unwrap();
        manager.start().await;

        manager.store.put(&MessageId::new("x"), b"data").await.unwrap();
        manager.stop().await;

        let catalog_path = dir.path().join("catalog.json");
        assert!(catalog_path.exists());
    }
}
