//! Segment Store (spec §4.1): a concurrent, size-bounded, disk-backed
//! map from message ID to decoded segment bytes.
//!
//! The in-memory catalog (map + running `total_size`) lives behind a
//! single [`tokio::sync::Mutex`]; all disk I/O in [`Store::get`] and
//! [`Store::put`] happens after the guard is dropped, per spec §4.1's
//! "disk I/O outside the lock" rule. `SaveCatalog` serializes a snapshot
//! under the lock, releases it, then writes — the same clone-then-write
//! shape the teacher uses in `backup/data_blob.rs` for its own
//! temp-file-plus-rename writers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;

use super::entry::{CacheEntry, Catalog, MessageId};
use super::error::CacheError;

const CATALOG_FILE: &str = "catalog.json";

struct StoreState {
    entries: Catalog,
    total_size: u64,
}

/// Disk-backed, size-bounded segment store.
pub struct Store {
    state: Mutex<StoreState>,
    cache_path: PathBuf,
    max_size_bytes: u64,
    expiry: chrono::Duration,
    seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Store {
    /// Creates `cache_path` if missing, loads `catalog.json` if present,
    /// and drops any entry whose data file no longer stats successfully
    /// (spec §4.1 `Startup`). A corrupt catalog is logged and treated as
    /// empty. Orphan `.seg` files are left alone (spec §9 open question).
    pub async fn startup(
        cache_path: impl Into<PathBuf>,
        max_size_bytes: u64,
        expiry: std::time::Duration,
    ) -> Result<Arc<Self>, CacheError> {
        let cache_path = cache_path.into();
        fs::create_dir_all(&cache_path)
            .await
            .map_err(|e| CacheError::StoreCorruption(MessageId::new(""), e))?;

        let catalog_path = cache_path.join(CATALOG_FILE);
        let mut entries: Catalog = match fs::read(&catalog_path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(catalog) => catalog,
                Err(err) => {
                    warn!("catalog at {:?} is corrupt ({err}), starting empty", catalog_path);
                    Catalog::new()
                }
            },
            Err(_) => Catalog::new(),
        };

        let mut dropped = 0usize;
        let mut total_size = 0u64;
        entries.retain(|_, entry| {
            let exists = entry.data_path.exists();
            if !exists {
                dropped += 1;
            } else {
                total_size += entry.size;
            }
            exists
        });
        if dropped > 0 {
            debug!("dropped {dropped} catalog entries with missing data files at startup");
        }

        // `seq` is not persisted (spec.md §6's bit-exact catalog shape
        // excludes it), so every loaded entry deserializes to 0. Reassign
        // it from iteration order so eviction still has a stable,
        // monotonically increasing tie-breaker after a restart.
        for (i, entry) in entries.values_mut().enumerate() {
            entry.seq = i as u64;
        }

        let max_seq = entries.values().map(|e| e.seq).max().unwrap_or(0);

        Ok(Arc::new(Self {
            state: Mutex::new(StoreState { entries, total_size }),
            cache_path,
            max_size_bytes,
            expiry: chrono::Duration::from_std(expiry).unwrap_or(chrono::Duration::zero()),
            seq: AtomicU64::new(max_seq + 1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }))
    }

    fn data_path(&self, id: &MessageId) -> PathBuf {
        let digest = Sha256::digest(id.as_str().as_bytes());
        self.cache_path.join(format!("{}.seg", hex::encode(digest)))
    }

    /// O(1), no disk I/O: presence in the in-memory catalog only.
    pub async fn has(&self, id: &MessageId) -> bool {
        self.state.lock().await.entries.contains_key(id)
    }

    /// Reads the data file and updates `last_access`. A missing data
    /// file is a silent local drop: the entry is evicted and `None` is
    /// returned (the caller treats this as a miss and refetches).
    pub async fn get(&self, id: &MessageId) -> Option<Vec<u8>> {
        let path = {
            let guard = self.state.lock().await;
            guard.entries.get(id)?.data_path.clone()
        };

        match fs::read(&path).await {
            Ok(data) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let mut guard = self.state.lock().await;
                if let Some(entry) = guard.entries.get_mut(id) {
                    entry.last_access = Utc::now();
                }
                Some(data)
            }
            Err(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let mut guard = self.state.lock().await;
                if let Some(entry) = guard.entries.remove(id) {
                    guard.total_size = guard.total_size.saturating_sub(entry.size);
                }
                None
            }
        }
    }

    /// Snapshot of hit/miss counters (spec §4.5 `GetStats`).
    pub fn hit_miss_counts(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Writes `<hex(sha256(id))>.seg` atomically via temp-file + rename,
    /// then updates the catalog entry. Overwrites any prior entry for
    /// `id`, adjusting `total_size` so `sum(size) == total_size` holds.
    pub async fn put(&self, id: &MessageId, data: &[u8]) -> Result<(), CacheError> {
        if self.max_size_bytes == 0 {
            return Err(CacheError::Disabled);
        }

        let path = self.data_path(id);
        write_atomic(&path, data)
            .await
            .map_err(|e| CacheError::StoreCorruption(id.clone(), e))?;

        let now = Utc::now();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.state.lock().await;
        let new_size = data.len() as u64;
        let old_size = guard
            .entries
            .get(id)
            .map(|e| e.size)
            .unwrap_or(0);
        guard.entries.insert(
            id.clone(),
            CacheEntry {
                data_path: path,
                size: new_size,
                last_access: now,
                created: now,
                seq,
            },
        );
        guard.total_size = guard.total_size - old_size + new_size;
        Ok(())
    }

    /// Current total size of all stored segments, kept in memory.
    pub async fn total_size(&self) -> u64 {
        self.state.lock().await.total_size
    }

    pub async fn item_count(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// While `total_size > max_size_bytes`, removes the entry with the
    /// smallest `last_access` (ties broken by insertion order), deletes
    /// its file, and subtracts its size. A single entry larger than the
    /// cap is kept (spec §4.1 invariant: `TotalSize <= MaxSizeBytes` or
    /// `ItemCount <= 1`).
    pub async fn evict(&self) {
        loop {
            let victim = {
                let guard = self.state.lock().await;
                if guard.total_size <= self.max_size_bytes || guard.entries.len() <= 1 {
                    return;
                }
                guard
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| (e.last_access, e.seq))
                    .map(|(id, e)| (id.clone(), e.data_path.clone(), e.size))
            };

            let Some((id, path, size)) = victim else {
                return;
            };

            let _ = fs::remove_file(&path).await;
            let mut guard = self.state.lock().await;
            if let Some(entry) = guard.entries.get(&id) {
                if entry.data_path == path {
                    guard.total_size = guard.total_size.saturating_sub(size);
                    guard.entries.remove(&id);
                }
            }
        }
    }

    /// Removes every entry with `last_access < now - expiry`. A zero
    /// `expiry` disables this (spec §4.1).
    pub async fn cleanup(&self) {
        if self.expiry <= chrono::Duration::zero() {
            return;
        }
        let cutoff = Utc::now() - self.expiry;
        let stale: Vec<(MessageId, PathBuf, u64)> = {
            let guard = self.state.lock().await;
            guard
                .entries
                .iter()
                .filter(|(_, e)| e.last_access < cutoff)
                .map(|(id, e)| (id.clone(), e.data_path.clone(), e.size))
                .collect()
        };

        for (id, path, size) in stale {
            let _ = fs::remove_file(&path).await;
            let mut guard = self.state.lock().await;
            if guard.entries.remove(&id).is_some() {
                guard.total_size = guard.total_size.saturating_sub(size);
            }
        }
    }

    /// Serializes a snapshot under the lock, releases it, then writes
    /// `catalog.json` via temp-file + rename.
    pub async fn save_catalog(&self) -> Result<(), CacheError> {
        let snapshot = {
            let guard = self.state.lock().await;
            guard.entries.clone()
        };
        let bytes = serde_json::to_vec_pretty(&snapshot).map_err(|e| {
            CacheError::StoreCorruption(
                MessageId::new(""),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        let path = self.cache_path.join(CATALOG_FILE);
        write_atomic(&path, &bytes)
            .await
            .map_err(|e| CacheError::StoreCorruption(MessageId::new(""), e))
    }
}

/// Writes `data` to `path` via a sibling temp file plus atomic rename, so
/// a reader never observes a partial write.
async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });
    fs::write(&tmp_path, data).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn store(max_size: u64) -> (Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::startup(dir.path(), max_size, Duration::from_secs(0))
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let (store, _dir) = store(1_000_000).await;
        let id = MessageId::new("msg-1");
        store.put(&id, b"hello").await.unwrap();
        assert!(store.has(&id).await);
        assert_eq!(store.get(&id).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn put_overwrite_updates_size() {
        let (store, _dir) = store(1_000_000).await;
        let id = MessageId::new("msg-1");
        store.put(&id, b"hello").await.unwrap();
        store.put(&id, b"a longer value").await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), b"a longer value");
        assert_eq!(store.total_size().await, "a longer value".len() as u64);
    }

    #[tokio::test]
    async fn evict_respects_size_bound() {
        let (store, _dir) = store(1500).await;
        let s1 = MessageId::new("s1");
        let s2 = MessageId::new("s2");
        store.put(&s1, &vec![0u8; 1000]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.put(&s2, &vec![0u8; 1000]).await.unwrap();
        store.evict().await;
        assert!(store.total_size().await <= 1500 || store.item_count().await <= 1);
        assert!(!store.has(&s1).await);
        assert!(store.has(&s2).await);
    }

    #[tokio::test]
    async fn single_oversized_entry_is_kept() {
        let (store, _dir) = store(10).await;
        let id = MessageId::new("big");
        store.put(&id, &vec![0u8; 1000]).await.unwrap();
        store.evict().await;
        assert!(store.has(&id).await);
    }

    #[tokio::test]
    async fn disabled_when_max_size_zero() {
        let (store, _dir) = store(0).await;
        let id = MessageId::new("x");
        let err = store.put(&id, b"x").await.unwrap_err();
        assert!(matches!(err, CacheError::Disabled));
    }

    #[tokio::test]
    async fn catalog_json_omits_seq() {
        let (store, dir) = store(1_000_000).await;
        store.put(&MessageId::new("a"), b"hello").await.unwrap();
        store.save_catalog().await.unwrap();

        let bytes = fs::read(dir.path().join(CATALOG_FILE)).await.unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("seq"));
        assert!(text.contains("data_path"));
        assert!(text.contains("last_access"));
    }

    #[tokio::test]
    async fn catalog_round_trips_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let id = MessageId::new("restart-me");
        {
            let store = Store::startup(dir.path(), 1_000_000, Duration::from_secs(0))
                .await
                .unwrap();
            store.put(&id, b"persisted").await.unwrap();
            store.save_catalog().await.unwrap();
        }
        let reopened = Store::startup(dir.path(), 1_000_000, Duration::from_secs(0))
            .await
            .unwrap();
        assert!(reopened.has(&id).await);
        assert_eq!(reopened.get(&id).await.unwrap(), b"persisted");
    }

    #[tokio::test]
    async fn missing_data_file_is_silent_miss() {
        let (store, _dir) = store(1_000_000).await;
        let id = MessageId::new("vanishing");
        store.put(&id, b"data").await.unwrap();
        let path = {
            let guard = store.state.lock().await;
            guard.entries.get(&id).unwrap().data_path.clone()
        };
        tokio::fs::remove_file(&path).await.unwrap();
        assert!(store.get(&id).await.is_none());
        assert!(!store.has(&id).await);
    }

    #[tokio::test]
    async fn cleanup_disabled_with_zero_expiry() {
        let (store, _dir) = store(1_000_000).await;
        let id = MessageId::new("never-expires");
        store.put(&id, b"data").await.unwrap();
        store.cleanup().await;
        assert!(store.has(&id).await);
    }
}
