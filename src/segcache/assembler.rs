//! File Read Assembler (spec §4.3): per-open-file object that maps
//! `(off, len)` reads to the covering segment list, fetches misses
//! through the shared [`Coalescer`], and assembles the output buffer.

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::time::timeout;

use super::coalescer::Coalescer;
use super::entry::SegmentEntry;
use super::error::{CacheError, FetchError, Result};
use super::fetcher::{ProgressSink, SegmentFetcher};
use super::prefetcher::Prefetcher;
use super::store::Store;

/// Result of a single `read_at` call (spec §4.3 step 6): Rust has no
/// "error that still carries a byte count" idiom, so EOF is modeled as
/// an `Ok` outcome carrying both the count and the flag rather than
/// overloading `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub n: usize,
    pub eof: bool,
}

/// Per-open-file state (spec §3 `SegmentCachedFile`). Holds only shared,
/// non-owning references; all data lives in the [`Store`].
pub struct SegmentCachedFile {
    entries: Arc<Vec<SegmentEntry>>,
    file_size: u64,
    store: Arc<Store>,
    coalescer: Arc<Coalescer>,
    prefetcher: Arc<Prefetcher>,
    fetcher: Arc<dyn SegmentFetcher>,
    progress: Arc<dyn ProgressSink>,
    fetch_timeout: Duration,
}

impl SegmentCachedFile {
    pub fn new(
        entries: Arc<Vec<SegmentEntry>>,
        file_size: u64,
        store: Arc<Store>,
        coalescer: Arc<Coalescer>,
        prefetcher: Arc<Prefetcher>,
        fetcher: Arc<dyn SegmentFetcher>,
        progress: Arc<dyn ProgressSink>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            entries,
            file_size,
            store,
            coalescer,
            prefetcher,
            fetcher,
            progress,
            fetch_timeout,
        }
    }

    /// Exposes the shared Prefetcher this file was opened with, so the
    /// Manager can confirm concurrent opens of the same path share one
    /// instance.
    pub fn prefetcher(&self) -> &Arc<Prefetcher> {
        &self.prefetcher
    }

    /// Reads is stateless beyond shared references: concurrent `read_at`
    /// calls on the same file object are safe (spec §4.3).
    pub async fn read_at(&self, buf: &mut [u8], off: i64) -> Result<ReadOutcome> {
        if off < 0 {
            return Err(CacheError::OutOfBounds);
        }
        let off = off as u64;
        if off >= self.file_size {
            return Ok(ReadOutcome { n: 0, eof: true });
        }

        let end = (off + buf.len() as u64).min(self.file_size);
        let want = (end - off) as usize;

        // First segment whose end lies beyond `off` (binary search on
        // `entries[i].file_end`, spec §4.3 step 3).
        let i0 = self.entries.partition_point(|e| e.file_end <= off);

        let mut written = 0usize;
        let mut i = i0;
        while i < self.entries.len() && self.entries[i].file_start < end {
            let entry = &self.entries[i];
            let data = self.fetch_with_retry(entry).await?;

            let start_in_seg = off.saturating_sub(entry.file_start) as usize;
            let end_in_seg = (end - entry.file_start).min(data.len() as u64) as usize;
            let chunk = &data[start_in_seg..end_in_seg];
            buf[written..written + chunk.len()].copy_from_slice(chunk);
            written += chunk.len();

            i += 1;
        }

        self.prefetcher.record_access(i0).await;

        debug_assert_eq!(written, want);
        let eof = end == self.file_size && written < buf.len();
        Ok(ReadOutcome { n: written, eof })
    }

    /// Fetches one segment's bytes, retrying once through the coalescer
    /// if the segment vanishes between the fetch and the follow-up `Get`
    /// (spec §4.3 step 4b).
    async fn fetch_with_retry(&self, entry: &SegmentEntry) -> Result<Arc<Vec<u8>>> {
        for attempt in 0..2 {
            if !self.store.has(&entry.message_id).await {
                self.run_fetch(entry).await?;
            }
            if let Some(data) = self.store.get(&entry.message_id).await {
                return Ok(Arc::new(data));
            }
            if attempt == 0 {
                warn!(
                    "segment {} missing immediately after put, retrying once",
                    entry.message_id
                );
            }
        }
        Err(CacheError::MissingAfterPut(entry.message_id.clone()))
    }

    async fn run_fetch(&self, entry: &SegmentEntry) -> Result<()> {
        let fetcher = self.fetcher.clone();
        let store = self.store.clone();
        let progress = self.progress.clone();
        let id = entry.message_id.clone();
        let file_start = entry.file_start;
        let len = entry.len();
        let fetch_timeout = self.fetch_timeout;

        let result = self
            .coalescer
            .do_once(&entry.message_id, move || async move {
                let data = timeout(fetch_timeout, fetcher.open_at(&id, file_start, len))
                    .await
                    .map_err(|_| FetchError::Timeout { id: id.clone() })??;
                progress.update_download_progress(&id, data.len() as u64);
                store.put(&id, &data).await.map_err(|e| FetchError::Transport {
                    id: id.clone(),
                    source: anyhow::anyhow!(e),
                })?;
                Ok(data)
            })
            .await;

        self.prefetcher.record_fetch_outcome(result.is_ok());

        result
            .map(|_| ())
            .map_err(|e| CacheError::FetchFailed(entry.message_id.clone(), (*e).clone_opaque()))
    }
}

/// `FetchError` doesn't derive `Clone` (it wraps `anyhow::Error`), but
/// the coalescer shares an `Arc<FetchError>` across waiters; this turns
/// the shared error back into an owned one for the per-caller
/// `CacheError`, preserving the message without requiring the source
/// chain to be `Clone`.
trait CloneOpaque {
    fn clone_opaque(&self) -> FetchError;
}

impl CloneOpaque for FetchError {
    fn clone_opaque(&self) -> FetchError {
        match self {
            FetchError::Timeout { id } => FetchError::Timeout { id: id.clone() },
            FetchError::Transport { id, source } => FetchError::Transport {
                id: id.clone(),
                source: anyhow::anyhow!(source.to_string()),
            },
            FetchError::ShortRead { id, got, wanted } => FetchError::ShortRead {
                id: id.clone(),
                got: *got,
                wanted: *wanted,
            },
            FetchError::Cancelled { id } => FetchError::Cancelled { id: id.clone() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segcache::entry::MessageId;
    use crate::segcache::fetcher::test_doubles::MapFetcher;
    use crate::segcache::fetcher::NullProgressSink;
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;

    fn entry(id: &str, start: u64, end: u64) -> SegmentEntry {
        SegmentEntry {
            message_id: MessageId::new(id),
            file_start: start,
            file_end: end,
            groups: vec![],
        }
    }

    async fn setup(
        segments: HashMap<MessageId, Vec<u8>>,
        entries: Vec<SegmentEntry>,
        file_size: u64,
    ) -> (SegmentCachedFile, tempfile::TempDir, Arc<MapFetcher>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::startup(dir.path(), 1_000_000_000, StdDuration::from_secs(0))
            .await
            .unwrap();
        let coalescer = Arc::new(Coalescer::new());
        let entries = Arc::new(entries);
        let fetcher = Arc::new(MapFetcher::new(segments));
        let prefetcher = Arc::new(Prefetcher::new(
            Default::default(),
            entries.clone(),
            store.clone(),
            coalescer.clone(),
            fetcher.clone(),
        ));
        let file = SegmentCachedFile::new(
            entries,
            file_size,
            store,
            coalescer,
            prefetcher,
            fetcher.clone(),
            Arc::new(NullProgressSink),
            StdDuration::from_secs(5),
        );
        (file, dir, fetcher)
    }

    #[tokio::test]
    async fn byte_exact_cross_segment_read() {
        let mut segs = HashMap::new();
        segs.insert(MessageId::new("a"), vec![b'A'; 1000]);
        segs.insert(MessageId::new("b"), vec![b'B'; 1000]);
        segs.insert(MessageId::new("c"), vec![b'C'; 500]);
        let entries = vec![entry("a", 0, 1000), entry("b", 1000, 2000), entry("c", 2000, 2500)];

        let (file, _dir, fetcher) = setup(segs, entries, 2500).await;

        let mut buf = vec![0u8; 750];
        let outcome = file.read_at(&mut buf, 1500).await.unwrap();
        assert_eq!(outcome.n, 750);
        assert!(!outcome.eof);

        let mut expected = vec![b'A'; 250];
        expected.extend(vec![b'B'; 1000]);
        expected.truncate(750);
        // off=1500 -> within segment a? no: a ends at 1000, so off=1500 is
        // inside segment b (250 bytes in), want 750 bytes: 500 bytes of B
        // then... let's just check concatenation semantics directly below.
        let full: Vec<u8> = {
            let mut v = vec![b'A'; 1000];
            v.extend(vec![b'B'; 1000]);
            v.extend(vec![b'C'; 500]);
            v
        };
        let want = &full[1500..1500 + 750];
        assert_eq!(&buf[..], want);

        // Only segments b and c were needed (a was never touched).
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_reads_coalesce_to_one_fetch() {
        let mut segs = HashMap::new();
        segs.insert(MessageId::new("only"), vec![7u8; 100]);
        let entries = vec![entry("only", 0, 100)];
        let (file, _dir, fetcher) = setup(segs, entries, 100).await;
        let file = Arc::new(file);

        let mut handles = vec![];
        for _ in 0..4 {
            let file = file.clone();
            handles.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 100];
                let outcome = file.read_at(&mut buf, 0).await.unwrap();
                (outcome.n, buf)
            }));
        }
        for h in handles {
            let (n, buf) = h.await.unwrap();
            assert_eq!(n, 100);
            assert_eq!(buf, vec![7u8; 100]);
        }
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn negative_offset_is_out_of_bounds() {
        let (file, _dir, _f) = setup(HashMap::new(), vec![entry("a", 0, 10)], 10).await;
        let mut buf = vec![0u8; 4];
        let err = file.read_at(&mut buf, -1).await.unwrap_err();
        assert!(matches!(err, CacheError::OutOfBounds));
    }

    #[tokio::test]
    async fn offset_at_eof_returns_zero_and_eof() {
        let (file, _dir, _f) = setup(HashMap::new(), vec![entry("a", 0, 10)], 10).await;
        let mut buf = vec![0u8; 4];
        let outcome = file.read_at(&mut buf, 10).await.unwrap();
        assert_eq!(outcome.n, 0);
        assert!(outcome.eof);
    }
}
