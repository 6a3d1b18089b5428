//! External interfaces consumed by the core (spec §6): the segment
//! fetcher, the segment-entry provider, and the progress sink.
//!
//! Modeled as `async_trait` traits the way the rest of the retrieval
//! pack does (the teacher's own `ReadChunk`/`AsyncReadChunk` pair in
//! `backup/read_chunk.rs` hand-rolls `Pin<Box<dyn Future<...>>>` instead,
//! predating `async-trait`'s adoption; this crate follows the newer,
//! now-universal idiom).

use async_trait::async_trait;

use super::entry::{MessageId, SegmentEntry};
use super::error::FetchError;

/// Opaque segment fetcher over the underlying Usenet transport.
///
/// `open_at` is always called with a `file_start`/`len` pair that is
/// exactly one covering [`SegmentEntry`]'s range (spec §4.3.1, tested by
/// property 2 in spec §8): the fetcher never has to reassemble or split
/// a request itself.
#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    async fn open_at(
        &self,
        id: &MessageId,
        file_start: u64,
        len: u64,
    ) -> Result<Vec<u8>, FetchError>;
}

/// Computes the segment layout of a file from its metadata (spec §6).
#[async_trait]
pub trait SegmentEntryProvider: Send + Sync {
    async fn get_segment_entries(
        &self,
        path: &str,
    ) -> anyhow::Result<(Vec<SegmentEntry>, u64)>;
}

/// Optional hook invoked whenever bytes arrive at the Store (spec §6).
/// The core never depends on it for correctness; a no-op default is
/// provided for embedders that don't track progress.
pub trait ProgressSink: Send + Sync {
    fn update_download_progress(&self, id: &MessageId, bytes: u64);
}

/// Default sink that discards all progress updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn update_download_progress(&self, _id: &MessageId, _bytes: u64) {}
}
