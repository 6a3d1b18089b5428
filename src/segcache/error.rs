//! Error taxonomy for the segment cache (spec §7).

use std::io;

use thiserror::Error;

use super::entry::MessageId;

/// Errors surfaced by the [`super::fetcher::SegmentFetcher`] seam.
///
/// Opaque by design: the core does not interpret network/NNTP-level
/// failure reasons, it only counts them and feeds the circuit breaker.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch of segment {id} timed out")]
    Timeout { id: MessageId },

    #[error("fetch of segment {id} failed: {source}")]
    Transport {
        id: MessageId,
        #[source]
        source: anyhow::Error,
    },

    #[error("fetch of segment {id} returned a short read (got {got}, wanted {wanted})")]
    ShortRead {
        id: MessageId,
        got: u64,
        wanted: u64,
    },

    #[error("fetch of segment {id} was cancelled")]
    Cancelled { id: MessageId },
}

impl FetchError {
    pub fn id(&self) -> &MessageId {
        match self {
            FetchError::Timeout { id }
            | FetchError::Transport { id, .. }
            | FetchError::ShortRead { id, .. }
            | FetchError::Cancelled { id } => id,
        }
    }
}

/// Errors surfaced at the Assembler/Store boundary (spec §7).
#[derive(Debug, Error)]
pub enum CacheError {
    /// `off < 0` was requested of `read_at`.
    #[error("invalid read offset")]
    OutOfBounds,

    /// Every attempt (including the single retry, spec §4.3 step 4b) to
    /// fetch a segment failed.
    #[error("failed to fetch segment {0}: {1}")]
    FetchFailed(MessageId, #[source] FetchError),

    /// The caller's context was cancelled while waiting on a fetch.
    #[error("read cancelled")]
    Cancelled,

    /// `Store::put` could not write or rename the backing file.
    #[error("failed to persist segment {0} to disk: {1}")]
    StoreCorruption(MessageId, #[source] io::Error),

    /// `MaxSizeBytes == 0` was configured; the store refuses all writes.
    #[error("segment store is disabled (MaxSizeBytes == 0)")]
    Disabled,

    /// A segment vanished from the store between the coalesced fetch and
    /// the follow-up `Get`, and the single permitted retry also missed.
    #[error("segment {0} missing from store after put")]
    MissingAfterPut(MessageId),

    /// `Manager::open`'s caller-supplied segment layout failed spec.md §3's
    /// layout invariant (sorted, contiguous, starts at 0, ends at the
    /// file size).
    #[error("invalid segment layout: {0}")]
    InvalidSegmentLayout(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl From<CacheError> for io::Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::OutOfBounds => io::Error::new(io::ErrorKind::InvalidInput, err),
            CacheError::Cancelled => io::Error::new(io::ErrorKind::Interrupted, err),
            _ => io::Error::new(io::ErrorKind::Other, err),
        }
    }
}
