//! Segment Cache Core.
//!
//! This is the subsystem that sits between AltMount's virtual-file read
//! path and the network. It translates random-range reads from many
//! concurrent clients (media players, importers, WebDAV) into exactly
//! one network fetch per Usenet *segment*, deduplicates concurrent
//! misses, prefetches ahead during sequential playback, and evicts under
//! a bounded on-disk footprint.
//!
//! # Data flow
//!
//! ```text
//! read(off, len) -> Assembler -> [covering segments via binary search]
//!    for each segment s:
//!      if Store.Has(s): read from disk
//!      else: Coalescer(s) -> Fetcher.OpenAt(s.fileStart, s.bytes) -> Store.Put(s)
//!    Prefetcher.RecordAccess(firstSegmentIdx)  // may schedule lookahead
//! ```
//!
//! # Locking
//!
//! The [`store::Store`]'s mutex is the only critical region covering
//! in-memory catalog state; all disk I/O happens outside it. The
//! [`prefetcher::Prefetcher`] uses a second lock for its sequential-
//! detection counters and plain atomics for the circuit breaker, so no
//! lock-order cycle is possible: no task ever holds more than one of
//! these at a time.
//!
//! # Ownership
//!
//! The [`manager::Manager`] owns the Store and the per-path Prefetcher
//! table. Each [`assembler::SegmentCachedFile`] holds only shared,
//! non-owning references; closing a file decrements the Manager's
//! active-file counter but never tears down a Prefetcher directly — the
//! idle monitor does, once a path has no open files and has been quiet
//! past `IdleThreshold`.

pub mod assembler;
pub mod coalescer;
pub mod entry;
pub mod error;
pub mod fetcher;
pub mod manager;
pub mod metrics;
pub mod prefetcher;
pub mod store;

pub use assembler::{ReadOutcome, SegmentCachedFile};
pub use coalescer::Coalescer;
pub use entry::{CacheEntry, Catalog, MessageId, SegmentEntry};
pub use error::{CacheError, FetchError};
pub use fetcher::{NullProgressSink, ProgressSink, SegmentEntryProvider, SegmentFetcher};
pub use manager::Manager;
pub use metrics::CacheStats;
pub use prefetcher::{Prefetcher, PrefetcherParams, PrefetchState};
pub use store::Store;
