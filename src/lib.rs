//! This crate implements AltMount's segment-aligned read cache: the
//! subsystem that sits between the virtual-file read path and the
//! Usenet transport.
//!
//! # Scope
//!
//! AltMount mounts Usenet content as a virtual filesystem and serves it
//! over FUSE/WebDAV. Reading a file means translating arbitrary byte
//! ranges from many concurrent clients into network fetches of
//! ~750 KB segments, each identified by a globally unique message ID.
//! This crate owns that translation:
//!
//! - [`segcache::store::Store`] — the disk-backed, size-bounded
//!   key/value store from message ID to decoded segment bytes.
//! - [`segcache::coalescer::Coalescer`] — singleflight-style
//!   deduplication so concurrent callers share one outstanding fetch per
//!   segment.
//! - [`segcache::assembler::SegmentCachedFile`] — the per-open-file
//!   object that turns a `(off, len)` read into a list of segment
//!   fetches and assembles the result.
//! - [`segcache::prefetcher::Prefetcher`] — sequential-access detection,
//!   bounded lookahead, and a circuit breaker for sustained fetch
//!   failures.
//! - [`segcache::manager::Manager`] — lifecycle: constructs the above,
//!   runs periodic eviction/cleanup/catalog-flush and idle-prefetcher
//!   reaping, and publishes [`segcache::metrics::CacheStats`].
//!
//! # Non-goals
//!
//! This crate is not a general-purpose block cache: it assumes
//! immutable content keyed by globally unique message IDs. It does not
//! guarantee durability of cached bytes across a catastrophic crash (the
//! on-disk catalog may lag by one flush interval). It does not retry at
//! the NNTP level; any fetch failure is treated as opaque and only feeds
//! the Prefetcher's circuit breaker.
//!
//! The NZB parser, importer pipeline, archive extraction, the
//! WebDAV/FUSE front-ends, the HTTP API, auth, config persistence, the
//! NNTP connection pool itself, and health/repair/ARR integrations are
//! all external collaborators reached only through the
//! [`segcache::fetcher::SegmentFetcher`],
//! [`segcache::fetcher::SegmentEntryProvider`], and
//! [`segcache::fetcher::ProgressSink`] trait seams.

pub mod config;
pub mod segcache;

pub use config::SegmentCacheConfig;
