//! Stats snapshot (spec §4.5 `GetStats`) and the progress-sink interface
//! re-export (spec §6, consumer-only from this crate's perspective: the
//! surrounding pool metrics tracker is out of scope, spec §1).

/// Point-in-time snapshot published by [`super::manager::Manager::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_size: u64,
    pub item_count: usize,
    pub active_files: usize,
}
