//! Prefetcher (spec §4.4): per-path sequential-access detector, bounded
//! lookahead scheduler, and circuit breaker.
//!
//! The bounded-concurrency lookahead follows the shape used throughout
//! the retrieval pack for readahead workers (e.g.
//! `other_examples/.../preload-ng/prefetcher.rs`'s `execute_concurrent`);
//! cancellation uses `tokio_util::sync::CancellationToken`, the
//! structured-cancellation primitive spec §9 calls for in languages that
//! have one, rather than hand-threaded stop booleans.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::coalescer::Coalescer;
use super::entry::SegmentEntry;
use super::fetcher::SegmentFetcher;
use super::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchState {
    Idle,
    SequentialActive,
    CircuitOpen,
    Stopped,
}

/// Tunables for one [`Prefetcher`] (spec §4.4 and §6 configuration
/// surface).
#[derive(Debug, Clone)]
pub struct PrefetcherParams {
    pub read_ahead_segments: usize,
    pub prefetch_concurrency: usize,
    pub sequential_hits_to_engage: u32,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
    pub idle_threshold: Duration,
}

impl Default for PrefetcherParams {
    fn default() -> Self {
        Self {
            read_ahead_segments: 8,
            prefetch_concurrency: 3,
            sequential_hits_to_engage: 3,
            circuit_breaker_threshold: 10,
            circuit_breaker_cooldown: Duration::from_secs(60),
            idle_threshold: Duration::from_secs(30),
        }
    }
}

impl From<&crate::config::SegmentCacheConfig> for PrefetcherParams {
    fn from(cfg: &crate::config::SegmentCacheConfig) -> Self {
        Self {
            read_ahead_segments: cfg.read_ahead_segments,
            prefetch_concurrency: cfg.prefetch_concurrency,
            sequential_hits_to_engage: cfg.sequential_hits_to_engage,
            circuit_breaker_threshold: cfg.circuit_breaker_threshold,
            circuit_breaker_cooldown: cfg.circuit_breaker_cooldown,
            idle_threshold: cfg.idle_threshold,
        }
    }
}

struct SeqState {
    last_seg: Option<u64>,
    hits: u32,
    state: PrefetchState,
    circuit_opened_at: Option<Instant>,
    last_seen: Instant,
}

struct Lookahead {
    token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// Resets the consecutive-error counter after a successful fetch,
/// whether it ran in the foreground or in a lookahead task.
fn note_fetch_success(error_count: &AtomicU32) {
    error_count.store(0, Ordering::SeqCst);
}

/// Records a fetch failure against the shared error counter and, once
/// `threshold` consecutive failures have accumulated, trips the circuit
/// breaker through the same `seq` state machine `record_access` reads.
/// Returns `true` if this call tripped the breaker open.
fn note_fetch_failure(
    seq: &std::sync::Mutex<SeqState>,
    error_count: &AtomicU32,
    threshold: u32,
) -> bool {
    let count = error_count.fetch_add(1, Ordering::SeqCst) + 1;
    if count < threshold {
        return false;
    }
    let mut seq = seq.lock().unwrap();
    if seq.state != PrefetchState::Stopped {
        seq.state = PrefetchState::CircuitOpen;
        seq.circuit_opened_at = Some(Instant::now());
    }
    true
}

/// Per-path prefetcher, shared across concurrent opens of the same path
/// (spec §3, §4.4).
pub struct Prefetcher {
    params: PrefetcherParams,
    entries: Arc<Vec<SegmentEntry>>,
    store: Arc<Store>,
    coalescer: Arc<Coalescer>,
    fetcher: Arc<dyn SegmentFetcher>,
    semaphore: Arc<Semaphore>,
    seq: Arc<std::sync::Mutex<SeqState>>,
    error_count: Arc<AtomicU32>,
    lookahead: AsyncMutex<Lookahead>,
}

impl Prefetcher {
    pub fn new(
        params: PrefetcherParams,
        entries: Arc<Vec<SegmentEntry>>,
        store: Arc<Store>,
        coalescer: Arc<Coalescer>,
        fetcher: Arc<dyn SegmentFetcher>,
    ) -> Self {
        let concurrency = params.prefetch_concurrency.max(1);
        Self {
            params,
            entries,
            store,
            coalescer,
            fetcher,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            seq: Arc::new(std::sync::Mutex::new(SeqState {
                last_seg: None,
                hits: 0,
                state: PrefetchState::Idle,
                circuit_opened_at: None,
                last_seen: Instant::now(),
            })),
            error_count: Arc::new(AtomicU32::new(0)),
            lookahead: AsyncMutex::new(Lookahead {
                token: None,
                handle: None,
            }),
        }
    }

    pub fn state(&self) -> PrefetchState {
        self.seq.lock().unwrap().state
    }

    pub fn is_idle_since(&self, threshold: Duration) -> bool {
        self.seq.lock().unwrap().last_seen.elapsed() >= threshold
    }

    /// Records a foreground (or lookahead) access at segment index `k`
    /// and runs the state machine in spec §4.4's transition table.
    pub async fn record_access(&self, k: usize) {
        let (cancel, schedule, from) = {
            let mut seq = self.seq.lock().unwrap();
            seq.last_seen = Instant::now();
            if seq.state == PrefetchState::Stopped {
                return;
            }

            if seq.state == PrefetchState::CircuitOpen {
                if let Some(opened) = seq.circuit_opened_at {
                    if opened.elapsed() >= self.params.circuit_breaker_cooldown {
                        seq.state = PrefetchState::Idle;
                        seq.circuit_opened_at = None;
                        self.error_count.store(0, Ordering::SeqCst);
                    }
                }
            }

            let k = k as u64;
            let mut cancel = false;
            let mut schedule = false;
            match seq.last_seg {
                Some(prev) if k == prev + 1 => {
                    seq.hits += 1;
                    seq.last_seg = Some(k);
                    if seq.state == PrefetchState::Idle
                        && seq.hits >= self.params.sequential_hits_to_engage
                    {
                        seq.state = PrefetchState::SequentialActive;
                        schedule = true;
                    } else if seq.state == PrefetchState::SequentialActive {
                        schedule = true;
                    }
                }
                _ => {
                    cancel = seq.state == PrefetchState::SequentialActive;
                    seq.hits = 1;
                    seq.last_seg = Some(k);
                    if seq.state != PrefetchState::CircuitOpen {
                        seq.state = PrefetchState::Idle;
                    }
                }
            }

            if seq.state == PrefetchState::CircuitOpen {
                schedule = false;
            }

            (cancel, schedule, seq.last_seg.unwrap())
        };

        if cancel {
            self.cancel_lookahead().await;
        }
        if schedule {
            self.schedule_lookahead(from).await;
        }
    }

    /// Cancels any in-flight lookahead task. Called on a non-sequential
    /// access (seek) and on `Stop()`.
    pub async fn cancel_lookahead(&self) {
        let mut guard = self.lookahead.lock().await;
        if let Some(token) = guard.token.take() {
            token.cancel();
        }
        if let Some(handle) = guard.handle.take() {
            handle.abort();
        }
    }

    async fn schedule_lookahead(&self, from: u64) {
        let mut guard = self.lookahead.lock().await;
        if let Some(handle) = &guard.handle {
            if !handle.is_finished() {
                return; // already have an in-flight lookahead
            }
        }

        let token = CancellationToken::new();
        let targets: Vec<usize> = ((from + 1)..=(from + self.params.read_ahead_segments as u64))
            .map(|i| i as usize)
            .filter(|&i| i < self.entries.len())
            .collect();

        if targets.is_empty() {
            guard.token = None;
            guard.handle = None;
            return;
        }

        let entries = self.entries.clone();
        let store = self.store.clone();
        let coalescer = self.coalescer.clone();
        let fetcher = self.fetcher.clone();
        let semaphore = self.semaphore.clone();
        let child_token = token.clone();
        let error_count = self.error_count.clone();
        let seq = self.seq.clone();
        let threshold = self.params.circuit_breaker_threshold;

        let handle = tokio::spawn(async move {
            for idx in targets {
                if child_token.is_cancelled() {
                    break;
                }
                let entry = entries[idx].clone();
                if store.has(&entry.message_id).await {
                    continue;
                }
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                if child_token.is_cancelled() {
                    drop(permit);
                    break;
                }

                let fetcher = fetcher.clone();
                let store = store.clone();
                let id = entry.message_id.clone();
                let file_start = entry.file_start;
                let len = entry.len();
                let result = coalescer
                    .do_once(&entry.message_id, move || async move {
                        let data = fetcher.open_at(&id, file_start, len).await?;
                        store
                            .put(&id, &data)
                            .await
                            .map_err(|e| super::error::FetchError::Transport {
                                id: id.clone(),
                                source: anyhow::anyhow!(e),
                            })?;
                        Ok(data)
                    })
                    .await;
                drop(permit);

                if result.is_err() {
                    if note_fetch_failure(&seq, &error_count, threshold) {
                        debug!("prefetcher circuit breaker tripped after {threshold} consecutive errors");
                        break;
                    }
                } else {
                    note_fetch_success(&error_count);
                }
            }
        });

        guard.token = Some(token);
        guard.handle = Some(handle);
    }

    /// Called by the foreground read path whenever a fetch it performed
    /// completes, so the circuit breaker also sees foreground errors
    /// (spec §8 scenario F: 10 foreground failures alone trip it).
    pub fn record_fetch_outcome(&self, success: bool) {
        if success {
            note_fetch_success(&self.error_count);
            return;
        }
        note_fetch_failure(&self.seq, &self.error_count, self.params.circuit_breaker_threshold);
    }

    pub async fn stop(&self) {
        {
            let mut seq = self.seq.lock().unwrap();
            seq.state = PrefetchState::Stopped;
        }
        self.cancel_lookahead().await;
    }
}
