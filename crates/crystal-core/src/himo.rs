//! Himo cache/eviction engine
//!
//! A process-wide (but injectable) memory-bounded cache of loaded
//! fragments ("himos") belonging to flake containers. When aggregate
//! cached size exceeds the configured limit, the oldest entries are
//! forced to save through their owning container and detached.
//!
//! Concurrency contract: candidates are collected under the cache mutex,
//! the forced saves run with the mutex released, and the loop re-checks
//! the shared counter every iteration. The mutex is never held across an
//! awaited I/O call.

use crate::flake::{FlakeId, FragmentId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Weak;
use tracing::{debug, warn};

/// Default slack below the limit that eviction drives usage down to
pub const DEFAULT_MARGIN: i64 = 100 * 1024 * 1024;

/// Entries dequeued per pass while the mutex is held
const EVICTION_BATCH: usize = 10;

/// Stale queue nodes tolerated per live entry before compaction
const QUEUE_COMPACT_SLACK: usize = 2;

/// Queue length below which compaction never runs
const QUEUE_COMPACT_FLOOR: usize = 64;

/// Identity of one cached fragment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HimoKey {
    pub flake: FlakeId,
    pub fragment: FragmentId,
}

impl HimoKey {
    /// Create a key for a fragment within a flake
    #[must_use]
    pub fn new(flake: FlakeId, fragment: FragmentId) -> Self {
        Self { flake, fragment }
    }
}

/// Save capability of a himo's owning container
///
/// The cache holds only a weak handle: the container owns its himos'
/// lifetime, the cache just references them.
#[async_trait]
pub trait HimoOwner: Send + Sync {
    /// Serialize and write one fragment through the owner's filer.
    /// `forced` means the call comes from eviction and the owner should
    /// drop its memory-resident copy after the write. Returns `true`
    /// when the resident copy was dropped (the entry can be detached),
    /// `false` when the fragment was rewritten while the save was in
    /// flight and must stay cached.
    async fn save_data(&self, fragment: FragmentId, forced: bool) -> crystal_common::Result<bool>;
}

struct HimoEntry {
    size: i64,
    seq: u64,
    owner: Weak<dyn HimoOwner>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<HimoKey, HimoEntry>,
    /// Recency queue: stale (seq mismatch) nodes are skipped at dequeue
    queue: VecDeque<(u64, HimoKey)>,
    /// Invariant: equals the sum of `size` over all live entries
    usage: i64,
    next_seq: u64,
}

/// Memory-bounded cache with write-back eviction
pub struct HimoCache {
    inner: Mutex<CacheInner>,
    limit: i64,
    margin: i64,
}

impl HimoCache {
    /// Create a cache with the default margin
    #[must_use]
    pub fn new(limit: i64) -> Self {
        Self::with_margin(limit, DEFAULT_MARGIN)
    }

    /// Create a cache with an explicit margin
    #[must_use]
    pub fn with_margin(limit: i64, margin: i64) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            limit,
            margin,
        }
    }

    /// Aggregate size of all cached fragments
    #[must_use]
    pub fn memory_usage(&self) -> i64 {
        self.inner.lock().usage
    }

    /// Number of live cached fragments
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check whether the cache holds no fragments
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// The usage floor eviction drives down to
    fn target(&self) -> i64 {
        self.margin.max(self.limit - self.margin)
    }

    /// Register or refresh a cached fragment
    ///
    /// Links a new entry at the most-recently-used end, or refreshes an
    /// existing one (recency bump plus size delta). If the limit is
    /// crossed, eviction runs before returning - after the mutex is
    /// released.
    pub async fn touch(&self, owner: Weak<dyn HimoOwner>, key: HimoKey, new_size: i64) {
        let over_limit = {
            let mut inner = self.inner.lock();
            inner.next_seq += 1;
            let seq = inner.next_seq;
            let previous = match inner.entries.get_mut(&key) {
                Some(entry) => {
                    let previous = entry.size;
                    entry.size = new_size;
                    entry.seq = seq;
                    entry.owner = owner;
                    previous
                }
                None => {
                    inner.entries.insert(
                        key,
                        HimoEntry {
                            size: new_size,
                            seq,
                            owner,
                        },
                    );
                    0
                }
            };
            inner.queue.push_back((seq, key));
            inner.usage += new_size - previous;
            Self::maybe_compact(&mut inner);
            inner.usage > self.limit
        };

        if over_limit {
            self.unload().await;
        }
    }

    /// Evict least-recently-used fragments until usage falls to the
    /// target floor
    ///
    /// Concurrent callers are self-limiting: every iteration re-reads
    /// the counter, and dequeue is atomic, so no entry is evicted twice.
    /// A save failure logs and relinks the entry at the MRU end so one
    /// stuck fragment never blocks the rest.
    pub async fn unload(&self) {
        loop {
            let target = self.target();
            let batch = {
                let mut inner = self.inner.lock();
                if inner.usage <= target {
                    return;
                }
                // Capture only as many LRU entries as the deficit needs,
                // capped at the batch size
                let mut projected = inner.usage;
                let mut batch = Vec::with_capacity(EVICTION_BATCH);
                while batch.len() < EVICTION_BATCH && projected > target {
                    let Some((seq, key)) = inner.queue.pop_front() else {
                        break;
                    };
                    match inner.entries.get(&key) {
                        // Live node: the entry was last touched by this
                        // queue position
                        Some(entry) if entry.seq == seq => {
                            projected -= entry.size;
                            batch.push((key, entry.owner.clone()));
                        }
                        _ => continue,
                    }
                }
                if batch.is_empty() {
                    // Oversized individual entries (or all in flight
                    // elsewhere); nothing left to evict
                    warn!(
                        usage = inner.usage,
                        target, "eviction queue drained with usage above target"
                    );
                    return;
                }
                batch
            };

            let mut progressed = false;
            for (key, owner) in batch {
                match owner.upgrade() {
                    Some(owner) => match owner.save_data(key.fragment, true).await {
                        Ok(true) => {
                            self.detach(key);
                            progressed = true;
                        }
                        Ok(false) => {
                            // Rewritten past the decision point: the
                            // entry stays, with a fresh recency position
                            debug!(
                                flake = %key.flake,
                                fragment = %key.fragment,
                                "fragment rewritten during eviction, stays cached"
                            );
                            self.relink(key);
                        }
                        Err(e) => {
                            warn!(
                                flake = %key.flake,
                                fragment = %key.fragment,
                                error = %e,
                                "forced save failed, himo stays cached"
                            );
                            self.relink(key);
                        }
                    },
                    // Owner is gone: nothing to flush to
                    None => {
                        self.detach(key);
                        progressed = true;
                    }
                }
            }

            if !progressed {
                debug!("eviction pass made no progress, deferring to next trigger");
                return;
            }
        }
    }

    /// Remove an evicted entry and release its accounted size
    ///
    /// Idempotent; a concurrent re-touch after the save decision simply
    /// re-creates the entry later.
    pub fn detach(&self, key: HimoKey) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.remove(&key) {
            inner.usage -= entry.size;
        }
    }

    /// Relink a dequeued entry at the most-recently-used end
    fn relink(&self, key: HimoKey) {
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.seq = seq;
            inner.queue.push_back((seq, key));
        }
        Self::maybe_compact(&mut inner);
    }

    /// Drop stale queue nodes once they outnumber live entries
    ///
    /// Touches under the limit only ever push; without this, a stable
    /// working set would grow the queue by one node per touch forever.
    fn maybe_compact(inner: &mut CacheInner) {
        let bound = (inner.entries.len() * QUEUE_COMPACT_SLACK).max(QUEUE_COMPACT_FLOOR);
        if inner.queue.len() > bound {
            let CacheInner { entries, queue, .. } = inner;
            queue.retain(|(seq, key)| entries.get(key).map_or(false, |e| e.seq == *seq));
        }
    }

    #[cfg(test)]
    fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Discard one fragment without saving (explicit unload)
    pub fn remove(&self, key: HimoKey) {
        self.detach(key);
    }

    /// Discard every fragment belonging to a flake without saving
    pub fn remove_flake(&self, flake: FlakeId) {
        let mut inner = self.inner.lock();
        let removed: Vec<HimoKey> = inner
            .entries
            .keys()
            .filter(|key| key.flake == flake)
            .copied()
            .collect();
        for key in removed {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.usage -= entry.size;
            }
        }
        // Stale queue nodes for these keys are skipped at dequeue
    }
}
