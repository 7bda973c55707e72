#![forbid(unsafe_code)]

//! The listener index: id → weakly held observer set.
//!
//! This is the authoritative subscription table. It is owned by the serial
//! worker and carries no interior locking — serial job ordering is the
//! concurrency control. Reads from any other thread are forbidden.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::model::ModelId;
use crate::observer::Observer;
use crate::weak_set::WeakSet;

/// Subscription table mapping node ids to the observers interested in
/// them. Dead handles are reclaimed lazily: on lookup, on explicit prune,
/// and on removal.
#[derive(Default)]
pub struct ListenerIndex {
    buckets: FxHashMap<ModelId, WeakSet<dyn Observer>>,
}

impl ListenerIndex {
    /// An empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `observer` to `id`'s bucket iff not already present by
    /// pointer identity.
    pub fn add(&mut self, id: ModelId, observer: &Arc<dyn Observer>) {
        let bucket = self.buckets.entry(id).or_default();
        if !bucket.contains_identity(observer) {
            bucket.append(observer);
        }
    }

    /// Remove `observer` from every bucket it appears in. Dead slots in
    /// visited buckets are compacted as a side effect; buckets left empty
    /// are dropped.
    pub fn remove(&mut self, observer: &Arc<dyn Observer>) {
        self.buckets.retain(|_, bucket| {
            let kept = bucket.map(|slot| slot.filter(|live| !Arc::ptr_eq(live, observer)));
            let keep = !kept.is_empty();
            *bucket = kept;
            keep
        });
    }

    /// Live observers subscribed to `id`, in insertion order. Prunes the
    /// bucket and writes back the compacted set.
    pub fn observers_for(&mut self, id: &ModelId) -> Vec<Arc<dyn Observer>> {
        match self.buckets.get_mut(id) {
            Some(bucket) => bucket.prune(),
            None => Vec::new(),
        }
    }

    /// Prune every bucket and drop the ones left empty. Invoked on GC
    /// ticks and memory pressure.
    pub fn prune_all(&mut self) {
        self.buckets.retain(|_, bucket| {
            bucket.prune();
            !bucket.is_empty()
        });
    }

    /// Number of buckets currently held (dead-only buckets included
    /// until the next prune).
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of slots in `id`'s bucket, dead or live.
    #[must_use]
    pub fn bucket_len(&self, id: &ModelId) -> usize {
        self.buckets.get(id).map_or(0, WeakSet::len)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
