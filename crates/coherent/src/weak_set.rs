#![forbid(unsafe_code)]

//! An ordered, append-only collection of weak handles.
//!
//! One generic container serves every capability the engine holds weakly
//! (observers, delegates), instead of one hand-rolled weak array per
//! capability type.
//!
//! # Invariants
//!
//! 1. Iteration order is insertion order.
//! 2. [`WeakSet::prune`] is the only in-place compaction; callers invoke it
//!    opportunistically (lookup, GC tick, memory pressure).
//! 3. Liveness is checked at the moment of use — a slot that upgraded a
//!    moment ago may be dead now, and that is never an error.

use std::sync::{Arc, Weak};

use smallvec::SmallVec;

/// Weak handles in insertion order. Most buckets hold one or two
/// observers, hence the inline capacity.
pub struct WeakSet<T: ?Sized> {
    slots: SmallVec<[Weak<T>; 2]>,
}

impl<T: ?Sized> Default for WeakSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> WeakSet<T> {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: SmallVec::new(),
        }
    }

    /// Number of slots, live or dead.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no slots are held (dead slots still count).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Append a weak handle to `value`.
    pub fn append(&mut self, value: &Arc<T>) {
        self.slots.push(Arc::downgrade(value));
    }

    /// Membership by pointer identity, not semantic equality. Dead slots
    /// never match.
    #[must_use]
    pub fn contains_identity(&self, value: &Arc<T>) -> bool {
        self.slots
            .iter()
            .filter_map(Weak::upgrade)
            .any(|live| Arc::ptr_eq(&live, value))
    }

    /// Upgrade every live slot, drop the dead ones in place, and return
    /// the live values in insertion order.
    pub fn prune(&mut self) -> Vec<Arc<T>> {
        let mut live = Vec::with_capacity(self.slots.len());
        self.slots.retain(|slot| match slot.upgrade() {
            Some(value) => {
                live.push(value);
                true
            }
            None => false,
        });
        live
    }

    /// A new set where each slot is replaced by `f(upgrade(slot))`.
    /// Returning `None` drops the slot, so `f` compacts dead slots by
    /// answering `None` for a `None` input.
    #[must_use]
    pub fn map(&self, mut f: impl FnMut(Option<Arc<T>>) -> Option<Arc<T>>) -> WeakSet<T> {
        let mut out = WeakSet::new();
        for slot in &self.slots {
            if let Some(kept) = f(slot.upgrade()) {
                out.append(&kept);
            }
        }
        out
    }

    /// Live values in insertion order, without compacting.
    pub fn iter_live(&self) -> impl Iterator<Item = Arc<T>> + '_ {
        self.slots.iter().filter_map(Weak::upgrade)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
