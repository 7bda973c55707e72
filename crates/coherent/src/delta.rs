#![forbid(unsafe_code)]

//! Delta: the pair of disjoint id-sets describing what a rewrite changed.
//!
//! # Invariants (at delivery)
//!
//! 1. `changed ∩ deleted = ∅` — enforced by [`Delta::normalize`], which
//!    subtracts `deleted` from `changed` (deleted wins).
//! 2. Every id in `deleted` refers to a node absent from the delivered root.
//! 3. Every id in `changed` refers to a node present in the delivered root
//!    whose value differs from the observer's previous root.
//!
//! (2) and (3) are properties of the rewrite that produced the delta; the
//! type itself only guarantees (1).

use rustc_hash::FxHashSet;

use crate::model::ModelId;

/// Ids changed or deleted by a rewrite, computed against an observer's
/// prior root.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct Delta {
    changed: FxHashSet<ModelId>,
    deleted: FxHashSet<ModelId>,
}

impl Delta {
    /// An empty delta.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing changed and nothing was deleted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }

    /// Ids whose value differs from the prior root.
    #[must_use]
    pub fn changed(&self) -> &FxHashSet<ModelId> {
        &self.changed
    }

    /// Ids present in the prior root but absent from the new root.
    #[must_use]
    pub fn deleted(&self) -> &FxHashSet<ModelId> {
        &self.deleted
    }

    /// Total number of recorded ids. Used by the rewriter to detect whether
    /// a subtree recorded anything across a `map_children` call.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changed.len() + self.deleted.len()
    }

    pub(crate) fn mark_changed(&mut self, id: ModelId) {
        self.changed.insert(id);
    }

    pub(crate) fn mark_deleted(&mut self, id: ModelId) {
        self.deleted.insert(id);
    }

    pub(crate) fn changed_mut(&mut self) -> &mut FxHashSet<ModelId> {
        &mut self.changed
    }

    pub(crate) fn deleted_mut(&mut self) -> &mut FxHashSet<ModelId> {
        &mut self.deleted
    }

    /// Subtract `deleted` from `changed`. Called once before every
    /// delivery so the two sets are disjoint.
    pub fn normalize(&mut self) {
        if !self.deleted.is_empty() {
            self.changed.retain(|id| !self.deleted.contains(id));
        }
    }

    /// Fold a later delta into this one, the paused-observer merge rule:
    ///
    /// ```text
    /// changed ← (changed ∪ later.changed) \ (deleted ∪ later.deleted)
    /// deleted ← deleted ∪ later.deleted
    /// ```
    pub fn absorb(&mut self, later: Delta) {
        self.changed.extend(later.changed);
        self.deleted.extend(later.deleted);
        self.changed.retain(|id| !self.deleted.contains(id));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
