#![forbid(unsafe_code)]

//! The recursive model rewrite: propagate a patch through an observer's
//! current tree, detecting cascading deletes and changed ancestors.
//!
//! # Algorithm
//!
//! Recursive descent over the current root, threading one mutable
//! accumulator through the recursion:
//!
//! 1. A node whose id is directly patched either short-circuits (the
//!    replacement is semantically equal — nothing observable changed),
//!    deletes (patched to `None`), or is replaced wholesale. A wholesale
//!    replacement also surfaces patched descendants of the *old* subtree
//!    as changed, because the observer sees their new values arrive with
//!    the replacement.
//! 2. Otherwise the node's children are mapped recursively. A child
//!    deletion the node cannot tolerate cascades upward through
//!    `map_children` returning `None`. A node whose subtree recorded any
//!    change or deletion is itself marked changed.
//!
//! The accumulator growing across a `map_children` call is the only
//! "did anything happen below" signal; when it did not grow, the original
//! node is returned untouched and no copy is made.
//!
//! # Tie-breaks
//!
//! - A node both patched and cascade-deleted resolves as deleted; the
//!   delivery-time [`Delta::normalize`](crate::delta::Delta::normalize)
//!   enforces disjointness.
//! - Duplicate ids are rewritten independently per occurrence; the delta
//!   sets record each id once.
//! - Id-less nodes are traversed but never recorded.

use rustc_hash::FxHashMap;

use crate::delta::Delta;
use crate::model::{Model, ModelId, ModelRef};
use crate::observer::CriticalError;

/// Replacement map: `None` means "delete this id".
pub type Patch = FxHashMap<ModelId, Option<ModelRef>>;

/// Everything a rewrite produced, beyond the new root itself.
#[derive(Default)]
pub struct RewriteOutcome {
    /// The rebuilt root; `None` iff the root was deleted directly or by
    /// cascade.
    pub new_root: Option<ModelRef>,
    /// Ids changed or deleted relative to the input root. Not yet
    /// normalized; the delivery path subtracts `deleted` from `changed`.
    pub delta: Delta,
    /// Replacement subtrees introduced wholesale. The engine indexes
    /// their reachable ids so future updates to nodes within them reach
    /// the observer.
    pub introduced: Vec<ModelRef>,
    /// `(old, new)` pairs for the will-replace delegate hook, in
    /// traversal order.
    pub replacements: Vec<(ModelRef, ModelRef)>,
    /// Contract violations detected during the rewrite.
    pub errors: Vec<CriticalError>,
}

/// Rewrite `current` against `patch`.
#[must_use]
pub fn rewrite(current: &ModelRef, patch: &Patch) -> RewriteOutcome {
    let mut outcome = RewriteOutcome::default();
    let new_root = rewrite_node(current, patch, &mut outcome);
    outcome.new_root = new_root;
    outcome
}

fn rewrite_node(
    current: &ModelRef,
    patch: &Patch,
    acc: &mut RewriteOutcome,
) -> Option<ModelRef> {
    if let Some(id) = current.identity()
        && let Some(entry) = patch.get(&id)
    {
        return match entry {
            None => {
                acc.delta.mark_deleted(id);
                None
            }
            Some(replacement) if replacement.eq_model(current.as_ref()) => {
                Some(current.clone())
            }
            Some(replacement) => {
                acc.replacements.push((current.clone(), replacement.clone()));
                changed_submodel_ids(current, patch, &mut acc.delta);
                acc.delta.mark_changed(id);
                acc.introduced.push(replacement.clone());
                Some(replacement.clone())
            }
        };
    }

    let recorded_before = acc.delta.len();
    let mapped = current.map_children(&mut |child| rewrite_node(&child, patch, acc));
    let subtree_recorded = acc.delta.len() > recorded_before;

    match mapped {
        None => {
            // Cascading delete: a required child vanished.
            if let Some(id) = current.identity() {
                acc.delta.mark_deleted(id);
            }
            None
        }
        Some(_) if !subtree_recorded => Some(current.clone()),
        Some(mapped) => {
            if mapped.as_any().type_id() != current.as_any().type_id() {
                acc.errors.push(CriticalError::WrongMapType {
                    id: current.identity(),
                });
            }
            if let Some(id) = current.identity() {
                acc.delta.mark_changed(id);
            }
            Some(mapped)
        }
    }
}

/// Second pass over a replaced subtree's *old* children: patched,
/// non-equal descendants must still surface as changed even though the
/// whole subtree was swapped at once.
fn changed_submodel_ids(old_root: &ModelRef, patch: &Patch, delta: &mut Delta) {
    old_root.for_each_child(&mut |child| {
        if let Some(id) = child.identity()
            && let Some(Some(replacement)) = patch.get(&id)
            && !replacement.eq_model(child.as_ref())
        {
            delta.mark_changed(id);
        }
        changed_submodel_ids(child, patch, delta);
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
