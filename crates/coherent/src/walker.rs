#![forbid(unsafe_code)]

//! Read-only recursive traversal over the model capability.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::model::{Model, ModelId, ModelRef};

/// Pre-order visit: `root` first, then each child subtree in child order.
pub fn visit_all(root: &ModelRef, f: &mut dyn FnMut(&ModelRef)) {
    f(root);
    root.for_each_child(&mut |child| visit_all(child, f));
}

/// Collect every identified node into a map. Later occurrences of a
/// duplicate id (in pre-order tree position) overwrite earlier ones, which
/// the engine relies on when comparing old and new trees by id.
#[must_use]
pub fn flatten_by_id(root: &ModelRef) -> FxHashMap<ModelId, ModelRef> {
    let mut out = FxHashMap::default();
    visit_all(root, &mut |node| {
        if let Some(id) = node.identity() {
            out.insert(id, node.clone());
        }
    });
    out
}

/// Identified node ids reachable from `root`, in pre-order, first
/// occurrence only.
#[must_use]
pub fn collect_ids(root: &ModelRef) -> Vec<ModelId> {
    let mut seen = FxHashSet::default();
    let mut out = Vec::new();
    visit_all(root, &mut |node| {
        if let Some(id) = node.identity()
            && seen.insert(id.clone())
        {
            out.push(id);
        }
    });
    out
}

/// True when the identified-node sets of the two traversal results agree
/// on `id`'s presence. Helper for debug assertions.
#[cfg(debug_assertions)]
pub(crate) fn contains_id(root: &ModelRef, id: &ModelId) -> bool {
    let mut found = false;
    visit_all(root, &mut |node| {
        if node.identity().as_ref() == Some(id) {
            found = true;
        }
    });
    found
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
