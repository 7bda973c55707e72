//! Property-based invariant tests for the rewrite algorithm.
//!
//! Patches are generated the way the engine itself builds them — either
//! the flattening of one published model (all-`Some`), or a single-id
//! delete — over random trees with unique ids. For any such input:
//!
//! 1. After normalization, `changed` and `deleted` are disjoint.
//! 2. Every deleted id is absent from the new root.
//! 3. Every changed id is present in the new root with a value that is
//!    not `eq_model` to its value in the old root (when the root
//!    survives).
//! 4. Every changed or deleted id existed in the old root.
//! 5. The empty patch is the identity: same allocation back, empty delta.
//! 6. Rewriting the rewritten tree with the same patch is a no-op.
//! 7. A patch hitting none of the tree's ids returns the same allocation.
//! 8. Newly-introduced subtrees are exactly the non-equal replacements.

use std::sync::Arc;

use coherent::rewrite::{rewrite, Patch};
use coherent::testing::{leaf, node, node_requiring, TestNode};
use coherent::walker::{flatten_by_id, visit_all};
use coherent::{Delta, Model, ModelId, ModelRef};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

// ═══════════════════════════════════════════════════════════════════════════
// Strategy helpers
// ═══════════════════════════════════════════════════════════════════════════

/// Shape of a generated tree; ids are assigned afterwards in DFS order
/// so every node gets a unique one.
#[derive(Debug, Clone)]
struct Shape {
    payload: u64,
    children: Vec<Shape>,
}

fn shape_strategy() -> impl Strategy<Value = Shape> {
    let leaf = (0u64..4).prop_map(|payload| Shape {
        payload,
        children: Vec::new(),
    });
    leaf.prop_recursive(3, 24, 4, |inner| {
        ((0u64..4), prop::collection::vec(inner, 0..4)).prop_map(|(payload, children)| Shape {
            payload,
            children,
        })
    })
}

/// Assign ids `n0, n1, ...` in DFS order. Every seventh-ish child is a
/// required one, so single-id deletes exercise cascades too.
fn build(shape: &Shape, counter: &mut usize) -> ModelRef {
    let my_id = format!("n{}", *counter);
    *counter += 1;
    let mut children = Vec::new();
    let mut required = Vec::new();
    for (i, child_shape) in shape.children.iter().enumerate() {
        if *counter % 7 == 3 {
            required.push(i);
        }
        children.push(build(child_shape, counter));
    }
    node_requiring(&my_id, shape.payload, children, &required)
}

fn all_nodes(root: &ModelRef) -> Vec<ModelRef> {
    let mut nodes = Vec::new();
    visit_all(root, &mut |n| nodes.push(n.clone()));
    nodes
}

fn payload_of(model: &ModelRef) -> u64 {
    model
        .as_any()
        .downcast_ref::<TestNode>()
        .expect("fixture tree")
        .payload()
}

/// A "publish": a fresh version of `model`'s subtree. Seed-driven and
/// deterministic — some payloads bump, some children drop, some nodes
/// gain a fresh-id child — while the kept hierarchy (and so ancestry)
/// is preserved.
fn transform(model: &ModelRef, seed: u64, fresh: &mut usize) -> ModelRef {
    let id = model.identity().expect("generated nodes have ids");
    let k: u64 = id.as_str()[1..].parse().expect("generated id digits");

    let payload = payload_of(model);
    let new_payload = if (k + seed) % 2 == 0 { payload + 1 } else { payload };

    let mut children = Vec::new();
    model.for_each_child(&mut |child| {
        let child_id = child.identity().expect("generated nodes have ids");
        let ck: u64 = child_id.as_str()[1..].parse().expect("generated id digits");
        if (ck + seed) % 5 != 0 {
            children.push(transform(child, seed, fresh));
        }
    });
    if (k + seed) % 3 == 0 {
        let fresh_id = format!("f{}", *fresh);
        *fresh += 1;
        children.push(leaf(&fresh_id, seed % 4));
    }
    node(id.as_str(), new_payload, children)
}

/// Patch as `publish` builds it: flatten one model, everything `Some`.
fn publish_patch(published: &ModelRef) -> Patch {
    flatten_by_id(published)
        .into_iter()
        .map(|(id, model)| (id, Some(model)))
        .collect()
}

/// Patch as `delete` builds it: one id, `None`.
fn delete_patch(id: &ModelId) -> Patch {
    let mut patch = Patch::default();
    patch.insert(id.clone(), None);
    patch
}

fn check_delta_invariants(
    old_by_id: &rustc_hash::FxHashMap<ModelId, ModelRef>,
    new_root: Option<&ModelRef>,
    delta: &Delta,
) -> Result<(), TestCaseError> {
    for id in delta.changed() {
        prop_assert!(!delta.deleted().contains(id), "{id} in both sets");
        prop_assert!(old_by_id.contains_key(id), "changed id {id} not in old tree");
    }
    for id in delta.deleted() {
        prop_assert!(old_by_id.contains_key(id), "deleted id {id} not in old tree");
    }
    if let Some(new_root) = new_root {
        let new_by_id = flatten_by_id(new_root);
        for id in delta.deleted() {
            prop_assert!(
                !new_by_id.contains_key(id),
                "deleted id {id} still present in the new tree"
            );
        }
        for id in delta.changed() {
            let Some(new_node) = new_by_id.get(id) else {
                return Err(TestCaseError::fail(format!(
                    "changed id {id} absent from the new tree"
                )));
            };
            prop_assert!(
                !new_node.eq_model(old_by_id[id].as_ref()),
                "changed id {id} has an unchanged value"
            );
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Invariants
// ═══════════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn publish_shaped_patch_upholds_delta_invariants(
        shape in shape_strategy(),
        subtree_sel in any::<prop::sample::Index>(),
        seed in 0u64..32,
    ) {
        let mut counter = 0;
        let root = build(&shape, &mut counter);
        let old_by_id = flatten_by_id(&root);

        let nodes = all_nodes(&root);
        let published = transform(subtree_sel.get(&nodes), seed, &mut 0);
        let patch = publish_patch(&published);

        let mut out = rewrite(&root, &patch);
        out.delta.normalize();

        prop_assert!(out.delta.deleted().is_empty(), "all-Some patches cannot delete");
        prop_assert!(out.new_root.is_some());
        check_delta_invariants(&old_by_id, out.new_root.as_ref(), &out.delta)?;
    }

    #[test]
    fn delete_shaped_patch_upholds_delta_invariants(
        shape in shape_strategy(),
        target_sel in any::<prop::sample::Index>(),
    ) {
        let mut counter = 0;
        let root = build(&shape, &mut counter);
        let old_by_id = flatten_by_id(&root);

        let nodes = all_nodes(&root);
        let target = target_sel.get(&nodes).identity().expect("ids everywhere");
        let patch = delete_patch(&target);

        let mut out = rewrite(&root, &patch);
        out.delta.normalize();

        prop_assert!(out.delta.deleted().contains(&target));
        check_delta_invariants(&old_by_id, out.new_root.as_ref(), &out.delta)?;
    }

    #[test]
    fn empty_patch_is_the_identity(shape in shape_strategy()) {
        let mut counter = 0;
        let root = build(&shape, &mut counter);
        let out = rewrite(&root, &Patch::default());
        prop_assert!(out.delta.is_empty());
        prop_assert!(out.introduced.is_empty());
        prop_assert!(Arc::ptr_eq(out.new_root.as_ref().unwrap(), &root));
    }

    #[test]
    fn missing_ids_leave_the_allocation_untouched(
        shape in shape_strategy(),
        payload in 0u64..4,
    ) {
        let mut counter = 0;
        let root = build(&shape, &mut counter);
        let mut patch = Patch::default();
        patch.insert(ModelId::from("absent"), Some(leaf("absent", payload)));
        patch.extend(delete_patch(&ModelId::from("also-absent")));

        let out = rewrite(&root, &patch);
        prop_assert!(out.delta.is_empty());
        prop_assert!(Arc::ptr_eq(out.new_root.as_ref().unwrap(), &root));
    }

    #[test]
    fn rewriting_twice_with_a_publish_patch_is_a_noop(
        shape in shape_strategy(),
        subtree_sel in any::<prop::sample::Index>(),
        seed in 0u64..32,
    ) {
        let mut counter = 0;
        let root = build(&shape, &mut counter);
        let nodes = all_nodes(&root);
        let published = transform(subtree_sel.get(&nodes), seed, &mut 0);
        let patch = publish_patch(&published);

        let first = rewrite(&root, &patch);
        let new_root = first.new_root.expect("publishes never delete");
        let second = rewrite(&new_root, &patch);
        prop_assert!(second.delta.is_empty(), "second delta: {:?}", second.delta);
        prop_assert!(Arc::ptr_eq(second.new_root.as_ref().unwrap(), &new_root));
    }

    #[test]
    fn rewriting_twice_with_a_delete_patch_is_a_noop(
        shape in shape_strategy(),
        target_sel in any::<prop::sample::Index>(),
    ) {
        let mut counter = 0;
        let root = build(&shape, &mut counter);
        let nodes = all_nodes(&root);
        let target = target_sel.get(&nodes).identity().expect("ids everywhere");
        let patch = delete_patch(&target);

        let first = rewrite(&root, &patch);
        if let Some(new_root) = &first.new_root {
            let second = rewrite(new_root, &patch);
            prop_assert!(second.delta.is_empty(), "second delta: {:?}", second.delta);
            prop_assert!(Arc::ptr_eq(second.new_root.as_ref().unwrap(), new_root));
        }
    }

    #[test]
    fn introduced_subtrees_are_exactly_the_nonequal_replacements(
        shape in shape_strategy(),
        subtree_sel in any::<prop::sample::Index>(),
        seed in 0u64..32,
    ) {
        let mut counter = 0;
        let root = build(&shape, &mut counter);
        let nodes = all_nodes(&root);
        let published = transform(subtree_sel.get(&nodes), seed, &mut 0);
        let patch = publish_patch(&published);

        let out = rewrite(&root, &patch);
        prop_assert_eq!(out.introduced.len(), out.replacements.len());
        for introduced in &out.introduced {
            let id = introduced.identity().expect("replacements are identified");
            match patch.get(&id) {
                Some(Some(replacement)) => {
                    prop_assert!(introduced.eq_model(replacement.as_ref()));
                    prop_assert!(
                        out.delta.changed().contains(&id),
                        "introduced {id} must be reported changed"
                    );
                }
                _ => prop_assert!(false, "introduced subtree {id} not in the patch"),
            }
        }
    }
}
