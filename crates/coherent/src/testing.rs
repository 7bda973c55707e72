#![forbid(unsafe_code)]

//! Test fixtures: a small structural model plus recording observer and
//! delegate implementations.
//!
//! Compiled for this crate's own tests and, behind the `test-helpers`
//! feature, for integration tests and downstream consumers that want a
//! ready-made conforming model.

use std::any::Any;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashSet;

use crate::delta::Delta;
use crate::model::{Context, Model, ModelId, ModelRef};
use crate::observer::{CriticalError, EngineDelegate, Observer};
use crate::rewrite::Patch;

/// A child slot of a [`TestNode`], with the "must exist" flag that drives
/// cascading deletes.
struct TestChild {
    model: ModelRef,
    required: bool,
}

/// Structural tree node: optional identity, integer payload, ordered
/// children. `eq_model` is structural; deleting a required child deletes
/// the node.
pub struct TestNode {
    id: Option<ModelId>,
    payload: u64,
    children: Vec<TestChild>,
}

impl TestNode {
    /// The node's payload, for assertions.
    #[must_use]
    pub fn payload(&self) -> u64 {
        self.payload
    }
}

impl Model for TestNode {
    fn identity(&self) -> Option<ModelId> {
        self.id.clone()
    }

    fn for_each_child(&self, visit: &mut dyn FnMut(&ModelRef)) {
        for child in &self.children {
            visit(&child.model);
        }
    }

    fn eq_model(&self, other: &dyn Model) -> bool {
        let Some(other) = other.as_any().downcast_ref::<TestNode>() else {
            return false;
        };
        self.id == other.id
            && self.payload == other.payload
            && self.children.len() == other.children.len()
            && self
                .children
                .iter()
                .zip(&other.children)
                .all(|(a, b)| a.model.eq_model(b.model.as_ref()))
    }

    fn map_children(
        &self,
        f: &mut dyn FnMut(ModelRef) -> Option<ModelRef>,
    ) -> Option<ModelRef> {
        let mut children = Vec::with_capacity(self.children.len());
        for child in &self.children {
            match f(child.model.clone()) {
                Some(mapped) => children.push(TestChild {
                    model: mapped,
                    required: child.required,
                }),
                None if child.required => return None,
                None => {}
            }
        }
        Some(Arc::new(TestNode {
            id: self.id.clone(),
            payload: self.payload,
            children,
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Leaf node with an identity.
#[must_use]
pub fn leaf(id: &str, payload: u64) -> ModelRef {
    node(id, payload, Vec::new())
}

/// Interior node with an identity; no child is required.
#[must_use]
pub fn node(id: &str, payload: u64, children: Vec<ModelRef>) -> ModelRef {
    Arc::new(TestNode {
        id: Some(ModelId::from(id)),
        payload,
        children: children
            .into_iter()
            .map(|model| TestChild {
                model,
                required: false,
            })
            .collect(),
    })
}

/// Interior node requiring the children at `required_indexes`; deleting
/// one of those cascades.
#[must_use]
pub fn node_requiring(
    id: &str,
    payload: u64,
    children: Vec<ModelRef>,
    required_indexes: &[usize],
) -> ModelRef {
    Arc::new(TestNode {
        id: Some(ModelId::from(id)),
        payload,
        children: children
            .into_iter()
            .enumerate()
            .map(|(i, model)| TestChild {
                model,
                required: required_indexes.contains(&i),
            })
            .collect(),
    })
}

/// Node without identity: traversed, never addressed.
#[must_use]
pub fn unnamed(children: Vec<ModelRef>) -> ModelRef {
    Arc::new(TestNode {
        id: None,
        payload: 0,
        children: children
            .into_iter()
            .map(|model| TestChild {
                model,
                required: false,
            })
            .collect(),
    })
}

/// Patch replacing each model under its own id. Panics on id-less models
/// (fixture misuse).
#[must_use]
pub fn patch_set(models: &[ModelRef]) -> Patch {
    models
        .iter()
        .map(|m| (m.identity().expect("patch_set needs identified models"), Some(m.clone())))
        .collect()
}

/// Patch deleting each id.
#[must_use]
pub fn patch_delete(ids: &[&str]) -> Patch {
    ids.iter().map(|id| (ModelId::from(*id), None)).collect()
}

/// Sorted string form of a delta id-set, for stable assertions.
#[must_use]
pub fn sorted_ids(set: &FxHashSet<ModelId>) -> Vec<String> {
    let mut v: Vec<_> = set.iter().map(ToString::to_string).collect();
    v.sort();
    v
}

/// Opaque string context.
#[must_use]
pub fn ctx(label: &str) -> Context {
    Arc::new(label.to_owned())
}

/// Recover a string context created by [`ctx`].
#[must_use]
pub fn ctx_str(context: Option<&Context>) -> Option<&str> {
    context.and_then(|c| c.downcast_ref::<String>()).map(String::as_str)
}

/// One delivery as seen by a [`RecordingObserver`].
pub struct RecordedUpdate {
    pub new_root: Option<ModelRef>,
    pub delta: Delta,
    pub context: Option<Context>,
}

/// Observer that applies every delivery to its stored root and keeps the
/// full delivery log.
pub struct RecordingObserver {
    root: Mutex<Option<ModelRef>>,
    updates: Mutex<Vec<RecordedUpdate>>,
}

impl RecordingObserver {
    /// Observer currently displaying `root`.
    #[must_use]
    pub fn with_root(root: ModelRef) -> Arc<Self> {
        Arc::new(Self {
            root: Mutex::new(Some(root)),
            updates: Mutex::new(Vec::new()),
        })
    }

    /// Observer with nothing displayed (detached).
    #[must_use]
    pub fn detached() -> Arc<Self> {
        Arc::new(Self {
            root: Mutex::new(None),
            updates: Mutex::new(Vec::new()),
        })
    }

    /// Overwrite the displayed root out-of-band, as a UI would when the
    /// user navigates.
    pub fn set_root(&self, root: Option<ModelRef>) {
        *self.root.lock().unwrap() = root;
    }

    /// Number of deliveries received.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    /// Run `f` over the delivery log.
    pub fn with_updates<R>(&self, f: impl FnOnce(&[RecordedUpdate]) -> R) -> R {
        f(&self.updates.lock().unwrap())
    }

    /// The last delivery's delta, if any delivery happened.
    #[must_use]
    pub fn last_delta(&self) -> Option<Delta> {
        self.updates.lock().unwrap().last().map(|u| u.delta.clone())
    }
}

impl Observer for RecordingObserver {
    fn current_model(&self) -> Option<ModelRef> {
        self.root.lock().unwrap().clone()
    }

    fn on_model_updated(
        &self,
        new_root: Option<ModelRef>,
        delta: Delta,
        context: Option<Context>,
    ) {
        *self.root.lock().unwrap() = new_root.clone();
        self.updates.lock().unwrap().push(RecordedUpdate {
            new_root,
            delta,
            context,
        });
    }
}

/// Delegate recording every critical error and will-replace pair.
#[derive(Default)]
pub struct RecordingDelegate {
    errors: Mutex<Vec<CriticalError>>,
    replacements: Mutex<Vec<(Option<ModelId>, Option<ModelId>)>>,
}

impl RecordingDelegate {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn errors(&self) -> Vec<CriticalError> {
        self.errors.lock().unwrap().clone()
    }

    #[must_use]
    pub fn replacements(&self) -> Vec<(Option<ModelId>, Option<ModelId>)> {
        self.replacements.lock().unwrap().clone()
    }
}

impl EngineDelegate for RecordingDelegate {
    fn will_replace_model(&self, old: &ModelRef, new: &ModelRef, _context: Option<&Context>) {
        self.replacements
            .lock()
            .unwrap()
            .push((old.identity(), new.identity()));
    }

    fn critical_error(&self, error: &CriticalError) {
        self.errors.lock().unwrap().push(error.clone());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
