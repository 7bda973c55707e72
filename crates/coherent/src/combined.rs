#![forbid(unsafe_code)]

//! Batch observation: watch several independent roots as one.
//!
//! A [`BatchObserver`] owns a list of root slots. [`BatchBridge`] adapts
//! it to the single-root [`Observer`] capability by wrapping the slots in
//! an id-less umbrella model, so the engine's indexing, rewriting, and
//! pause machinery apply unchanged. Deleting a slot's root never
//! cascades — the umbrella survives with the slot emptied, keeping slot
//! positions stable.
//!
//! The bridge holds its target weakly and is handed back to the caller
//! as an `Arc` guard: drop the bridge and the batch observer detaches.

use std::any::Any;
use std::sync::{Arc, Weak};

use crate::delta::Delta;
use crate::engine::ConsistencyEngine;
use crate::model::{Context, Model, ModelId, ModelRef};
use crate::observer::Observer;

/// An entity observing several independent root models at once.
pub trait BatchObserver: Send + Sync + 'static {
    /// The presently displayed roots, one slot per watched position.
    /// Called only from the delivery scheduler's context.
    fn current_models(&self) -> Vec<Option<ModelRef>>;

    /// Delivery of the rebuilt slots plus the combined delta.
    /// Called only from the delivery scheduler's context.
    fn on_models_updated(
        &self,
        models: Vec<Option<ModelRef>>,
        delta: Delta,
        context: Option<Context>,
    );
}

/// Id-less umbrella over a batch observer's slots. Participates in
/// structure only: it can never be addressed by a patch and never
/// cascades away.
pub struct CombinedModel {
    slots: Vec<Option<ModelRef>>,
}

impl CombinedModel {
    #[must_use]
    pub fn new(slots: Vec<Option<ModelRef>>) -> Self {
        Self { slots }
    }

    /// The slots, empty positions preserved.
    #[must_use]
    pub fn slots(&self) -> &[Option<ModelRef>] {
        &self.slots
    }
}

impl Model for CombinedModel {
    fn identity(&self) -> Option<ModelId> {
        None
    }

    fn for_each_child(&self, visit: &mut dyn FnMut(&ModelRef)) {
        for slot in self.slots.iter().flatten() {
            visit(slot);
        }
    }

    fn eq_model(&self, other: &dyn Model) -> bool {
        let Some(other) = other.as_any().downcast_ref::<CombinedModel>() else {
            return false;
        };
        self.slots.len() == other.slots.len()
            && self
                .slots
                .iter()
                .zip(&other.slots)
                .all(|(a, b)| match (a, b) {
                    (Some(a), Some(b)) => a.eq_model(b.as_ref()),
                    (None, None) => true,
                    _ => false,
                })
    }

    fn map_children(
        &self,
        f: &mut dyn FnMut(ModelRef) -> Option<ModelRef>,
    ) -> Option<ModelRef> {
        let slots = self
            .slots
            .iter()
            .map(|slot| slot.as_ref().and_then(|model| f(model.clone())))
            .collect();
        Some(Arc::new(CombinedModel { slots }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Adapter from [`BatchObserver`] to [`Observer`]. Keep the returned
/// `Arc` alive for as long as the batch observer should stay subscribed.
pub struct BatchBridge {
    target: Weak<dyn BatchObserver>,
}

impl BatchBridge {
    /// Bridge to `target`, held weakly.
    #[must_use]
    pub fn new(target: &Arc<dyn BatchObserver>) -> Arc<Self> {
        Arc::new(Self {
            target: Arc::downgrade(target),
        })
    }
}

impl Observer for BatchBridge {
    fn current_model(&self) -> Option<ModelRef> {
        let target = self.target.upgrade()?;
        Some(Arc::new(CombinedModel::new(target.current_models())))
    }

    fn on_model_updated(
        &self,
        new_root: Option<ModelRef>,
        delta: Delta,
        context: Option<Context>,
    ) {
        let Some(target) = self.target.upgrade() else {
            return;
        };
        let slots = new_root
            .as_ref()
            .and_then(|root| root.as_any().downcast_ref::<CombinedModel>())
            .map(|combined| combined.slots().to_vec())
            .unwrap_or_default();
        target.on_models_updated(slots, delta, context);
    }
}

impl ConsistencyEngine {
    /// Subscribe a batch observer through its bridge. Convenience over
    /// [`subscribe`](Self::subscribe) with the coerced bridge handle.
    pub fn subscribe_batch(&self, bridge: &Arc<BatchBridge>) {
        let observer: Arc<dyn Observer> = Arc::clone(bridge) as Arc<dyn Observer>;
        self.subscribe(&observer);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
