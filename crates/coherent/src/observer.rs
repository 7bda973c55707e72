#![forbid(unsafe_code)]

//! Observer and delegate capabilities, and the critical-error taxonomy.
//!
//! Observers are held weakly by the engine; the external holder owns them.
//! Both callbacks run on the engine's delivery scheduler, never on the
//! worker thread directly (unless the scheduler is the inline one).

use thiserror::Error;

use crate::delta::Delta;
use crate::model::{Context, ModelId, ModelRef};

/// An entity that owns a current root model and receives deltas.
pub trait Observer: Send + Sync + 'static {
    /// The presently displayed root, or `None` if the observer has
    /// detached. Called only from the delivery scheduler's context.
    fn current_model(&self) -> Option<ModelRef>;

    /// Delivery of a rebuilt root plus the delta computed against the
    /// previous root. Called only from the delivery scheduler's context.
    /// `new_root` is `None` when the root itself was deleted.
    fn on_model_updated(
        &self,
        new_root: Option<ModelRef>,
        delta: Delta,
        context: Option<Context>,
    );
}

/// Weakly-held sink for engine-level notifications. All methods have
/// default no-op bodies; implement only what you need.
pub trait EngineDelegate: Send + Sync + 'static {
    /// A subtree rooted at `old` is about to be handed to observers as
    /// `new`. Fired once per wholesale replacement, before the delivery
    /// it belongs to.
    fn will_replace_model(&self, old: &ModelRef, new: &ModelRef, context: Option<&Context>) {
        let _ = (old, new, context);
    }

    /// A caller-contract violation was detected. The engine keeps
    /// operating; no retries are attempted.
    fn critical_error(&self, error: &CriticalError) {
        let _ = error;
    }
}

/// Contract violations surfaced through [`EngineDelegate::critical_error`].
///
/// These are never returned to the caller and never panic the engine:
/// they indicate a bug in the caller's [`Model`](crate::model::Model)
/// implementation or in how the engine was invoked.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CriticalError {
    /// `delete` was called with a model that has no identity.
    #[error("delete requires a model with an identity")]
    DeleteWithoutId,

    /// `map_children` returned a node of a different dynamic type than
    /// its receiver, breaking the map contract.
    #[error("map_children changed the dynamic type of node {id:?}")]
    WrongMapType {
        /// Identity of the offending node, when it had one.
        id: Option<ModelId>,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
