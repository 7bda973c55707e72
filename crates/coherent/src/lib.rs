#![forbid(unsafe_code)]

//! Coherent: a client-side model consistency engine.
//!
//! Keeps multiple independent observers of a shared, tree-structured
//! domain model in sync. Observers register interest in a whole model
//! subtree; when a mutation is published — to the root of one observer's
//! tree or to a deeply nested node shared across many — the engine
//! computes, for every affected observer, a freshly rebuilt subtree plus
//! a [`Delta`] describing which identified nodes changed or were
//! deleted, and delivers it on the caller-supplied delivery scheduler.
//!
//! # Key Components
//!
//! - [`Model`] - Capability a domain tree implements: identity, child
//!   enumeration, semantic equality, children-rewriting map
//! - [`Observer`] - Weakly-held entity owning a current root and
//!   receiving deltas
//! - [`ConsistencyEngine`] - Public surface: subscribe, publish, delete,
//!   pause/resume, memory housekeeping
//! - [`Delta`] - Disjoint changed/deleted id-sets per delivery
//! - [`DeliveryScheduler`] - Where callbacks run; the portable stand-in
//!   for "the main thread"
//! - [`BatchObserver`] - Several independent roots observed as one
//!
//! # Execution model
//!
//! One serial worker thread owns the subscription index and runs every
//! rewrite; the delivery scheduler runs every callback. Nothing the
//! engine stores keeps a model or an observer alive.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use coherent::{ConsistencyEngine, InlineScheduler, Observer};
//!
//! # fn demo(observer: Arc<dyn Observer>, model: coherent::ModelRef) -> std::io::Result<()> {
//! let engine = ConsistencyEngine::new(Arc::new(InlineScheduler))?;
//! engine.subscribe(&observer);
//! engine.publish(model, None);
//! # Ok(())
//! # }
//! ```

pub mod combined;
pub mod delta;
pub mod engine;
pub mod index;
pub mod model;
pub mod observer;
pub mod rewrite;
pub mod scheduler;
#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;
pub mod walker;
pub mod weak_set;

mod pause;
mod work_queue;

pub use combined::{BatchBridge, BatchObserver, CombinedModel};
pub use delta::Delta;
pub use engine::{ConsistencyEngine, EngineConfig, DEFAULT_GC_INTERVAL};
pub use model::{Context, Model, ModelId, ModelRef};
pub use observer::{CriticalError, EngineDelegate, Observer};
pub use rewrite::{rewrite, Patch, RewriteOutcome};
pub use scheduler::{DeliveryScheduler, InlineScheduler, QueueScheduler, Task};
pub use weak_set::WeakSet;
