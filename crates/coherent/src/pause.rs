#![forbid(unsafe_code)]

//! Buffered state for paused observers.
//!
//! A paused observer stays in the listener index and keeps matching
//! publishes, but deliveries are folded into its entry here instead of
//! reaching the observer. Resume reconciles the accumulated delta against
//! the observer's real current root and delivers once.
//!
//! The table is keyed by observer pointer identity and mutated only from
//! the delivery scheduler's context; the engine wraps it in a `Mutex` to
//! make that discipline checkable rather than load-bearing.

use std::sync::{Arc, Weak};

use rustc_hash::FxHashMap;

use crate::delta::Delta;
use crate::model::{Context, ModelRef};
use crate::observer::Observer;

/// Pointer identity of an observer allocation. Stable for the lifetime of
/// the `Arc`; never dereferenced.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct ObserverKey(usize);

impl ObserverKey {
    pub(crate) fn of(observer: &Arc<dyn Observer>) -> Self {
        Self(Arc::as_ptr(observer).cast::<()>() as usize)
    }
}

/// Buffered state for one paused observer.
pub(crate) struct PausedEntry {
    /// Kept weak so a pause entry never extends an observer's lifetime.
    pub observer: Weak<dyn Observer>,
    /// Starts as the observer's current model at pause time; replaced by
    /// each buffered rewrite's result.
    pub buffered_root: Option<ModelRef>,
    /// Accumulated across buffered publishes via [`Delta::absorb`].
    pub delta: Delta,
    /// The latest publish's context, `None` included.
    pub context: Option<Context>,
}

/// Per-observer buffered state, keyed by observer identity.
#[derive(Default)]
pub(crate) struct PauseTable {
    entries: FxHashMap<ObserverKey, PausedEntry>,
}

impl PauseTable {
    /// Insert an entry snapshotting `observer`'s current model. Returns
    /// `false` (no-op) when already paused.
    pub fn pause(&mut self, observer: &Arc<dyn Observer>) -> bool {
        let key = ObserverKey::of(observer);
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(
            key,
            PausedEntry {
                observer: Arc::downgrade(observer),
                buffered_root: observer.current_model(),
                delta: Delta::new(),
                context: None,
            },
        );
        true
    }

    pub fn is_paused(&self, observer: &Arc<dyn Observer>) -> bool {
        self.entries.contains_key(&ObserverKey::of(observer))
    }

    /// Remove and return the entry, if any. Used by resume.
    pub fn take(&mut self, observer: &Arc<dyn Observer>) -> Option<PausedEntry> {
        self.entries.remove(&ObserverKey::of(observer))
    }

    /// Remove without returning. Used by unsubscribe.
    pub fn remove(&mut self, observer: &Arc<dyn Observer>) {
        self.entries.remove(&ObserverKey::of(observer));
    }

    /// Fold a buffered publish result into `observer`'s entry. Returns
    /// `false` when the observer is not paused (caller delivers directly).
    pub fn merge(
        &mut self,
        observer: &Arc<dyn Observer>,
        new_root: Option<ModelRef>,
        sub_delta: Delta,
        context: Option<Context>,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(&ObserverKey::of(observer)) else {
            return false;
        };
        entry.buffered_root = new_root;
        entry.delta.absorb(sub_delta);
        entry.context = context;
        true
    }

    /// Snapshot of the buffered root for a paused observer, or `None`
    /// when not paused. The outer option distinguishes "not paused" from
    /// "paused with no root".
    pub fn buffered_root(&self, observer: &Arc<dyn Observer>) -> Option<Option<ModelRef>> {
        self.entries
            .get(&ObserverKey::of(observer))
            .map(|entry| entry.buffered_root.clone())
    }

    /// Drop entries whose observer has died.
    pub fn prune(&mut self) {
        self.entries
            .retain(|_, entry| entry.observer.strong_count() > 0);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use crate::testing::{leaf, RecordingObserver};

    fn delta_changed(ids: &[&str]) -> Delta {
        let mut d = Delta::new();
        for id in ids {
            d.mark_changed(crate::model::ModelId::from(*id));
        }
        d
    }

    #[test]
    fn pause_snapshots_current_model() {
        let observer = RecordingObserver::with_root(leaf("a", 1));
        let o: Arc<dyn Observer> = observer.clone();
        let mut table = PauseTable::default();

        assert!(table.pause(&o));
        let root = table.buffered_root(&o).expect("paused");
        assert!(root.expect("has root").eq_model(leaf("a", 1).as_ref()));
    }

    #[test]
    fn pause_is_idempotent() {
        let observer = RecordingObserver::with_root(leaf("a", 1));
        let o: Arc<dyn Observer> = observer.clone();
        let mut table = PauseTable::default();

        assert!(table.pause(&o));
        // The observer's model moves on; a second pause must not re-snapshot.
        observer.set_root(Some(leaf("a", 2)));
        assert!(!table.pause(&o));
        let root = table.buffered_root(&o).expect("paused").expect("root");
        assert!(root.eq_model(leaf("a", 1).as_ref()));
    }

    #[test]
    fn merge_replaces_root_and_absorbs_delta() {
        let observer = RecordingObserver::with_root(leaf("a", 1));
        let o: Arc<dyn Observer> = observer.clone();
        let mut table = PauseTable::default();
        table.pause(&o);

        assert!(table.merge(&o, Some(leaf("a", 2)), delta_changed(&["a"]), None));
        assert!(table.merge(&o, Some(leaf("a", 3)), delta_changed(&["a"]), None));

        let entry = table.take(&o).expect("entry");
        assert!(entry.buffered_root.expect("root").eq_model(leaf("a", 3).as_ref()));
        assert!(entry.delta.changed().contains("a"));
    }

    #[test]
    fn merge_on_unpaused_observer_is_refused() {
        let observer = RecordingObserver::with_root(leaf("a", 1));
        let o: Arc<dyn Observer> = observer.clone();
        let mut table = PauseTable::default();
        assert!(!table.merge(&o, None, Delta::new(), None));
    }

    #[test]
    fn take_removes_the_entry() {
        let observer = RecordingObserver::with_root(leaf("a", 1));
        let o: Arc<dyn Observer> = observer.clone();
        let mut table = PauseTable::default();
        table.pause(&o);

        assert!(table.take(&o).is_some());
        assert!(!table.is_paused(&o));
        assert!(table.take(&o).is_none());
    }

    #[test]
    fn prune_drops_dead_observers() {
        let mut table = PauseTable::default();
        {
            let observer = RecordingObserver::with_root(leaf("a", 1));
            let o: Arc<dyn Observer> = observer.clone();
            table.pause(&o);
            assert_eq!(table.len(), 1);
        }
        table.prune();
        assert_eq!(table.len(), 0);
    }
}
