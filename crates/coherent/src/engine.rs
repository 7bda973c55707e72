#![forbid(unsafe_code)]

//! The public surface: subscriptions, publishes, deletes, pause/resume,
//! and the resource housekeeping around them.
//!
//! # Execution model
//!
//! Two contexts:
//!
//! 1. The **serial worker** (one named thread, FIFO). Owns the listener
//!    index and runs every rewrite. Serial ordering is the concurrency
//!    control; the index has no lock.
//! 2. The **delivery scheduler** (caller-supplied). Runs every observer
//!    callback, every delegate notification, and every pause-table
//!    mutation.
//!
//! A publish flows: caller → worker (flatten patch, collect affected
//! observers) → blocking hop to the scheduler (snapshot each observer's
//! current root) → worker (rewrite each snapshot) → scheduler (deliver or
//! buffer). Between snapshot and delivery the observer may move on; the
//! delivery-time identity re-check bounds that hazard.
//!
//! # Ordering
//!
//! Publishes from one caller are delivered in submission order (worker
//! FIFO plus scheduler FIFO). A subscribe enqueued after a publish may or
//! may not observe that publish's delta, depending on queue arrival.
//!
//! # Failure modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | Dead weak observer handle | silent no-op, reclaimed lazily |
//! | Publish hitting no subscriber | silent no-op |
//! | Delivery superseded by newer publish | dropped, `debug!` event |
//! | Caller-contract violation | `CriticalError` via delegate, engine continues |

use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info_span, trace};

use crate::delta::Delta;
use crate::index::ListenerIndex;
use crate::model::{Context, Model, ModelRef};
use crate::observer::{CriticalError, EngineDelegate, Observer};
use crate::pause::{ObserverKey, PauseTable, PausedEntry};
use crate::rewrite::{rewrite, Patch};
use crate::scheduler::{run_sync, DeliveryScheduler, InlineScheduler};
use crate::walker;
use crate::work_queue::{WorkHandle, WorkQueue};

/// Default period between GC pruning ticks.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(300);

/// Construction-time configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Period between pruning ticks. `Duration::ZERO` disables the timer;
    /// pruning still runs on memory pressure and opportunistically.
    pub gc_interval: Duration,
    /// Name given to the serial worker thread.
    pub worker_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gc_interval: DEFAULT_GC_INTERVAL,
            worker_name: "coherent-worker".to_owned(),
        }
    }
}

/// State reachable from both execution contexts.
struct Shared {
    scheduler: Arc<dyn DeliveryScheduler>,
    /// Mutated only from scheduler-dispatched tasks (and the documented
    /// delivery-context-only entry points).
    paused: Mutex<PauseTable>,
    delegate: Mutex<Option<Weak<dyn EngineDelegate>>>,
}

impl Shared {
    fn delegate(&self) -> Option<Arc<dyn EngineDelegate>> {
        self.delegate.lock().unwrap().as_ref()?.upgrade()
    }
}

/// The model consistency engine.
///
/// Keeps weakly-held [`Observer`]s of tree-structured models in sync:
/// whenever a node is published or deleted, every observer whose tree
/// reaches that node's id receives a freshly rebuilt root plus a
/// [`Delta`] of changed and deleted ids, on the delivery scheduler.
///
/// The engine owns only its index, its worker thread, its GC timer, and
/// its pause table. Models and observers are borrowed.
pub struct ConsistencyEngine {
    shared: Arc<Shared>,
    queue: WorkQueue,
    timer: GcTimer,
}

impl ConsistencyEngine {
    /// Engine with default configuration over `scheduler`.
    pub fn new(scheduler: Arc<dyn DeliveryScheduler>) -> io::Result<Self> {
        Self::with_config(EngineConfig::default(), scheduler)
    }

    /// Engine with explicit configuration.
    ///
    /// # Errors
    ///
    /// Fails only when the worker or timer thread cannot be spawned.
    pub fn with_config(
        config: EngineConfig,
        scheduler: Arc<dyn DeliveryScheduler>,
    ) -> io::Result<Self> {
        let queue = WorkQueue::start(&config.worker_name)?;
        let shared = Arc::new(Shared {
            scheduler,
            paused: Mutex::new(PauseTable::default()),
            delegate: Mutex::new(None),
        });
        let tick_work = queue.handle();
        let tick_shared = Arc::clone(&shared);
        let timer = GcTimer::start(config.gc_interval, move || {
            trace!("gc tick");
            enqueue_clean(&tick_work, &tick_shared);
        })?;
        Ok(Self {
            shared,
            queue,
            timer,
        })
    }

    /// Lazily constructed process-wide instance: default configuration,
    /// inline delivery (callbacks run on the worker thread). Prefer an
    /// explicit handle when you control construction.
    pub fn global() -> &'static ConsistencyEngine {
        static GLOBAL: OnceLock<ConsistencyEngine> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            ConsistencyEngine::new(Arc::new(InlineScheduler))
                .expect("spawn consistency engine threads")
        })
    }

    /// Register `observer` for every identified node reachable from its
    /// current model. Reads `current_model()` on the calling thread, so
    /// call from the delivery context. A `None` current model makes this
    /// a no-op. Idempotent.
    pub fn subscribe(&self, observer: &Arc<dyn Observer>) {
        if let Some(root) = observer.current_model() {
            self.subscribe_with_root(observer, root);
        }
    }

    /// Like [`subscribe`](Self::subscribe), with the root supplied by the
    /// caller instead of snapshotted from the observer.
    pub fn subscribe_with_root(&self, observer: &Arc<dyn Observer>, root: ModelRef) {
        let observer = Arc::clone(observer);
        self.queue.submit(Box::new(move |index| {
            let ids = walker::collect_ids(&root);
            debug!(ids = ids.len(), "subscribe");
            for id in ids {
                index.add(id, &observer);
            }
        }));
    }

    /// Publish a new model. Every observer whose tree reaches any
    /// identified node of `model` receives a rebuilt root and delta;
    /// unaffected observers hear nothing. Returns immediately.
    pub fn publish(&self, model: ModelRef, context: Option<Context>) {
        let shared = Arc::clone(&self.shared);
        self.queue.submit(Box::new(move |index| {
            let mut patch = Patch::default();
            for (id, node) in walker::flatten_by_id(&model) {
                patch.insert(id, Some(node));
            }
            let observers = affected_observers(index, &patch);
            let _span = info_span!(
                "publish",
                patch_ids = patch.len(),
                observers = observers.len()
            )
            .entered();
            update_observers(index, &shared, observers, &patch, context);
        }));
    }

    /// Delete the node with `model`'s identity everywhere it occurs,
    /// cascading per each observer's tree. A model without identity is a
    /// caller-contract violation surfaced through the delegate.
    pub fn delete(&self, model: &ModelRef, context: Option<Context>) {
        let Some(id) = model.identity() else {
            dispatch_errors(&self.shared, vec![CriticalError::DeleteWithoutId]);
            return;
        };
        let shared = Arc::clone(&self.shared);
        self.queue.submit(Box::new(move |index| {
            let observers = index.observers_for(&id);
            let _span = info_span!("delete", id = %id, observers = observers.len()).entered();
            let mut patch = Patch::default();
            patch.insert(id, None);
            update_observers(index, &shared, observers, &patch, context);
        }));
    }

    /// Remove `observer` from the pause table and from every index
    /// bucket. Safe to call during observer teardown; unknown observers
    /// are a no-op.
    pub fn unsubscribe(&self, observer: &Arc<dyn Observer>) {
        let for_pause = Arc::clone(observer);
        let shared = Arc::clone(&self.shared);
        self.shared.scheduler.dispatch(Box::new(move || {
            shared.paused.lock().unwrap().remove(&for_pause);
        }));
        let for_index = Arc::clone(observer);
        self.queue
            .submit(Box::new(move |index| index.remove(&for_index)));
    }

    /// Stop delivering to `observer` and start buffering instead.
    /// Delivery-context only. Idempotent; pausing does not resubscribe.
    pub fn pause(&self, observer: &Arc<dyn Observer>) {
        self.shared.paused.lock().unwrap().pause(observer);
    }

    /// Whether `observer` is currently buffering. Delivery-context only.
    #[must_use]
    pub fn is_paused(&self, observer: &Arc<dyn Observer>) -> bool {
        self.shared.paused.lock().unwrap().is_paused(observer)
    }

    /// Stop buffering and deliver the net effect of everything published
    /// while paused, reconciled against the observer's real current
    /// model. Delivery-context only. Not-paused observers are a no-op.
    pub fn resume(&self, observer: &Arc<dyn Observer>) {
        let Some(entry) = self.shared.paused.lock().unwrap().take(observer) else {
            return;
        };
        if entry.delta.is_empty() {
            return;
        }
        let Some(outdated) = observer.current_model() else {
            return;
        };
        if let Some(buffered) = &entry.buffered_root
            && buffered.eq_model(outdated.as_ref())
        {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let observer = Arc::clone(observer);
        self.queue.submit(Box::new(move |_index| {
            let _span = info_span!("resume").entered();
            reconcile_and_deliver(&shared, observer, entry, &outdated);
        }));
    }

    /// Prune dead weak handles everywhere: index buckets (empty ones
    /// dropped) and pause entries whose observer died.
    pub fn clean_memory(&self) {
        enqueue_clean(&self.queue.handle(), &self.shared);
    }

    /// Platform memory-pressure hook; equivalent to
    /// [`clean_memory`](Self::clean_memory).
    pub fn memory_pressure(&self) {
        trace!("memory pressure");
        self.clean_memory();
    }

    /// Replace the GC pruning period. `Duration::ZERO` disables the
    /// timer. Delivery-context only.
    pub fn set_gc_interval(&self, interval: Duration) {
        self.timer.set_interval(interval);
    }

    /// The current GC pruning period.
    #[must_use]
    pub fn gc_interval(&self) -> Duration {
        self.timer.interval()
    }

    /// Install the weakly-held delegate for will-replace and
    /// critical-error notifications.
    pub fn set_delegate(&self, delegate: &Arc<dyn EngineDelegate>) {
        *self.shared.delegate.lock().unwrap() = Some(Arc::downgrade(delegate));
    }

    /// Block until every job enqueued before this call — and the
    /// deliveries those jobs dispatched — has run. With a pumped
    /// scheduler the pumping thread must keep pumping while this blocks.
    pub fn barrier(&self) {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        self.queue.submit(Box::new(move |_index| {
            let _ = run_sync(shared.scheduler.as_ref(), || ());
            let _ = tx.send(());
        }));
        let _ = rx.recv();
    }

    /// Deterministic teardown: stop the timer, drain and join the
    /// worker. Also performed on drop.
    pub fn shutdown(&mut self) {
        self.timer.stop();
        self.queue.shutdown();
    }

    /// Run `f` against the live listener index on the worker, blocking
    /// for the result. `None` when the engine is shut down.
    #[cfg(any(test, feature = "test-helpers"))]
    pub fn inspect_index<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut ListenerIndex) -> R + Send + 'static,
    ) -> Option<R> {
        let (tx, rx) = mpsc::channel();
        self.queue.submit(Box::new(move |index| {
            let _ = tx.send(f(index));
        }));
        rx.recv().ok()
    }
}

/// Deduplicated (by identity) union of the buckets for every id in the
/// patch, bucket order preserved.
fn affected_observers(index: &mut ListenerIndex, patch: &Patch) -> Vec<Arc<dyn Observer>> {
    let mut seen = rustc_hash::FxHashSet::default();
    let mut out = Vec::new();
    for id in patch.keys() {
        for observer in index.observers_for(id) {
            if seen.insert(ObserverKey::of(&observer)) {
                out.push(observer);
            }
        }
    }
    out
}

/// The orchestration core shared by publish and delete. Runs on the
/// worker with the index borrowed.
fn update_observers(
    index: &mut ListenerIndex,
    shared: &Arc<Shared>,
    observers: Vec<Arc<dyn Observer>>,
    patch: &Patch,
    context: Option<Context>,
) {
    if observers.is_empty() {
        return;
    }

    // Hop 1 (blocking): snapshot each observer's root in the delivery
    // context. Paused observers snapshot their buffered root.
    let snapshot_shared = Arc::clone(shared);
    let Some(snapshots) = run_sync(shared.scheduler.as_ref(), move || {
        let paused = snapshot_shared.paused.lock().unwrap();
        observers
            .into_iter()
            .map(|observer| {
                let root = match paused.buffered_root(&observer) {
                    Some(buffered) => buffered,
                    None => observer.current_model(),
                };
                (observer, root)
            })
            .collect::<Vec<_>>()
    }) else {
        return;
    };

    // Rewrite on the worker; hop 2 (async) delivers.
    for (observer, root) in snapshots {
        let Some(root) = root else { continue };
        let outcome = rewrite(&root, patch);
        dispatch_errors(shared, outcome.errors);
        if outcome.delta.is_empty() {
            continue;
        }
        // Future updates to nodes inside replacement subtrees must reach
        // this observer too.
        for introduced in &outcome.introduced {
            for id in walker::collect_ids(introduced) {
                index.add(id, &observer);
            }
        }
        dispatch_replacements(shared, outcome.replacements, context.clone());
        deliver(
            shared,
            observer,
            outcome.new_root,
            outcome.delta,
            context.clone(),
        );
    }
}

/// Dispatch one delivery. Pausedness is re-checked here — delivery time
/// is authoritative — and the identity guard drops updates a newer
/// publish has already superseded.
fn deliver(
    shared: &Arc<Shared>,
    observer: Arc<dyn Observer>,
    new_root: Option<ModelRef>,
    mut delta: Delta,
    context: Option<Context>,
) {
    let task_shared = Arc::clone(shared);
    shared.scheduler.dispatch(Box::new(move || {
        {
            let mut paused = task_shared.paused.lock().unwrap();
            if paused.is_paused(&observer) {
                paused.merge(&observer, new_root, delta, context);
                return;
            }
        }
        if let Some(new_root_ref) = &new_root {
            let Some(current) = observer.current_model() else {
                debug!("dropping delivery: observer detached");
                return;
            };
            if current.identity() != new_root_ref.identity() {
                debug!("dropping delivery: superseded by newer publish");
                return;
            }
        } else {
            // The whole tree is gone; nothing can be "changed" in it.
            delta.changed_mut().clear();
        }
        delta.normalize();
        #[cfg(debug_assertions)]
        if let Some(root) = &new_root {
            for id in delta.deleted() {
                debug_assert!(
                    !walker::contains_id(root, id),
                    "deleted id {id} still present in delivered root"
                );
            }
        }
        observer.on_model_updated(new_root, delta, context);
    }));
}

/// Resume step 4: reconcile the accumulated delta against reality, then
/// deliver unless it reconciled away. Runs on the worker.
fn reconcile_and_deliver(
    shared: &Arc<Shared>,
    observer: Arc<dyn Observer>,
    mut entry: PausedEntry,
    outdated: &ModelRef,
) {
    let buffered_map = entry
        .buffered_root
        .as_ref()
        .map(walker::flatten_by_id)
        .unwrap_or_default();
    // Ids that survived in the buffered tree were not net-deleted.
    entry
        .delta
        .deleted_mut()
        .retain(|id| !buffered_map.contains_key(id));
    // Ids whose buffered value matches what the observer already shows
    // net-cancelled.
    let outdated_map = walker::flatten_by_id(outdated);
    entry
        .delta
        .changed_mut()
        .retain(|id| match (buffered_map.get(id), outdated_map.get(id)) {
            (Some(buffered), Some(shown)) => !buffered.eq_model(shown.as_ref()),
            _ => true,
        });
    if entry.buffered_root.is_none() {
        entry.delta.changed_mut().clear();
    }
    entry.delta.normalize();
    if entry.delta.is_empty() {
        debug!("resume reconciled to an empty delta");
        return;
    }

    let new_root = entry.buffered_root;
    let delta = entry.delta;
    let context = entry.context;
    shared.scheduler.dispatch(Box::new(move || {
        observer.on_model_updated(new_root, delta, context);
    }));
}

fn enqueue_clean(work: &WorkHandle, shared: &Arc<Shared>) {
    let shared = Arc::clone(shared);
    work.submit(Box::new(move |index| {
        index.prune_all();
        let pause_shared = Arc::clone(&shared);
        shared.scheduler.dispatch(Box::new(move || {
            pause_shared.paused.lock().unwrap().prune();
        }));
    }));
}

fn dispatch_errors(shared: &Arc<Shared>, errors: Vec<CriticalError>) {
    if errors.is_empty() {
        return;
    }
    let task_shared = Arc::clone(shared);
    shared.scheduler.dispatch(Box::new(move || {
        if let Some(delegate) = task_shared.delegate() {
            for error in &errors {
                delegate.critical_error(error);
            }
        }
    }));
}

fn dispatch_replacements(
    shared: &Arc<Shared>,
    replacements: Vec<(ModelRef, ModelRef)>,
    context: Option<Context>,
) {
    if replacements.is_empty() {
        return;
    }
    let task_shared = Arc::clone(shared);
    shared.scheduler.dispatch(Box::new(move || {
        if let Some(delegate) = task_shared.delegate() {
            for (old, new) in &replacements {
                delegate.will_replace_model(old, new, context.as_ref());
            }
        }
    }));
}

// ---------------------------------------------------------------------------
// GC timer
// ---------------------------------------------------------------------------

struct TimerState {
    interval: Duration,
    stopped: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cvar: Condvar,
}

/// Periodic pruning: a thread parked on a condvar, woken by interval
/// changes, shutdown, or the timeout elapsing. A zero interval parks
/// indefinitely until reconfigured.
struct GcTimer {
    shared: Arc<TimerShared>,
    handle: Option<JoinHandle<()>>,
}

impl GcTimer {
    fn start(interval: Duration, on_tick: impl Fn() + Send + 'static) -> io::Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                interval,
                stopped: false,
            }),
            cvar: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("coherent-gc".to_owned())
            .spawn(move || timer_loop(&thread_shared, &on_tick))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    fn set_interval(&self, interval: Duration) {
        self.shared.state.lock().unwrap().interval = interval;
        self.shared.cvar.notify_all();
    }

    fn interval(&self) -> Duration {
        self.shared.state.lock().unwrap().interval
    }

    fn stop(&mut self) {
        self.shared.state.lock().unwrap().stopped = true;
        self.shared.cvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GcTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn timer_loop(shared: &TimerShared, on_tick: &dyn Fn()) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.stopped {
            return;
        }
        if state.interval.is_zero() {
            state = shared.cvar.wait(state).unwrap();
            continue;
        }
        let armed = state.interval;
        let (guard, timeout) = shared.cvar.wait_timeout(state, armed).unwrap();
        state = guard;
        if state.stopped {
            return;
        }
        // A wake that changed the interval re-arms without firing.
        if timeout.timed_out() && state.interval == armed {
            drop(state);
            on_tick();
            state = shared.state.lock().unwrap();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
