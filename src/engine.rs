//! Thread-safe mutable façade over a snapshot.
//!
//! The engine serializes every configuration change and commit on one
//! worker thread fed by a FIFO channel, so at most one commit body runs
//! at a time. Each enqueued task carries its own cancellation source;
//! enqueuing a new task signals the token of the task currently
//! outstanding, letting an in-flight commit short-circuit and coalesce
//! with its successor. Snapshots are immutable, so long commit bodies
//! run outside the single mutex that guards the current snapshot, the
//! auto-commit counter, and the in-flight token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::builder::Builder;
use crate::cancel::CancellationSource;
use crate::error::GraphError;
use crate::node::{DerivedSpec, Input, InputSpec, NodeRef};
use crate::snapshot::{ChangeSet, Snapshot};

/// Engine behaviour switches.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Adopt the partial result of a cancelled commit (replaying input
    /// changes that arrived meanwhile) instead of discarding it.
    pub continue_with_aborted_calculations: bool,
    /// Evaluate the nodes of one level in parallel during commits.
    pub parallel: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            continue_with_aborted_calculations: false,
            parallel: true,
        }
    }
}

/// Receiver of state-changed notifications.
///
/// Listeners run on the engine worker after the state mutex has been
/// released; they see the installed snapshot and the set of nodes the
/// commit reported as changed.
pub trait ChangeListener: Send + Sync + 'static {
    /// Called after a commit installed a new snapshot with changes.
    fn on_change(&self, changes: &ChangeSet, snapshot: &Snapshot);
}

struct FnListener<F>(F);

impl<F: Fn(&ChangeSet, &Snapshot) + Send + Sync + 'static> ChangeListener for FnListener<F> {
    fn on_change(&self, changes: &ChangeSet, snapshot: &Snapshot) {
        (self.0)(changes, snapshot)
    }
}

/// Handle identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

enum Job {
    Commit {
        source: CancellationSource,
        allow_cancellation: bool,
        reply: Option<Sender<Result<Snapshot, GraphError>>>,
    },
    Reconfigure {
        stage: Box<dyn FnOnce(&mut Builder) -> bool + Send>,
        source: CancellationSource,
        reply: Sender<Result<Snapshot, GraphError>>,
    },
    Barrier {
        reply: Sender<Option<GraphError>>,
    },
    Shutdown,
}

pub(crate) struct EngineState {
    snapshot: Snapshot,
    suspend_count: usize,
    inflight: Option<CancellationSource>,
    deferred_error: Option<GraphError>,
}

pub(crate) struct EngineShared {
    config: EngineConfig,
    state: Mutex<EngineState>,
    listeners: Mutex<Vec<(SubscriptionId, Arc<dyn ChangeListener>)>>,
    next_subscription: AtomicU64,
}

impl EngineShared {
    pub(crate) fn remove_listener(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(key, _)| *key != id);
        listeners.len() != before
    }
}

/// Thread-safe mutable façade: serialized commits, cancellation
/// coalescing, auto-commit suspension, and change notifications.
pub struct Engine {
    shared: Arc<EngineShared>,
    tx: Sender<Job>,
    worker: Option<JoinHandle<()>>,
}

impl Engine {
    /// Wrap a snapshot with the default configuration.
    pub fn new(snapshot: Snapshot) -> Self {
        Self::with_config(snapshot, EngineConfig::default())
    }

    /// Wrap a snapshot with an explicit configuration.
    pub fn with_config(snapshot: Snapshot, config: EngineConfig) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(EngineShared {
            config,
            state: Mutex::new(EngineState {
                snapshot,
                suspend_count: 0,
                inflight: None,
                deferred_error: None,
            }),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        });
        let worker_shared = shared.clone();
        let worker = std::thread::spawn(move || worker_loop(worker_shared, rx));
        Self {
            shared,
            tx,
            worker: Some(worker),
        }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// The current snapshot. Pending changes may be present while a
    /// commit is queued or suspended.
    pub fn snapshot(&self) -> Snapshot {
        self.shared.state.lock().snapshot.clone()
    }

    /// Update an input and schedule a commit.
    ///
    /// The snapshot mutation happens immediately under the mutex and the
    /// updated (not yet committed) snapshot is returned. Unless
    /// auto-commit is suspended (and `always_commit` is false) a commit
    /// task is enqueued; its cancellation token is governed by
    /// `allow_cancellation` and is signalled when a later task arrives.
    pub fn set_value<T: Send + Sync + 'static>(
        &self,
        input: &Input<T>,
        value: T,
        allow_cancellation: bool,
        always_commit: bool,
    ) -> Result<Snapshot, GraphError> {
        let source = CancellationSource::new();
        let mut state = self.shared.state.lock();
        let updated = state.snapshot.change_value(input, value)?;
        state.snapshot = updated.clone();
        if state.suspend_count > 0 && !always_commit {
            return Ok(updated);
        }
        if let Some(prev) = state.inflight.replace(source.clone()) {
            prev.cancel();
        }
        let _ = self.tx.send(Job::Commit {
            source,
            allow_cancellation,
            reply: None,
        });
        Ok(updated)
    }

    /// Enqueue a commit and wait for its completion.
    ///
    /// Returns the snapshot the engine holds after the task: the
    /// committed one, or the untouched current one when the task was
    /// cancelled and aborted results are not adopted.
    pub fn commit(&self, allow_cancellation: bool) -> Result<Snapshot, GraphError> {
        let source = CancellationSource::new();
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        {
            let mut state = self.shared.state.lock();
            if let Some(prev) = state.inflight.replace(source.clone()) {
                prev.cancel();
            }
            let _ = self.tx.send(Job::Commit {
                source,
                allow_cancellation,
                reply: Some(reply_tx),
            });
        }
        reply_rx
            .recv()
            .map_err(|_| GraphError::invalid_op("engine worker stopped"))?
    }

    /// Run a staging closure against a builder seeded from the current
    /// snapshot, then build, commit, and install the new configuration.
    ///
    /// The whole operation is FIFO-serialized with commits. Input
    /// changes that arrive while the rebuild runs are replayed onto the
    /// installed snapshot.
    pub fn register_nodes<R, F>(&self, stage: F) -> Result<R, GraphError>
    where
        F: FnOnce(&mut Builder) -> Result<R, GraphError> + Send + 'static,
        R: Send + 'static,
    {
        let source = CancellationSource::new();
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let (staged_tx, staged_rx) = crossbeam_channel::bounded(1);
        let stage = Box::new(move |builder: &mut Builder| {
            let result = stage(builder);
            let ok = result.is_ok();
            let _ = staged_tx.send(result);
            ok
        });
        {
            let mut state = self.shared.state.lock();
            if let Some(prev) = state.inflight.replace(source.clone()) {
                prev.cancel();
            }
            let _ = self.tx.send(Job::Reconfigure {
                stage,
                source,
                reply: reply_tx,
            });
        }
        let outcome = reply_rx
            .recv()
            .map_err(|_| GraphError::invalid_op("engine worker stopped"))?;
        match staged_rx.try_recv() {
            Ok(staged) => {
                let value = staged?;
                outcome?;
                Ok(value)
            }
            Err(_) => Err(outcome.err().unwrap_or_else(|| {
                GraphError::invalid_op("reconfiguration staging did not run")
            })),
        }
    }

    /// Register an input node. FIFO-serialized.
    pub fn register_input<N: InputSpec>(
        &self,
        name: impl Into<String>,
        spec: N,
        initial: N::Value,
    ) -> Result<Input<N::Value>, GraphError> {
        let name = name.into();
        self.register_nodes(move |builder| builder.add_input(name, spec, initial))
    }

    /// Register a derived node. FIFO-serialized.
    pub fn register_calculation<N: DerivedSpec>(
        &self,
        name: impl Into<String>,
        spec: N,
    ) -> Result<crate::node::Calc<N::Output>, GraphError> {
        let name = name.into();
        self.register_nodes(move |builder| builder.add_calculation(name, spec))
    }

    /// Remove a node and everything depending on it. FIFO-serialized.
    pub fn remove_node_and_dependents(&self, node: &NodeRef) -> Result<(), GraphError> {
        let node = node.clone();
        self.register_nodes(move |builder| {
            builder.remove_node_and_dependents(&node);
            Ok(())
        })
    }

    /// Suspend auto-commit until the returned guard (and every guard
    /// nested inside it) is dropped; dropping the last guard schedules
    /// one commit.
    pub fn disable_auto_commit(&self) -> AutoCommitGuard<'_> {
        self.shared.state.lock().suspend_count += 1;
        AutoCommitGuard { engine: self }
    }

    /// Wait until every task enqueued before this call has completed.
    ///
    /// Surfaces the first error of a background commit (one scheduled by
    /// `set_value` or a guard drop) since the previous wait.
    pub fn wait_for_all_pending(&self) -> Result<(), GraphError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let _ = self.tx.send(Job::Barrier { reply: reply_tx });
        match reply_rx.recv() {
            Ok(Some(error)) => Err(error),
            Ok(None) => Ok(()),
            Err(_) => Err(GraphError::invalid_op("engine worker stopped")),
        }
    }

    /// Register a state-changed listener.
    pub fn subscribe(&self, listener: Arc<dyn ChangeListener>) -> SubscriptionId {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners.lock().push((id, listener));
        id
    }

    /// Register a closure as a state-changed listener.
    pub fn subscribe_fn<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ChangeSet, &Snapshot) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnListener(listener)))
    }

    /// Remove a listener; returns false when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.remove_listener(id)
    }

    pub(crate) fn shared_weak(&self) -> Weak<EngineShared> {
        Arc::downgrade(&self.shared)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Engine")
            .field("snapshot", &state.snapshot)
            .field("suspended", &(state.suspend_count > 0))
            .finish()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.tx.send(Job::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Scope guard suspending auto-commit; see
/// [`Engine::disable_auto_commit`].
pub struct AutoCommitGuard<'a> {
    engine: &'a Engine,
}

impl Drop for AutoCommitGuard<'_> {
    fn drop(&mut self) {
        let source = CancellationSource::new();
        let mut state = self.engine.shared.state.lock();
        state.suspend_count -= 1;
        if state.suspend_count > 0 {
            return;
        }
        if let Some(prev) = state.inflight.replace(source.clone()) {
            prev.cancel();
        }
        let _ = self.engine.tx.send(Job::Commit {
            source,
            allow_cancellation: true,
            reply: None,
        });
    }
}

fn worker_loop(shared: Arc<EngineShared>, rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Shutdown => break,
            Job::Barrier { reply } => {
                let deferred = shared.state.lock().deferred_error.take();
                let _ = reply.send(deferred);
            }
            Job::Commit {
                source,
                allow_cancellation,
                reply,
            } => run_commit(&shared, source, allow_cancellation, reply),
            Job::Reconfigure {
                stage,
                source,
                reply,
            } => run_reconfigure(&shared, stage, source, reply),
        }
    }
}

fn run_commit(
    shared: &EngineShared,
    source: CancellationSource,
    allow_cancellation: bool,
    reply: Option<Sender<Result<Snapshot, GraphError>>>,
) {
    let base = shared.state.lock().snapshot.clone();
    let token = if allow_cancellation {
        Some(source.token())
    } else {
        None
    };

    match base.commit(token.as_ref(), shared.config.parallel) {
        Err(error) => {
            tracing::debug!(%error, "commit task failed");
            let mut state = shared.state.lock();
            finish_inflight(&mut state, &source);
            match reply {
                Some(reply) => {
                    drop(state);
                    let _ = reply.send(Err(error));
                }
                None => {
                    state.deferred_error.get_or_insert(error);
                }
            }
        }
        Ok((committed, changes)) => {
            let cancelled = allow_cancellation && source.is_cancelled();
            let adopt = !cancelled || shared.config.continue_with_aborted_calculations;
            let (installed, notify) = {
                let mut state = shared.state.lock();
                let outcome = if adopt {
                    let live = state.snapshot.clone();
                    let next = replay_pending_inputs(&live, committed);
                    state.snapshot = next.clone();
                    (next, !changes.is_empty())
                } else {
                    (state.snapshot.clone(), false)
                };
                finish_inflight(&mut state, &source);
                outcome
            };
            if notify {
                emit(shared, &changes, &installed);
            }
            if let Some(reply) = reply {
                let _ = reply.send(Ok(installed));
            }
        }
    }
}

fn run_reconfigure(
    shared: &EngineShared,
    stage: Box<dyn FnOnce(&mut Builder) -> bool + Send>,
    source: CancellationSource,
    reply: Sender<Result<Snapshot, GraphError>>,
) {
    let base = shared.state.lock().snapshot.clone();
    let mut builder = base.change_configuration();
    if !stage(&mut builder) {
        let mut state = shared.state.lock();
        finish_inflight(&mut state, &source);
        drop(state);
        let _ = reply.send(Err(GraphError::invalid_op("reconfiguration staging failed")));
        return;
    }

    let token = source.token();
    let result = builder
        .build()
        .and_then(|snapshot| snapshot.commit(Some(&token), shared.config.parallel));
    match result {
        Err(error) => {
            tracing::debug!(%error, "reconfiguration failed");
            let mut state = shared.state.lock();
            finish_inflight(&mut state, &source);
            drop(state);
            let _ = reply.send(Err(error));
        }
        Ok((committed, changes)) => {
            // A cancelled rebuild is still installed: the configuration
            // must not be lost, and the cancelling task picks up the
            // remaining pending nodes right after.
            let installed = {
                let mut state = shared.state.lock();
                let live = state.snapshot.clone();
                let next = replay_pending_inputs(&live, committed);
                state.snapshot = next.clone();
                finish_inflight(&mut state, &source);
                next
            };
            if !changes.is_empty() {
                emit(shared, &changes, &installed);
            }
            let _ = reply.send(Ok(installed));
        }
    }
}

fn finish_inflight(state: &mut EngineState, source: &CancellationSource) {
    let is_current = state
        .inflight
        .as_ref()
        .map_or(false, |current| current.same_as(source));
    if is_current {
        state.inflight = None;
    }
}

/// Re-apply input mutations that landed on the live snapshot while a
/// commit ran elsewhere. Values equal to the committed baseline fall out
/// through revert detection, so only genuinely newer inputs stay
/// pending.
fn replay_pending_inputs(live: &Snapshot, onto: Snapshot) -> Snapshot {
    let mut result = onto;
    for node in live.changes().iter() {
        if !node.is_input() {
            continue;
        }
        let Ok(value) = live.get_erased(node) else {
            continue;
        };
        if let Ok(next) = result.change_object_value(node, value) {
            result = next;
        }
    }
    result
}

fn emit(shared: &EngineShared, changes: &ChangeSet, snapshot: &Snapshot) {
    let listeners: Vec<Arc<dyn ChangeListener>> = shared
        .listeners
        .lock()
        .iter()
        .map(|(_, listener)| listener.clone())
        .collect();
    for listener in listeners {
        listener.on_change(changes, snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{Cell, Sum};

    fn engine() -> (Engine, Input<i64>, crate::node::Calc<i64>) {
        let engine = Engine::new(Builder::new().build_and_commit().unwrap());
        let a = engine.register_input("a", Cell::new(), 1i64).unwrap();
        let b = engine.register_input("b", Cell::new(), 2i64).unwrap();
        let sum = engine.register_calculation("sum", Sum::of(&a, &b)).unwrap();
        (engine, a, sum)
    }

    #[test]
    fn registration_commits_eagerly() {
        let (engine, _, sum) = engine();
        let snapshot = engine.snapshot();
        assert!(snapshot.is_consistent());
        assert_eq!(*snapshot.get_value(&sum).unwrap(), 3);
    }

    #[test]
    fn set_value_schedules_a_commit() {
        let (engine, a, sum) = engine();
        let updated = engine.set_value(&a, 10, true, false).unwrap();
        assert!(!updated.is_consistent());
        engine.wait_for_all_pending().unwrap();
        let snapshot = engine.snapshot();
        assert!(snapshot.is_consistent());
        assert_eq!(*snapshot.get_value(&sum).unwrap(), 12);
    }

    #[test]
    fn explicit_commit_returns_the_committed_snapshot() {
        let (engine, a, sum) = engine();
        let _ = engine.set_value(&a, 5, true, false).unwrap();
        let committed = engine.commit(false).unwrap();
        assert!(committed.is_consistent());
        assert_eq!(*committed.get_value(&sum).unwrap(), 7);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        use std::sync::atomic::AtomicUsize;

        let (engine, a, _) = engine();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let id = engine.subscribe_fn(move |_, _| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        let _ = engine.set_value(&a, 2, false, false).unwrap();
        engine.wait_for_all_pending().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(engine.unsubscribe(id));
        assert!(!engine.unsubscribe(id));
        let _ = engine.set_value(&a, 3, false, false).unwrap();
        engine.wait_for_all_pending().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
