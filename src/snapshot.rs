//! Immutable graph snapshots and the commit algorithm.
//!
//! A snapshot binds every node of one configuration to a value, plus the
//! set of pending changes against the last consistent baseline. All
//! mutators are functional: they return a new snapshot and leave the
//! receiver untouched, so snapshots are cheap to share across threads.
//!
//! A commit walks the configuration's levels in ascending order and
//! recomputes exactly the transitive-affected derived nodes, evaluating
//! the nodes of one level in parallel. Lazy nodes are not computed
//! eagerly; their slots hold an unresolved marker until the first read,
//! which resolves them level-by-level under a per-snapshot guard.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::builder::Builder;
use crate::cancel::CancellationToken;
use crate::error::GraphError;
use crate::meta::NetworkMeta;
use crate::node::{NodeId, NodeLike, NodeRef};
use crate::value::{downcast, erase, is_unresolved, lazy_unresolved, Inputs, Value};

pub(crate) type ValueMap = ahash::HashMap<NodeId, Value>;

/// Opaque identifier of a consistent state.
///
/// Regenerated whenever a commit produces a consistent snapshot that
/// carried committed changes; two snapshots with the same id share the
/// same baseline and configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VersionId(u64);

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

impl VersionId {
    pub(crate) fn fresh() -> Self {
        Self(NEXT_VERSION.fetch_add(1, Ordering::Relaxed))
    }
}

/// Set of nodes reported as changed by a commit.
#[derive(Clone, Default)]
pub struct ChangeSet {
    nodes: Arc<Vec<NodeRef>>,
    ids: Arc<ahash::HashSet<NodeId>>,
}

impl ChangeSet {
    pub(crate) fn from_nodes(nodes: Vec<NodeRef>) -> Self {
        let ids = nodes.iter().map(|n| n.id()).collect();
        Self {
            nodes: Arc::new(nodes),
            ids: Arc::new(ids),
        }
    }

    /// Returns true when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of changed nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the set contains the given node.
    pub fn contains_node(&self, node: &NodeRef) -> bool {
        self.ids.contains(&node.id())
    }

    /// Whether the set contains the node behind a typed handle.
    pub fn contains<T>(&self, node: &impl NodeLike<T>) -> bool {
        self.contains_node(node.node_ref())
    }

    /// Iterate over the changed nodes. Order is unspecified.
    pub fn iter(&self) -> impl Iterator<Item = &NodeRef> + '_ {
        self.nodes.iter()
    }
}

impl std::fmt::Debug for ChangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.nodes.iter()).finish()
    }
}

struct SnapshotInner {
    meta: Arc<NetworkMeta>,
    values: Arc<ValueMap>,
    /// Baseline of the last consistent state; a node absent here has no
    /// committed value yet.
    initial_values: Arc<ValueMap>,
    changes: Arc<ahash::HashSet<NodeId>>,
    version: VersionId,
    /// Write-back slots for lazy nodes resolved on this snapshot.
    lazy_slots: papaya::HashMap<NodeId, Value, ahash::RandomState>,
    /// Serializes lazy resolution; plain reads never take it.
    lazy_guard: Mutex<()>,
}

/// An immutable binding of every node to a value, plus pending-change
/// metadata. Cheap to clone and share.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

enum Processed {
    Clean,
    Unprocessed(NodeRef),
    Changed(NodeRef, Value),
}

impl Snapshot {
    pub(crate) fn from_parts(
        meta: Arc<NetworkMeta>,
        values: ValueMap,
        initial_values: Arc<ValueMap>,
        changes: ahash::HashSet<NodeId>,
        version: VersionId,
    ) -> Self {
        Self {
            inner: Arc::new(SnapshotInner {
                meta,
                values: Arc::new(values),
                initial_values,
                changes: Arc::new(changes),
                version,
                lazy_slots: papaya::HashMap::with_hasher(ahash::RandomState::new()),
                lazy_guard: Mutex::new(()),
            }),
        }
    }

    fn derive(&self, values: ValueMap, changes: ahash::HashSet<NodeId>) -> Self {
        Self {
            inner: Arc::new(SnapshotInner {
                meta: self.inner.meta.clone(),
                values: Arc::new(values),
                initial_values: self.inner.initial_values.clone(),
                changes: Arc::new(changes),
                version: self.inner.version,
                lazy_slots: papaya::HashMap::with_hasher(ahash::RandomState::new()),
                lazy_guard: Mutex::new(()),
            }),
        }
    }

    /// The configuration metadata shared by all snapshots of this
    /// generation.
    pub fn meta(&self) -> &NetworkMeta {
        &self.inner.meta
    }

    pub(crate) fn baseline_map(&self) -> &ValueMap {
        &self.inner.initial_values
    }

    /// All nodes of the snapshot, in topological order.
    pub fn nodes(&self) -> &[NodeRef] {
        self.inner.meta.nodes()
    }

    /// Identifier of the consistent state this snapshot derives from.
    pub fn version_id(&self) -> VersionId {
        self.inner.version
    }

    /// True when no changes are pending.
    pub fn is_consistent(&self) -> bool {
        self.inner.changes.is_empty()
    }

    /// The pending changes against the committed baseline.
    pub fn changes(&self) -> ChangeSet {
        let nodes = self
            .inner
            .changes
            .iter()
            .filter_map(|id| self.inner.meta.get(*id).cloned())
            .collect();
        ChangeSet::from_nodes(nodes)
    }

    /// Set an input's value through its typed handle.
    ///
    /// See [`change_object_value`](Self::change_object_value).
    #[must_use = "change_value returns a new snapshot"]
    pub fn change_value<T: Send + Sync + 'static>(
        &self,
        input: &crate::node::Input<T>,
        value: T,
    ) -> Result<Snapshot, GraphError> {
        self.change_object_value(input.node(), erase(value))
    }

    /// Set an input's value from an erased slot.
    ///
    /// The node's `validate` runs first and may coerce or reject the
    /// value. Reverting an input to its committed baseline removes it
    /// from the pending set again, so set-then-revert leaves the
    /// snapshot consistent. The version id is preserved.
    #[must_use = "change_object_value returns a new snapshot"]
    pub fn change_object_value(
        &self,
        node: &NodeRef,
        value: Value,
    ) -> Result<Snapshot, GraphError> {
        if !self.inner.meta.contains(node.id()) {
            return Err(GraphError::UnknownNode {
                name: node.name().to_string(),
            });
        }
        let spec = node.as_input().ok_or_else(|| {
            GraphError::invalid_op(format!("node {:?} is not an input", node.name()))
        })?;
        let validated = spec.validate(node.name(), value)?;

        let mut values = (*self.inner.values).clone();
        values.insert(node.id(), validated.clone());

        let mut changes = (*self.inner.changes).clone();
        match self.inner.initial_values.get(&node.id()) {
            Some(baseline) if node.values_equal(baseline, &validated) => {
                changes.remove(&node.id());
            }
            _ => {
                changes.insert(node.id());
            }
        }
        Ok(self.derive(values, changes))
    }

    /// Explicitly mark a node as changed.
    ///
    /// Used when a derived node's computation reads state outside the
    /// graph; that node is then responsible for its own thread-safety.
    #[must_use = "mark_changed returns a new snapshot"]
    pub fn mark_changed(&self, node: &NodeRef) -> Result<Snapshot, GraphError> {
        if !self.inner.meta.contains(node.id()) {
            return Err(GraphError::UnknownNode {
                name: node.name().to_string(),
            });
        }
        let mut changes = (*self.inner.changes).clone();
        changes.insert(node.id());
        Ok(self.derive((*self.inner.values).clone(), changes))
    }

    /// Typed read of a node's current value.
    ///
    /// Resolves lazy slots on demand; see [`get_erased`](Self::get_erased).
    pub fn get_value<T: Send + Sync + 'static>(
        &self,
        node: &impl NodeLike<T>,
    ) -> Result<Arc<T>, GraphError> {
        let value = self.get_erased(node.node_ref())?;
        downcast::<T>(&value).ok_or_else(|| {
            GraphError::invalid_op(format!(
                "node {:?} does not hold a {}",
                node.node_ref().name(),
                std::any::type_name::<T>()
            ))
        })
    }

    /// Erased read of a node's current value.
    ///
    /// Non-lazy reads are lock-free. When the slot holds the unresolved
    /// marker, the reachable unresolved nodes are evaluated level by
    /// level (parallel within a level) under the snapshot's resolution
    /// guard and written back; the result of every read is stable for
    /// the life of the snapshot.
    pub fn get_erased(&self, node: &NodeRef) -> Result<Value, GraphError> {
        let slot = self
            .inner
            .values
            .get(&node.id())
            .ok_or_else(|| GraphError::UnknownNode {
                name: node.name().to_string(),
            })?;
        if !is_unresolved(slot) {
            return Ok(slot.clone());
        }
        if let Some(resolved) = self.overlay_get(node.id()) {
            return Ok(resolved);
        }
        self.resolve_lazy(node)
    }

    /// Off-thread read of a node's current value.
    ///
    /// Spawns a worker to perform the (possibly lazy-resolving) read and
    /// returns the receiving end; only meaningful when lazy nodes exist.
    pub fn get_value_async<T: Send + Sync + 'static>(
        &self,
        node: &impl NodeLike<T>,
    ) -> crossbeam_channel::Receiver<Result<Arc<T>, GraphError>> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let snapshot = self.clone();
        let node = node.node_ref().clone();
        std::thread::spawn(move || {
            let result = snapshot.get_erased(&node).and_then(|value| {
                downcast::<T>(&value).ok_or_else(|| {
                    GraphError::invalid_op(format!(
                        "node {:?} does not hold a {}",
                        node.name(),
                        std::any::type_name::<T>()
                    ))
                })
            });
            let _ = tx.send(result);
        });
        rx
    }

    fn overlay_get(&self, id: NodeId) -> Option<Value> {
        self.inner.lazy_slots.pin().get(&id).cloned()
    }

    /// Current effective value of a dependency during lazy resolution.
    fn resolution_value(&self, dep: &NodeRef) -> Result<Value, GraphError> {
        if let Some(resolved) = self.overlay_get(dep.id()) {
            return Ok(resolved);
        }
        self.inner
            .values
            .get(&dep.id())
            .cloned()
            .ok_or_else(|| GraphError::UnknownNode {
                name: dep.name().to_string(),
            })
    }

    fn resolve_lazy(&self, node: &NodeRef) -> Result<Value, GraphError> {
        let _guard = self.inner.lazy_guard.lock();
        if let Some(resolved) = self.overlay_get(node.id()) {
            return Ok(resolved);
        }

        // Collect the reachable unresolved nodes, then evaluate them
        // grouped by precomputed level so dependencies resolve first.
        let mut pending: Vec<NodeRef> = Vec::new();
        let mut seen: ahash::HashSet<NodeId> = ahash::HashSet::default();
        let mut stack = vec![node.clone()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.id()) {
                continue;
            }
            let slot = self.inner.values.get(&current.id()).ok_or_else(|| {
                GraphError::UnknownNode {
                    name: current.name().to_string(),
                }
            })?;
            if !is_unresolved(slot) || self.overlay_get(current.id()).is_some() {
                continue;
            }
            stack.extend(current.dependencies());
            pending.push(current);
        }

        let mut by_level: BTreeMap<usize, Vec<NodeRef>> = BTreeMap::new();
        for n in pending {
            let level = self.inner.meta.level_of(n.id()).unwrap_or(0);
            by_level.entry(level).or_default().push(n);
        }
        tracing::trace!(node = node.name(), levels = by_level.len(), "lazy resolution");

        for batch in by_level.into_values() {
            let results: Result<Vec<(NodeId, Value)>, GraphError> = batch
                .par_iter()
                .map(|n| self.evaluate_node(n).map(|v| (n.id(), v)))
                .collect();
            let pinned = self.inner.lazy_slots.pin();
            for (id, value) in results? {
                pinned.insert(id, value);
            }
        }

        self.overlay_get(node.id()).ok_or_else(|| {
            GraphError::invalid_op(format!("lazy resolution missed node {:?}", node.name()))
        })
    }

    /// Evaluate one derived node against the current effective values.
    fn evaluate_node(&self, node: &NodeRef) -> Result<Value, GraphError> {
        let Some(spec) = node.as_derived() else {
            return self.resolution_value(node);
        };
        let deps = spec.dependencies();
        let mut inputs = Vec::with_capacity(deps.len());
        for dep in &deps {
            inputs.push(self.resolution_value(dep)?);
        }
        spec.calculate(&Inputs::new(&inputs))
            .map_err(|e| GraphError::Calculation {
                node: node.name().to_string(),
                message: e.to_string(),
            })
    }

    /// Drive the snapshot towards a consistent state.
    ///
    /// Iterates the levels in ascending order and recomputes every
    /// derived node whose inputs (or itself) are marked changed,
    /// in parallel within one level unless `parallel` is false or a
    /// cancellation has been observed during this call. Returns the new
    /// snapshot and the set of pending input changes plus derived nodes
    /// whose value actually changed.
    ///
    /// When the token is signalled mid-way, the remaining affected nodes
    /// are carried over into the returned snapshot's pending set, making
    /// it inconsistent; committing again finishes the work.
    ///
    /// # Errors
    ///
    /// `MissingDependency` or `Calculation` abort the commit; nothing is
    /// installed.
    pub fn commit(
        &self,
        cancel: Option<&CancellationToken>,
        parallel: bool,
    ) -> Result<(Snapshot, ChangeSet), GraphError> {
        if self.is_consistent() {
            return Ok((self.clone(), ChangeSet::default()));
        }

        let meta = &self.inner.meta;
        let mut working = (*self.inner.values).clone();
        let mut dirty: ahash::HashSet<NodeId> = (*self.inner.changes).clone();
        let mut unprocessed: ahash::HashSet<NodeId> = ahash::HashSet::default();
        let mut output: ahash::HashSet<NodeId> = self
            .inner
            .changes
            .iter()
            .copied()
            .filter(|id| meta.get(*id).map(NodeRef::is_input).unwrap_or(false))
            .collect();

        tracing::debug!(pending = dirty.len(), "commit start");

        for level in meta.derived_levels() {
            let run_parallel = parallel && !cancel.map_or(false, CancellationToken::is_cancelled);
            let results: Result<Vec<Processed>, GraphError> = if run_parallel {
                level
                    .par_iter()
                    .map(|n| self.process(n, &working, &dirty, cancel))
                    .collect()
            } else {
                level
                    .iter()
                    .map(|n| self.process(n, &working, &dirty, cancel))
                    .collect()
            };
            for processed in results? {
                match processed {
                    Processed::Clean => {}
                    Processed::Unprocessed(node) => {
                        unprocessed.insert(node.id());
                    }
                    Processed::Changed(node, value) => {
                        working.insert(node.id(), value);
                        dirty.insert(node.id());
                        output.insert(node.id());
                    }
                }
            }
        }

        let consistent = unprocessed.is_empty();
        let version = if consistent && !output.is_empty() {
            VersionId::fresh()
        } else {
            self.inner.version
        };
        tracing::debug!(
            changed = output.len(),
            carried = unprocessed.len(),
            consistent,
            "commit done"
        );

        let values = Arc::new(working);
        let snapshot = Snapshot {
            inner: Arc::new(SnapshotInner {
                meta: meta.clone(),
                values: values.clone(),
                initial_values: values,
                changes: Arc::new(unprocessed),
                version,
                lazy_slots: papaya::HashMap::with_hasher(ahash::RandomState::new()),
                lazy_guard: Mutex::new(()),
            }),
        };
        let change_set = ChangeSet::from_nodes(
            output
                .iter()
                .filter_map(|id| meta.get(*id).cloned())
                .collect(),
        );
        Ok((snapshot, change_set))
    }

    fn process(
        &self,
        node: &NodeRef,
        working: &ValueMap,
        dirty: &ahash::HashSet<NodeId>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Processed, GraphError> {
        let Some(spec) = node.as_derived() else {
            return Ok(Processed::Clean);
        };
        let deps = spec.dependencies();
        let affected =
            dirty.contains(&node.id()) || deps.iter().any(|d| dirty.contains(&d.id()));

        if self.inner.meta.is_lazy(node.id()) {
            // Dirtiness still propagates so downstream nodes see the
            // change; the recompute itself is deferred to the next read.
            return Ok(if affected {
                Processed::Changed(node.clone(), lazy_unresolved())
            } else {
                Processed::Clean
            });
        }
        if !affected {
            return Ok(Processed::Clean);
        }
        if cancel.map_or(false, CancellationToken::is_cancelled) {
            return Ok(Processed::Unprocessed(node.clone()));
        }

        let mut inputs = Vec::with_capacity(deps.len());
        for dep in &deps {
            let value =
                working
                    .get(&dep.id())
                    .cloned()
                    .ok_or_else(|| GraphError::MissingDependency {
                        node: node.name().to_string(),
                        dependency: dep.name().to_string(),
                    })?;
            inputs.push(value);
        }
        let new_value =
            spec.calculate(&Inputs::new(&inputs))
                .map_err(|e| GraphError::Calculation {
                    node: node.name().to_string(),
                    message: e.to_string(),
                })?;

        let changed = match self.inner.initial_values.get(&node.id()) {
            Some(baseline) => !node.values_equal(baseline, &new_value),
            None => true,
        };
        Ok(if changed {
            Processed::Changed(node.clone(), new_value)
        } else {
            Processed::Clean
        })
    }

    /// Render every node's current value by name, for inspection.
    ///
    /// Unresolved lazy slots render as `"<unresolved>"`.
    pub fn dump(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for node in self.inner.meta.nodes() {
            let Some(slot) = self.inner.values.get(&node.id()) else {
                continue;
            };
            let rendered = if is_unresolved(slot) {
                match self.overlay_get(node.id()) {
                    Some(resolved) => node.render(&resolved),
                    None => "<unresolved>".to_string(),
                }
            } else {
                node.render(slot)
            };
            out.insert(node.name().to_string(), rendered);
        }
        out
    }

    /// Start a reconfiguration seeded with the current node list and the
    /// committed baselines; nodes already present keep their values.
    pub fn change_configuration(&self) -> Builder {
        Builder::from_snapshot(self)
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("nodes", &self.inner.meta.len())
            .field("version", &self.inner.version)
            .field("pending", &self.inner.changes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::nodes::{try_map1, Cell, Sum};

    fn two_input_sum() -> (Snapshot, crate::node::Input<i64>, crate::node::Calc<i64>) {
        let mut builder = Builder::new();
        let a = builder.add_input("a", Cell::new(), 1i64).unwrap();
        let b = builder.add_input("b", Cell::new(), 2i64).unwrap();
        let sum = builder
            .add_calculation("sum", Sum::of(&a, &b))
            .unwrap();
        let state = builder.build_and_commit().unwrap();
        (state, a, sum)
    }

    #[test]
    fn revert_detection_is_precise() {
        let (state, a, _) = two_input_sum();
        let touched = state.change_value(&a, 5).unwrap();
        assert!(!touched.is_consistent());
        let reverted = touched.change_value(&a, 1).unwrap();
        assert!(reverted.is_consistent());
    }

    #[test]
    fn commit_on_consistent_snapshot_is_identity() {
        let (state, _, sum) = two_input_sum();
        let (next, changes) = state.commit(None, true).unwrap();
        assert!(changes.is_empty());
        assert_eq!(next.version_id(), state.version_id());
        assert_eq!(*next.get_value(&sum).unwrap(), 3);
    }

    #[test]
    fn parallel_and_serial_commits_agree() {
        let (state, a, sum) = two_input_sum();
        let touched = state.change_value(&a, 10).unwrap();
        let (par, par_changes) = touched.commit(None, true).unwrap();
        let (ser, ser_changes) = touched.commit(None, false).unwrap();
        assert_eq!(*par.get_value(&sum).unwrap(), *ser.get_value(&sum).unwrap());
        assert_eq!(par_changes.len(), ser_changes.len());
        for node in par_changes.iter() {
            assert!(ser_changes.contains_node(node));
        }
    }

    #[test]
    fn snapshots_are_observationally_immutable() {
        let (state, a, sum) = two_input_sum();
        let before = *state.get_value(&sum).unwrap();
        let touched = state.change_value(&a, 100).unwrap();
        let (committed, _) = touched.commit(None, true).unwrap();
        assert_eq!(*state.get_value(&sum).unwrap(), before);
        assert_eq!(*committed.get_value(&sum).unwrap(), 102);
        assert!(state.is_consistent());
    }

    #[test]
    fn calculation_errors_abort_the_commit() {
        let mut builder = Builder::new();
        let a = builder.add_input("a", Cell::new(), 1i64).unwrap();
        let _bad = builder
            .add_calculation(
                "bad",
                try_map1(&a, |_: &i64| -> Result<i64, GraphError> {
                    Err(GraphError::invalid_op("boom"))
                }),
            )
            .unwrap();
        let built = builder.build().unwrap();
        let err = built.commit(None, true).unwrap_err();
        assert!(matches!(err, GraphError::Calculation { .. }));
    }

    #[test]
    fn version_changes_only_on_committed_changes() {
        let (state, a, _) = two_input_sum();
        let v0 = state.version_id();
        let (same, _) = state.commit(None, true).unwrap();
        assert_eq!(same.version_id(), v0);
        let (next, _) = state
            .change_value(&a, 7)
            .unwrap()
            .commit(None, true)
            .unwrap();
        assert_ne!(next.version_id(), v0);
    }

    #[test]
    fn dump_renders_names_and_values() {
        let (state, _, _) = two_input_sum();
        let dump = state.dump();
        assert_eq!(dump.get("a").map(String::as_str), Some("1"));
        assert_eq!(dump.get("sum").map(String::as_str), Some("3"));
    }
}
