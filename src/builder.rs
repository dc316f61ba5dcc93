//! Staged graph configuration and the freeze into a snapshot.
//!
//! A builder stages additions and removals without recomputing anything.
//! `build` performs the topological sort (with cycle detection), applies
//! the removal closure over dependents, runs the one-time `on_build`
//! hooks, freezes the network metadata, and seeds the initial snapshot:
//! carried nodes keep their committed values, new nodes start from their
//! initial/default value and are marked pending.

use indexmap::IndexMap;

use crate::error::GraphError;
use crate::meta::NetworkMeta;
use crate::node::{Calc, DerivedSpec, Input, InputSpec, NodeId, NodeRef};
use crate::snapshot::{Snapshot, ValueMap, VersionId};
use crate::value::erase;

/// Stages a graph configuration and freezes it into a [`Snapshot`].
#[derive(Default)]
pub struct Builder {
    staged: IndexMap<NodeId, NodeRef, ahash::RandomState>,
    /// Committed values carried over from a previous configuration.
    baselines: ValueMap,
    /// Validated initial values for newly added inputs.
    initials: ValueMap,
    removed: ahash::HashSet<NodeId>,
}

impl Builder {
    /// Start an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a builder from an existing snapshot: same node list, and the
    /// committed baseline as carried values.
    ///
    /// Equivalent to [`Snapshot::change_configuration`].
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let staged = snapshot
            .nodes()
            .iter()
            .map(|n| (n.id(), n.clone()))
            .collect();
        Self {
            staged,
            baselines: snapshot.baseline_map().clone(),
            initials: ValueMap::default(),
            removed: ahash::HashSet::default(),
        }
    }

    /// Stage an input node with its initial value.
    ///
    /// The initial value passes the node's `validate` immediately.
    pub fn add_input<N: InputSpec>(
        &mut self,
        name: impl Into<String>,
        spec: N,
        initial: N::Value,
    ) -> Result<Input<N::Value>, GraphError> {
        let validated = spec.validate(initial)?;
        let node = NodeRef::new_input(name, spec);
        self.initials.insert(node.id(), erase(validated));
        self.staged.insert(node.id(), node.clone());
        Ok(Input::new(node))
    }

    /// Stage a derived node.
    pub fn add_calculation<N: DerivedSpec>(
        &mut self,
        name: impl Into<String>,
        spec: N,
    ) -> Result<Calc<N::Output>, GraphError> {
        let node = NodeRef::new_derived(name, spec);
        self.staged.insert(node.id(), node.clone());
        Ok(Calc::new(node))
    }

    /// Stage the removal of a node together with everything that
    /// transitively depends on it.
    pub fn remove_node_and_dependents(&mut self, node: &NodeRef) {
        self.removed.insert(node.id());
    }

    /// Freeze the staged configuration into an unreduced snapshot.
    ///
    /// New nodes are seeded as pending; call
    /// [`build_and_commit`](Self::build_and_commit) for a consistent
    /// result in one step.
    ///
    /// # Errors
    ///
    /// `CircularDependency` when the staged graph contains a cycle,
    /// `MissingDependency` when a dependency was never staged; both are
    /// fatal and no snapshot is produced. `on_build` failures propagate.
    pub fn build(self) -> Result<Snapshot, GraphError> {
        let sorted = self.topo_sort()?;

        // Removal closure: one pass suffices because the list is in
        // topological order, so a removed dependency is seen before any
        // of its dependents.
        let mut removed = self.removed.clone();
        let mut remaining = Vec::with_capacity(sorted.len());
        for node in sorted {
            let dead = removed.contains(&node.id())
                || node
                    .dependencies()
                    .iter()
                    .any(|d| removed.contains(&d.id()));
            if dead {
                removed.insert(node.id());
            } else {
                remaining.push(node);
            }
        }

        for node in &remaining {
            if let Some(spec) = node.as_derived() {
                spec.on_build()?;
            }
        }

        let meta = NetworkMeta::freeze(remaining);
        tracing::debug!(nodes = meta.len(), removed = removed.len(), "configuration built");

        let mut values = ValueMap::default();
        let mut initial_values = ValueMap::default();
        let mut changes = ahash::HashSet::default();
        for node in meta.nodes() {
            if let Some(committed) = self.baselines.get(&node.id()) {
                values.insert(node.id(), committed.clone());
                initial_values.insert(node.id(), committed.clone());
                continue;
            }
            changes.insert(node.id());
            let seed = match self.initials.get(&node.id()) {
                Some(initial) => initial.clone(),
                None => match node.as_derived() {
                    Some(spec) => spec.default_value(),
                    None => {
                        return Err(GraphError::invalid_op(format!(
                            "input {:?} has no initial value",
                            node.name()
                        )))
                    }
                },
            };
            values.insert(node.id(), seed);
        }

        Ok(Snapshot::from_parts(
            std::sync::Arc::new(meta),
            values,
            std::sync::Arc::new(initial_values),
            changes,
            VersionId::fresh(),
        ))
    }

    /// [`build`](Self::build) followed by a full commit.
    pub fn build_and_commit(self) -> Result<Snapshot, GraphError> {
        let (snapshot, _) = self.build()?.commit(None, true)?;
        Ok(snapshot)
    }

    /// Depth-first topological sort over the staged nodes.
    fn topo_sort(&self) -> Result<Vec<NodeRef>, GraphError> {
        let mut visiting = ahash::HashSet::default();
        let mut visited = ahash::HashSet::default();
        let mut path = Vec::new();
        let mut sorted = Vec::with_capacity(self.staged.len());
        for node in self.staged.values() {
            self.visit(node, &mut visiting, &mut visited, &mut path, &mut sorted)?;
        }
        Ok(sorted)
    }

    fn visit(
        &self,
        node: &NodeRef,
        visiting: &mut ahash::HashSet<NodeId>,
        visited: &mut ahash::HashSet<NodeId>,
        path: &mut Vec<String>,
        sorted: &mut Vec<NodeRef>,
    ) -> Result<(), GraphError> {
        if visited.contains(&node.id()) {
            return Ok(());
        }
        if visiting.contains(&node.id()) {
            let mut cycle = path.clone();
            cycle.push(node.name().to_string());
            return Err(GraphError::CircularDependency { path: cycle });
        }
        visiting.insert(node.id());
        path.push(node.name().to_string());
        for dep in node.dependencies() {
            let staged = self.staged.get(&dep.id()).ok_or_else(|| {
                GraphError::MissingDependency {
                    node: node.name().to_string(),
                    dependency: dep.name().to_string(),
                }
            })?;
            self.visit(staged, visiting, visited, path, sorted)?;
        }
        visiting.remove(&node.id());
        path.pop();
        visited.insert(node.id());
        sorted.push(node.clone());
        Ok(())
    }
}
