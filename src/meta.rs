//! Frozen network metadata: topological order, levels, laziness closure.
//!
//! The meta is computed once per configuration and shared by every
//! snapshot of that configuration. `levels[0]` holds the input nodes;
//! `levels[k]` holds the derived nodes whose deepest dependency sits at
//! level `k - 1`, so all nodes of one level are mutually independent and
//! can be evaluated in parallel.

use crate::node::{NodeId, NodeRef};

/// Immutable scheduling metadata for one graph configuration.
pub struct NetworkMeta {
    nodes: Vec<NodeRef>,
    levels: Vec<Vec<NodeRef>>,
    level_of: ahash::HashMap<NodeId, usize>,
    index_of: ahash::HashMap<NodeId, usize>,
    lazy: ahash::HashSet<NodeId>,
}

impl NetworkMeta {
    /// Freeze a topologically sorted node list into scheduling metadata.
    ///
    /// Single pass: `level(input) = 0`,
    /// `level(derived) = 1 + max(level(dep))`. A derived node is
    /// effectively lazy when it is declared lazy or any dependency is
    /// effectively lazy.
    pub(crate) fn freeze(sorted: Vec<NodeRef>) -> Self {
        let mut levels: Vec<Vec<NodeRef>> = vec![Vec::new()];
        let mut level_of = ahash::HashMap::default();
        let mut index_of = ahash::HashMap::default();
        let mut lazy = ahash::HashSet::default();

        for (index, node) in sorted.iter().enumerate() {
            index_of.insert(node.id(), index);
            let deps = node.dependencies();
            let level = if node.is_input() {
                0
            } else {
                1 + deps
                    .iter()
                    .filter_map(|d| level_of.get(&d.id()))
                    .max()
                    .copied()
                    .unwrap_or(0)
            };
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(node.clone());
            level_of.insert(node.id(), level);

            if node.is_declared_lazy() || deps.iter().any(|d| lazy.contains(&d.id())) {
                lazy.insert(node.id());
            }
        }

        tracing::debug!(
            nodes = sorted.len(),
            levels = levels.len(),
            lazy = lazy.len(),
            "network meta frozen"
        );

        Self {
            nodes: sorted,
            levels,
            level_of,
            index_of,
            lazy,
        }
    }

    /// All nodes, in topological order.
    pub fn nodes(&self) -> &[NodeRef] {
        &self.nodes
    }

    /// Number of nodes in the configuration.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true for an empty configuration.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Dependency depth of a node; `None` when the node is not part of
    /// this configuration.
    pub fn level_of(&self, id: NodeId) -> Option<usize> {
        self.level_of.get(&id).copied()
    }

    /// Whether the node belongs to this configuration.
    pub fn contains(&self, id: NodeId) -> bool {
        self.level_of.contains_key(&id)
    }

    /// Look a node up by identity.
    pub fn get(&self, id: NodeId) -> Option<&NodeRef> {
        self.index_of.get(&id).map(|&i| &self.nodes[i])
    }

    /// Derived levels in ascending order (level 0, the inputs, skipped).
    pub(crate) fn derived_levels(&self) -> impl Iterator<Item = &Vec<NodeRef>> + '_ {
        self.levels.iter().skip(1)
    }

    /// Whether a node is effectively lazy (declared or transitively).
    pub(crate) fn is_lazy(&self, id: NodeId) -> bool {
        self.lazy.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{map1, Cell, Sum};

    fn input(name: &str) -> NodeRef {
        NodeRef::new_input(name, Cell::<i64>::new())
    }

    #[test]
    fn levels_exceed_dependency_levels() {
        let a = input("a");
        let b = input("b");
        let sum = NodeRef::new_derived(
            "sum",
            Sum::<i64>::new([
                crate::node::ValueRef::from_node(a.clone()),
                crate::node::ValueRef::from_node(b.clone()),
            ]),
        );
        let doubled = NodeRef::new_derived(
            "doubled",
            map1(
                &crate::node::ValueRef::<i64>::from_node(sum.clone()),
                |v: &i64| v * 2,
            ),
        );
        let meta = NetworkMeta::freeze(vec![a.clone(), b.clone(), sum.clone(), doubled.clone()]);

        assert_eq!(meta.level_of(a.id()), Some(0));
        assert_eq!(meta.level_of(b.id()), Some(0));
        assert_eq!(meta.level_of(sum.id()), Some(1));
        assert_eq!(meta.level_of(doubled.id()), Some(2));
        for node in meta.nodes() {
            for dep in node.dependencies() {
                assert!(meta.level_of(node.id()) > meta.level_of(dep.id()));
            }
        }
    }

    #[test]
    fn laziness_is_transitive() {
        let a = input("a");
        let lazy = NodeRef::new_derived(
            "lazy",
            map1(
                &crate::node::ValueRef::<i64>::from_node(a.clone()),
                |v: &i64| v + 1,
            )
            .lazy(),
        );
        let downstream = NodeRef::new_derived(
            "downstream",
            map1(
                &crate::node::ValueRef::<i64>::from_node(lazy.clone()),
                |v: &i64| v + 1,
            ),
        );
        let meta = NetworkMeta::freeze(vec![a.clone(), lazy.clone(), downstream.clone()]);

        assert!(!meta.is_lazy(a.id()));
        assert!(meta.is_lazy(lazy.id()));
        assert!(meta.is_lazy(downstream.id()));
    }
}
