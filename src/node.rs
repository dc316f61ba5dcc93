//! Node identity, the typed node contracts, and their erased runtime form.
//!
//! A node is a stable, hashable identity carrying a human-readable name
//! and one of two capability sets: an *input* (externally set value with
//! validation) or a *derived* computation (pure function over other
//! nodes' values). User code implements the typed [`InputSpec`] /
//! [`DerivedSpec`] traits; the crate stores them behind erased objects
//! so one heterogeneous snapshot can hold mixed-type values. Typed
//! handles ([`Input`], [`Calc`], [`ValueRef`]) are thin wrappers around
//! the erased identity.

use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::GraphError;
use crate::value::{erase, Inputs, Value};

/// Process-unique node identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(0);

impl NodeId {
    fn fresh() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Typed contract for an input node: a typed value holder.
///
/// `validate` is invoked on every mutation before storage and must be
/// pure and idempotent. It may return a substitute value (e.g. a min/max
/// clamp) or reject with [`GraphError::InvalidInputValue`]. The default
/// is identity.
///
/// `values_equal` decides whether two values are the same for change
/// detection. It is an instance method so a node can carry its own
/// tolerance.
pub trait InputSpec: Send + Sync + 'static {
    /// The value type held by this input.
    type Value: Clone + Debug + Send + Sync + 'static;

    /// Validate (and possibly coerce) a candidate value.
    fn validate(&self, value: Self::Value) -> Result<Self::Value, GraphError> {
        Ok(value)
    }

    /// Compare two values for change-detection purposes.
    fn values_equal(&self, a: &Self::Value, b: &Self::Value) -> bool;
}

/// Typed contract for a derived node: a pure computation over the
/// current values of an ordered dependency list.
///
/// `calculate` receives the dependency values in declaration order
/// (`inputs.get(i)` corresponds to `dependencies()[i]`) and must be
/// deterministic and side-effect free. `default_value` fills the node's
/// slot before its first commit. `on_build` runs once per snapshot
/// construction the node participates in; an implementation may use it
/// as the moment after which the node becomes immutable.
pub trait DerivedSpec: Send + Sync + 'static {
    /// The output type produced by this node.
    type Output: Debug + Send + Sync + 'static;

    /// Ordered list of dependencies, matching the order `calculate`
    /// expects its inputs in.
    fn dependencies(&self) -> Vec<NodeRef>;

    /// Compute the output from the current dependency values.
    fn calculate(&self, inputs: &Inputs<'_>) -> Result<Self::Output, GraphError>;

    /// Initial slot value before the first commit.
    fn default_value(&self) -> Self::Output;

    /// Declared laziness. A node is also *implicitly* lazy when any
    /// transitive dependency is lazy; that closure is computed when the
    /// network is frozen.
    fn is_lazy(&self) -> bool {
        false
    }

    /// One-time configuration hook, called during every build this node
    /// is part of.
    fn on_build(&self) -> Result<(), GraphError> {
        Ok(())
    }

    /// Compare two outputs for change-detection purposes.
    fn values_equal(&self, a: &Self::Output, b: &Self::Output) -> bool;
}

/// Object-safe erased form of [`InputSpec`].
pub(crate) trait AnyInput: Send + Sync + 'static {
    fn validate(&self, node: &str, value: Value) -> Result<Value, GraphError>;
    fn values_equal(&self, a: &Value, b: &Value) -> bool;
    fn render(&self, value: &Value) -> String;
}

/// Object-safe erased form of [`DerivedSpec`].
pub(crate) trait AnyDerived: Send + Sync + 'static {
    fn dependencies(&self) -> Vec<NodeRef>;
    fn calculate(&self, inputs: &Inputs<'_>) -> Result<Value, GraphError>;
    fn default_value(&self) -> Value;
    fn is_lazy(&self) -> bool;
    fn on_build(&self) -> Result<(), GraphError>;
    fn values_equal(&self, a: &Value, b: &Value) -> bool;
    fn render(&self, value: &Value) -> String;
}

struct InputAdapter<N>(N);

impl<N: InputSpec> AnyInput for InputAdapter<N> {
    fn validate(&self, node: &str, value: Value) -> Result<Value, GraphError> {
        let typed =
            value
                .downcast_ref::<N::Value>()
                .ok_or_else(|| GraphError::InvalidInputValue {
                    node: node.to_string(),
                    reason: format!("expected a {}", std::any::type_name::<N::Value>()),
                })?;
        Ok(erase(self.0.validate(typed.clone())?))
    }

    fn values_equal(&self, a: &Value, b: &Value) -> bool {
        match (a.downcast_ref::<N::Value>(), b.downcast_ref::<N::Value>()) {
            (Some(a), Some(b)) => self.0.values_equal(a, b),
            _ => false,
        }
    }

    fn render(&self, value: &Value) -> String {
        match value.downcast_ref::<N::Value>() {
            Some(v) => format!("{v:?}"),
            None => "<?>".to_string(),
        }
    }
}

struct DerivedAdapter<N>(N);

impl<N: DerivedSpec> AnyDerived for DerivedAdapter<N> {
    fn dependencies(&self) -> Vec<NodeRef> {
        self.0.dependencies()
    }

    fn calculate(&self, inputs: &Inputs<'_>) -> Result<Value, GraphError> {
        Ok(erase(self.0.calculate(inputs)?))
    }

    fn default_value(&self) -> Value {
        erase(self.0.default_value())
    }

    fn is_lazy(&self) -> bool {
        self.0.is_lazy()
    }

    fn on_build(&self) -> Result<(), GraphError> {
        self.0.on_build()
    }

    fn values_equal(&self, a: &Value, b: &Value) -> bool {
        match (a.downcast_ref::<N::Output>(), b.downcast_ref::<N::Output>()) {
            (Some(a), Some(b)) => self.0.values_equal(a, b),
            _ => false,
        }
    }

    fn render(&self, value: &Value) -> String {
        match value.downcast_ref::<N::Output>() {
            Some(v) => format!("{v:?}"),
            None => "<?>".to_string(),
        }
    }
}

#[derive(Clone)]
pub(crate) enum NodeKind {
    Input(Arc<dyn AnyInput>),
    Derived(Arc<dyn AnyDerived>),
}

struct NodeInner {
    id: NodeId,
    name: Arc<str>,
    kind: NodeKind,
}

/// Cheap-clone handle to a node.
///
/// Equality and hashing use the node's identity only; the same node may
/// be referenced by multiple configurations and outlives every snapshot
/// that mentions it.
#[derive(Clone)]
pub struct NodeRef {
    inner: Arc<NodeInner>,
}

impl NodeRef {
    pub(crate) fn new_input<N: InputSpec>(name: impl Into<String>, spec: N) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                id: NodeId::fresh(),
                name: Arc::from(name.into()),
                kind: NodeKind::Input(Arc::new(InputAdapter(spec))),
            }),
        }
    }

    pub(crate) fn new_derived<N: DerivedSpec>(name: impl Into<String>, spec: N) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                id: NodeId::fresh(),
                name: Arc::from(name.into()),
                kind: NodeKind::Derived(Arc::new(DerivedAdapter(spec))),
            }),
        }
    }

    /// Stable identity of this node.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns true for externally-set value holders.
    pub fn is_input(&self) -> bool {
        matches!(self.inner.kind, NodeKind::Input(_))
    }

    /// Returns true for computed nodes.
    pub fn is_derived(&self) -> bool {
        matches!(self.inner.kind, NodeKind::Derived(_))
    }

    /// Dependencies of the node; empty for inputs.
    pub fn dependencies(&self) -> Vec<NodeRef> {
        match &self.inner.kind {
            NodeKind::Input(_) => Vec::new(),
            NodeKind::Derived(spec) => spec.dependencies(),
        }
    }

    pub(crate) fn as_input(&self) -> Option<&Arc<dyn AnyInput>> {
        match &self.inner.kind {
            NodeKind::Input(spec) => Some(spec),
            NodeKind::Derived(_) => None,
        }
    }

    pub(crate) fn as_derived(&self) -> Option<&Arc<dyn AnyDerived>> {
        match &self.inner.kind {
            NodeKind::Input(_) => None,
            NodeKind::Derived(spec) => Some(spec),
        }
    }

    pub(crate) fn is_declared_lazy(&self) -> bool {
        match &self.inner.kind {
            NodeKind::Input(_) => false,
            NodeKind::Derived(spec) => spec.is_lazy(),
        }
    }

    pub(crate) fn values_equal(&self, a: &Value, b: &Value) -> bool {
        match &self.inner.kind {
            NodeKind::Input(spec) => spec.values_equal(a, b),
            NodeKind::Derived(spec) => spec.values_equal(a, b),
        }
    }

    pub(crate) fn render(&self, value: &Value) -> String {
        match &self.inner.kind {
            NodeKind::Input(spec) => spec.render(value),
            NodeKind::Derived(spec) => spec.render(value),
        }
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for NodeRef {}

impl Hash for NodeRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.inner.name, self.inner.id.0)
    }
}

/// Anything that names a node producing a `T`: [`Input`], [`Calc`] or
/// [`ValueRef`].
pub trait NodeLike<T> {
    /// The underlying erased node.
    fn node_ref(&self) -> &NodeRef;
}

/// Typed handle to an input node, returned by
/// [`Builder::add_input`](crate::Builder::add_input).
pub struct Input<T> {
    node: NodeRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Input<T> {
    pub(crate) fn new(node: NodeRef) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    /// The underlying erased node.
    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    /// Kind-erased typed reference, for use in dependency lists.
    pub fn value_ref(&self) -> ValueRef<T> {
        ValueRef::from_node(self.node.clone())
    }
}

impl<T> Clone for Input<T> {
    fn clone(&self) -> Self {
        Self::new(self.node.clone())
    }
}

impl<T> Debug for Input<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Input({:?})", self.node)
    }
}

impl<T> NodeLike<T> for Input<T> {
    fn node_ref(&self) -> &NodeRef {
        &self.node
    }
}

/// Typed handle to a derived node, returned by
/// [`Builder::add_calculation`](crate::Builder::add_calculation).
pub struct Calc<T> {
    node: NodeRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Calc<T> {
    pub(crate) fn new(node: NodeRef) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    /// The underlying erased node.
    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    /// Kind-erased typed reference, for use in dependency lists.
    pub fn value_ref(&self) -> ValueRef<T> {
        ValueRef::from_node(self.node.clone())
    }
}

impl<T> Clone for Calc<T> {
    fn clone(&self) -> Self {
        Self::new(self.node.clone())
    }
}

impl<T> Debug for Calc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Calc({:?})", self.node)
    }
}

impl<T> NodeLike<T> for Calc<T> {
    fn node_ref(&self) -> &NodeRef {
        &self.node
    }
}

/// Kind-erased typed reference to a node producing a `T`.
///
/// Dependency lists accept these so inputs and derived nodes can mix.
pub struct ValueRef<T> {
    node: NodeRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ValueRef<T> {
    pub(crate) fn from_node(node: NodeRef) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    /// The underlying erased node.
    pub fn node(&self) -> &NodeRef {
        &self.node
    }
}

impl<T> Clone for ValueRef<T> {
    fn clone(&self) -> Self {
        Self::from_node(self.node.clone())
    }
}

impl<T> Debug for ValueRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueRef({:?})", self.node)
    }
}

impl<T> NodeLike<T> for ValueRef<T> {
    fn node_ref(&self) -> &NodeRef {
        &self.node
    }
}

impl<T> From<&Input<T>> for ValueRef<T> {
    fn from(input: &Input<T>) -> Self {
        input.value_ref()
    }
}

impl<T> From<&Calc<T>> for ValueRef<T> {
    fn from(calc: &Calc<T>) -> Self {
        calc.value_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::Cell;

    #[test]
    fn identity_is_reference_equality() {
        let a = NodeRef::new_input("a", Cell::<i32>::new());
        let b = NodeRef::new_input("a", Cell::<i32>::new());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn erased_input_validates_types() {
        let node = NodeRef::new_input("n", Cell::<i32>::new());
        let spec = node.as_input().unwrap();
        assert!(spec.validate("n", erase(1i32)).is_ok());
        let err = spec.validate("n", erase("wrong")).unwrap_err();
        assert!(matches!(err, GraphError::InvalidInputValue { .. }));
    }

    #[test]
    fn erased_equality_is_false_across_types() {
        let node = NodeRef::new_input("n", Cell::<i32>::new());
        let spec = node.as_input().unwrap();
        assert!(spec.values_equal(&erase(2i32), &erase(2i32)));
        assert!(!spec.values_equal(&erase(2i32), &erase(2i64)));
    }

    #[test]
    fn node_ref_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NodeRef>();
        assert_send_sync::<Input<i64>>();
        assert_send_sync::<Calc<i64>>();
    }
}
