//! Closure-backed derived nodes over one, two, or three dependencies.
//!
//! `map*` take an infallible closure; `try_map*` take a closure that
//! may fail the calculation. The slot before the first commit is
//! `O::default()` unless overridden with `with_default`.

use std::fmt::Debug;
use std::marker::PhantomData;

use crate::error::GraphError;
use crate::node::{DerivedSpec, NodeLike, NodeRef};
use crate::value::Inputs;

/// Derived node computing from a single dependency.
pub struct Map1<A, O, F> {
    a: NodeRef,
    f: F,
    default: Option<O>,
    lazy: bool,
    _marker: PhantomData<fn(&A) -> O>,
}

/// Derived node computing from two dependencies.
pub struct Map2<A, B, O, F> {
    a: NodeRef,
    b: NodeRef,
    f: F,
    default: Option<O>,
    lazy: bool,
    _marker: PhantomData<fn(&A, &B) -> O>,
}

/// Derived node computing from three dependencies.
pub struct Map3<A, B, C, O, F> {
    a: NodeRef,
    b: NodeRef,
    c: NodeRef,
    f: F,
    default: Option<O>,
    lazy: bool,
    _marker: PhantomData<fn(&A, &B, &C) -> O>,
}

/// Map a single node through an infallible closure.
pub fn map1<A, O, F>(
    a: &impl NodeLike<A>,
    f: F,
) -> Map1<A, O, impl Fn(&A) -> Result<O, GraphError> + Send + Sync + 'static>
where
    F: Fn(&A) -> O + Send + Sync + 'static,
{
    try_map1(a, move |v: &A| Ok(f(v)))
}

/// Map a single node through a fallible closure.
pub fn try_map1<A, O, F>(a: &impl NodeLike<A>, f: F) -> Map1<A, O, F>
where
    F: Fn(&A) -> Result<O, GraphError> + Send + Sync + 'static,
{
    Map1 {
        a: a.node_ref().clone(),
        f,
        default: None,
        lazy: false,
        _marker: PhantomData,
    }
}

/// Combine two nodes through an infallible closure.
pub fn map2<A, B, O, F>(
    a: &impl NodeLike<A>,
    b: &impl NodeLike<B>,
    f: F,
) -> Map2<A, B, O, impl Fn(&A, &B) -> Result<O, GraphError> + Send + Sync + 'static>
where
    F: Fn(&A, &B) -> O + Send + Sync + 'static,
{
    try_map2(a, b, move |x: &A, y: &B| Ok(f(x, y)))
}

/// Combine two nodes through a fallible closure.
pub fn try_map2<A, B, O, F>(a: &impl NodeLike<A>, b: &impl NodeLike<B>, f: F) -> Map2<A, B, O, F>
where
    F: Fn(&A, &B) -> Result<O, GraphError> + Send + Sync + 'static,
{
    Map2 {
        a: a.node_ref().clone(),
        b: b.node_ref().clone(),
        f,
        default: None,
        lazy: false,
        _marker: PhantomData,
    }
}

/// Combine three nodes through an infallible closure.
pub fn map3<A, B, C, O, F>(
    a: &impl NodeLike<A>,
    b: &impl NodeLike<B>,
    c: &impl NodeLike<C>,
    f: F,
) -> Map3<A, B, C, O, impl Fn(&A, &B, &C) -> Result<O, GraphError> + Send + Sync + 'static>
where
    F: Fn(&A, &B, &C) -> O + Send + Sync + 'static,
{
    let f = move |a: &A, b: &B, c: &C| Ok(f(a, b, c));
    Map3 {
        a: a.node_ref().clone(),
        b: b.node_ref().clone(),
        c: c.node_ref().clone(),
        f,
        default: None,
        lazy: false,
        _marker: PhantomData,
    }
}

macro_rules! map_builders {
    ($ty:ident < $($g:ident),* >) => {
        impl<$($g,)* O, F> $ty<$($g,)* O, F> {
            /// Mark the node lazy: not computed eagerly on commit.
            pub fn lazy(mut self) -> Self {
                self.lazy = true;
                self
            }

            /// Override the slot value used before the first commit.
            pub fn with_default(mut self, default: O) -> Self {
                self.default = Some(default);
                self
            }
        }
    };
}

map_builders!(Map1<A>);
map_builders!(Map2<A, B>);
map_builders!(Map3<A, B, C>);

impl<A, O, F> DerivedSpec for Map1<A, O, F>
where
    A: Send + Sync + 'static,
    O: Clone + Default + Debug + PartialEq + Send + Sync + 'static,
    F: Fn(&A) -> Result<O, GraphError> + Send + Sync + 'static,
{
    type Output = O;

    fn dependencies(&self) -> Vec<NodeRef> {
        vec![self.a.clone()]
    }

    fn calculate(&self, inputs: &Inputs<'_>) -> Result<O, GraphError> {
        (self.f)(inputs.get::<A>(0)?)
    }

    fn default_value(&self) -> O {
        self.default.clone().unwrap_or_default()
    }

    fn is_lazy(&self) -> bool {
        self.lazy
    }

    fn values_equal(&self, a: &O, b: &O) -> bool {
        a == b
    }
}

impl<A, B, O, F> DerivedSpec for Map2<A, B, O, F>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    O: Clone + Default + Debug + PartialEq + Send + Sync + 'static,
    F: Fn(&A, &B) -> Result<O, GraphError> + Send + Sync + 'static,
{
    type Output = O;

    fn dependencies(&self) -> Vec<NodeRef> {
        vec![self.a.clone(), self.b.clone()]
    }

    fn calculate(&self, inputs: &Inputs<'_>) -> Result<O, GraphError> {
        (self.f)(inputs.get::<A>(0)?, inputs.get::<B>(1)?)
    }

    fn default_value(&self) -> O {
        self.default.clone().unwrap_or_default()
    }

    fn is_lazy(&self) -> bool {
        self.lazy
    }

    fn values_equal(&self, a: &O, b: &O) -> bool {
        a == b
    }
}

impl<A, B, C, O, F> DerivedSpec for Map3<A, B, C, O, F>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    C: Send + Sync + 'static,
    O: Clone + Default + Debug + PartialEq + Send + Sync + 'static,
    F: Fn(&A, &B, &C) -> Result<O, GraphError> + Send + Sync + 'static,
{
    type Output = O;

    fn dependencies(&self) -> Vec<NodeRef> {
        vec![self.a.clone(), self.b.clone(), self.c.clone()]
    }

    fn calculate(&self, inputs: &Inputs<'_>) -> Result<O, GraphError> {
        (self.f)(
            inputs.get::<A>(0)?,
            inputs.get::<B>(1)?,
            inputs.get::<C>(2)?,
        )
    }

    fn default_value(&self) -> O {
        self.default.clone().unwrap_or_default()
    }

    fn is_lazy(&self) -> bool {
        self.lazy
    }

    fn values_equal(&self, a: &O, b: &O) -> bool {
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::nodes::Cell;

    #[test]
    fn maps_compose_mixed_types() {
        let mut builder = Builder::new();
        let count = builder.add_input("count", Cell::new(), 3i64).unwrap();
        let label = builder
            .add_input("label", Cell::new(), "x".to_string())
            .unwrap();
        let rendered = builder
            .add_calculation(
                "rendered",
                map2(&count, &label, |n: &i64, s: &String| format!("{s}{n}")),
            )
            .unwrap();
        let state = builder.build_and_commit().unwrap();
        assert_eq!(*state.get_value(&rendered).unwrap(), "x3");
    }

    #[test]
    fn try_map_failure_is_a_calculation_error() {
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
        let err = builder.build().unwrap().commit(None, true).unwrap_err();
        assert!(matches!(err, GraphError::Calculation { .. }));
    }

    #[test]
    fn explicit_default_fills_the_slot_before_commit() {
        let mut builder = Builder::new();
        let a = builder.add_input("a", Cell::new(), 1i64).unwrap();
        let mapped = builder
            .add_calculation("mapped", map1(&a, |v: &i64| v + 1).with_default(-1))
            .unwrap();
        let state = builder.build().unwrap();
        assert_eq!(*state.get_value(&mapped).unwrap(), -1);
        let (state, _) = state.commit(None, true).unwrap();
        assert_eq!(*state.get_value(&mapped).unwrap(), 2);
    }
}
