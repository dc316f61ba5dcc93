//! N-ary aggregates over homogeneously typed dependency lists.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::ops::{Add, Mul};

use crate::error::GraphError;
use crate::node::{DerivedSpec, NodeLike, NodeRef, ValueRef};
use crate::value::Inputs;

macro_rules! aggregate {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name<T> {
            deps: Vec<NodeRef>,
            lazy: bool,
            _marker: PhantomData<fn() -> T>,
        }

        impl<T> $name<T> {
            /// Aggregate over an arbitrary list of typed references.
            pub fn new<I: IntoIterator<Item = ValueRef<T>>>(deps: I) -> Self {
                Self {
                    deps: deps.into_iter().map(|r| r.node().clone()).collect(),
                    lazy: false,
                    _marker: PhantomData,
                }
            }

            /// Aggregate over exactly two nodes.
            pub fn of(a: &impl NodeLike<T>, b: &impl NodeLike<T>) -> Self {
                Self {
                    deps: vec![a.node_ref().clone(), b.node_ref().clone()],
                    lazy: false,
                    _marker: PhantomData,
                }
            }

            /// Mark the node lazy: not computed eagerly on commit.
            pub fn lazy(mut self) -> Self {
                self.lazy = true;
                self
            }
        }
    };
}

aggregate! {
    /// Sum of all dependency values; `T::default()` when empty.
    Sum
}
aggregate! {
    /// Product of all dependency values; `T::default()` when empty.
    Product
}
aggregate! {
    /// Smallest dependency value; `T::default()` when empty.
    Min
}
aggregate! {
    /// Largest dependency value; `T::default()` when empty.
    Max
}

fn gather<T: Clone + 'static>(inputs: &Inputs<'_>) -> Result<Vec<T>, GraphError> {
    (0..inputs.len())
        .map(|i| inputs.get::<T>(i).cloned())
        .collect()
}

impl<T> DerivedSpec for Sum<T>
where
    T: Add<Output = T> + Clone + Default + Debug + PartialEq + Send + Sync + 'static,
{
    type Output = T;

    fn dependencies(&self) -> Vec<NodeRef> {
        self.deps.clone()
    }

    fn calculate(&self, inputs: &Inputs<'_>) -> Result<T, GraphError> {
        Ok(gather::<T>(inputs)?
            .into_iter()
            .fold(T::default(), |acc, v| acc + v))
    }

    fn default_value(&self) -> T {
        T::default()
    }

    fn is_lazy(&self) -> bool {
        self.lazy
    }

    fn values_equal(&self, a: &T, b: &T) -> bool {
        a == b
    }
}

impl<T> DerivedSpec for Product<T>
where
    T: Mul<Output = T> + Clone + Default + Debug + PartialEq + Send + Sync + 'static,
{
    type Output = T;

    fn dependencies(&self) -> Vec<NodeRef> {
        self.deps.clone()
    }

    fn calculate(&self, inputs: &Inputs<'_>) -> Result<T, GraphError> {
        let mut values = gather::<T>(inputs)?.into_iter();
        let Some(first) = values.next() else {
            return Ok(T::default());
        };
        Ok(values.fold(first, |acc, v| acc * v))
    }

    fn default_value(&self) -> T {
        T::default()
    }

    fn is_lazy(&self) -> bool {
        self.lazy
    }

    fn values_equal(&self, a: &T, b: &T) -> bool {
        a == b
    }
}

impl<T> DerivedSpec for Min<T>
where
    T: PartialOrd + Clone + Default + Debug + Send + Sync + 'static,
{
    type Output = T;

    fn dependencies(&self) -> Vec<NodeRef> {
        self.deps.clone()
    }

    fn calculate(&self, inputs: &Inputs<'_>) -> Result<T, GraphError> {
        Ok(gather::<T>(inputs)?
            .into_iter()
            .reduce(|acc, v| if v < acc { v } else { acc })
            .unwrap_or_default())
    }

    fn default_value(&self) -> T {
        T::default()
    }

    fn is_lazy(&self) -> bool {
        self.lazy
    }

    fn values_equal(&self, a: &T, b: &T) -> bool {
        a == b
    }
}

impl<T> DerivedSpec for Max<T>
where
    T: PartialOrd + Clone + Default + Debug + Send + Sync + 'static,
{
    type Output = T;

    fn dependencies(&self) -> Vec<NodeRef> {
        self.deps.clone()
    }

    fn calculate(&self, inputs: &Inputs<'_>) -> Result<T, GraphError> {
        Ok(gather::<T>(inputs)?
            .into_iter()
            .reduce(|acc, v| if v > acc { v } else { acc })
            .unwrap_or_default())
    }

    fn default_value(&self) -> T {
        T::default()
    }

    fn is_lazy(&self) -> bool {
        self.lazy
    }

    fn values_equal(&self, a: &T, b: &T) -> bool {
        a == b
    }
}
