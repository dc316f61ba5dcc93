//! Type-erased value representation shared by all node slots.

use std::any::Any;
use std::sync::Arc;

use crate::error::GraphError;

/// The erased slot type stored for every node of a snapshot.
///
/// Values are wrapped in `Arc` so cloning a value map is a pointer bump
/// per slot; typed reads re-cast at the boundary.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Sentinel stored in the slot of a lazy node whose value has not been
/// computed yet.
#[derive(Debug)]
pub(crate) struct LazyUnresolved;

pub(crate) fn lazy_unresolved() -> Value {
    Arc::new(LazyUnresolved)
}

pub(crate) fn is_unresolved(value: &Value) -> bool {
    value.is::<LazyUnresolved>()
}

/// Erase a typed value into a [`Value`].
pub fn erase<T: Send + Sync + 'static>(value: T) -> Value {
    Arc::new(value)
}

/// Re-cast an erased value, returning `None` on a type mismatch.
pub fn downcast<T: Send + Sync + 'static>(value: &Value) -> Option<Arc<T>> {
    value.clone().downcast::<T>().ok()
}

/// Borrowed view over the dependency values handed to a derived node's
/// `calculate`.
///
/// `get(i)` corresponds to the i-th entry of the node's dependency list.
pub struct Inputs<'a> {
    values: &'a [Value],
}

impl<'a> Inputs<'a> {
    pub(crate) fn new(values: &'a [Value]) -> Self {
        Self { values }
    }

    /// Number of dependency values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the node has no dependencies.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Typed access to the i-th dependency value.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if the index is out of range or the stored value
    /// has a different type than requested.
    pub fn get<T: 'static>(&self, index: usize) -> Result<&T, GraphError> {
        let value = self.values.get(index).ok_or_else(|| {
            GraphError::invalid_op(format!("dependency index {index} out of range"))
        })?;
        value.downcast_ref::<T>().ok_or_else(|| {
            GraphError::invalid_op(format!(
                "dependency {index} is not a {}",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Iterate over the erased dependency values.
    pub fn iter(&self) -> impl Iterator<Item = &Value> + '_ {
        self.values.iter()
    }
}
