//! Forward-declared derived nodes.
//!
//! A placeholder lets a configuration reference a node before its
//! computation exists, e.g. when wiring depends on registration order.
//! It is one-time-assignable: once bound it delegates its whole derived
//! contract to the target, and `on_build` freezes the binding.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::GraphError;
use crate::node::{DerivedSpec, NodeRef};
use crate::value::Inputs;

struct PlaceholderInner<T> {
    target: RwLock<Option<Box<dyn DerivedSpec<Output = T>>>>,
    frozen: AtomicBool,
}

/// One-time-assignable holder delegating to its bound target.
///
/// Clones share the binding, so the handle kept by the caller and the
/// copy registered with a builder stay in sync.
pub struct Placeholder<T> {
    inner: Arc<PlaceholderInner<T>>,
}

impl<T> Clone for Placeholder<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Debug + Default + Send + Sync + 'static> Placeholder<T> {
    /// Create an unbound placeholder.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PlaceholderInner {
                target: RwLock::new(None),
                frozen: AtomicBool::new(false),
            }),
        }
    }

    /// Assign the target this placeholder delegates to.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when already bound or when the binding has
    /// been frozen by a build.
    pub fn bind<N: DerivedSpec<Output = T>>(&self, target: N) -> Result<(), GraphError> {
        if self.inner.frozen.load(Ordering::Acquire) {
            return Err(GraphError::invalid_op("placeholder binding is frozen"));
        }
        let mut slot = self.inner.target.write();
        if slot.is_some() {
            return Err(GraphError::invalid_op("placeholder is already bound"));
        }
        *slot = Some(Box::new(target));
        Ok(())
    }

    /// Whether a target has been assigned.
    pub fn is_bound(&self) -> bool {
        self.inner.target.read().is_some()
    }
}

impl<T: Debug + Default + Send + Sync + 'static> Default for Placeholder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Debug + Default + Send + Sync + 'static> DerivedSpec for Placeholder<T> {
    type Output = T;

    fn dependencies(&self) -> Vec<NodeRef> {
        self.inner
            .target
            .read()
            .as_deref()
            .map(|t| t.dependencies())
            .unwrap_or_default()
    }

    fn calculate(&self, inputs: &Inputs<'_>) -> Result<T, GraphError> {
        let slot = self.inner.target.read();
        let target = slot
            .as_deref()
            .ok_or_else(|| GraphError::invalid_op("placeholder used before bind"))?;
        target.calculate(inputs)
    }

    fn default_value(&self) -> T {
        self.inner
            .target
            .read()
            .as_deref()
            .map(|t| t.default_value())
            .unwrap_or_default()
    }

    fn is_lazy(&self) -> bool {
        self.inner
            .target
            .read()
            .as_deref()
            .map(|t| t.is_lazy())
            .unwrap_or(false)
    }

    fn on_build(&self) -> Result<(), GraphError> {
        let slot = self.inner.target.read();
        let target = slot
            .as_deref()
            .ok_or_else(|| GraphError::invalid_op("placeholder built before bind"))?;
        target.on_build()?;
        self.inner.frozen.store(true, Ordering::Release);
        Ok(())
    }

    fn values_equal(&self, a: &T, b: &T) -> bool {
        self.inner
            .target
            .read()
            .as_deref()
            .map(|t| t.values_equal(a, b))
            .unwrap_or(false)
    }
}
