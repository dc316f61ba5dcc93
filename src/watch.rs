//! Per-node change watching over engine notifications.

use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::engine::{Engine, EngineShared, SubscriptionId};
use crate::error::GraphError;
use crate::node::{Calc, DerivedSpec, NodeLike, NodeRef, ValueRef};

type Callbacks<T> = Arc<Mutex<Vec<Box<dyn Fn(&Arc<T>) + Send + Sync>>>>;

/// Re-raises an engine's state-changed event as a per-node typed event.
///
/// The watch registers one listener with the engine and fires its own
/// callbacks whenever a reported change set contains the watched node,
/// passing the node's fresh value. It holds only a weak back-reference
/// to the engine internals, so it never keeps the engine alive; dropping
/// the watch unsubscribes.
pub struct ValueWatch<T> {
    node: NodeRef,
    engine: Weak<EngineShared>,
    subscription: SubscriptionId,
    callbacks: Callbacks<T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ValueWatch<T> {
    /// Watch one node on the given engine.
    pub fn new(engine: &Engine, node: &impl NodeLike<T>) -> Self {
        let node = node.node_ref().clone();
        let callbacks: Callbacks<T> = Arc::new(Mutex::new(Vec::new()));

        let watched = node.clone();
        let fired = callbacks.clone();
        let subscription = engine.subscribe_fn(move |changes, snapshot| {
            if !changes.contains_node(&watched) {
                return;
            }
            let handle = ValueRef::<T>::from_node(watched.clone());
            let Ok(value) = snapshot.get_value(&handle) else {
                return;
            };
            for callback in fired.lock().iter() {
                callback(&value);
            }
        });

        Self {
            node,
            engine: engine.shared_weak(),
            subscription,
            callbacks,
            _marker: PhantomData,
        }
    }

    /// Register a derived node with the engine and watch it in one step.
    pub fn register<N: DerivedSpec<Output = T>>(
        engine: &Engine,
        name: impl Into<String>,
        spec: N,
    ) -> Result<(Self, Calc<T>), GraphError> {
        let calc = engine.register_calculation(name, spec)?;
        Ok((Self::new(engine, &calc), calc))
    }

    /// The watched node.
    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    /// Add a callback fired with the node's new value on every reported
    /// change.
    pub fn on_changed(&self, callback: impl Fn(&Arc<T>) + Send + Sync + 'static) {
        self.callbacks.lock().push(Box::new(callback));
    }
}

impl<T> Drop for ValueWatch<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.engine.upgrade() {
            shared.remove_listener(self.subscription);
        }
    }
}
