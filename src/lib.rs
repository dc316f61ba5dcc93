//! Calc-Flow: persistent, incrementally-evaluated dependency graphs of
//! typed values.
//!
//! A client assembles a directed acyclic graph of *input* nodes
//! (externally set values) and *derived* nodes (pure computations over
//! other nodes' current values). After any number of input mutations, a
//! **commit** recomputes exactly the transitive-affected derived nodes
//! in dependency order and yields a new immutable [`Snapshot`];
//! intermediate snapshots stay valid and usable.
//!
//! # Key Features
//!
//! - **Functional snapshots**: every mutation returns a new snapshot;
//!   holding a reference freezes what you observe
//! - **Levelled parallel commits**: independent nodes of one dependency
//!   level evaluate in parallel
//! - **Precise change detection**: per-node equality predicates, with
//!   set-then-revert leaving a snapshot consistent
//! - **Lazy nodes**: deferred evaluation on first read, with dirtiness
//!   still propagating through commits
//! - **Serialized engine**: a thread-safe façade with a FIFO commit
//!   queue, in-flight cancellation coalescing, auto-commit suspension,
//!   and change notifications
//!
//! # Example
//!
//! ```ignore
//! use calc_flow::{nodes::{Cell, Sum}, Builder};
//!
//! let mut builder = Builder::new();
//! let a = builder.add_input("a", Cell::new(), 1i64)?;
//! let b = builder.add_input("b", Cell::new(), 2i64)?;
//! let sum = builder.add_calculation("sum", Sum::of(&a, &b))?;
//!
//! let state = builder.build_and_commit()?;
//! assert_eq!(*state.get_value(&sum)?, 3);
//!
//! let (state, changes) = state.change_value(&a, 10)?.commit(None, true)?;
//! assert_eq!(*state.get_value(&sum)?, 12);
//! assert!(changes.contains(&sum));
//! ```

mod builder;
mod cancel;
mod engine;
mod error;
mod meta;
mod node;
pub mod nodes;
mod snapshot;
mod value;
pub mod value_eq;
mod watch;

pub use builder::Builder;
pub use cancel::{CancellationSource, CancellationToken};
pub use engine::{
    AutoCommitGuard, ChangeListener, Engine, EngineConfig, SubscriptionId,
};
pub use error::GraphError;
pub use meta::NetworkMeta;
pub use node::{Calc, DerivedSpec, Input, InputSpec, NodeId, NodeLike, NodeRef, ValueRef};
pub use snapshot::{ChangeSet, Snapshot, VersionId};
pub use value::{downcast, erase, Inputs, Value};
pub use watch::ValueWatch;
