//! Ready-made node implementations.
//!
//! The core only defines the [`InputSpec`](crate::InputSpec) and
//! [`DerivedSpec`](crate::DerivedSpec) contracts; this module carries
//! the implementations most graphs are assembled from: plain and
//! clamped input cells, closure-backed mappings, n-ary aggregates, and
//! the one-time-assignable [`Placeholder`] for forward declarations.

mod agg;
mod cell;
mod func;
mod placeholder;

pub use agg::{Max, Min, Product, Sum};
pub use cell::{Cell, CellWith, ClampedCell};
pub use func::{map1, map2, map3, try_map1, try_map2, Map1, Map2, Map3};
pub use placeholder::Placeholder;
