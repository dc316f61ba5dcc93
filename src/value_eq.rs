//! Reusable value-equality predicates for change detection.
//!
//! Nodes decide whether two values are *the same* for the purpose of
//! change propagation. The default everywhere is structural equality;
//! the helpers here cover the common overrides, e.g. floating-point
//! comparison within a tolerance for use with
//! [`CellWith`](crate::nodes::CellWith).

/// Structural equality.
pub fn exact<T: PartialEq>(a: &T, b: &T) -> bool {
    a == b
}

/// `f64` comparison within an absolute tolerance.
///
/// # Example
/// ```ignore
/// let gain = CellWith::new(Ok, value_eq::approx_f64(1e-9));
/// ```
pub fn approx_f64(epsilon: f64) -> impl Fn(&f64, &f64) -> bool + Clone + Send + Sync + 'static {
    move |a, b| (a - b).abs() < epsilon
}

/// `f32` comparison within an absolute tolerance.
pub fn approx_f32(epsilon: f32) -> impl Fn(&f32, &f32) -> bool + Clone + Send + Sync + 'static {
    move |a, b| (a - b).abs() < epsilon
}
