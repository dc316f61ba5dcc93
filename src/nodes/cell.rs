//! Input cells: plain, clamped, and custom-behaviour value holders.

use std::fmt::Debug;
use std::marker::PhantomData;

use crate::error::GraphError;
use crate::node::InputSpec;

/// Plain input cell: identity validation, structural equality.
pub struct Cell<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Cell<T> {
    /// Create a plain cell.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Cell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InputSpec for Cell<T>
where
    T: Clone + Debug + PartialEq + Send + Sync + 'static,
{
    type Value = T;

    fn values_equal(&self, a: &T, b: &T) -> bool {
        a == b
    }
}

/// Input cell that clamps every incoming value into `[min, max]`.
pub struct ClampedCell<T> {
    min: T,
    max: T,
}

impl<T> ClampedCell<T> {
    /// Create a clamping cell with the given inclusive range.
    pub fn new(min: T, max: T) -> Self {
        Self { min, max }
    }
}

impl<T> InputSpec for ClampedCell<T>
where
    T: Clone + Debug + PartialOrd + Send + Sync + 'static,
{
    type Value = T;

    fn validate(&self, value: T) -> Result<T, GraphError> {
        if value < self.min {
            Ok(self.min.clone())
        } else if value > self.max {
            Ok(self.max.clone())
        } else {
            Ok(value)
        }
    }

    fn values_equal(&self, a: &T, b: &T) -> bool {
        a == b
    }
}

/// Input cell with caller-provided validation and equality.
///
/// Use for rejecting inputs or tolerance-based change detection:
///
/// ```ignore
/// let gain = CellWith::new(
///     |v: f64| if v.is_finite() { Ok(v) } else {
///         Err(GraphError::InvalidInputValue { node: "gain".into(), reason: "not finite".into() })
///     },
///     value_eq::approx_f64(1e-9),
/// );
/// ```
pub struct CellWith<T, V, E> {
    validate: V,
    eq: E,
    _marker: PhantomData<fn() -> T>,
}

impl<T, V, E> CellWith<T, V, E> {
    /// Create a cell from a validation function and an equality
    /// predicate.
    pub fn new(validate: V, eq: E) -> Self {
        Self {
            validate,
            eq,
            _marker: PhantomData,
        }
    }
}

impl<T, V, E> InputSpec for CellWith<T, V, E>
where
    T: Clone + Debug + Send + Sync + 'static,
    V: Fn(T) -> Result<T, GraphError> + Send + Sync + 'static,
    E: Fn(&T, &T) -> bool + Send + Sync + 'static,
{
    type Value = T;

    fn validate(&self, value: T) -> Result<T, GraphError> {
        (self.validate)(value)
    }

    fn values_equal(&self, a: &T, b: &T) -> bool {
        (self.eq)(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_eq;

    #[test]
    fn clamped_cell_substitutes() {
        let cell = ClampedCell::new(1i64, 5i64);
        assert_eq!(cell.validate(3).unwrap(), 3);
        assert_eq!(cell.validate(0).unwrap(), 1);
        assert_eq!(cell.validate(6).unwrap(), 5);
    }

    #[test]
    fn cell_with_rejects() {
        let cell = CellWith::new(
            |v: i64| {
                if v >= 0 {
                    Ok(v)
                } else {
                    Err(GraphError::InvalidInputValue {
                        node: "n".into(),
                        reason: "negative".into(),
                    })
                }
            },
            |a: &i64, b: &i64| a == b,
        );
        assert_eq!(cell.validate(2).unwrap(), 2);
        assert!(cell.validate(-1).is_err());
    }

    #[test]
    fn cell_with_tolerance_equality() {
        let cell = CellWith::new(Ok, value_eq::approx_f64(1e-6));
        assert!(cell.values_equal(&1.0, &(1.0 + 1e-9)));
        assert!(!cell.values_equal(&1.0, &2.0));
    }
}
