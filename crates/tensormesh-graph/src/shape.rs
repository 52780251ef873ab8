//! Rank-capped tensor shapes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Maximum number of axes a shape may carry.
pub const MAX_RANK: usize = 8;

/// An ordered list of per-axis extents.
///
/// Rank is bounded by [`MAX_RANK`]; a zero-axis shape is a scalar with
/// one element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a shape, enforcing the rank cap.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::RankExceeded`] if more than [`MAX_RANK`]
    /// axes are given.
    pub fn new(dims: Vec<usize>) -> Result<Self, GraphError> {
        if dims.len() > MAX_RANK {
            return Err(GraphError::RankExceeded(dims.len()));
        }
        Ok(Self(dims))
    }

    /// Per-axis extents.
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of axes.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total element count (product of extents; 1 for a scalar).
    #[must_use]
    pub fn n_elems(&self) -> usize {
        self.0.iter().product()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_n_elems() {
        let s = Shape::new(vec![2, 3, 4]).unwrap();
        assert_eq!(s.n_elems(), 24);
        assert_eq!(s.rank(), 3);
    }

    #[test]
    fn test_scalar() {
        let s = Shape::new(vec![]).unwrap();
        assert_eq!(s.n_elems(), 1);
        assert_eq!(s.rank(), 0);
    }

    #[test]
    fn test_rank_cap() {
        assert!(Shape::new(vec![1; MAX_RANK]).is_ok());
        assert!(Shape::new(vec![1; MAX_RANK + 1]).is_err());
    }

    #[test]
    fn test_display() {
        let s = Shape::new(vec![2, 3]).unwrap();
        assert_eq!(s.to_string(), "[2,3]");
    }
}
