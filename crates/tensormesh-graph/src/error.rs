//! Error types for the graph crate.

use crate::node::NodeId;

/// Errors from graph construction and evaluation.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Shape has more axes than the fixed rank cap allows.
    #[error("shape rank {0} exceeds the rank cap")]
    RankExceeded(usize),

    /// Unknown dtype wire tag.
    #[error("unknown dtype tag {0}")]
    UnknownDType(u8),

    /// Buffer length does not match shape × dtype size.
    #[error("buffer of {got} bytes does not match expected {expected}")]
    BufferSize {
        /// Bytes received.
        got: usize,
        /// Bytes required by shape and dtype.
        expected: usize,
    },

    /// Elementwise arguments disagree on shape.
    #[error("shape mismatch: {left} vs {right}")]
    ShapeMismatch {
        /// First argument's shape (display form).
        left: String,
        /// Second argument's shape (display form).
        right: String,
    },

    /// Elementwise arguments disagree on dtype.
    #[error("dtype mismatch: {left} vs {right}")]
    DTypeMismatch {
        /// First argument's dtype.
        left: crate::dtype::DType,
        /// Second argument's dtype.
        right: crate::dtype::DType,
    },

    /// Operation applied with the wrong number of arguments.
    #[error("op {op} expects {expected} args, got {got}")]
    Arity {
        /// Operation name.
        op: String,
        /// Required argument count.
        expected: usize,
        /// Supplied argument count.
        got: usize,
    },

    /// Node handle does not exist in this graph.
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),

    /// A required remote reference has never received data.
    #[error("remote reference {0:?} has never been populated")]
    Unpopulated(NodeId),

    /// The arena has no handles left (u32 index space exhausted).
    #[error("graph arena is full")]
    ArenaFull,
}
