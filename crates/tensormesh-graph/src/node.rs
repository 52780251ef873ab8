//! The arena-owned expression graph.
//!
//! Nodes live in a [`Graph`] arena and are addressed by [`NodeId`]
//! handles. A node is one of three kinds: a local leaf holding data, a
//! functor combining argument nodes, or a remote reference standing in
//! for a tensor owned by another cluster. Kind dispatch is pattern
//! matching over [`NodeKind`]; there is no runtime type inspection.

use std::fmt;

use crate::data::TensorData;
use crate::dtype::DType;
use crate::error::GraphError;
use crate::reference::RemoteRef;
use crate::shape::Shape;

/// Handle to a node within one [`Graph`] arena.
///
/// Handles are indices, not pointers; they are only meaningful for the
/// graph that issued them and are never reused for a different node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// The elementwise operation catalog.
///
/// Deliberately small: the full operator set is an external
/// collaborator, and these cover what evaluation and the test graphs
/// need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `args[0] + args[1]`
    Add,
    /// `args[0] * args[1]`
    Mul,
    /// `-args[0]`
    Neg,
    /// `sin(args[0])`
    Sin,
}

impl Op {
    /// Number of arguments the op consumes.
    #[must_use]
    pub const fn arity(self) -> usize {
        match self {
            Self::Add | Self::Mul => 2,
            Self::Neg | Self::Sin => 1,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Mul => write!(f, "mul"),
            Self::Neg => write!(f, "neg"),
            Self::Sin => write!(f, "sin"),
        }
    }
}

/// What a node is.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// A local tensor with authoritative data.
    Leaf {
        /// Current value.
        data: TensorData,
        /// Bumped whenever the value is overwritten.
        version: u64,
    },
    /// A pending computation over argument nodes.
    Functor {
        /// The operation.
        op: Op,
        /// Direct argument handles.
        args: Vec<NodeId>,
        /// Cached output from the last evaluation, if any.
        value: Option<TensorData>,
        /// Bumped whenever the output is recomputed.
        version: u64,
        /// Argument versions observed at the last compute.
        arg_versions: Vec<u64>,
    },
    /// A tensor owned and computed by another cluster.
    Remote(RemoteRef),
}

/// One node in the arena.
#[derive(Debug, Clone)]
pub struct Node {
    /// Kind and kind-specific state.
    pub kind: NodeKind,
    dtype: DType,
    shape: Shape,
}

impl Node {
    /// Element dtype.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Tensor shape.
    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Current state version (0 for never-computed functors and
    /// never-populated remote references).
    #[must_use]
    pub fn version(&self) -> u64 {
        match &self.kind {
            NodeKind::Leaf { version, .. } | NodeKind::Functor { version, .. } => *version,
            NodeKind::Remote(r) => r.read().1,
        }
    }

    /// Current value, if one exists.
    #[must_use]
    pub fn value(&self) -> Option<&TensorData> {
        match &self.kind {
            NodeKind::Leaf { data, .. } => Some(data),
            NodeKind::Functor { value, .. } => value.as_ref(),
            NodeKind::Remote(r) => Some(r.read().0),
        }
    }

    /// Direct argument handles (empty for leaves and references).
    #[must_use]
    pub fn args(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Functor { args, .. } => args,
            _ => &[],
        }
    }
}

/// Arena of session-owned nodes.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    /// An empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes in the arena.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a leaf with initial data (version starts at 1).
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::BufferSize`] if `values` does not match
    /// the shape's element count.
    pub fn leaf(
        &mut self,
        dtype: DType,
        shape: Shape,
        values: &[f64],
    ) -> Result<NodeId, GraphError> {
        if values.len() != shape.n_elems() {
            return Err(GraphError::BufferSize {
                got: values.len() * dtype.size_bytes(),
                expected: shape.n_elems() * dtype.size_bytes(),
            });
        }
        let data = TensorData::from_f64s(dtype, values);
        self.push(Node {
            kind: NodeKind::Leaf { data, version: 1 },
            dtype,
            shape,
        })
    }

    /// Overwrite a leaf's value, bumping its version.
    ///
    /// # Errors
    ///
    /// Fails if `id` is not a leaf of matching element count.
    pub fn set_leaf(&mut self, id: NodeId, values: &[f64]) -> Result<(), GraphError> {
        let n = self.node(id)?.shape().n_elems();
        let dtype = self.node(id)?.dtype();
        if values.len() != n {
            return Err(GraphError::BufferSize {
                got: values.len() * dtype.size_bytes(),
                expected: n * dtype.size_bytes(),
            });
        }
        match &mut self.nodes[id.0 as usize].kind {
            NodeKind::Leaf { data, version } => {
                *data = TensorData::from_f64s(dtype, values);
                *version += 1;
                Ok(())
            }
            _ => Err(GraphError::UnknownNode(id)),
        }
    }

    /// Add a functor over argument handles.
    ///
    /// Elementwise ops require all arguments to agree on shape and
    /// dtype; the output takes both from the first argument.
    ///
    /// # Errors
    ///
    /// Fails on arity, shape, or dtype disagreement, or unknown args.
    pub fn functor(&mut self, op: Op, args: Vec<NodeId>) -> Result<NodeId, GraphError> {
        if args.len() != op.arity() {
            return Err(GraphError::Arity {
                op: op.to_string(),
                expected: op.arity(),
                got: args.len(),
            });
        }
        let first = self.node(args[0])?;
        let (dtype, shape) = (first.dtype(), first.shape().clone());
        for &arg in &args[1..] {
            let other = self.node(arg)?;
            if other.shape() != &shape {
                return Err(GraphError::ShapeMismatch {
                    left: shape.to_string(),
                    right: other.shape().to_string(),
                });
            }
            if other.dtype() != dtype {
                return Err(GraphError::DTypeMismatch {
                    left: dtype,
                    right: other.dtype(),
                });
            }
        }
        let arity = args.len();
        self.push(Node {
            kind: NodeKind::Functor {
                op,
                args,
                value: None,
                version: 0,
                arg_versions: vec![0; arity],
            },
            dtype,
            shape,
        })
    }

    /// Add a remote reference node.
    ///
    /// # Errors
    ///
    /// Fails with [`GraphError::ArenaFull`] once handle capacity is
    /// exhausted.
    pub fn remote(&mut self, reference: RemoteRef) -> Result<NodeId, GraphError> {
        let dtype = reference.dtype();
        let shape = reference.shape().clone();
        self.push(Node {
            kind: NodeKind::Remote(reference),
            dtype,
            shape,
        })
    }

    /// Borrow a node.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownNode`] for a foreign handle.
    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes
            .get(id.0 as usize)
            .ok_or(GraphError::UnknownNode(id))
    }

    /// Mutably borrow a node.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownNode`] for a foreign handle.
    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes
            .get_mut(id.0 as usize)
            .ok_or(GraphError::UnknownNode(id))
    }

    /// Apply an inbound remote value under the monotonic rule.
    ///
    /// Returns whether the cache changed (stale and duplicate versions
    /// are dropped, which is not an error).
    ///
    /// # Errors
    ///
    /// Fails if `id` is not a remote reference, or with
    /// [`GraphError::BufferSize`] if the payload length disagrees with
    /// the reference's declared shape.
    pub fn update_remote(
        &mut self,
        id: NodeId,
        values: &[f64],
        version: u64,
    ) -> Result<bool, GraphError> {
        match &mut self.node_mut(id)?.kind {
            NodeKind::Remote(r) => r.update(values, version),
            _ => Err(GraphError::UnknownNode(id)),
        }
    }

    /// The remote reference behind `id`, if it is one.
    #[must_use]
    pub fn as_remote(&self, id: NodeId) -> Option<&RemoteRef> {
        match &self.nodes.get(id.0 as usize)?.kind {
            NodeKind::Remote(r) => Some(r),
            _ => None,
        }
    }

    /// Iterate over all (id, node) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            // indices fit in u32 by construction: push refuses to grow
            // the arena past that
            .map(|(i, n)| (NodeId(i as u32), n))
    }

    fn push(&mut self, node: Node) -> Result<NodeId, GraphError> {
        let idx = u32::try_from(self.nodes.len()).map_err(|_| GraphError::ArenaFull)?;
        self.nodes.push(node);
        Ok(NodeId(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(dims: &[usize]) -> Shape {
        Shape::new(dims.to_vec()).unwrap()
    }

    #[test]
    fn test_leaf_starts_versioned() {
        let mut g = Graph::new();
        let a = g.leaf(DType::F64, shape(&[2]), &[1.0, 2.0]).unwrap();
        assert_eq!(g.node(a).unwrap().version(), 1);
        assert_eq!(g.node(a).unwrap().value().unwrap().to_f64s(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_set_leaf_bumps_version() {
        let mut g = Graph::new();
        let a = g.leaf(DType::F64, shape(&[1]), &[1.0]).unwrap();
        g.set_leaf(a, &[5.0]).unwrap();
        assert_eq!(g.node(a).unwrap().version(), 2);
        assert_eq!(g.node(a).unwrap().value().unwrap().to_f64s(), vec![5.0]);
    }

    #[test]
    fn test_functor_validates_arity_and_shape() {
        let mut g = Graph::new();
        let a = g.leaf(DType::F64, shape(&[2]), &[1.0, 2.0]).unwrap();
        let b = g.leaf(DType::F64, shape(&[3]), &[1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(
            g.functor(Op::Add, vec![a]),
            Err(GraphError::Arity { .. })
        ));
        assert!(matches!(
            g.functor(Op::Add, vec![a, b]),
            Err(GraphError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_functor_validates_dtype() {
        let mut g = Graph::new();
        let a = g.leaf(DType::F64, shape(&[1]), &[1.0]).unwrap();
        let b = g.leaf(DType::F32, shape(&[1]), &[1.0]).unwrap();
        assert!(matches!(
            g.functor(Op::Mul, vec![a, b]),
            Err(GraphError::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_functor_starts_unevaluated() {
        let mut g = Graph::new();
        let a = g.leaf(DType::F64, shape(&[1]), &[1.0]).unwrap();
        let f = g.functor(Op::Neg, vec![a]).unwrap();
        assert_eq!(g.node(f).unwrap().version(), 0);
        assert!(g.node(f).unwrap().value().is_none());
        assert_eq!(g.node(f).unwrap().args(), &[a]);
    }

    #[test]
    fn test_remote_node() {
        let mut g = Graph::new();
        let r = g.remote(RemoteRef::new(
            "peer-b".into(),
            "uid-9".into(),
            DType::F64,
            shape(&[2]),
        )).unwrap();
        assert!(g.as_remote(r).is_some());
        assert_eq!(g.node(r).unwrap().version(), 0);
        assert!(g.update_remote(r, &[3.0, 4.0], 7).unwrap());
        assert_eq!(g.node(r).unwrap().version(), 7);
        assert!(!g.update_remote(r, &[9.0, 9.0], 7).unwrap());
    }

    #[test]
    fn test_unknown_node() {
        let g = Graph::new();
        assert!(g.node(NodeId(4)).is_err());
    }
}
