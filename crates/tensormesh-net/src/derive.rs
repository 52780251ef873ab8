//! Seam for cross-peer differentiation.
//!
//! The session does not know how to differentiate; an implementation
//! of [`Deriver`] is injected at connect time. Peers without one
//! answer derivative requests with an unsupported error.

use std::collections::HashMap;

use tensormesh_graph::{Graph, GraphError, NodeId};

/// Builds gradient subgraphs inside a session's arena.
///
/// Called by the peer server when another cluster asks this one to
/// extend a derivative chain through locally owned nodes.
pub trait Deriver: Send + Sync {
    /// Extend gradients through `graph`.
    ///
    /// Each `(root, upstream_grad)` pair names a locally owned root and
    /// the node already holding the derivative of the overall objective
    /// with respect to that root. For every target, the implementation
    /// adds nodes computing the target's gradient and returns the
    /// mapping target → gradient node.
    ///
    /// # Errors
    ///
    /// Fails if a handle is foreign to `graph` or the gradient graph
    /// cannot be constructed.
    fn derive(
        &self,
        graph: &mut Graph,
        root_grads: &[(NodeId, NodeId)],
        targets: &[NodeId],
    ) -> Result<HashMap<NodeId, NodeId>, GraphError>;
}
