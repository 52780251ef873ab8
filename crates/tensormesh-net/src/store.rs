//! The session-owned node store.
//!
//! Couples the graph arena with a bidirectional index between shared
//! ids and arena handles. Both directions are updated together, so a
//! node maps to at most one id and an id to at most one live node;
//! expiry removes both sides atomically.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use tensormesh_graph::{Graph, NodeId, NodeKind};

use crate::wire::NodeMeta;
use crate::{ClusterId, NodeUid};

/// Store shared between the session and its peer server task.
pub type SharedStore = Arc<RwLock<NodeStore>>;

/// Arena plus uid⇄handle index.
#[derive(Debug, Default)]
pub struct NodeStore {
    graph: Graph,
    by_uid: HashMap<NodeUid, NodeId>,
    by_node: HashMap<NodeId, NodeUid>,
}

impl NodeStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A new shared handle around an empty store.
    #[must_use]
    pub fn shared() -> SharedStore {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Borrow the graph.
    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Mutably borrow the graph.
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    /// Associate a shared id with a node, both directions at once.
    ///
    /// Binding an already-bound node or id is a no-op returning the
    /// surviving association's id side (`false` if the requested
    /// binding was not applied).
    pub fn bind(&mut self, uid: NodeUid, node: NodeId) -> bool {
        if self.by_uid.contains_key(&uid) || self.by_node.contains_key(&node) {
            return false;
        }
        self.by_uid.insert(uid.clone(), node);
        self.by_node.insert(node, uid);
        true
    }

    /// Drop an association, both directions at once.
    pub fn unbind(&mut self, uid: &NodeUid) -> Option<NodeId> {
        let node = self.by_uid.remove(uid)?;
        self.by_node.remove(&node);
        Some(node)
    }

    /// The node bound to an id.
    #[must_use]
    pub fn node_of(&self, uid: &str) -> Option<NodeId> {
        self.by_uid.get(uid).copied()
    }

    /// The id bound to a node.
    #[must_use]
    pub fn uid_of(&self, node: NodeId) -> Option<&NodeUid> {
        self.by_node.get(&node)
    }

    /// Number of bound ids.
    #[must_use]
    pub fn bound_count(&self) -> usize {
        self.by_uid.len()
    }

    /// Wire metadata for a bound id.
    ///
    /// For a remote reference the owning cluster is the reference's
    /// true owner; for local nodes it is `self_id`.
    #[must_use]
    pub fn meta_of(&self, uid: &str, self_id: &ClusterId) -> Option<NodeMeta> {
        let id = self.node_of(uid)?;
        let node = self.graph.node(id).ok()?;
        let cluster = match &node.kind {
            NodeKind::Remote(r) => r.cluster_id().to_string(),
            _ => self_id.clone(),
        };
        Some(NodeMeta::new(
            uid.to_string(),
            node.dtype(),
            node.shape(),
            cluster,
        ))
    }
}
