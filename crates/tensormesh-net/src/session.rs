//! The per-cluster orchestrator.
//!
//! A [`DistribSession`] owns one graph arena, one peer server, and one
//! client per known peer. Evaluation is a two-phase pass: fetch every
//! remote dependency of the targets (one `GetData` per owning
//! cluster, concurrently), drain the results, then evaluate functors
//! bottom-up by height. A cluster that fails its fetch poisons only
//! the functors depending on it; everything else evaluates normally
//! and the pass reports what was skipped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tensormesh_graph::{evaluate_targets, Device, NodeId, NodeKind, RemoteRef};

use crate::derive::Deriver;
use crate::error::{LookupError, RpcError, SessionError};
use crate::registry::{node_owner_key, Registry};
use crate::rpc::client::{ClientConfig, PeerClient};
use crate::rpc::server::{PeerServer, ServerContext};
use crate::store::{NodeStore, SharedStore};
use crate::wire::{NodeData, NodeMeta};
use crate::{ClusterId, NodeUid};

/// Source of globally unique shared ids.
pub trait IdSource: Send + Sync {
    /// A fresh id, unique across all clusters.
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs; collision-free without coordination.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidSource;

impl IdSource for UuidSource {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Session construction knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Logical service name, used for log context.
    pub service_name: String,
    /// Peer server listen address; port 0 picks a free port.
    pub listen_address: String,
    /// Address peers should dial, when it differs from the bound one
    /// (NAT, container networking). Defaults to the bound address.
    pub advertise_address: Option<String>,
    /// Outbound call tunables.
    pub client: ClientConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_name: "tensormesh".into(),
            listen_address: "127.0.0.1:0".into(),
            advertise_address: None,
            client: ClientConfig::default(),
        }
    }
}

/// One inbound event from a per-cluster fetch task.
enum FetchEvent {
    /// A value for one remote reference.
    Update(NodeData),
    /// The cluster's fetch finished, successfully or not.
    ClusterDone {
        cluster: ClusterId,
        result: Result<(), RpcError>,
    },
}

/// A functor the pass could not evaluate.
#[derive(Debug)]
pub struct SkippedFunctor {
    /// The functor left unevaluated.
    pub node: NodeId,
    /// Human-readable cause.
    pub reason: String,
}

/// What one evaluation pass did.
#[derive(Debug, Default)]
pub struct PassReport {
    /// Functors evaluated (or found already fresh) this pass.
    pub evaluated: Vec<NodeId>,
    /// Functors skipped, with causes. Never silently stale: a skip is
    /// always visible here.
    pub skipped: Vec<SkippedFunctor>,
    /// Clusters a fetch was issued to this pass.
    pub fetched_clusters: Vec<ClusterId>,
}

impl PassReport {
    /// Whether every targeted functor evaluated.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// The distributed evaluation session for one cluster.
pub struct DistribSession {
    self_id: ClusterId,
    config: SessionConfig,
    registry: Arc<dyn Registry>,
    ids: Arc<dyn IdSource>,
    store: SharedStore,
    device: Arc<dyn Device>,
    clients: HashMap<ClusterId, PeerClient>,
    server: Option<PeerServer>,
    /// Tracked functors bucketed by height (index 0 = height 1).
    levels: Vec<Vec<NodeId>>,
    /// Direct remote-reference arguments per tracked functor.
    deps: HashMap<NodeId, Vec<NodeId>>,
    roots: Vec<NodeId>,
    events_tx: mpsc::UnboundedSender<FetchEvent>,
    events_rx: mpsc::UnboundedReceiver<FetchEvent>,
    /// Clusters with an outstanding fetch task this batch.
    inflight: usize,
}

impl DistribSession {
    /// Join the mesh: bind the peer server, register with the
    /// registry, and seed the peer table.
    ///
    /// # Errors
    ///
    /// Fails if the server cannot bind or the registry is unreachable;
    /// a session that cannot announce itself must not serve.
    pub async fn connect(
        registry: Arc<dyn Registry>,
        device: Arc<dyn Device>,
        ids: Arc<dyn IdSource>,
        deriver: Option<Arc<dyn Deriver>>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let self_id = ids.next_id();
        let store = NodeStore::shared();
        let ctx = ServerContext {
            self_id: self_id.clone(),
            store: store.clone(),
            device: device.clone(),
            deriver,
            ids: ids.clone(),
            registry: registry.clone(),
        };
        let server = PeerServer::bind(&config.listen_address, ctx)
            .await
            .map_err(SessionError::Bind)?;
        let advertise = config
            .advertise_address
            .clone()
            .unwrap_or_else(|| server.local_addr().to_string());
        registry.register(&self_id, &advertise).await?;
        info!(
            service = %config.service_name,
            cluster = %self_id,
            %advertise,
            "session joined"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut session = Self {
            self_id,
            config,
            registry,
            ids,
            store,
            device,
            clients: HashMap::new(),
            server: Some(server),
            levels: Vec::new(),
            deps: HashMap::new(),
            roots: Vec::new(),
            events_tx,
            events_rx,
            inflight: 0,
        };
        session.refresh_peers().await?;
        Ok(session)
    }

    /// This cluster's id.
    #[must_use]
    pub fn cluster_id(&self) -> &ClusterId {
        &self.self_id
    }

    /// The address peers dial for this session's server.
    #[must_use]
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.server.as_ref().map(PeerServer::local_addr)
    }

    /// Run a closure against the graph.
    pub fn with_graph<T>(&self, f: impl FnOnce(&tensormesh_graph::Graph) -> T) -> T {
        f(self.store.read().graph())
    }

    /// Run a closure against the graph, mutably.
    pub fn with_graph_mut<T>(&self, f: impl FnOnce(&mut tensormesh_graph::Graph) -> T) -> T {
        f(self.store.write().graph_mut())
    }

    /// Rebuild the peer table from the registry, dropping departed
    /// peers and picking up new ones.
    ///
    /// # Errors
    ///
    /// Fails if the registry cannot list members.
    pub async fn refresh_peers(&mut self) -> Result<(), SessionError> {
        let members = self.registry.list_members().await.map_err(SessionError::Registry)?;
        let mut clients = HashMap::new();
        for (cluster, address) in members {
            if cluster == self.self_id {
                continue;
            }
            clients.insert(
                cluster.clone(),
                PeerClient::new(cluster, address, self.config.client.clone()),
            );
        }
        debug!(cluster = %self.self_id, peers = clients.len(), "peer table refreshed");
        self.clients = clients;
        Ok(())
    }

    /// Give a node a shared id and claim ownership in the registry.
    ///
    /// Idempotent: exposing an already-exposed node returns its
    /// existing id. The owner entry is written before the local
    /// binding, so a registry failure leaves nothing half-exposed; a
    /// retry after such a failure mints a fresh id and tries again.
    /// Re-exposing always re-issues the (idempotent) owner write, so
    /// a lost entry is healed rather than silently missing.
    ///
    /// # Errors
    ///
    /// Fails if the registry rejects the owner entry.
    pub async fn expose(&mut self, node: NodeId) -> Result<NodeUid, SessionError> {
        let (uid, bound) = {
            let store = self.store.read();
            match store.uid_of(node) {
                Some(existing) => (existing.clone(), true),
                None => (self.ids.next_id(), false),
            }
        };
        self.registry
            .set_kv(&node_owner_key(&uid), &self.self_id)
            .await
            .map_err(SessionError::Registry)?;
        if !bound {
            let store_arc = self.store.clone();
            let mut store = store_arc.write();
            store.bind(uid.clone(), node);
        }
        Ok(uid)
    }

    /// The shared id of a node, if it has one.
    #[must_use]
    pub fn lookup_id(&self, node: NodeId) -> Option<NodeUid> {
        self.store.read().uid_of(node).cloned()
    }

    /// Resolve a shared id to a local handle.
    ///
    /// Non-recursive lookup only consults the local store. Recursive
    /// lookup additionally asks the registry who owns the id, lazily
    /// refreshes the peer table when the owner is unknown here, calls
    /// the owner's `FindNodes`, and materializes a remote reference.
    ///
    /// # Errors
    ///
    /// [`LookupError`] describing where resolution stopped.
    pub async fn lookup_node(
        &mut self,
        uid: &NodeUid,
        recursive: bool,
    ) -> Result<NodeId, SessionError> {
        if let Some(id) = self.store.read().node_of(uid) {
            return Ok(id);
        }
        if !recursive {
            return Err(LookupError::NotFound(uid.clone()).into());
        }

        let owner = self
            .registry
            .get_kv(&node_owner_key(uid))
            .await
            .map_err(|e| LookupError::OwnerUnknown {
                uid: uid.clone(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| LookupError::NotFound(uid.clone()))?;
        if owner == self.self_id {
            // registry says we own it, but it is not bound here
            return Err(LookupError::NotFound(uid.clone()).into());
        }

        if !self.clients.contains_key(&owner) {
            self.refresh_peers().await?;
        }
        let client = self
            .clients
            .get(&owner)
            .ok_or_else(|| LookupError::Rpc(RpcError::UnknownPeer(owner.clone())))?;

        let metas = client
            .find_nodes(vec![uid.clone()])
            .await
            .map_err(LookupError::Rpc)?;
        let meta = metas
            .into_iter()
            .find(|m| &m.uid == uid)
            .ok_or_else(|| LookupError::EmptyResult(owner.clone()))?;
        let reference = RemoteRef::new(
            meta.cluster.clone(),
            uid.clone(),
            meta.dtype().map_err(LookupError::Meta)?,
            meta.to_shape().map_err(LookupError::Meta)?,
        );

        let mut store = self.store.write();
        let id = store.graph_mut().remote(reference)?;
        store.bind(uid.clone(), id);
        Ok(id)
    }

    /// Track roots for evaluation: rebuild the height-bucketed functor
    /// levels and the direct remote-dependency map for everything
    /// reachable from `roots`.
    ///
    /// # Errors
    ///
    /// Fails on a handle foreign to this session's graph.
    pub fn track(&mut self, roots: &[NodeId]) -> Result<(), SessionError> {
        let store = self.store.read();
        let graph = store.graph();

        let order = reachable_postorder(graph, roots)?;
        let mut heights: HashMap<NodeId, usize> = HashMap::new();
        let mut levels: Vec<Vec<NodeId>> = Vec::new();
        let mut deps: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

        for id in order {
            let node = graph.node(id)?;
            match &node.kind {
                NodeKind::Leaf { .. } | NodeKind::Remote(_) => {
                    heights.insert(id, 0);
                }
                NodeKind::Functor { args, .. } => {
                    let height = 1 + args
                        .iter()
                        .map(|a| heights.get(a).copied().unwrap_or(0))
                        .max()
                        .unwrap_or(0);
                    heights.insert(id, height);
                    if levels.len() < height {
                        levels.resize_with(height, Vec::new);
                    }
                    levels[height - 1].push(id);
                    let remote_args: Vec<NodeId> = args
                        .iter()
                        .copied()
                        .filter(|&a| graph.as_remote(a).is_some())
                        .collect();
                    if !remote_args.is_empty() {
                        deps.insert(id, remote_args);
                    }
                }
            }
        }
        drop(store);

        self.levels = levels;
        self.deps = deps;
        self.roots = roots.to_vec();
        Ok(())
    }

    /// Evaluate every tracked root. See [`Self::update_target`].
    ///
    /// # Errors
    ///
    /// Fails on graph-structural errors; fetch failures are reported
    /// in the [`PassReport`], not as errors.
    pub async fn update(&mut self) -> Result<PassReport, SessionError> {
        let roots = self.roots.clone();
        self.update_target(&roots).await
    }

    /// One evaluation pass over `targets` (a subset of the tracked
    /// graph): fetch all remote dependencies, one `GetData` per owning
    /// cluster, then evaluate bottom-up. Functors depending on a
    /// failed cluster (directly or transitively) are skipped and
    /// reported; unrelated functors evaluate normally.
    ///
    /// # Errors
    ///
    /// Fails on graph-structural errors; fetch failures are reported
    /// in the [`PassReport`], not as errors.
    pub async fn update_target(&mut self, targets: &[NodeId]) -> Result<PassReport, SessionError> {
        // phase 1: what does this pass need?
        let (needed, fetch) = {
            let store = self.store.read();
            let graph = store.graph();
            let order = reachable_postorder(graph, targets)?;
            let needed: HashSet<NodeId> = order.iter().copied().collect();
            let mut fetch = Vec::new();
            for &id in &order {
                if let Some(r) = graph.as_remote(id) {
                    fetch.push((r.cluster_id().to_string(), r.node_uid().to_string(), r.read().1, id));
                }
            }
            (needed, fetch)
        };

        // phase 2: one concurrent fetch per owning cluster
        let fetched_clusters = self.call(&fetch);
        let (failed, rejected) = self.sync().await;

        // phase 3: bottom-up evaluation with skip propagation
        let mut report = PassReport {
            fetched_clusters,
            ..PassReport::default()
        };
        let store_arc = self.store.clone();
        let mut store = store_arc.write();
        // a failed cluster poisons its references even when an older
        // value is cached: a skip is reported, never silent staleness.
        // The same goes for a reference whose payload was rejected.
        let mut skipset: HashSet<NodeId> = rejected;
        for (cluster, _, _, id) in &fetch {
            if failed.contains(cluster) {
                skipset.insert(*id);
            }
        }

        let empty = HashSet::new();
        let levels = self.levels.clone();
        for level in &levels {
            for &functor in level {
                if !needed.contains(&functor) {
                    continue;
                }
                let args = store.graph().node(functor)?.args().to_vec();
                if let Some(&bad) = args.iter().find(|a| skipset.contains(a)) {
                    let direct_remote = self
                        .deps
                        .get(&functor)
                        .is_some_and(|remotes| remotes.contains(&bad));
                    skipset.insert(functor);
                    report.skipped.push(SkippedFunctor {
                        node: functor,
                        reason: if direct_remote {
                            format!("remote argument {bad} could not be fetched")
                        } else {
                            format!("argument {bad} skipped this pass")
                        },
                    });
                    continue;
                }
                match evaluate_targets(store.graph_mut(), self.device.as_ref(), &[functor], &empty)
                {
                    Ok(_) => report.evaluated.push(functor),
                    Err(e) => {
                        skipset.insert(functor);
                        report.skipped.push(SkippedFunctor {
                            node: functor,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        if !report.skipped.is_empty() {
            warn!(
                cluster = %self.self_id,
                skipped = report.skipped.len(),
                "pass finished with skipped functors"
            );
        }
        Ok(report)
    }

    /// Issue one `GetData` task per owning cluster for the given
    /// references. Returns the clusters contacted; results arrive on
    /// the event channel and are drained by [`Self::sync`].
    fn call(&mut self, fetch: &[(ClusterId, NodeUid, u64, NodeId)]) -> Vec<ClusterId> {
        let mut by_cluster: HashMap<ClusterId, Vec<(NodeUid, u64)>> = HashMap::new();
        for (cluster, uid, version, _) in fetch {
            by_cluster
                .entry(cluster.clone())
                .or_default()
                .push((uid.clone(), *version));
        }

        let mut contacted = Vec::new();
        for (cluster, mut uids) in by_cluster {
            uids.sort();
            uids.dedup();
            let Some(client) = self.clients.get(&cluster).cloned() else {
                // no client: report the cluster failed without a task
                let _ = self.events_tx.send(FetchEvent::ClusterDone {
                    cluster: cluster.clone(),
                    result: Err(RpcError::UnknownPeer(cluster.clone())),
                });
                self.inflight += 1;
                contacted.push(cluster);
                continue;
            };
            let tx = self.events_tx.clone();
            let done_cluster = cluster.clone();
            self.inflight += 1;
            contacted.push(cluster);
            tokio::spawn(async move {
                let result = match client.get_data(uids).await {
                    Ok(updates) => {
                        for data in updates {
                            let _ = tx.send(FetchEvent::Update(data));
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = tx.send(FetchEvent::ClusterDone {
                    cluster: done_cluster,
                    result,
                });
            });
        }
        contacted
    }

    /// Drain the event channel until every outstanding fetch task has
    /// reported, applying inbound values under the monotonic rule.
    /// Returns the clusters whose fetch failed and the references
    /// whose inbound payload was rejected as malformed.
    async fn sync(&mut self) -> (HashSet<ClusterId>, HashSet<NodeId>) {
        let mut failed = HashSet::new();
        let mut rejected = HashSet::new();
        while self.inflight > 0 {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            match event {
                FetchEvent::Update(data) => {
                    let store_arc = self.store.clone();
                    let mut store = store_arc.write();
                    let Some(id) = store.node_of(&data.uid) else {
                        warn!(uid = %data.uid, "inbound value for unknown node, dropping");
                        continue;
                    };
                    match store.graph_mut().update_remote(id, &data.values, data.version) {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(uid = %data.uid, version = data.version, "stale value dropped");
                        }
                        Err(e) => {
                            warn!(uid = %data.uid, %e, "inbound value rejected");
                            rejected.insert(id);
                        }
                    }
                }
                FetchEvent::ClusterDone { cluster, result } => {
                    self.inflight -= 1;
                    if let Err(e) = result {
                        warn!(%cluster, %e, "fetch failed");
                        failed.insert(cluster);
                    }
                }
            }
        }
        (failed, rejected)
    }

    /// Ask a peer to extend derivative chains through its nodes. Each
    /// pair names a root owned by `cluster` and the local node holding
    /// the objective's derivative with respect to that root; `targets`
    /// are peer-owned ids to differentiate. Returns target id →
    /// freshly exposed gradient id, resolvable via
    /// [`Self::lookup_node`].
    ///
    /// # Errors
    ///
    /// Fails if a gradient node is not exposed locally, the peer is
    /// unknown, or the call fails.
    pub async fn remote_derive(
        &mut self,
        cluster: &ClusterId,
        root_grads: &[(NodeUid, NodeUid)],
        targets: &[NodeUid],
    ) -> Result<HashMap<NodeUid, NodeUid>, SessionError> {
        let pairs: Vec<(NodeUid, NodeMeta)> = {
            let store = self.store.read();
            let mut pairs = Vec::with_capacity(root_grads.len());
            for (root_uid, grad_uid) in root_grads {
                let meta = store
                    .meta_of(grad_uid, &self.self_id)
                    .ok_or_else(|| LookupError::NotFound(grad_uid.clone()))?;
                pairs.push((root_uid.clone(), meta));
            }
            pairs
        };

        if !self.clients.contains_key(cluster) {
            self.refresh_peers().await?;
        }
        let client = self
            .clients
            .get(cluster)
            .ok_or_else(|| LookupError::Rpc(RpcError::UnknownPeer(cluster.clone())))?;
        let map = client
            .derive(pairs, targets.to_vec())
            .await
            .map_err(LookupError::Rpc)?;
        Ok(map)
    }

    /// Forget tracked evaluation state. The graph and its bindings
    /// stay; only the level schedule is dropped.
    pub fn clear(&mut self) {
        self.levels.clear();
        self.deps.clear();
        self.roots.clear();
    }

    /// Leave the mesh: stop the peer server and deregister.
    pub async fn shutdown(mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown().await;
        }
        if let Err(e) = self.registry.deregister(&self.self_id).await {
            warn!(cluster = %self.self_id, %e, "deregister failed");
        }
        info!(cluster = %self.self_id, "session left");
    }
}

/// Dependency-first ordering of everything reachable from `targets`.
fn reachable_postorder(
    graph: &tensormesh_graph::Graph,
    targets: &[NodeId],
) -> Result<Vec<NodeId>, SessionError> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut stack: Vec<(NodeId, bool)> = targets.iter().rev().map(|&t| (t, false)).collect();
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            order.push(id);
            continue;
        }
        if !seen.insert(id) {
            continue;
        }
        stack.push((id, true));
        let node = graph.node(id).map_err(SessionError::Graph)?;
        for &arg in node.args().iter().rev() {
            if !seen.contains(&arg) {
                stack.push((arg, false));
            }
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensormesh_graph::{DType, Graph, Op, Shape};

    fn shape(dims: &[usize]) -> Shape {
        Shape::new(dims.to_vec()).unwrap()
    }

    #[test]
    fn test_uuid_source_unique() {
        let ids = UuidSource;
        assert_ne!(ids.next_id(), ids.next_id());
    }

    #[test]
    fn test_reachable_postorder_is_dependency_first() {
        let mut g = Graph::new();
        let a = g.leaf(DType::F64, shape(&[1]), &[1.0]).unwrap();
        let b = g.leaf(DType::F64, shape(&[1]), &[2.0]).unwrap();
        let f = g.functor(Op::Add, vec![a, b]).unwrap();
        let h = g.functor(Op::Neg, vec![f]).unwrap();
        let order = reachable_postorder(&g, &[h]).unwrap();
        let pos = |n: NodeId| order.iter().position(|&x| x == n).unwrap();
        assert!(pos(a) < pos(f));
        assert!(pos(b) < pos(f));
        assert!(pos(f) < pos(h));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_reachable_postorder_shared_subexpression_once() {
        let mut g = Graph::new();
        let a = g.leaf(DType::F64, shape(&[1]), &[1.0]).unwrap();
        let f = g.functor(Op::Neg, vec![a]).unwrap();
        let h = g.functor(Op::Add, vec![f, f]).unwrap();
        let order = reachable_postorder(&g, &[h]).unwrap();
        assert_eq!(order.len(), 3);
    }
}
