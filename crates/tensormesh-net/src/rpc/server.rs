//! The peer-facing server task.
//!
//! One accept loop per session; every connection gets its own task and
//! may carry any number of sequential requests. Handlers operate on
//! the store shared with the owning session, taking the lock only for
//! the synchronous part of each request and never across a send.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tensormesh_graph::{evaluate_targets, Device, NodeId, RemoteRef};

use crate::derive::Deriver;
use crate::registry::{node_owner_key, Registry};
use crate::session::IdSource;
use crate::store::SharedStore;
use crate::wire::{read_frame, write_frame, NodeData, NodeMeta, Request, Response, WireError};
use crate::{ClusterId, NodeUid};

/// Everything a request handler needs, shared with the session.
#[derive(Clone)]
pub struct ServerContext {
    /// This cluster's id.
    pub self_id: ClusterId,
    /// The node store shared with the owning session.
    pub store: SharedStore,
    /// Device used for the restricted local evaluation in `GetData`.
    pub device: Arc<dyn Device>,
    /// Differentiation collaborator, if this peer supports `Derive`.
    pub deriver: Option<Arc<dyn Deriver>>,
    /// Source of fresh shared ids for exposed gradient nodes.
    pub ids: Arc<dyn IdSource>,
    /// Registry receiving owner entries for exposed gradient nodes.
    pub registry: Arc<dyn Registry>,
}

/// A running accept loop.
pub struct PeerServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PeerServer {
    /// Bind `listen` and start accepting peer requests.
    ///
    /// # Errors
    ///
    /// Fails if the listen address cannot be bound.
    pub async fn bind(listen: &str, ctx: ServerContext) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            accept_loop(listener, ctx, loop_cancel).await;
        });
        info!(%local_addr, "peer server listening");
        Ok(Self {
            local_addr,
            cancel,
            task,
        })
    }

    /// The bound address (resolves port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the accept loop to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(%e, "peer server task panicked");
        }
    }
}

async fn accept_loop(listener: TcpListener, ctx: ServerContext, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("peer server accept loop stopping");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn_ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, conn_ctx).await {
                            debug!(%peer, %e, "peer connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(%e, "accept failed");
                }
            },
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    ctx: ServerContext,
) -> Result<(), crate::error::RpcError> {
    while let Some(request) = read_frame::<Request, _>(&mut stream).await? {
        let responses = match request {
            Request::FindNodes { uids } => vec![handle_find_nodes(&ctx, &uids)],
            Request::GetData { uids } => handle_get_data(&ctx, &uids),
            Request::Derive { root_grads, targets } => {
                vec![handle_derive(&ctx, root_grads, &targets).await]
            }
        };
        for response in &responses {
            write_frame(&mut stream, response).await?;
        }
    }
    Ok(())
}

/// Metadata lookup. Strictly local and fail-closed: one unknown id
/// fails the whole request.
fn handle_find_nodes(ctx: &ServerContext, uids: &[NodeUid]) -> Response {
    let store = ctx.store.read();
    let mut metas = Vec::with_capacity(uids.len());
    for uid in uids {
        match store.meta_of(uid, &ctx.self_id) {
            Some(meta) => metas.push(meta),
            None => return Response::Error(WireError::NotFound(uid.clone())),
        }
    }
    Response::Nodes(metas)
}

/// Value fetch. Refreshes each requested node with a strictly local
/// evaluation pass, then streams back only nodes newer than the
/// caller's last-seen version.
///
/// A node that fails to evaluate here (an unpopulated reference, most
/// commonly) is simply not streamed; the caller sees no update for it.
fn handle_get_data(ctx: &ServerContext, uids: &[(NodeUid, u64)]) -> Vec<Response> {
    let ignored = HashSet::new();
    let mut store = ctx.store.write();
    let mut resolved = Vec::with_capacity(uids.len());
    for (uid, last_seen) in uids {
        match store.node_of(uid) {
            Some(id) => resolved.push((uid.clone(), id, *last_seen)),
            None => return vec![Response::Error(WireError::NotFound(uid.clone()))],
        }
    }

    let mut responses = Vec::new();
    for (uid, id, last_seen) in resolved {
        if let Err(e) = evaluate_targets(store.graph_mut(), ctx.device.as_ref(), &[id], &ignored) {
            debug!(%uid, %e, "node not refreshable, skipping");
            continue;
        }
        let Ok(node) = store.graph().node(id) else {
            continue;
        };
        let version = node.version();
        if version <= last_seen {
            continue;
        }
        let Some(value) = node.value() else {
            continue;
        };
        responses.push(Response::Data(NodeData {
            uid,
            version,
            values: value.to_f64s(),
        }));
    }
    responses.push(Response::DataEnd);
    responses
}

/// Cross-peer differentiation. Requires an injected [`Deriver`];
/// root and target ids must be known here, while upstream gradient
/// nodes arrive as metadata and become references to the caller.
async fn handle_derive(
    ctx: &ServerContext,
    root_grads: Vec<(NodeUid, NodeMeta)>,
    targets: &[NodeUid],
) -> Response {
    let Some(deriver) = ctx.deriver.as_ref() else {
        return Response::Error(WireError::Unsupported("no deriver installed".into()));
    };

    // (target uid, grad uid, grad is newly exposed) triples, built
    // under the lock; registry writes happen after it is released.
    let mut exposed: Vec<NodeUid> = Vec::new();
    let mut result: HashMap<NodeUid, NodeUid> = HashMap::new();
    {
        let mut store = ctx.store.write();

        let mut pairs: Vec<(NodeId, NodeId)> = Vec::with_capacity(root_grads.len());
        for (root_uid, grad_meta) in &root_grads {
            let Some(root) = store.node_of(root_uid) else {
                return Response::Error(WireError::NotFound(root_uid.clone()));
            };
            let grad = match store.node_of(&grad_meta.uid) {
                Some(id) => id,
                None => {
                    let made = reference_from_meta(grad_meta)
                        .and_then(|r| store.graph_mut().remote(r));
                    match made {
                        Ok(id) => {
                            store.bind(grad_meta.uid.clone(), id);
                            id
                        }
                        Err(e) => {
                            return Response::Error(WireError::Malformed(e.to_string()));
                        }
                    }
                }
            };
            pairs.push((root, grad));
        }

        let mut target_ids = Vec::with_capacity(targets.len());
        for uid in targets {
            match store.node_of(uid) {
                Some(id) => target_ids.push((uid.clone(), id)),
                None => return Response::Error(WireError::NotFound(uid.clone())),
            }
        }

        let ids_only: Vec<NodeId> = target_ids.iter().map(|(_, id)| *id).collect();
        let grads = match deriver.derive(store.graph_mut(), &pairs, &ids_only) {
            Ok(grads) => grads,
            Err(e) => return Response::Error(WireError::Internal(e.to_string())),
        };

        for (uid, id) in target_ids {
            let Some(&grad_id) = grads.get(&id) else {
                return Response::Error(WireError::Internal(format!(
                    "deriver returned no gradient for {uid}"
                )));
            };
            let grad_uid = match store.uid_of(grad_id) {
                Some(existing) => existing.clone(),
                None => {
                    let fresh = ctx.ids.next_id();
                    store.bind(fresh.clone(), grad_id);
                    exposed.push(fresh.clone());
                    fresh
                }
            };
            result.insert(uid, grad_uid);
        }
    }

    for uid in exposed {
        if let Err(e) = ctx
            .registry
            .set_kv(&node_owner_key(&uid), &ctx.self_id)
            .await
        {
            return Response::Error(WireError::Internal(format!(
                "registry rejected owner entry for {uid}: {e}"
            )));
        }
    }
    Response::Derived(result)
}

fn reference_from_meta(meta: &NodeMeta) -> Result<RemoteRef, tensormesh_graph::GraphError> {
    Ok(RemoteRef::new(
        meta.cluster.clone(),
        meta.uid.clone(),
        meta.dtype()?,
        meta.to_shape()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use crate::rpc::client::{ClientConfig, PeerClient};
    use crate::session::UuidSource;
    use crate::store::NodeStore;
    use tensormesh_graph::{CpuDevice, DType, Op, Shape};

    fn shape(dims: &[usize]) -> Shape {
        Shape::new(dims.to_vec()).unwrap()
    }

    async fn serve(store: SharedStore) -> (PeerServer, PeerClient) {
        let ctx = ServerContext {
            self_id: "peer-a".into(),
            store,
            device: Arc::new(CpuDevice),
            deriver: None,
            ids: Arc::new(UuidSource),
            registry: Arc::new(MemoryRegistry::new()),
        };
        let server = PeerServer::bind("127.0.0.1:0", ctx).await.unwrap();
        let client = PeerClient::new(
            "peer-a".into(),
            server.local_addr().to_string(),
            ClientConfig::default(),
        );
        (server, client)
    }

    #[tokio::test]
    async fn test_find_nodes_round_trip() {
        let store = NodeStore::shared();
        {
            let mut s = store.write();
            let a = s.graph_mut().leaf(DType::F64, shape(&[2]), &[1.0, 2.0]).unwrap();
            s.bind("u-a".into(), a);
        }
        let (server, client) = serve(store).await;
        let metas = client.find_nodes(vec!["u-a".into()]).await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].cluster, "peer-a");
        assert_eq!(metas[0].shape, vec![2]);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_find_nodes_fails_closed() {
        let store = NodeStore::shared();
        {
            let mut s = store.write();
            let a = s.graph_mut().leaf(DType::F64, shape(&[1]), &[1.0]).unwrap();
            s.bind("u-a".into(), a);
        }
        let (server, client) = serve(store).await;
        let err = client
            .find_nodes(vec!["u-a".into(), "u-missing".into()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::RpcError::Remote(WireError::NotFound(_))
        ));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_data_evaluates_and_suppresses() {
        let store = NodeStore::shared();
        {
            let mut s = store.write();
            let a = s.graph_mut().leaf(DType::F64, shape(&[2]), &[1.0, 2.0]).unwrap();
            let b = s.graph_mut().leaf(DType::F64, shape(&[2]), &[3.0, 4.0]).unwrap();
            let f = s.graph_mut().functor(Op::Add, vec![a, b]).unwrap();
            s.bind("u-f".into(), f);
        }
        let (server, client) = serve(store).await;

        let first = client.get_data(vec![("u-f".into(), 0)]).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].values, vec![4.0, 6.0]);
        let v = first[0].version;
        assert!(v > 0);

        // caller already holds version v: nothing changed, nothing sent
        let second = client.get_data(vec![("u-f".into(), v)]).await.unwrap();
        assert!(second.is_empty());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_derive_without_deriver_is_unsupported() {
        let store = NodeStore::shared();
        let (server, client) = serve(store).await;
        let err = client.derive(vec![], vec![]).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::RpcError::Remote(WireError::Unsupported(_))
        ));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_multiple_requests_per_connection_equivalent() {
        // connect-per-call from two sequential calls still lands on the
        // same accept loop; exercises re-armed accept
        let store = NodeStore::shared();
        {
            let mut s = store.write();
            let a = s.graph_mut().leaf(DType::F64, shape(&[1]), &[7.0]).unwrap();
            s.bind("u-a".into(), a);
        }
        let (server, client) = serve(store).await;
        for _ in 0..3 {
            let metas = client.find_nodes(vec!["u-a".into()]).await.unwrap();
            assert_eq!(metas[0].uid, "u-a");
        }
        server.shutdown().await;
    }
}
