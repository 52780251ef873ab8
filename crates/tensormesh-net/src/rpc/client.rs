//! Outbound peer calls with timeouts and bounded retries.

use std::collections::HashMap;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::wire::{read_frame, write_frame, NodeData, NodeMeta, Request, Response};
use crate::{ClusterId, NodeUid};

/// Tunables for outbound calls.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for establishing a connection.
    pub connect_timeout: Duration,
    /// Deadline for a single-response call.
    pub request_timeout: Duration,
    /// Per-frame deadline within a streamed response.
    pub stream_timeout: Duration,
    /// Attempts per call before giving up.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles per attempt.
    pub initial_retry_delay: Duration,
    /// Backoff ceiling.
    pub max_retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            stream_timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_retry_delay: Duration::from_millis(50),
            max_retry_delay: Duration::from_secs(2),
        }
    }
}

/// Client for one peer cluster.
///
/// Cheap to clone; holds no connection. Every call dials the peer,
/// runs one exchange, and drops the socket.
#[derive(Debug, Clone)]
pub struct PeerClient {
    cluster_id: ClusterId,
    address: String,
    config: ClientConfig,
}

impl PeerClient {
    /// A client for the peer at `address`.
    #[must_use]
    pub fn new(cluster_id: ClusterId, address: String, config: ClientConfig) -> Self {
        Self {
            cluster_id,
            address,
            config,
        }
    }

    /// The peer this client talks to.
    #[must_use]
    pub fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }

    /// The peer's advertised address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Resolve metadata for shared ids on the peer.
    ///
    /// # Errors
    ///
    /// Fails once retries are exhausted or the peer answers with an
    /// application error.
    pub async fn find_nodes(&self, uids: Vec<NodeUid>) -> Result<Vec<NodeMeta>, RpcError> {
        self.with_retries(|| async {
            let mut stream = self.dial().await?;
            write_frame(&mut stream, &Request::FindNodes { uids: uids.clone() }).await?;
            match self.read_one(&mut stream).await? {
                Response::Nodes(metas) => Ok(metas),
                Response::Error(e) => Err(RpcError::Remote(e)),
                other => Err(RpcError::Unexpected(format!("{other:?}"))),
            }
        })
        .await
    }

    /// Refresh and fetch values for shared ids on the peer.
    ///
    /// Each pair names a node and the version already cached here; the
    /// peer streams back only nodes newer than that, and a fully
    /// up-to-date request legitimately yields an empty list.
    ///
    /// # Errors
    ///
    /// Fails once retries are exhausted or the peer answers with an
    /// application error.
    pub async fn get_data(&self, uids: Vec<(NodeUid, u64)>) -> Result<Vec<NodeData>, RpcError> {
        self.with_retries(|| async {
            let mut stream = self.dial().await?;
            write_frame(&mut stream, &Request::GetData { uids: uids.clone() }).await?;
            let mut out = Vec::new();
            loop {
                let frame = timeout(self.config.stream_timeout, read_frame(&mut stream))
                    .await
                    .map_err(|_| RpcError::Timeout(self.config.stream_timeout))??;
                match frame {
                    Some(Response::Data(data)) => out.push(data),
                    Some(Response::DataEnd) => return Ok(out),
                    Some(Response::Error(e)) => return Err(RpcError::Remote(e)),
                    Some(other) => return Err(RpcError::Unexpected(format!("{other:?}"))),
                    None => return Err(RpcError::Closed),
                }
            }
        })
        .await
    }

    /// Ask the peer to extend derivative chains through its nodes.
    ///
    /// # Errors
    ///
    /// Fails once retries are exhausted, or immediately if the peer
    /// has no deriver.
    pub async fn derive(
        &self,
        root_grads: Vec<(NodeUid, NodeMeta)>,
        targets: Vec<NodeUid>,
    ) -> Result<HashMap<NodeUid, NodeUid>, RpcError> {
        self.with_retries(|| async {
            let mut stream = self.dial().await?;
            write_frame(
                &mut stream,
                &Request::Derive {
                    root_grads: root_grads.clone(),
                    targets: targets.clone(),
                },
            )
            .await?;
            match self.read_one(&mut stream).await? {
                Response::Derived(map) => Ok(map),
                Response::Error(e) => Err(RpcError::Remote(e)),
                other => Err(RpcError::Unexpected(format!("{other:?}"))),
            }
        })
        .await
    }

    async fn dial(&self) -> Result<TcpStream, RpcError> {
        timeout(self.config.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| RpcError::Timeout(self.config.connect_timeout))?
            .map_err(RpcError::Io)
    }

    async fn read_one(&self, stream: &mut TcpStream) -> Result<Response, RpcError> {
        timeout(self.config.request_timeout, read_frame(stream))
            .await
            .map_err(|_| RpcError::Timeout(self.config.request_timeout))??
            .ok_or(RpcError::Closed)
    }

    /// Run `call` with exponential backoff, re-issuing the whole call
    /// per attempt. Application errors from the peer are permanent and
    /// stop retries immediately.
    async fn with_retries<T, F, Fut>(&self, call: F) -> Result<T, RpcError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, RpcError>>,
    {
        let attempts = self.config.max_retries.max(1);
        let mut delay = self.config.initial_retry_delay;
        let mut last = None;
        for attempt in 1..=attempts {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_permanent() => {
                    debug!(cluster = %self.cluster_id, %e, "peer call failed permanently");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        cluster = %self.cluster_id,
                        attempt,
                        %e,
                        "peer call attempt failed"
                    );
                    last = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(self.config.max_retry_delay);
                    }
                }
            }
        }
        Err(RpcError::Exhausted {
            attempts,
            // last is always set: the loop ran at least once and only
            // falls through on Err.
            last: Box::new(last.unwrap_or(RpcError::Closed)),
        })
    }
}
