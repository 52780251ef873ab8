//! Error taxonomies for the distributed layer.
//!
//! Errors are values that bubble up to the session, which decides
//! per-functor whether to skip, retry next pass, or abort the whole
//! pass. Stale or duplicate inbound data is not an error anywhere: the
//! reference drops it silently.

use std::time::Duration;

use crate::registry::RegistryError;
use crate::wire::WireError;
use crate::{ClusterId, NodeUid};

/// Errors from peer RPC calls.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Connection or socket-level failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A call-kind deadline elapsed.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// A frame exceeded the size cap.
    #[error("frame of {0} bytes exceeds the frame cap")]
    FrameTooLarge(usize),

    /// Failed to encode or decode a frame.
    #[error("codec error: {0}")]
    Codec(String),

    /// The peer closed the connection mid-exchange.
    #[error("peer closed the connection mid-call")]
    Closed,

    /// The peer answered with a different response kind than the call
    /// expects.
    #[error("unexpected response: {0}")]
    Unexpected(String),

    /// The peer answered with an application error. Permanent for this
    /// invocation: not retried.
    #[error("peer error: {0}")]
    Remote(#[from] WireError),

    /// No client exists for the target cluster.
    #[error("no client for cluster {0}")]
    UnknownPeer(ClusterId),

    /// All retry attempts failed.
    #[error("call failed after {attempts} attempts")]
    Exhausted {
        /// Total attempts made.
        attempts: u32,
        /// The last attempt's failure.
        #[source]
        last: Box<RpcError>,
    },
}

impl RpcError {
    /// Whether retrying the same call cannot help.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Remote(_) | Self::UnknownPeer(_) | Self::Exhausted { .. }
        )
    }
}

/// Errors from resolving a shared node id.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// The id is unknown here and either recursion was disallowed or
    /// no peer knows it.
    #[error("no node {0} found")]
    NotFound(NodeUid),

    /// The registry could not say who owns the id. Retryable by the
    /// caller; not fatal.
    #[error("owner of node {uid} unknown: {reason}")]
    OwnerUnknown {
        /// The id being resolved.
        uid: NodeUid,
        /// Why the owner could not be determined.
        reason: String,
    },

    /// The owning peer answered but returned no metadata for the id.
    #[error("peer {0} returned no result")]
    EmptyResult(ClusterId),

    /// The peer call itself failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Returned metadata could not be turned into a local reference.
    #[error("bad node metadata: {0}")]
    Meta(#[from] tensormesh_graph::GraphError),
}

/// Errors from session lifecycle and evaluation passes.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The registry is unreachable. Fatal at construction: the process
    /// cannot safely coordinate node ownership.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A node lookup failed.
    #[error(transparent)]
    Lookup(#[from] LookupError),

    /// A graph operation failed.
    #[error(transparent)]
    Graph(#[from] tensormesh_graph::GraphError),

    /// The peer server could not be started.
    #[error("peer server bind failed: {0}")]
    Bind(std::io::Error),
}
