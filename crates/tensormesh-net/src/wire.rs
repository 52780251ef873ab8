//! Peer-to-peer message model and framing.
//!
//! Every frame is a u32 big-endian length prefix followed by a bincode
//! body, capped at [`MAX_FRAME_BYTES`]. Three operations exist:
//!
//! - `FindNodes(uids)` → one `Nodes` response (metadata list)
//! - `GetData(uids)` → zero or more `Data` frames, then `DataEnd`
//! - `Derive(root_grads, targets)` → one `Derived` response
//!
//! Any operation may instead answer a single `Error` frame. Payloads
//! travel as raw f64 arrays plus a dtype tag and shape; endpoints
//! narrow to their declared dtype on receipt.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use tensormesh_graph::{DType, GraphError, Shape};

use crate::error::RpcError;
use crate::{ClusterId, NodeUid};

/// Upper bound on a single frame body.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// A request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Metadata lookup for the given shared ids.
    FindNodes {
        /// Ids to resolve.
        uids: Vec<NodeUid>,
    },
    /// Value fetch: the server refreshes the targets once and streams
    /// back only nodes newer than the version the caller already holds.
    GetData {
        /// (id, caller's last-seen version) pairs. Version 0 means the
        /// caller holds nothing yet.
        uids: Vec<(NodeUid, u64)>,
    },
    /// Cross-peer derivative request. Each pair carries the root's
    /// shared id and the metadata of the caller-side upstream gradient
    /// node, so the server can reference it without recursing.
    Derive {
        /// (root id, upstream gradient metadata) pairs.
        root_grads: Vec<(NodeUid, NodeMeta)>,
        /// Ids to differentiate with respect to.
        targets: Vec<NodeUid>,
    },
}

/// Metadata describing one shared node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMeta {
    /// The node's shared id.
    pub uid: NodeUid,
    /// Element dtype wire tag.
    pub dtype_tag: u8,
    /// Per-axis extents.
    pub shape: Vec<usize>,
    /// The cluster that computes the authoritative value. For a node
    /// that is itself a remote reference, this is the true owner, not
    /// the answering peer.
    pub cluster: ClusterId,
}

impl NodeMeta {
    /// Build metadata from graph-side types.
    #[must_use]
    pub fn new(uid: NodeUid, dtype: DType, shape: &Shape, cluster: ClusterId) -> Self {
        Self {
            uid,
            dtype_tag: dtype.tag(),
            shape: shape.dims().to_vec(),
            cluster,
        }
    }

    /// Decode the dtype tag.
    ///
    /// # Errors
    ///
    /// Fails on an unknown tag.
    pub fn dtype(&self) -> Result<DType, GraphError> {
        DType::try_from(self.dtype_tag)
    }

    /// Decode the shape.
    ///
    /// # Errors
    ///
    /// Fails if the axis count exceeds the rank cap.
    pub fn to_shape(&self) -> Result<Shape, GraphError> {
        Shape::new(self.shape.clone())
    }
}

/// One streamed value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeData {
    /// The node's shared id.
    pub uid: NodeUid,
    /// The server-side version of this value.
    pub version: u64,
    /// Raw payload, widened to f64.
    pub values: Vec<f64>,
}

/// A response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Answer to `FindNodes`.
    Nodes(Vec<NodeMeta>),
    /// One streamed value for `GetData`.
    Data(NodeData),
    /// End of a `GetData` stream.
    DataEnd,
    /// Answer to `Derive`: target id → freshly exposed gradient id.
    Derived(HashMap<NodeUid, NodeUid>),
    /// The operation failed on the peer.
    Error(WireError),
}

/// Application-level errors a peer can answer with.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum WireError {
    /// A requested id is unknown to the peer.
    #[error("not found: {0}")]
    NotFound(String),

    /// The peer does not support the operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The request could not be interpreted.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The peer failed internally while serving.
    #[error("internal: {0}")]
    Internal(String),
}

/// Write one length-prefixed bincode frame.
///
/// # Errors
///
/// Fails on encoding or socket errors, or an oversized body.
pub async fn write_frame<T, W>(writer: &mut W, msg: &T) -> Result<(), RpcError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| RpcError::Codec(e.to_string()))?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(RpcError::FrameTooLarge(body.len()));
    }
    let len = u32::try_from(body.len()).map_err(|_| RpcError::FrameTooLarge(body.len()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between
/// frames.
///
/// # Errors
///
/// Fails on decoding or socket errors, or an oversized body.
pub async fn read_frame<T, R>(reader: &mut R) -> Result<Option<T>, RpcError>
where
    T: for<'de> Deserialize<'de>,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(RpcError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let (msg, _) = bincode::serde::decode_from_slice(&body, bincode::config::standard())
        .map_err(|e| RpcError::Codec(e.to_string()))?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let req = Request::FindNodes {
            uids: vec!["u1".into(), "u2".into()],
        };
        write_frame(&mut a, &req).await.unwrap();
        let got: Request = read_frame(&mut b).await.unwrap().unwrap();
        match got {
            Request::FindNodes { uids } => assert_eq!(uids, vec!["u1", "u2"]),
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let got: Result<Option<Request>, _> = read_frame(&mut b).await;
        assert!(got.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversize_rejected_on_read() {
        let (mut a, mut b) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        let fake = u32::try_from(MAX_FRAME_BYTES + 1).unwrap();
        a.write_all(&fake.to_be_bytes()).await.unwrap();
        let got: Result<Option<Request>, _> = read_frame(&mut b).await;
        assert!(matches!(got, Err(RpcError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_stream_frames_in_order() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        for i in 0..3u64 {
            let frame = Response::Data(NodeData {
                uid: "u".into(),
                version: i,
                values: vec![i as f64],
            });
            write_frame(&mut a, &frame).await.unwrap();
        }
        write_frame(&mut a, &Response::DataEnd).await.unwrap();
        let mut versions = Vec::new();
        loop {
            let frame: Response = read_frame(&mut b).await.unwrap().unwrap();
            match frame {
                Response::Data(d) => versions.push(d.version),
                Response::DataEnd => break,
                other => panic!("wrong frame: {other:?}"),
            }
        }
        assert_eq!(versions, vec![0, 1, 2]);
    }

    #[test]
    fn test_meta_decodes() {
        let shape = Shape::new(vec![2, 3]).unwrap();
        let meta = NodeMeta::new("u".into(), DType::F64, &shape, "peer-a".into());
        assert_eq!(meta.dtype().unwrap(), DType::F64);
        assert_eq!(meta.to_shape().unwrap(), shape);
    }

    #[test]
    fn test_meta_bad_tag() {
        let meta = NodeMeta {
            uid: "u".into(),
            dtype_tag: 99,
            shape: vec![1],
            cluster: "a".into(),
        };
        assert!(meta.dtype().is_err());
    }
}
