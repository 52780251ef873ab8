//! # tensormesh-net: Distributed Graph Synchronization
//!
//! Lets multiple independent processes ("clusters") each hold a
//! partition of one logical tensor expression graph, discover each
//! other through a shared registry, and transparently fetch up-to-date
//! values for nodes owned by a remote peer when local evaluation
//! depends on them.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   FindNodes / GetData / Derive   ┌────────────┐
//! │ Cluster A   │◄────────────────────────────────►│ Cluster B   │
//! │ session +   │                                  │ session +   │
//! │ peer server │                                  │ peer server │
//! └──────┬──────┘                                  └──────┬──────┘
//!        │              ┌──────────────┐                  │
//!        └─────────────►│   Registry    │◄─────────────────┘
//!                       │ (catalog + KV)│
//!                       └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`registry`]: Consumed peer-catalog + KV interface and the
//!   in-process implementation
//! - [`wire`]: Peer-to-peer message model and length-prefixed framing
//! - [`rpc`]: Peer client (timeout/retry/backoff) and peer server
//! - [`store`]: Session-owned arena + uid⇄handle bidirectional index
//! - [`session`]: The [`DistribSession`] orchestrator
//! - [`derive`]: Collaborator seam for cross-peer derivative requests

pub mod derive;
pub mod error;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod store;
pub mod wire;

/// Id of the process owning and serving a graph partition.
pub type ClusterId = String;

/// Globally unique, opaque id of a shared graph node.
pub type NodeUid = String;

pub use derive::Deriver;
pub use error::{LookupError, RpcError, SessionError};
pub use registry::{MemoryRegistry, Registry, RegistryError};
pub use rpc::{ClientConfig, PeerClient, PeerServer, ServerContext};
pub use session::{
    DistribSession, IdSource, PassReport, SessionConfig, SkippedFunctor, UuidSource,
};
pub use store::{NodeStore, SharedStore};
