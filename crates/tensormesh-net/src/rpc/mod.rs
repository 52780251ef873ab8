//! Peer-to-peer RPC over framed TCP.
//!
//! Each session runs one [`server::PeerServer`] accepting requests
//! from every other cluster, and holds one [`client::PeerClient`] per
//! known peer. Calls are connect-per-call: a fresh connection carries
//! one request and its response frames, which keeps retries free of
//! connection-state bookkeeping.

pub mod client;
pub mod server;

pub use client::{ClientConfig, PeerClient};
pub use server::{PeerServer, ServerContext};
