//! # tensormesh-graph: Tensor Expression Graph
//!
//! The process-local half of tensormesh: an arena-owned tensor
//! expression graph whose leaves may be remote references — stand-ins
//! for tensors owned and computed by a different process.
//!
//! ## Modules
//!
//! - [`dtype`]: Element dtypes with stable wire tags
//! - [`shape`]: Rank-capped tensor shapes
//! - [`data`]: Typed byte buffers and f64 widen/narrow conversion
//! - [`node`]: The arena graph and the `Leaf`/`Functor`/`Remote` node kinds
//! - [`reference`]: Remote references with monotonic version stamps
//! - [`eval`]: Restricted topological evaluation against a [`Device`]
//!
//! The distributed layer (`tensormesh-net`) builds on these types; this
//! crate performs no I/O.

pub mod data;
pub mod dtype;
pub mod error;
pub mod eval;
pub mod node;
pub mod reference;
pub mod shape;

pub use data::TensorData;
pub use dtype::DType;
pub use error::GraphError;
pub use eval::{evaluate_targets, CpuDevice, Device};
pub use node::{Graph, Node, NodeId, NodeKind, Op};
pub use reference::RemoteRef;
pub use shape::Shape;
