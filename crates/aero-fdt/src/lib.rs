//! Read-only device tree documents.
//!
//! A [`DeviceTree`] is decoded from a flattened blob ([`DeviceTree::from_blob`]) or assembled in
//! memory with [`DeviceTreeBuilder`]. Nodes are addressed by [`NodeId`] handles and properties are
//! exposed as raw big-endian bytes; interpreting cells is left to the consumer.

#![forbid(unsafe_code)]

mod blob;
mod builder;
mod error;
mod tree;

pub use blob::{parse, FDT_LAST_COMP_VERSION, FDT_MAGIC, FDT_VERSION};
pub use builder::{DeviceTreeBuilder, NodeToken};
pub use error::FdtError;
pub use tree::{DeviceTree, Node, NodeId, Property};
