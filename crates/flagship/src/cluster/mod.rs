//! Cluster coordination modules.
//!
//! Implements:
//! - Node registry and per-connection peers
//! - The cluster listener, dispatch and broadcast
//! - Keep-alive probing
//! - Force-sync fan-out

mod force_sync;
mod keepalive;
mod registry;
mod server;

pub use force_sync::ForceSyncCoordinator;
pub use keepalive::KeepAlive;
pub use registry::{NodeOutcome, NodeRegistry, Peer};
pub use server::{ClusterServer, Fanout};
