//! File synchronization between the master and its workers.
//!
//! Implements:
//! - Manifest comparison
//! - Bundle encoding (lz4 + bincode)
//! - The master-side sync workflow and its per-node supervision

pub mod bundle;
mod compare;
mod tracker;
mod workflow;

pub use compare::compare_files;
pub use tracker::SyncTracker;
pub use workflow::spawn_sync;
