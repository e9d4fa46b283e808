//! Application state and shared resources.

use sha2::{Digest, Sha256};
use std::sync::Arc;

use convoy_common::{NodeRecord, NodeRole};

use crate::cluster::NodeRegistry;
use crate::config::AppConfig;
use crate::store::FileStore;
use crate::sync::SyncTracker;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Validated configuration, read-only after startup
    pub config: Arc<AppConfig>,

    /// Every known node and its connection
    pub registry: NodeRegistry,

    /// The master's file tree
    pub store: Arc<dyn FileStore>,

    /// In-flight sync workflows
    pub syncs: SyncTracker,

    /// Node identifier of this master
    pub node_name: String,
}

impl AppState {
    /// Create application state and register the master in its own registry
    pub async fn new(config: AppConfig, store: Arc<dyn FileStore>) -> Self {
        let node_name = config.node_name.clone();
        let registry = NodeRegistry::new();
        registry
            .register_local(NodeRecord::new(
                node_name.clone(),
                NodeRole::Master,
                config.listen_addr(),
            ))
            .await;

        Self {
            config: Arc::new(config),
            registry,
            store,
            syncs: SyncTracker::new(),
            node_name,
        }
    }

    /// Digest workers must present in their handshake
    pub fn key_digest(&self) -> String {
        key_digest(&self.config.key)
    }
}

/// Hex SHA-256 of the cluster key
pub fn key_digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}
