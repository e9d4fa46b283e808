//! Core types shared across Convoy components.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => f.write_str("master"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

/// Connection status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Connected,
    Disconnected,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => f.write_str("connected"),
            Self::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// A cluster participant as seen by the master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Unique node name
    pub name: String,

    pub role: NodeRole,

    /// Transport address (ip:port)
    pub address: String,

    pub status: NodeStatus,

    /// Timestamp of the successful handshake (Unix epoch seconds)
    pub connected_at: i64,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>, role: NodeRole, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role,
            address: address.into(),
            status: NodeStatus::Connected,
            connected_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == NodeStatus::Connected
    }
}

/// One file in a manifest. The file name is the manifest key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Hex digest of the file content
    pub checksum: String,

    /// Cluster item key selecting the write policy for this file
    pub cluster_item_key: String,
}

impl ManifestEntry {
    pub fn new(checksum: impl Into<String>, cluster_item_key: impl Into<String>) -> Self {
        Self {
            checksum: checksum.into(),
            cluster_item_key: cluster_item_key.into(),
        }
    }
}

/// File name → entry
pub type Manifest = HashMap<String, ManifestEntry>;

/// Policy tag carried by every classified file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRef {
    pub cluster_item_key: String,
}

impl ItemRef {
    pub fn new(cluster_item_key: impl Into<String>) -> Self {
        Self {
            cluster_item_key: cluster_item_key.into(),
        }
    }
}

/// Differences between a reference manifest and a candidate manifest.
///
/// - `missing`: in the reference, absent from the candidate
/// - `extra`: in the candidate, absent from the reference
/// - `shared`: in both with differing checksums
///
/// Files present in both with the same checksum appear nowhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub missing: HashMap<String, ItemRef>,
    pub extra: HashMap<String, ItemRef>,
    pub shared: HashMap<String, ItemRef>,
}

impl ComparisonResult {
    /// True when both manifests agree
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.shared.is_empty()
    }

    /// Files the candidate side needs: differing plus missing
    pub fn files_to_send(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .shared
            .keys()
            .chain(self.missing.keys())
            .cloned()
            .collect();
        paths.sort();
        paths
    }
}

/// Control entry of a worker's upload bundle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncControl {
    /// What the worker believes the master holds
    #[serde(default)]
    pub master_files: Manifest,

    /// The worker's own files, tagged with their cluster item keys
    #[serde(default)]
    pub worker_files: Manifest,
}

/// Worker handshake payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// Node name the worker registers under
    pub name: String,

    /// Hex SHA-256 of the cluster shared key
    pub key_digest: String,
}
