//! Common error types for Convoy components.

use thiserror::Error;

/// Common errors across Convoy components
#[derive(Debug, Error)]
pub enum ConvoyError {
    /// Cluster configuration missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// An uploaded file's cluster item key has no usable policy
    #[error("No policy for '{file}' (cluster item key '{key}')")]
    PolicyResolution { file: String, key: String },

    /// The file writer failed
    #[error("Failed to persist '{path}': {reason}")]
    Persistence { path: String, reason: String },

    /// A node did not answer in time
    #[error("Node '{0}' timed out")]
    Timeout(String),

    /// A node is not connected
    #[error("Node '{0}' is disconnected")]
    Disconnected(String),

    /// A node did not acknowledge a sync reply
    #[error("Node '{0}' did not acknowledge the sync reply")]
    AcknowledgementFailure(String),

    /// Malformed frame, handshake or control payload
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Bundle could not be encoded or decoded
    #[error("Bundle codec error: {0}")]
    Codec(String),

    /// File name escapes the synchronized tree
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConvoyError {
    /// Returns true if this error concerns a single node's interaction
    /// and should become a per-node outcome instead of failing the operation
    pub fn is_node_local(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Disconnected(_) | Self::AcknowledgementFailure(_)
        )
    }
}

impl From<serde_json::Error> for ConvoyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}
