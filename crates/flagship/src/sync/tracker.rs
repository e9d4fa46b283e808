//! Supervision of in-flight sync workflows.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// One tracked task per node. A node may have at most one sync in flight;
/// further uploads are rejected until it finishes.
#[derive(Clone, Default)]
pub struct SyncTracker {
    inflight: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl SyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` for `node` unless one is already running.
    /// Returns false when rejected.
    pub async fn try_start<F>(&self, node: &str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inflight = self.inflight.lock().await;
        inflight.retain(|_, handle| !handle.is_finished());

        if inflight.contains_key(node) {
            tracing::warn!(node = %node, "Sync already in progress, rejecting upload");
            return false;
        }

        inflight.insert(node.to_string(), tokio::spawn(task));
        true
    }

    /// Nodes with a sync still running, sorted
    pub async fn in_flight(&self) -> Vec<String> {
        let inflight = self.inflight.lock().await;
        let mut nodes: Vec<String> = inflight
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(node, _)| node.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Wait for every tracked sync to finish
    pub async fn drain(&self) {
        let handles: Vec<(String, JoinHandle<()>)> =
            self.inflight.lock().await.drain().collect();

        if !handles.is_empty() {
            tracing::info!(count = handles.len(), "Waiting for in-flight syncs");
        }
        for (node, handle) in handles {
            if let Err(e) = handle.await {
                tracing::error!(node = %node, error = %e, "Sync task failed");
            }
        }
    }
}
