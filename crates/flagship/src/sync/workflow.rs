//! Master-side handling of a worker's upload.
//!
//! One invocation runs five strictly sequential steps for one worker:
//! decode the bundle, classify the worker's view of the master tree,
//! apply the worker's files, send the master's corrections, and wait for
//! the acknowledgement. Steps 1-4 propagate their errors; step 5 only
//! reports.

use serde::Serialize;
use std::collections::BTreeMap;

use convoy_common::{ConvoyError, Manifest, NodeRole, SyncControl};

use super::bundle::{self, compress_files};
use super::compare_files;
use crate::protocol::Command;
use crate::state::AppState;
use crate::store::FileData;

/// Summary of a finished sync cycle
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub node: String,
    /// Files received from the worker
    pub received: usize,
    /// Files written to the master tree
    pub applied: usize,
    /// Files sent back to the worker
    pub sent: usize,
    /// Whether the worker acknowledged the reply
    pub acknowledged: bool,
}

/// One sync cycle for one worker
pub struct SyncWorkflow {
    state: AppState,
    node: String,
}

impl SyncWorkflow {
    pub fn new(state: AppState, node: impl Into<String>) -> Self {
        Self {
            state,
            node: node.into(),
        }
    }

    /// Run the whole cycle against an uploaded bundle
    pub async fn run(&self, payload: &[u8]) -> Result<SyncReport, ConvoyError> {
        let node = self.node.as_str();
        tracing::info!(node = %node, "[Sync worker->master] Start");

        // 1. Decode
        tracing::info!(node = %node, "[Sync worker->master] [STEP 1] Analyzing received files");
        let bundle = bundle::decompress(payload)?;
        let control: SyncControl = bundle.control_as()?;

        // 2. Classify
        let master_files = self
            .state
            .store
            .files_status(&self.state.config.cluster_items)
            .await?;
        let diff = compare_files(&master_files, &control.master_files);
        tracing::debug!(
            node = %node,
            missing = diff.missing.len(),
            extra = diff.extra.len(),
            shared = diff.shared.len(),
            "Worker view of master files classified"
        );

        // 3. Apply
        tracing::info!(node = %node, "[Sync worker->master] [STEP 2] Updating master files");
        let applied = self.apply(&control.worker_files, &bundle.files).await?;

        // 4. Respond
        let paths = diff.files_to_send();
        tracing::info!(
            node = %node,
            files = paths.len(),
            "[Sync worker->master] [STEP 3] Compressing files for worker"
        );
        let reply = compress_files(self.state.store.as_ref(), NodeRole::Master, &paths, &diff).await?;

        // 5. Confirm
        tracing::info!(node = %node, "[Sync worker->master] End. Sending files to worker");
        let acknowledged = self.confirm(reply).await;

        Ok(SyncReport {
            node: self.node.clone(),
            received: bundle.files.len(),
            applied,
            sent: paths.len(),
            acknowledged,
        })
    }

    /// Write every uploaded file with the policy of its cluster item.
    /// The first failure aborts the step.
    async fn apply(
        &self,
        worker_files: &Manifest,
        uploaded: &BTreeMap<String, FileData>,
    ) -> Result<usize, ConvoyError> {
        let items = &self.state.config.cluster_items;

        for (name, file) in uploaded {
            let key = worker_files
                .get(name)
                .map(|entry| entry.cluster_item_key.as_str())
                .unwrap_or_default();

            // Workers may only write their own items, inside the item's directory
            let policy = items
                .get(key)
                .filter(|item| item.accepts_worker_files() && item.contains(name))
                .ok_or_else(|| ConvoyError::PolicyResolution {
                    file: name.clone(),
                    key: key.to_string(),
                })
                .and_then(|item| item.policy(key))
                .map_err(|_| ConvoyError::PolicyResolution {
                    file: name.clone(),
                    key: key.to_string(),
                })
                .inspect_err(|e| {
                    tracing::error!(node = %self.node, file = %name, error = %e, "Cannot resolve write policy");
                })?;

            self.state
                .store
                .write_file(name, file, &policy, &self.state.node_name)
                .await
                .inspect_err(|e| {
                    tracing::error!(node = %self.node, file = %name, error = %e, "Cannot update master file");
                })?;
        }

        Ok(uploaded.len())
    }

    /// Send the reply bundle and wait for the worker's acknowledgement
    async fn confirm(&self, reply: Vec<u8>) -> bool {
        let Some(peer) = self.state.registry.peer(&self.node).await else {
            tracing::error!(
                node = %self.node,
                error = %ConvoyError::Disconnected(self.node.clone()),
                "[Sync master->worker] Cannot send files"
            );
            return false;
        };

        let result = peer
            .request(&Command::SyncReply, reply, self.state.config.socket_timeout())
            .await;

        match result.as_ref().map(|r| r.processed()) {
            Ok(Some(answer)) => {
                tracing::info!(node = %self.node, answer = %answer, "[Sync master->worker] Worker acknowledged");
                true
            }
            Ok(None) => {
                tracing::error!(
                    node = %self.node,
                    error = %ConvoyError::AcknowledgementFailure(self.node.clone()),
                    "[Sync master->worker] Worker reported an error receiving files"
                );
                false
            }
            Err(e) => {
                tracing::error!(node = %self.node, error = %e, "[Sync master->worker] No acknowledgement");
                false
            }
        }
    }
}

/// Start a supervised sync for `node`. Returns false if one is already running.
pub async fn spawn_sync(state: &AppState, node: &str, payload: Vec<u8>) -> bool {
    let workflow = SyncWorkflow::new(state.clone(), node);
    let node_name = node.to_string();

    state
        .syncs
        .try_start(node, async move {
            tracing::debug!(node = %node_name, "Sync task started");
            match workflow.run(&payload).await {
                Ok(report) if report.acknowledged => {
                    tracing::info!(
                        node = %node_name,
                        received = report.received,
                        applied = report.applied,
                        sent = report.sent,
                        "Sync completed"
                    );
                }
                Ok(_) => {
                    tracing::warn!(node = %node_name, "Sync finished without acknowledgement");
                }
                Err(e) => {
                    tracing::error!(node = %node_name, error = %e, "Sync failed");
                }
            }
        })
        .await
}
