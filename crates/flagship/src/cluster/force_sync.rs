//! Operator-triggered sync of selected workers.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, HashSet};

use convoy_common::ConvoyError;

use super::NodeOutcome;
use crate::protocol::{Command, force_sync_payload};
use crate::state::AppState;

/// Sends the force-sync sentinel to workers
pub struct ForceSyncCoordinator {
    state: AppState,
}

impl ForceSyncCoordinator {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Ask every known worker (or only `node_names`) to start a sync.
    ///
    /// Per-node failures become outcomes; only an invalid configuration
    /// fails the whole call.
    pub async fn force_sync(
        &self,
        node_names: Option<&HashSet<String>>,
    ) -> Result<BTreeMap<String, NodeOutcome>, ConvoyError> {
        self.state.config.validate()?;

        let timeout = self.state.config.force_sync_timeout();
        let workers = self.state.registry.workers().await;

        if let Some(names) = node_names {
            for name in names {
                if !workers.iter().any(|(record, _)| &record.name == name) {
                    tracing::warn!(node = %name, "Force-sync requested for unknown node");
                }
            }
        }

        let mut pending: FuturesUnordered<_> = workers
            .into_iter()
            .filter(|(record, _)| node_names.is_none_or(|names| names.contains(&record.name)))
            .map(|(record, peer)| async move {
                let outcome = match peer {
                    Some(peer) => NodeOutcome::from_result(
                        peer.request(&Command::ForceSync, force_sync_payload(), timeout)
                            .await,
                        &record.address,
                    ),
                    None => NodeOutcome::Disconnected {
                        address: record.address.clone(),
                    },
                };
                (record.name, outcome)
            })
            .collect();

        let mut outcomes = BTreeMap::new();
        while let Some((node, outcome)) = pending.next().await {
            if outcome.is_success() {
                tracing::info!(node = %node, "Force-sync accepted");
            } else {
                tracing::error!(node = %node, outcome = %outcome, "Force-sync failed");
            }
            outcomes.insert(node, outcome);
        }

        Ok(outcomes)
    }
}
