//! Periodic liveness check of connected workers.
//!
//! Only reports. Marking a node disconnected is left to its connection.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use convoy_common::constants::HEARTBEAT_MARKER;

use super::server::Fanout;
use crate::protocol::Command;

/// Keep-alive loop over any fan-out target
pub struct KeepAlive<F: Fanout> {
    fanout: Arc<F>,
    interval: Duration,
}

impl<F: Fanout> KeepAlive<F> {
    pub fn new(fanout: Arc<F>, interval: Duration) -> Self {
        Self { fanout, interval }
    }

    /// One keep-alive round. Returns false when no worker is connected.
    pub async fn tick(&self) -> bool {
        if self.fanout.connected_count().await == 0 {
            return false;
        }

        let outcomes = self
            .fanout
            .broadcast(&Command::Echo, HEARTBEAT_MARKER.as_bytes())
            .await;
        for (node, outcome) in outcomes {
            if outcome.is_success() {
                tracing::debug!(node = %node, "Keep-alive answered");
            } else {
                tracing::error!(node = %node, outcome = %outcome, "Keep-alive not answered");
            }
        }
        true
    }

    /// Probe every `interval` until shutdown. A round finishes before the
    /// next sleep starts.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval = ?self.interval, "Keep-alive loop started");

        loop {
            tokio::select! {
                _ = self.tick() => {}
                _ = shutdown.recv() => break,
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.recv() => break,
            }
        }

        tracing::info!("Keep-alive loop shutting down");
    }
}
