//! Local operator control channel.
//!
//! Listens on a Unix socket, so only local processes can reach it. One
//! request line per connection:
//!
//! ```text
//! <command> <target> [payload]      target = node name | all
//! file-status
//! force-sync [all | n1,n2,...]
//! ```
//!
//! The answer is a single JSON line, `{"status":"ok","data":...}` or
//! `{"status":"err","error":"..."}`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use convoy_common::constants::{ALL_NODES, commands};
use convoy_common::{ConvoyError, NodeRecord};

use crate::cluster::{ClusterServer, Fanout, ForceSyncCoordinator, NodeOutcome};
use crate::protocol::Command;

/// Longest request line accepted
const MAX_REQUEST_LINE: u64 = 1024 * 1024;

/// Answer to one control request
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ControlResponse {
    Ok { data: serde_json::Value },
    Err { error: String },
}

impl ControlResponse {
    fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self::Ok { data },
            Err(e) => Self::error(e),
        }
    }

    fn error(e: impl std::fmt::Display) -> Self {
        Self::Err {
            error: e.to_string(),
        }
    }
}

/// The master's own view of the cluster, built without network calls
#[derive(Debug, Serialize)]
struct FileStatus {
    master: String,
    /// Cluster item key → number of master files
    files: BTreeMap<String, usize>,
    nodes: Vec<NodeRecord>,
    syncing: Vec<String>,
}

/// Serves operator requests on the control socket
#[derive(Clone)]
pub struct ControlChannel {
    server: ClusterServer,
}

impl ControlChannel {
    pub fn new(server: ClusterServer) -> Self {
        Self { server }
    }

    /// Bind the socket, replacing a stale one left by a previous run
    pub fn bind(path: &Path) -> Result<UnixListener> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }

        UnixListener::bind(path)
            .with_context(|| format!("Failed to bind control socket {}", path.display()))
    }

    /// Serve requests until shutdown
    pub async fn run(&self, listener: UnixListener, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!("Control channel accepting requests");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let channel = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = channel.serve(stream).await {
                                tracing::warn!(error = %e, "Control request failed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept control connection");
                    }
                },
                _ = shutdown.recv() => {
                    tracing::info!("Control channel shutting down");
                    break;
                }
            }
        }
    }

    async fn serve(&self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader).take(MAX_REQUEST_LINE);
        let mut line = String::new();
        let timeout = self.server.state().config.socket_timeout();

        tokio::time::timeout(timeout, reader.read_line(&mut line))
            .await
            .context("Timed out reading control request")??;

        let response = self.handle(line.trim_end_matches(['\r', '\n'])).await;
        let mut body = serde_json::to_vec(&response)?;
        body.push(b'\n');
        writer.write_all(&body).await?;
        writer.shutdown().await?;
        Ok(())
    }

    /// Route one request line
    pub async fn handle(&self, line: &str) -> ControlResponse {
        let mut parts = line.splitn(3, ' ');
        let command = parts.next().unwrap_or_default().trim();
        let target = parts.next().map(str::trim).filter(|t| !t.is_empty());
        let payload = parts.next().unwrap_or_default();

        tracing::debug!(command = %command, target = ?target, "Control request");

        match command {
            "" => ControlResponse::error("empty request"),
            commands::FILE_STATUS => match self.file_status().await {
                Ok(status) => ControlResponse::ok(status),
                Err(e) => ControlResponse::error(e),
            },
            commands::FORCE_SYNC => {
                let nodes: Option<HashSet<String>> = target
                    .filter(|t| *t != ALL_NODES)
                    .map(|t| t.split(',').map(|n| n.trim().to_string()).collect());
                let coordinator = ForceSyncCoordinator::new(self.server.state().clone());
                match coordinator.force_sync(nodes.as_ref()).await {
                    Ok(outcomes) => ControlResponse::ok(outcomes),
                    Err(e) => ControlResponse::error(e),
                }
            }
            _ => {
                let Some(target) = target else {
                    return ControlResponse::error(format!("missing target for '{}'", command));
                };
                let command = Command::parse(command);
                let payload = payload.as_bytes().to_vec();

                if target == ALL_NODES {
                    let outcomes: BTreeMap<String, NodeOutcome> =
                        self.server.broadcast(&command, &payload).await.into_iter().collect();
                    ControlResponse::ok(outcomes)
                } else {
                    match self.server.send(target, &command, payload).await {
                        NodeOutcome::Replied { status, payload } => {
                            ControlResponse::ok(serde_json::json!({
                                "status": status,
                                "payload": payload,
                            }))
                        }
                        other => ControlResponse::error(other),
                    }
                }
            }
        }
    }

    async fn file_status(&self) -> Result<FileStatus, ConvoyError> {
        let state = self.server.state();
        let manifest = state.store.files_status(&state.config.cluster_items).await?;

        let mut files = BTreeMap::new();
        for entry in manifest.values() {
            *files.entry(entry.cluster_item_key.clone()).or_insert(0) += 1;
        }

        Ok(FileStatus {
            master: state.node_name.clone(),
            files,
            nodes: state.registry.nodes().await,
            syncing: state.syncs.in_flight().await,
        })
    }
}

/// Send one request line to a running master and return its JSON answer
pub async fn request(socket_path: &Path, line: &str) -> Result<String> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("Failed to connect to {}", socket_path.display()))?;

    stream
        .write_all(format!("{}\n", line).as_bytes())
        .await
        .context("Failed to send control request")?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    let mut chunk = String::new();

    while reader.read_line(&mut chunk).await? > 0 {
        response.push_str(&chunk);
        chunk.clear();
    }

    Ok(response.trim().to_string())
}
