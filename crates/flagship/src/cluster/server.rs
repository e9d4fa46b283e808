//! Cluster listener and per-connection handling.
//!
//! Each accepted connection is served on its own task:
//!
//! ```text
//! accept → hello (≤ connection_timeout) → register
//!        → reader loop ─┬─ request  → dispatch → reply via writer
//!                       └─ response → wake the waiting requester
//!        → EOF: disconnected | bye: removed
//! ```

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};

use convoy_common::{ConvoyError, Hello, NodeRecord, NodeRole};

use super::{NodeOutcome, Peer};
use crate::protocol::{Command, Frame, Reply, read_frame, write_frame};
use crate::state::AppState;
use crate::sync::spawn_sync;

/// Outbound frames queued per connection
const OUTBOUND_QUEUE: usize = 64;

/// Sends one request to many nodes and collects their outcomes
#[async_trait]
pub trait Fanout: Send + Sync {
    /// Number of connected workers
    async fn connected_count(&self) -> usize;

    /// Send `command` to every worker; outcomes arrive in completion order
    async fn broadcast(&self, command: &Command, payload: &[u8]) -> Vec<(String, NodeOutcome)>;
}

/// The master's cluster endpoint
#[derive(Clone)]
pub struct ClusterServer {
    state: AppState,
}

impl ClusterServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Accept connections until shutdown
    pub async fn run(&self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(addr = %self.state.config.listen_addr(), "Cluster server accepting connections");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        let server = self.clone();
                        let conn_shutdown = shutdown.resubscribe();
                        tokio::spawn(async move {
                            server
                                .handle_connection(stream, addr.to_string(), conn_shutdown)
                                .await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                    }
                },
                _ = shutdown.recv() => {
                    tracing::info!("Cluster server shutting down");
                    break;
                }
            }
        }
    }

    /// Serve one connection from handshake to close
    pub async fn handle_connection<S>(
        &self,
        stream: S,
        address: String,
        mut shutdown: broadcast::Receiver<()>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let (peer, outbound) = match self.handshake(&mut reader, &mut writer, &address).await {
            Ok(admitted) => admitted,
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "Handshake rejected");
                let _ = writer.shutdown().await;
                return;
            }
        };
        let name = peer.name().to_string();
        let (stop_writer, writer_stop) = oneshot::channel();
        let writer_task = tokio::spawn(write_loop(writer, outbound, writer_stop, name.clone()));

        let mut left = false;
        loop {
            tokio::select! {
                frame = read_frame(&mut reader) => match frame {
                    Ok(Some(Frame::Request { id, command, payload })) => {
                        let command = Command::parse(&command);
                        let reply = self.dispatch(&name, &command, payload).await;
                        if let Err(e) = peer.respond(id, reply).await {
                            tracing::warn!(node = %name, error = %e, "Cannot answer request");
                            break;
                        }
                        if command == Command::Bye {
                            left = true;
                            break;
                        }
                    }
                    Ok(Some(Frame::Response { id, status, payload })) => {
                        peer.complete(id, Reply { status, payload }).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(node = %name, error = %e, "Connection error");
                        break;
                    }
                },
                _ = peer.closed() => {
                    tracing::info!(node = %name, address = %peer.address(), "Session replaced by a new connection");
                    break;
                }
                _ = shutdown.recv() => break,
            }
        }

        if left {
            self.state.registry.remove(&name, &peer).await;
        } else {
            self.state.registry.disconnect(&name, &peer).await;
        }
        peer.close().await;

        // Let queued frames (the bye acknowledgement) reach the socket
        let _ = stop_writer.send(());
        if tokio::time::timeout(self.state.config.socket_timeout(), writer_task)
            .await
            .is_err()
        {
            tracing::debug!(node = %name, "Writer did not finish in time");
        }
    }

    /// Validate the hello frame and register the node
    async fn handshake<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        address: &str,
    ) -> Result<(Arc<Peer>, mpsc::Receiver<Frame>), ConvoyError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let first = tokio::time::timeout(self.state.config.connection_timeout(), read_frame(reader))
            .await
            .map_err(|_| ConvoyError::Timeout(address.to_string()))??;

        let Some(Frame::Request { id, command, payload }) = first else {
            return Err(ConvoyError::Protocol("expected hello".into()));
        };
        if Command::parse(&command) != Command::Hello {
            write_frame(writer, &Reply::err("expected hello").into_frame(id)).await?;
            return Err(ConvoyError::Protocol(format!(
                "expected hello, got '{}'",
                command
            )));
        }

        match self.admit(&payload, address).await {
            Ok(admitted) => {
                write_frame(writer, &Reply::ok(self.state.node_name.as_str()).into_frame(id)).await?;
                Ok(admitted)
            }
            Err(e) => {
                write_frame(writer, &Reply::err(&e).into_frame(id)).await?;
                Err(e)
            }
        }
    }

    async fn admit(
        &self,
        payload: &[u8],
        address: &str,
    ) -> Result<(Arc<Peer>, mpsc::Receiver<Frame>), ConvoyError> {
        let hello: Hello = serde_json::from_slice(payload)?;

        if hello.key_digest != self.state.key_digest() {
            return Err(ConvoyError::Protocol("invalid cluster key".into()));
        }
        if hello.name.is_empty() || hello.name == self.state.node_name {
            return Err(ConvoyError::Protocol(format!(
                "invalid node name '{}'",
                hello.name
            )));
        }

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let peer = Arc::new(Peer::new(&hello.name, address, tx));

        self.state
            .registry
            .connect(NodeRecord::new(&hello.name, NodeRole::Worker, address), peer.clone())
            .await?;

        Ok((peer, rx))
    }

    /// Answer one request from a worker
    pub async fn dispatch(&self, node: &str, command: &Command, payload: Vec<u8>) -> Reply {
        match command {
            Command::Echo => Reply::ok(payload),
            Command::RequestSync => {
                tracing::debug!(node = %node, "Worker requested sync permission");
                Reply::ack("Starting sync from worker")
            }
            Command::UploadSync => {
                if spawn_sync(&self.state, node, payload).await {
                    Reply::ack("Files received")
                } else {
                    Reply::err("sync already in progress")
                }
            }
            Command::Bye => Reply::ack("Bye"),
            other => {
                tracing::warn!(node = %node, command = %other, "Unrecognized command");
                Reply::err(format!("unrecognized command '{}'", other))
            }
        }
    }

    /// Send one request to one node
    pub async fn send(&self, node: &str, command: &Command, payload: Vec<u8>) -> NodeOutcome {
        let Some(record) = self.state.registry.get(node).await else {
            return NodeOutcome::Failed {
                reason: format!("unknown node '{}'", node),
            };
        };
        let Some(peer) = self.state.registry.peer(node).await else {
            return NodeOutcome::Disconnected {
                address: record.address,
            };
        };

        let result = peer
            .request(command, payload, self.state.config.socket_timeout())
            .await;
        NodeOutcome::from_result(result, &record.address)
    }
}

#[async_trait]
impl Fanout for ClusterServer {
    async fn connected_count(&self) -> usize {
        self.state.registry.connected_count().await
    }

    async fn broadcast(&self, command: &Command, payload: &[u8]) -> Vec<(String, NodeOutcome)> {
        let timeout = self.state.config.socket_timeout();
        let workers = self.state.registry.workers().await;

        let mut pending: FuturesUnordered<_> = workers
            .into_iter()
            .map(|(record, peer)| {
                let payload = payload.to_vec();
                async move {
                    let outcome = match peer {
                        Some(peer) => NodeOutcome::from_result(
                            peer.request(command, payload, timeout).await,
                            &record.address,
                        ),
                        None => NodeOutcome::Disconnected {
                            address: record.address.clone(),
                        },
                    };
                    (record.name, outcome)
                }
            })
            .collect();

        let mut outcomes = Vec::with_capacity(pending.len());
        while let Some((node, outcome)) = pending.next().await {
            if !outcome.is_success() {
                tracing::debug!(node = %node, command = %command, outcome = %outcome, "Broadcast miss");
            }
            outcomes.push((node, outcome));
        }
        outcomes
    }
}

/// Drain the outbound queue into the socket until stopped
async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Frame>,
    mut stop: oneshot::Receiver<()>,
    node: String,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        tracing::warn!(node = %node, error = %e, "Cannot write frame");
                        return;
                    }
                }
                None => break,
            },
            _ = &mut stop => {
                outbound.close();
                while let Some(frame) = outbound.recv().await {
                    if write_frame(&mut writer, &frame).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}
