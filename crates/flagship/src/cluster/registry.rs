//! Node registry and per-connection peer handles.
//!
//! The registry is the only mutable structure shared by the accept loop,
//! the keep-alive loop and every broadcast caller. All access goes through
//! its methods; readers get snapshots, never the backing map.

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, mpsc, oneshot};

use convoy_common::{ConvoyError, NodeRecord, NodeRole, NodeStatus};

use crate::protocol::{Command, Frame, Reply, ReplyStatus};

/// Outcome of one request to one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NodeOutcome {
    /// The node answered; non-UTF-8 payloads are rendered as `base64:<data>`
    Replied {
        status: ReplyStatus,
        payload: String,
    },
    TimedOut,
    Disconnected {
        address: String,
    },
    Failed {
        reason: String,
    },
}

impl NodeOutcome {
    pub fn replied(reply: &Reply) -> Self {
        let payload = match std::str::from_utf8(&reply.payload) {
            Ok(text) => text.to_string(),
            Err(_) => format!("base64:{}", STANDARD.encode(&reply.payload)),
        };
        Self::Replied {
            status: reply.status,
            payload,
        }
    }

    /// Fold a request result into an outcome
    pub fn from_result(result: Result<Reply, ConvoyError>, address: &str) -> Self {
        match result {
            Ok(reply) => Self::replied(&reply),
            Err(ConvoyError::Timeout(_)) => Self::TimedOut,
            Err(ConvoyError::Disconnected(_)) => Self::Disconnected {
                address: address.to_string(),
            },
            Err(e) => Self::Failed {
                reason: e.to_string(),
            },
        }
    }

    /// True for a non-error, non-empty reply
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Replied { status, payload } if *status != ReplyStatus::Err && !payload.is_empty()
        )
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replied { payload, .. } => f.write_str(payload),
            Self::TimedOut => f.write_str("Timed out"),
            Self::Disconnected { address } => write!(f, "Disconnected: {}", address),
            Self::Failed { reason } => write!(f, "Failed: {}", reason),
        }
    }
}

/// Handle to a connected node: queues outbound frames and correlates
/// the node's responses with the requests waiting for them
pub struct Peer {
    name: String,
    address: String,
    outbound: mpsc::Sender<Frame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_id: AtomicU64,
    closed: Notify,
}

impl Peer {
    pub fn new(name: impl Into<String>, address: impl Into<String>, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send a request and wait for the node's reply, bounded by `timeout`
    pub async fn request(
        &self,
        command: &Command,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Reply, ConvoyError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = Frame::Request {
            id,
            command: command.to_string(),
            payload,
        };
        let exchange = async {
            self.outbound
                .send(frame)
                .await
                .map_err(|_| ConvoyError::Disconnected(self.name.clone()))?;
            rx.await
                .map_err(|_| ConvoyError::Disconnected(self.name.clone()))
        };

        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ConvoyError::Timeout(self.name.clone())),
        };
        if result.is_err() {
            self.pending.lock().await.remove(&id);
        }

        result
    }

    /// Hand a response frame to the request waiting for it
    pub async fn complete(&self, id: u64, reply: Reply) -> bool {
        match self.pending.lock().await.remove(&id) {
            Some(waiter) => waiter.send(reply).is_ok(),
            None => {
                tracing::debug!(node = %self.name, id, "Response for unknown request");
                false
            }
        }
    }

    /// Answer a request the node sent us
    pub async fn respond(&self, id: u64, reply: Reply) -> Result<(), ConvoyError> {
        self.outbound
            .send(reply.into_frame(id))
            .await
            .map_err(|_| ConvoyError::Disconnected(self.name.clone()))
    }

    /// Fail every waiting request with `Disconnected` and wake the
    /// connection task serving this peer
    pub async fn close(&self) {
        self.pending.lock().await.clear();
        self.closed.notify_one();
    }

    /// Resolves once the peer has been closed
    pub async fn closed(&self) {
        self.closed.notified().await
    }
}

struct NodeEntry {
    record: NodeRecord,
    peer: Option<Arc<Peer>>,
}

/// Registry of every node known to the master
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<String, NodeEntry>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the master itself (no connection)
    pub async fn register_local(&self, record: NodeRecord) {
        let mut nodes = self.nodes.write().await;
        nodes.insert(record.name.clone(), NodeEntry { record, peer: None });
    }

    /// Register a node after a successful handshake.
    /// A session still registered under the same name is replaced and closed.
    pub async fn connect(&self, mut record: NodeRecord, peer: Arc<Peer>) -> Result<(), ConvoyError> {
        let replaced = {
            let mut nodes = self.nodes.write().await;
            if nodes
                .get(&record.name)
                .is_some_and(|e| e.record.role == NodeRole::Master)
            {
                return Err(ConvoyError::Protocol(format!(
                    "node name '{}' is taken by the master",
                    record.name
                )));
            }

            record.status = NodeStatus::Connected;
            tracing::info!(node = %record.name, address = %record.address, "Node connected");
            nodes
                .insert(
                    record.name.clone(),
                    NodeEntry {
                        record,
                        peer: Some(peer),
                    },
                )
                .and_then(|old| old.peer)
        };

        if let Some(stale) = replaced {
            tracing::warn!(
                node = %stale.name(),
                address = %stale.address(),
                "Replacing previous session"
            );
            stale.close().await;
        }
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<NodeRecord> {
        self.nodes.read().await.get(name).map(|e| e.record.clone())
    }

    /// Connection handle of a connected node
    pub async fn peer(&self, name: &str) -> Option<Arc<Peer>> {
        self.nodes.read().await.get(name).and_then(|e| e.peer.clone())
    }

    /// Update a node's status. Marking a node connected requires a live peer;
    /// marking it disconnected drops the peer.
    #[cfg(test)]
    pub async fn set_status(&self, name: &str, status: NodeStatus) -> bool {
        let mut nodes = self.nodes.write().await;
        let Some(entry) = nodes.get_mut(name) else {
            return false;
        };

        match status {
            NodeStatus::Connected if entry.peer.is_none() => false,
            NodeStatus::Connected => {
                entry.record.status = status;
                true
            }
            NodeStatus::Disconnected => {
                entry.record.status = status;
                entry.peer = None;
                true
            }
        }
    }

    /// Mark a node disconnected, unless it has reconnected through another peer
    pub async fn disconnect(&self, name: &str, peer: &Arc<Peer>) -> bool {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(name) {
            Some(entry) if entry.peer.as_ref().is_some_and(|p| Arc::ptr_eq(p, peer)) => {
                entry.record.status = NodeStatus::Disconnected;
                entry.peer = None;
                tracing::warn!(node = %name, "Node disconnected");
                true
            }
            _ => false,
        }
    }

    /// Forget a node that left explicitly
    pub async fn remove(&self, name: &str, peer: &Arc<Peer>) -> Option<NodeRecord> {
        let mut nodes = self.nodes.write().await;
        let owned = nodes
            .get(name)
            .and_then(|e| e.peer.as_ref())
            .is_some_and(|p| Arc::ptr_eq(p, peer));
        if !owned {
            return None;
        }

        tracing::info!(node = %name, "Node left the cluster");
        nodes.remove(name).map(|e| e.record)
    }

    /// Snapshot of every node, sorted by name
    pub async fn nodes(&self) -> Vec<NodeRecord> {
        let mut records: Vec<_> = self
            .nodes
            .read()
            .await
            .values()
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Snapshot of every worker with its peer (None when disconnected)
    pub async fn workers(&self) -> Vec<(NodeRecord, Option<Arc<Peer>>)> {
        let mut workers: Vec<_> = self
            .nodes
            .read()
            .await
            .values()
            .filter(|e| e.record.role == NodeRole::Worker)
            .map(|e| (e.record.clone(), e.peer.clone()))
            .collect();
        workers.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        workers
    }

    /// Number of connected workers
    pub async fn connected_count(&self) -> usize {
        self.nodes
            .read()
            .await
            .values()
            .filter(|e| e.record.role == NodeRole::Worker && e.peer.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> (Arc<Peer>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(Peer::new(name, "10.0.0.2:4000", tx)), rx)
    }

    fn worker(name: &str) -> NodeRecord {
        NodeRecord::new(name, NodeRole::Worker, "10.0.0.2:4000")
    }

    #[tokio::test]
    async fn test_reconnect_replaces_live_session() {
        let registry = NodeRegistry::new();
        let (p1, mut rx1) = peer("w1");
        let (p2, _rx2) = peer("w1");
        registry.connect(worker("w1"), p1.clone()).await.unwrap();

        let waiter = {
            let p1 = p1.clone();
            tokio::spawn(async move {
                p1.request(&Command::Echo, Vec::new(), Duration::from_secs(30))
                    .await
            })
        };
        assert!(rx1.recv().await.is_some());

        // The old session never saw EOF; a new hello still gets in
        registry.connect(worker("w1"), p2.clone()).await.unwrap();
        assert_eq!(registry.connected_count().await, 1);
        assert!(Arc::ptr_eq(&registry.peer("w1").await.unwrap(), &p2));

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ConvoyError::Disconnected(_))));
        tokio::time::timeout(Duration::from_secs(1), p1.closed())
            .await
            .unwrap();

        // The old session's teardown leaves the new one alone
        assert!(!registry.disconnect("w1", &p1).await);
        assert!(registry.get("w1").await.unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_master_name_cannot_be_taken() {
        let registry = NodeRegistry::new();
        registry
            .register_local(NodeRecord::new("master", NodeRole::Master, "0.0.0.0:1516"))
            .await;
        let (p, _rx) = peer("master");

        assert!(registry.connect(worker("master"), p).await.is_err());
        assert_eq!(registry.get("master").await.unwrap().role, NodeRole::Master);
    }

    #[tokio::test]
    async fn test_stale_peer_cannot_disconnect_new_session() {
        let registry = NodeRegistry::new();
        let (old, _rx1) = peer("w1");
        let (new, _rx2) = peer("w1");

        registry.connect(worker("w1"), old.clone()).await.unwrap();
        registry.set_status("w1", NodeStatus::Disconnected).await;
        registry.connect(worker("w1"), new.clone()).await.unwrap();

        assert!(!registry.disconnect("w1", &old).await);
        assert!(registry.remove("w1", &old).await.is_none());
        assert!(registry.get("w1").await.unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_set_status_requires_peer() {
        let registry = NodeRegistry::new();
        let (p, _rx) = peer("w1");
        registry.connect(worker("w1"), p).await.unwrap();

        assert!(registry.set_status("w1", NodeStatus::Disconnected).await);
        assert!(registry.peer("w1").await.is_none());
        assert!(!registry.set_status("w1", NodeStatus::Connected).await);
        assert!(!registry.set_status("ghost", NodeStatus::Disconnected).await);
    }

    #[tokio::test]
    async fn test_workers_snapshot_skips_master() {
        let registry = NodeRegistry::new();
        registry
            .register_local(NodeRecord::new("master", NodeRole::Master, "0.0.0.0:1516"))
            .await;
        let (p, _rx) = peer("w2");
        registry.connect(worker("w2"), p.clone()).await.unwrap();
        let (q, _rx2) = peer("w1");
        registry.connect(worker("w1"), q).await.unwrap();

        let workers = registry.workers().await;
        let names: Vec<_> = workers.iter().map(|(r, _)| r.name.as_str()).collect();
        assert_eq!(names, vec!["w1", "w2"]);
        assert_eq!(registry.nodes().await.len(), 3);

        assert!(registry.remove("w2", &p).await.is_some());
        assert!(registry.get("w2").await.is_none());
    }

    #[tokio::test]
    async fn test_request_reply_correlation() {
        let (p, mut rx) = peer("w1");
        let worker = {
            let p = p.clone();
            tokio::spawn(async move {
                while let Some(Frame::Request { id, payload, .. }) = rx.recv().await {
                    p.complete(id, Reply::ok(payload)).await;
                }
            })
        };

        let reply = p
            .request(&Command::Echo, b"ping".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, Reply::ok("ping"));

        drop(p);
        worker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_clears_pending() {
        let (p, _rx) = peer("w1");

        let result = p
            .request(&Command::Echo, Vec::new(), Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(ConvoyError::Timeout(_))));
        assert!(!p.complete(1, Reply::ok("late")).await);
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let (p, mut rx) = peer("w1");
        let waiter = {
            let p = p.clone();
            tokio::spawn(async move {
                p.request(&Command::Echo, Vec::new(), Duration::from_secs(30))
                    .await
            })
        };

        // Wait until the request is on the wire, then drop the connection
        assert!(rx.recv().await.is_some());
        p.close().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ConvoyError::Disconnected(_))));
    }

    #[test]
    fn test_outcome_rendering() {
        let outcome = NodeOutcome::from_result(
            Err(ConvoyError::Disconnected("w1".into())),
            "10.0.0.2:4000",
        );
        assert_eq!(outcome.to_string(), "Disconnected: 10.0.0.2:4000");
        assert!(!outcome.is_success());

        let binary = NodeOutcome::replied(&Reply::ok(vec![0xff, 0xfe]));
        assert_eq!(
            binary,
            NodeOutcome::Replied {
                status: ReplyStatus::Ok,
                payload: "base64://4=".to_string()
            }
        );

        let json = serde_json::to_value(NodeOutcome::TimedOut).unwrap();
        assert_eq!(json["outcome"], "timed_out");
    }
}
