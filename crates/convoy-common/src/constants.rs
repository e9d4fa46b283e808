//! Shared constants for Convoy components.

/// Default cluster listen address
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";

/// Default cluster port
pub const DEFAULT_PORT: u16 = 1516;

/// Default local control socket
pub const DEFAULT_CONTROL_SOCKET: &str = "/var/run/convoy/flagship.sock";

/// Default root of the master's synchronized tree
pub const DEFAULT_DATA_DIR: &str = "/var/lib/convoy";

/// Time allowed for a new connection to complete its handshake (seconds)
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Time allowed for a node to answer a request (seconds)
pub const DEFAULT_SOCKET_TIMEOUT_SECS: u64 = 30;

/// Keep-alive broadcast interval (seconds)
pub const DEFAULT_KEEP_ALIVE_INTERVAL_SECS: u64 = 30;

/// Connection and socket timeout applied to force-sync requests (seconds)
pub const DEFAULT_FORCE_SYNC_TIMEOUT_SECS: u64 = 100;

/// Fixed width of a plain protocol message; force-sync pads up to it
pub const PROTOCOL_PLAIN_SIZE: usize = 100;

/// Largest frame accepted on a cluster connection (64 MiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Payload of the master's keep-alive echo
pub const HEARTBEAT_MARKER: &str = "Keep-alive from master!";

/// Control-channel target addressing every node
pub const ALL_NODES: &str = "all";

/// Bundle layout
pub mod bundle {
    /// Reserved entry carrying the structured control payload
    pub const CONTROL_ENTRY: &str = "cluster_control.json";

    /// Prefix of every file entry inside a bundle
    pub const FILES_PREFIX: &str = "files/";
}

/// Command names used on the wire and on the control channel
pub mod commands {
    /// Worker handshake: {name, key_digest}
    pub const HELLO: &str = "hello";

    /// Liveness check, answered with the same payload
    pub const ECHO: &str = "echo";

    /// Worker announces it wants to sync
    pub const REQUEST_SYNC: &str = "request-sync";

    /// Worker pushes its bundle for reconciliation
    pub const UPLOAD_SYNC: &str = "upload-sync";

    /// Master pushes its correction bundle back to the worker
    pub const SYNC_REPLY: &str = "sync-reply";

    /// Master tells a worker to start a sync cycle now
    pub const FORCE_SYNC: &str = "force-sync";

    /// Local file-status summary (control channel only)
    pub const FILE_STATUS: &str = "file-status";

    /// Worker leaves the cluster
    pub const BYE: &str = "bye";
}
