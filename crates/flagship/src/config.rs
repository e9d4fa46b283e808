//! Configuration management for Flagship.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use convoy_common::ConvoyError;
use convoy_common::constants::{
    DEFAULT_BIND_ADDR, DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_CONTROL_SOCKET, DEFAULT_DATA_DIR,
    DEFAULT_FORCE_SYNC_TIMEOUT_SECS, DEFAULT_KEEP_ALIVE_INTERVAL_SECS, DEFAULT_PORT,
    DEFAULT_SOCKET_TIMEOUT_SECS,
};

/// Cluster configuration, loaded once and shared read-only
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// This master's node name (auto-generated if not set)
    #[serde(default = "generate_node_name")]
    pub node_name: String,

    /// Cluster listen address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Cluster listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared secret every worker must present in its handshake
    #[serde(default)]
    pub key: String,

    /// Handshake deadline for new connections
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Deadline for a node's answer to a request
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout_secs: u64,

    /// Keep-alive broadcast period
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_secs: u64,

    /// Deadline for force-sync requests
    #[serde(default = "default_force_sync_timeout")]
    pub force_sync_timeout_secs: u64,

    /// Root of the master's synchronized tree
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Local operator socket
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,

    /// Cluster item policy table
    #[serde(default)]
    pub cluster_items: ClusterItems,
}

/// Cluster item key → item
pub type ClusterItems = HashMap<String, ClusterItem>;

/// Which side owns the files of a cluster item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemSource {
    Master,
    Worker,
    All,
}

/// How a synchronized file replaces the previous version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Write to a temporary file, then rename over the target
    Atomic,
    /// Truncate and write the target in place
    Overwrite,
}

/// One entry of the cluster item policy table
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterItem {
    /// Directory (relative to the data dir) holding this item's files
    pub path: String,

    /// Walk subdirectories too
    #[serde(default)]
    pub recursive: bool,

    #[serde(default = "default_source")]
    pub source: ItemSource,

    #[serde(default = "default_write_mode")]
    pub write_mode: WriteMode,

    /// Creation umask, any integer literal ("0o117", "0117", "0x4f", "79")
    #[serde(default = "default_umask")]
    pub umask: String,
}

/// Resolved write policy for a single file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilePolicy {
    pub write_mode: WriteMode,
    pub umask: u32,
}

impl ClusterItem {
    /// Resolve this item's write policy
    pub fn policy(&self, key: &str) -> Result<FilePolicy, ConvoyError> {
        let umask = parse_umask(&self.umask).ok_or_else(|| ConvoyError::PolicyResolution {
            file: self.path.clone(),
            key: key.to_string(),
        })?;

        Ok(FilePolicy {
            write_mode: self.write_mode,
            umask,
        })
    }

    /// True if the master's own tree is authoritative for this item
    pub fn is_master_owned(&self) -> bool {
        matches!(self.source, ItemSource::Master | ItemSource::All)
    }

    /// True if workers may push files of this item to the master
    pub fn accepts_worker_files(&self) -> bool {
        matches!(self.source, ItemSource::Worker | ItemSource::All)
    }

    /// True if the cluster file `name` lies under this item's directory,
    /// directly or (for recursive items) in a subdirectory
    pub fn contains(&self, name: &str) -> bool {
        let dir = self.path.trim_matches('/');
        let Some(rest) = name
            .trim_start_matches('/')
            .strip_prefix(dir)
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return false;
        };

        if rest
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return false;
        }
        self.recursive || !rest.contains('/')
    }
}

/// Parse an integer literal with auto-detected base
fn parse_umask(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    let value = if let Some(oct) = raw.strip_prefix("0o").or_else(|| raw.strip_prefix("0O")) {
        u32::from_str_radix(oct, 8).ok()?
    } else if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()?
    } else if raw.len() > 1 && raw.starts_with('0') {
        u32::from_str_radix(&raw[1..], 8).ok()?
    } else {
        raw.parse().ok()?
    };

    (value <= 0o777).then_some(value)
}

// Default value functions
fn default_bind_addr() -> String { DEFAULT_BIND_ADDR.to_string() }
fn default_port() -> u16 { DEFAULT_PORT }
fn default_connection_timeout() -> u64 { DEFAULT_CONNECTION_TIMEOUT_SECS }
fn default_socket_timeout() -> u64 { DEFAULT_SOCKET_TIMEOUT_SECS }
fn default_keep_alive_interval() -> u64 { DEFAULT_KEEP_ALIVE_INTERVAL_SECS }
fn default_force_sync_timeout() -> u64 { DEFAULT_FORCE_SYNC_TIMEOUT_SECS }
fn default_data_dir() -> PathBuf { PathBuf::from(DEFAULT_DATA_DIR) }
fn default_control_socket() -> PathBuf { PathBuf::from(DEFAULT_CONTROL_SOCKET) }
fn default_source() -> ItemSource { ItemSource::Master }
fn default_write_mode() -> WriteMode { WriteMode::Atomic }
fn default_umask() -> String { "0o117".to_string() } // rw-rw----

fn generate_node_name() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("master-{:08x}", rng.random::<u32>())
}

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, args: &super::ServeArgs) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            // Use defaults if config file doesn't exist
            tracing::warn!("Config file not found, using defaults");
            Self::default()
        };

        // Apply CLI overrides
        if let Some(ref bind) = args.bind {
            config.bind_addr = bind.clone();
        }
        if let Some(port) = args.port {
            config.port = port;
        }
        if let Some(ref key) = args.key {
            config.key = key.clone();
        }
        if let Some(ref socket) = args.control_socket {
            config.control_socket = socket.clone();
        }

        Ok(config)
    }

    /// Reject configurations the cluster cannot run with
    pub fn validate(&self) -> Result<(), ConvoyError> {
        if self.key.is_empty() {
            return Err(ConvoyError::Config("cluster key is not set".into()));
        }
        if self.port == 0 {
            return Err(ConvoyError::Config("cluster port must be non-zero".into()));
        }
        if self.connection_timeout_secs == 0
            || self.socket_timeout_secs == 0
            || self.force_sync_timeout_secs == 0
        {
            return Err(ConvoyError::Config("timeouts must be non-zero".into()));
        }
        if self.keep_alive_interval_secs == 0 {
            return Err(ConvoyError::Config(
                "keep-alive interval must be non-zero".into(),
            ));
        }
        for (key, item) in &self.cluster_items {
            if parse_umask(&item.umask).is_none() {
                return Err(ConvoyError::Config(format!(
                    "cluster item '{}' has invalid umask '{}'",
                    key, item.umask
                )));
            }
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn force_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.force_sync_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_name: generate_node_name(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            key: String::new(),
            connection_timeout_secs: default_connection_timeout(),
            socket_timeout_secs: default_socket_timeout(),
            keep_alive_interval_secs: default_keep_alive_interval(),
            force_sync_timeout_secs: default_force_sync_timeout(),
            data_dir: default_data_dir(),
            control_socket: default_control_socket(),
            cluster_items: ClusterItems::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(umask: &str) -> ClusterItem {
        ClusterItem {
            path: "etc/shared".to_string(),
            recursive: true,
            source: ItemSource::Master,
            write_mode: WriteMode::Atomic,
            umask: umask.to_string(),
        }
    }

    #[test]
    fn test_parse_umask_bases() {
        assert_eq!(parse_umask("0o117"), Some(0o117));
        assert_eq!(parse_umask("0117"), Some(0o117));
        assert_eq!(parse_umask("0x4f"), Some(0o117));
        assert_eq!(parse_umask("79"), Some(0o117));
        assert_eq!(parse_umask("0"), Some(0));
        assert_eq!(parse_umask("0o999"), None);
        assert_eq!(parse_umask("rw"), None);
        assert_eq!(parse_umask("0o7777"), None);
    }

    #[test]
    fn test_item_policy() {
        let policy = item("0o027").policy("shared").unwrap();
        assert_eq!(policy.umask, 0o027);
        assert_eq!(policy.write_mode, WriteMode::Atomic);

        let err = item("bogus").policy("shared").unwrap_err();
        assert!(matches!(err, ConvoyError::PolicyResolution { .. }));
    }

    #[test]
    fn test_item_contains() {
        let shared = item("0o117");
        assert!(shared.contains("/etc/shared/agent.conf"));
        assert!(shared.contains("/etc/shared/default/merged.mg"));
        assert!(!shared.contains("/etc/shared"));
        assert!(!shared.contains("/etc/sharedx/agent.conf"));
        assert!(!shared.contains("/etc/ossec.conf"));
        assert!(!shared.contains("/etc/shared/../ossec.conf"));
        assert!(!shared.contains("/etc/shared//agent.conf"));

        let flat = ClusterItem {
            path: "queue/agent-info".to_string(),
            recursive: false,
            source: ItemSource::Worker,
            write_mode: WriteMode::Overwrite,
            umask: "0o117".to_string(),
        };
        assert!(flat.contains("/queue/agent-info/worker-1"));
        assert!(!flat.contains("/queue/agent-info/nested/worker-1"));
        assert!(flat.accepts_worker_files());
        assert!(!shared.accepts_worker_files());
    }

    #[test]
    fn test_validate() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_err());

        config.key = "0123456789abcdef".to_string();
        assert!(config.validate().is_ok());

        config.cluster_items.insert("shared".to_string(), item("0o9"));
        assert!(matches!(config.validate(), Err(ConvoyError::Config(_))));
    }

    #[test]
    fn test_deserialize_items() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                key = "secret"
                port = 1600

                [cluster_items.shared]
                path = "etc/shared"
                recursive = true
                umask = "0o117"

                [cluster_items.agent_info]
                path = "queue/agent-info"
                source = "worker"
                write_mode = "overwrite"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: AppConfig = settings.try_deserialize().unwrap();

        assert_eq!(config.port, 1600);
        assert_eq!(config.cluster_items.len(), 2);
        let agent_info = &config.cluster_items["agent_info"];
        assert_eq!(agent_info.source, ItemSource::Worker);
        assert_eq!(agent_info.write_mode, WriteMode::Overwrite);
        assert!(!agent_info.is_master_owned());
        assert!(config.node_name.starts_with("master-"));
    }
}
