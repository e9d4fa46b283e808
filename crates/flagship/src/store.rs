//! Master file tree access.
//!
//! Cluster file names look absolute (`/etc/shared/agent.conf`) and are
//! resolved under the configured data directory. Writers to the same path
//! are serialized; writers to different paths run in parallel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

use convoy_common::{ConvoyError, Manifest, ManifestEntry};

use crate::config::{ClusterItems, FilePolicy, WriteMode};

/// File content plus modification time (Unix epoch seconds)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileData {
    pub data: Vec<u8>,
    pub mtime: i64,
}

/// Persistence collaborator for the master's tree
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Manifest of every master-owned file under the cluster items
    async fn files_status(&self, items: &ClusterItems) -> Result<Manifest, ConvoyError>;

    async fn read_file(&self, name: &str) -> Result<FileData, ConvoyError>;

    /// Persist one file with its policy and mtime; `actor` names the writer for logs
    async fn write_file(
        &self,
        name: &str,
        file: &FileData,
        policy: &FilePolicy,
        actor: &str,
    ) -> Result<(), ConvoyError>;
}

/// File store backed by a local directory
pub struct LocalFileStore {
    root: PathBuf,
    /// One lock per target path
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Map a cluster file name to a path under the root
    pub fn resolve(&self, name: &str) -> Result<PathBuf, ConvoyError> {
        let relative = name.trim_start_matches('/');
        if relative.is_empty() {
            return Err(ConvoyError::InvalidPath(name.to_string()));
        }

        let mut path = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return Err(ConvoyError::InvalidPath(name.to_string())),
            }
        }

        Ok(path)
    }

    async fn path_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry for `path` once no writer holds or waits on it
    async fn release_lock(&self, path: &Path, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        drop(lock);
        if locks.get(path).is_some_and(|held| Arc::strong_count(held) == 1) {
            locks.remove(path);
        }
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn files_status(&self, items: &ClusterItems) -> Result<Manifest, ConvoyError> {
        let root = self.root.clone();
        let items: Vec<(String, PathBuf, bool)> = items
            .iter()
            .filter(|(_, item)| item.is_master_owned())
            .map(|(key, item)| (key.clone(), root.join(&item.path), item.recursive))
            .collect();

        tokio::task::spawn_blocking(move || scan_items(&root, &items))
            .await
            .map_err(|e| ConvoyError::Io(std::io::Error::other(e)))?
    }

    async fn read_file(&self, name: &str) -> Result<FileData, ConvoyError> {
        let path = self.resolve(name)?;
        let data = tokio::fs::read(&path).await?;
        let mtime = tokio::fs::metadata(&path)
            .await?
            .modified()
            .map(to_epoch_secs)?;

        Ok(FileData { data, mtime })
    }

    async fn write_file(
        &self,
        name: &str,
        file: &FileData,
        policy: &FilePolicy,
        actor: &str,
    ) -> Result<(), ConvoyError> {
        let path = self.resolve(name)?;
        let lock = self.path_lock(&path).await;

        let written = {
            let _guard = lock.lock().await;
            let target = path.clone();
            let file = file.clone();
            let policy = *policy;
            tokio::task::spawn_blocking(move || write_blocking(&target, &file, &policy))
                .await
                .map_err(|e| std::io::Error::other(e))
                .and_then(|r| r)
        };
        self.release_lock(&path, lock).await;

        written.map_err(|e| ConvoyError::Persistence {
            path: name.to_string(),
            reason: e.to_string(),
        })?;

        tracing::debug!(file = %name, actor = %actor, "File updated");
        Ok(())
    }
}

fn scan_items(root: &Path, items: &[(String, PathBuf, bool)]) -> Result<Manifest, ConvoyError> {
    let mut manifest = Manifest::new();

    for (key, dir, recursive) in items {
        if !dir.exists() {
            tracing::debug!(item = %key, dir = %dir.display(), "Cluster item directory missing");
            continue;
        }

        let walker = walkdir::WalkDir::new(dir)
            .min_depth(1)
            .max_depth(if *recursive { usize::MAX } else { 1 });

        for entry in walker {
            let entry = entry.map_err(|e| ConvoyError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let name = format!(
                "/{}",
                relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/")
            );

            let content = std::fs::read(entry.path())?;
            manifest.insert(name, ManifestEntry::new(checksum(&content), key.clone()));
        }
    }

    Ok(manifest)
}

fn write_blocking(path: &Path, file: &FileData, policy: &FilePolicy) -> std::io::Result<()> {
    use std::io::Write;

    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let staging = match policy.write_mode {
        WriteMode::Atomic => {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            parent.join(format!(".{}.{}.tmp", file_name, std::process::id()))
        }
        WriteMode::Overwrite => path.to_path_buf(),
    };

    let mut out = std::fs::File::create(&staging)?;
    out.write_all(&file.data)?;
    out.sync_all()?;
    out.set_modified(from_epoch_secs(file.mtime))?;
    drop(out);

    set_mode(&staging, 0o666 & !policy.umask)?;

    if staging != path {
        if let Err(e) = std::fs::rename(&staging, path) {
            let _ = std::fs::remove_file(&staging);
            return Err(e);
        }
    }

    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Hex SHA-256 of a file's content
pub fn checksum(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

fn to_epoch_secs(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn from_epoch_secs(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterItem, ItemSource};

    fn items() -> ClusterItems {
        let mut items = ClusterItems::new();
        items.insert(
            "shared".to_string(),
            ClusterItem {
                path: "etc/shared".to_string(),
                recursive: true,
                source: ItemSource::Master,
                write_mode: WriteMode::Atomic,
                umask: "0o117".to_string(),
            },
        );
        items.insert(
            "agent_info".to_string(),
            ClusterItem {
                path: "queue/agent-info".to_string(),
                recursive: false,
                source: ItemSource::Worker,
                write_mode: WriteMode::Overwrite,
                umask: "0o117".to_string(),
            },
        );
        items
    }

    fn atomic() -> FilePolicy {
        FilePolicy {
            write_mode: WriteMode::Atomic,
            umask: 0o117,
        }
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let store = LocalFileStore::new("/srv/convoy");
        assert_eq!(
            store.resolve("/etc/shared/a.conf").unwrap(),
            PathBuf::from("/srv/convoy/etc/shared/a.conf")
        );
        assert!(store.resolve("/etc/../../passwd").is_err());
        assert!(store.resolve("/").is_err());
        assert!(store.resolve("").is_err());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        let file = FileData {
            data: b"group default".to_vec(),
            mtime: 1_600_000_000,
        };

        store
            .write_file("/etc/shared/agent.conf", &file, &atomic(), "master")
            .await
            .unwrap();

        let read = store.read_file("/etc/shared/agent.conf").await.unwrap();
        assert_eq!(read, file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = std::fs::metadata(dir.path().join("etc/shared/agent.conf")).unwrap();
            assert_eq!(meta.permissions().mode() & 0o777, 0o660);
        }

        // No staging files left behind
        let leftovers = std::fs::read_dir(dir.path().join("etc/shared"))
            .unwrap()
            .count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_overwrite_mode() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        let policy = FilePolicy {
            write_mode: WriteMode::Overwrite,
            umask: 0o022,
        };

        for content in [&b"first"[..], &b"second"[..]] {
            let file = FileData {
                data: content.to_vec(),
                mtime: 1_700_000_000,
            };
            store
                .write_file("/queue/agent-info/w1", &file, &policy, "master")
                .await
                .unwrap();
        }

        let read = store.read_file("/queue/agent-info/w1").await.unwrap();
        assert_eq!(read.data, b"second");
    }

    #[tokio::test]
    async fn test_files_status_only_master_items() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("etc/shared/default")).unwrap();
        std::fs::create_dir_all(root.join("queue/agent-info")).unwrap();
        std::fs::write(root.join("etc/shared/agent.conf"), b"a").unwrap();
        std::fs::write(root.join("etc/shared/default/merged.mg"), b"b").unwrap();
        std::fs::write(root.join("queue/agent-info/w1"), b"c").unwrap();

        let store = LocalFileStore::new(root);
        let manifest = store.files_status(&items()).await.unwrap();

        assert_eq!(manifest.len(), 2);
        let entry = &manifest["/etc/shared/default/merged.mg"];
        assert_eq!(entry.cluster_item_key, "shared");
        assert_eq!(entry.checksum, checksum(b"b"));
        assert!(!manifest.contains_key("/queue/agent-info/w1"));
    }

    #[tokio::test]
    async fn test_write_outside_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        let file = FileData {
            data: Vec::new(),
            mtime: 0,
        };

        let result = store
            .write_file("/etc/../../escape", &file, &atomic(), "master")
            .await;
        assert!(matches!(result, Err(ConvoyError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_one_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalFileStore::new(dir.path()));
        let contents: Vec<Vec<u8>> = (0..16)
            .map(|i| format!("<agent_config rev=\"{}\"/>", i).repeat(256).into_bytes())
            .collect();

        let writers: Vec<_> = contents
            .iter()
            .cloned()
            .map(|data| {
                let store = store.clone();
                tokio::spawn(async move {
                    let file = FileData {
                        data,
                        mtime: 1_650_000_000,
                    };
                    store
                        .write_file("/etc/shared/agent.conf", &file, &atomic(), "worker-1")
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let written = std::fs::read(dir.path().join("etc/shared/agent.conf")).unwrap();
        assert!(contents.contains(&written));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("etc/shared"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .filter(|name| name != "agent.conf")
            .collect();
        assert!(leftovers.is_empty(), "stray files: {:?}", leftovers);

        assert!(store.locks.lock().await.is_empty());
    }
}
