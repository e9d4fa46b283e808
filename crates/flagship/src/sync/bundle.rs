//! File bundles: the compressed transport unit of a sync cycle.
//!
//! Layout: lz4 (size-prepended) over a bincode archive of
//! `{ origin, entries[] }`. File entries live under `files/<path>`; the
//! structured control payload lives in the reserved `cluster_control.json`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use convoy_common::constants::bundle::{CONTROL_ENTRY, FILES_PREFIX};
use convoy_common::{ConvoyError, NodeRole};

use crate::store::{FileData, FileStore};

#[derive(Serialize, Deserialize)]
struct Archive {
    origin: NodeRole,
    entries: Vec<ArchiveEntry>,
}

#[derive(Serialize, Deserialize)]
struct ArchiveEntry {
    name: String,
    data: Vec<u8>,
    mtime: i64,
}

/// A decoded bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    /// Role of the node that built the bundle
    pub origin: NodeRole,

    /// Normalized file name (`/etc/x`) → content
    pub files: BTreeMap<String, FileData>,

    /// Raw control entry, if present
    pub control: Option<Vec<u8>>,
}

impl Bundle {
    pub fn new(origin: NodeRole) -> Self {
        Self {
            origin,
            files: BTreeMap::new(),
            control: None,
        }
    }

    /// Parse the control entry as JSON
    pub fn control_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConvoyError> {
        let raw = self
            .control
            .as_deref()
            .ok_or_else(|| ConvoyError::Codec(format!("bundle has no {}", CONTROL_ENTRY)))?;
        serde_json::from_slice(raw)
            .map_err(|e| ConvoyError::Codec(format!("invalid {}: {}", CONTROL_ENTRY, e)))
    }
}

/// Encode a bundle
pub fn compress(bundle: &Bundle) -> Result<Vec<u8>, ConvoyError> {
    let mut entries: Vec<ArchiveEntry> = bundle
        .files
        .iter()
        .map(|(name, file)| ArchiveEntry {
            name: format!("{}{}", FILES_PREFIX, name.trim_start_matches('/')),
            data: file.data.clone(),
            mtime: file.mtime,
        })
        .collect();

    if let Some(control) = &bundle.control {
        entries.push(ArchiveEntry {
            name: CONTROL_ENTRY.to_string(),
            data: control.clone(),
            mtime: chrono::Utc::now().timestamp(),
        });
    }

    let archive = Archive {
        origin: bundle.origin,
        entries,
    };
    let raw = bincode::serialize(&archive)
        .map_err(|e| ConvoyError::Codec(format!("cannot encode bundle: {}", e)))?;

    Ok(lz4_flex::compress_prepend_size(&raw))
}

/// Largest uncompressed bundle accepted (512 MiB)
const MAX_BUNDLE_SIZE: usize = 512 * 1024 * 1024;

/// Decode a bundle, normalizing `files/etc/x` to `/etc/x`
pub fn decompress(bytes: &[u8]) -> Result<Bundle, ConvoyError> {
    let declared = bytes
        .get(..4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
        .ok_or_else(|| ConvoyError::Codec("bundle too short".into()))?;
    if declared > MAX_BUNDLE_SIZE {
        return Err(ConvoyError::Codec(format!(
            "bundle too large: {} bytes",
            declared
        )));
    }

    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| ConvoyError::Codec(format!("cannot decompress bundle: {}", e)))?;
    let archive: Archive = bincode::deserialize(&raw)
        .map_err(|e| ConvoyError::Codec(format!("cannot decode bundle: {}", e)))?;

    let mut bundle = Bundle::new(archive.origin);
    for entry in archive.entries {
        if entry.name == CONTROL_ENTRY {
            bundle.control = Some(entry.data);
            continue;
        }

        let Some(path) = entry.name.strip_prefix(FILES_PREFIX) else {
            return Err(ConvoyError::Codec(format!(
                "unexpected bundle entry '{}'",
                entry.name
            )));
        };
        bundle.files.insert(
            format!("/{}", path),
            FileData {
                data: entry.data,
                mtime: entry.mtime,
            },
        );
    }

    Ok(bundle)
}

/// Read `paths` from the store and pack them with a JSON control payload
pub async fn compress_files<C: Serialize>(
    store: &dyn FileStore,
    origin: NodeRole,
    paths: &[String],
    control: &C,
) -> Result<Vec<u8>, ConvoyError> {
    let mut bundle = Bundle::new(origin);
    for path in paths {
        let file = store.read_file(path).await?;
        bundle.files.insert(path.clone(), file);
    }
    bundle.control = Some(serde_json::to_vec(control)?);

    compress(&bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalFileStore;
    use convoy_common::SyncControl;

    #[test]
    fn test_files_are_normalized() {
        let mut bundle = Bundle::new(NodeRole::Worker);
        bundle.files.insert(
            "/queue/agent-info/w1".to_string(),
            FileData {
                data: b"linux".to_vec(),
                mtime: 42,
            },
        );
        bundle.control = Some(serde_json::to_vec(&SyncControl::default()).unwrap());

        let decoded = decompress(&compress(&bundle).unwrap()).unwrap();

        assert_eq!(decoded.origin, NodeRole::Worker);
        assert_eq!(decoded.files, bundle.files);
        let control: SyncControl = decoded.control_as().unwrap();
        assert!(control.worker_files.is_empty());
    }

    #[test]
    fn test_missing_control_entry() {
        let bundle = Bundle::new(NodeRole::Worker);
        let decoded = decompress(&compress(&bundle).unwrap()).unwrap();
        assert!(matches!(
            decoded.control_as::<SyncControl>(),
            Err(ConvoyError::Codec(_))
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            decompress(b"\x05\x00\x00\x00abc"),
            Err(ConvoyError::Codec(_))
        ));
        assert!(matches!(decompress(b"ab"), Err(ConvoyError::Codec(_))));
        assert!(matches!(
            decompress(b"\xff\xff\xff\xffabc"),
            Err(ConvoyError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn test_compress_files_reads_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc/shared")).unwrap();
        std::fs::write(dir.path().join("etc/shared/agent.conf"), b"<agent_config/>").unwrap();
        let store = LocalFileStore::new(dir.path());

        let bytes = compress_files(
            &store,
            NodeRole::Master,
            &["/etc/shared/agent.conf".to_string()],
            &serde_json::json!({"note": "hello"}),
        )
        .await
        .unwrap();

        let bundle = decompress(&bytes).unwrap();
        assert_eq!(bundle.origin, NodeRole::Master);
        assert_eq!(bundle.files["/etc/shared/agent.conf"].data, b"<agent_config/>");
        let control: serde_json::Value = bundle.control_as().unwrap();
        assert_eq!(control["note"], "hello");
    }
}
