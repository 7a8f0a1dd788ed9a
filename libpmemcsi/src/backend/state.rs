//! Per-volume records the node agent persists across restarts.
//!
//! # On-disk layout
//!
//! ```text
//! <state_dir>/
//!   <volume-id>.json        # VolumeRecord
//!   <volume-id>.json.tmp    # in-flight write, renamed into place
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CsiError;
use crate::pool::BackingHandle;
use crate::types::{Volume, VolumeCapability, VolumeId, VolumeState};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Staging {
    pub path: String,
    pub capability: VolumeCapability,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Publication {
    pub target_path: String,
    pub read_only: bool,
}

/// Everything the node knows about one of its volumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeRecord {
    pub volume: Volume,
    pub handle: BackingHandle,
    /// Wipe the backing storage when the volume is deleted.
    pub erase_after: bool,
    /// Created inline by stage; deleted again by unstage.
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub state: VolumeState,
    #[serde(default)]
    pub staging: Option<Staging>,
    #[serde(default)]
    pub published: Option<Publication>,
}

impl VolumeRecord {
    pub fn id(&self) -> &VolumeId {
        &self.volume.volume_id
    }
}

/// Directory of [`VolumeRecord`] sidecar files.
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: &VolumeId) -> PathBuf {
        self.dir.join(format!("{}.json", id.0))
    }

    /// Write `record` atomically: a crash leaves either the old or the new
    /// file, never a torn one.
    pub async fn save(&self, record: &VolumeRecord) -> Result<(), CsiError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CsiError::BackendError(format!("create {}: {e}", self.dir.display())))?;
        let path = self.path(record.id());
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record).map_err(CsiError::backend)?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| CsiError::BackendError(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CsiError::BackendError(format!("rename {}: {e}", path.display())))?;
        debug!(volume_id = %record.id(), state = ?record.state, "record saved");
        Ok(())
    }

    pub async fn remove(&self, id: &VolumeId) -> Result<(), CsiError> {
        match tokio::fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CsiError::BackendError(format!("remove record {id}: {e}"))),
        }
    }

    /// Every readable record.  Unreadable or unparsable files are skipped
    /// with a warning.
    pub async fn load_all(&self) -> Result<Vec<VolumeRecord>, CsiError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CsiError::BackendError(format!(
                    "read_dir {}: {e}",
                    self.dir.display()
                )));
            }
        };

        let mut records = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(CsiError::backend)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let json = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read volume record, skipping");
                    continue;
                }
            };
            match serde_json::from_slice::<VolumeRecord>(&json) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse volume record, skipping");
                }
            }
        }
        records.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceMode;

    fn record(id: &str) -> VolumeRecord {
        VolumeRecord {
            volume: Volume {
                volume_id: VolumeId::from(id),
                capacity_bytes: 1 << 30,
                device_mode: DeviceMode::Lvm,
                parameters: Default::default(),
                volume_context: Default::default(),
                accessible_topology: Vec::new(),
                condition: None,
            },
            handle: BackingHandle::Lvm {
                volume_group: "ndbus0region0fsdax".into(),
                name: id.into(),
                device_path: format!("/dev/ndbus0region0fsdax/{id}"),
            },
            erase_after: true,
            ephemeral: false,
            state: VolumeState::Created,
            staging: None,
            published: None,
        }
    }

    #[tokio::test]
    async fn save_load_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path().join("state"));
        assert!(store.load_all().await.unwrap().is_empty());

        let mut rec = record("pmem-b");
        store.save(&rec).await.unwrap();
        store.save(&record("pmem-a")).await.unwrap();

        rec.state = VolumeState::Staged;
        rec.staging = Some(Staging {
            path: "/stage/b".into(),
            capability: VolumeCapability::mount("xfs"),
        });
        store.save(&rec).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id().0, "pmem-a");
        assert_eq!(loaded[1], rec);

        store.remove(rec.id()).await.unwrap();
        store.remove(rec.id()).await.unwrap();
        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_records_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        store.save(&record("pmem-good")).await.unwrap();
        tokio::fs::write(tmp.path().join("pmem-bad.json"), b"{not json")
            .await
            .unwrap();
        tokio::fs::write(tmp.path().join("stray.json.tmp"), b"{}")
            .await
            .unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id().0, "pmem-good");
    }
}
