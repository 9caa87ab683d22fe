//! Checkpoint storage for training runs.
//!
//! Snapshots are JSON files in one directory per run. The directory carries a
//! `checkpoints.json` manifest with one entry per file: kind, monitored value,
//! SHA-256 of the file contents, size and creation time.

use crate::error::MlError;
use crate::model::ParameterSet;
use crate::persistence::{atomic_write_json, load_json};
use crate::training::callbacks::CheckpointKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const MANIFEST: &str = "checkpoints.json";

/// Persisted training state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub epoch: usize,
    pub global_step: u64,
    pub monitor: Option<f64>,
    pub params: ParameterSet,
    /// Callback state keyed by callback name.
    pub callbacks: BTreeMap<String, Value>,
}

/// Manifest entry for one snapshot file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub id: String,
    pub filename: String,
    pub kind: CheckpointKind,
    pub epoch: usize,
    pub global_step: u64,
    pub monitor: Option<f64>,
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Checkpoint directory shared by every checkpoint policy of a run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    /// Manifest entries, oldest first.
    pub fn list(&self) -> Result<Vec<CheckpointEntry>, MlError> {
        Ok(load_json(&self.dir.join(MANIFEST))?.unwrap_or_default())
    }

    /// The best-kind entry with the lowest monitored value.
    pub fn best(&self) -> Result<Option<CheckpointEntry>, MlError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|c| c.kind == CheckpointKind::Best)
            .filter(|c| c.monitor.is_some_and(f64::is_finite))
            .min_by(|a, b| {
                a.monitor
                    .partial_cmp(&b.monitor)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }))
    }

    /// Write `snapshot` as `filename`, replacing any entry of the same name.
    pub fn save(
        &self,
        filename: &str,
        kind: CheckpointKind,
        snapshot: &Snapshot,
    ) -> Result<CheckpointEntry, MlError> {
        let bytes = atomic_write_json(&self.path_of(filename), snapshot).map_err(|e| {
            MlError::checkpoint(format!("cannot write {filename} in {}: {e}", self.dir.display()))
        })?;
        let entry = CheckpointEntry {
            id: uuid::Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            kind,
            epoch: snapshot.epoch,
            global_step: snapshot.global_step,
            monitor: snapshot.monitor,
            hash: format!("{:x}", Sha256::digest(&bytes)),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };

        let mut entries = self.list()?;
        entries.retain(|c| c.filename != filename);
        entries.push(entry.clone());
        self.write_manifest(&entries)?;
        Ok(entry)
    }

    /// Load a snapshot, verifying its hash against the manifest.
    pub fn load(&self, filename: &str) -> Result<Snapshot, MlError> {
        let entry = self
            .list()?
            .into_iter()
            .find(|c| c.filename == filename)
            .ok_or_else(|| MlError::checkpoint(format!("{filename} is not in the manifest")))?;
        let bytes = std::fs::read(self.path_of(filename))?;
        let hash = format!("{:x}", Sha256::digest(&bytes));
        if hash != entry.hash {
            return Err(MlError::checkpoint(format!(
                "{filename} does not match its manifest hash"
            )));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Delete a snapshot file and its manifest entry.
    pub fn remove(&self, filename: &str) -> Result<(), MlError> {
        let path = self.path_of(filename);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let mut entries = self.list()?;
        entries.retain(|c| c.filename != filename);
        self.write_manifest(&entries)
    }

    fn write_manifest(&self, entries: &[CheckpointEntry]) -> Result<(), MlError> {
        atomic_write_json(&self.dir.join(MANIFEST), &entries)
            .map_err(|e| MlError::checkpoint(format!("cannot update manifest: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Parameter;
    use pretty_assertions::assert_eq;

    fn snapshot(epoch: usize, monitor: f64) -> Snapshot {
        Snapshot {
            epoch,
            global_step: epoch as u64 * 10,
            monitor: Some(monitor),
            params: ParameterSet::new(vec![Parameter::new("w", vec![epoch as f32])]),
            callbacks: BTreeMap::from([("ema".to_string(), serde_json::json!({"decay": 0.9}))]),
        }
    }

    #[test]
    fn test_save_load_and_best() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("ckpt"));
        store.save("a.ckpt", CheckpointKind::Best, &snapshot(1, 0.5)).unwrap();
        store.save("b.ckpt", CheckpointKind::Best, &snapshot(2, 0.3)).unwrap();
        store.save("last.ckpt", CheckpointKind::Last, &snapshot(3, 0.1)).unwrap();

        assert_eq!(store.list().unwrap().len(), 3);
        assert_eq!(store.best().unwrap().unwrap().filename, "b.ckpt");
        assert_eq!(store.load("b.ckpt").unwrap(), snapshot(2, 0.3));
    }

    #[test]
    fn test_save_replaces_same_filename() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf());
        store.save("last.ckpt", CheckpointKind::Last, &snapshot(1, 0.5)).unwrap();
        store.save("last.ckpt", CheckpointKind::Last, &snapshot(2, 0.4)).unwrap();
        let entries = store.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].epoch, 2);
    }

    #[test]
    fn test_remove_deletes_file_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf());
        store.save("a.ckpt", CheckpointKind::Best, &snapshot(1, 0.5)).unwrap();
        store.remove("a.ckpt").unwrap();
        assert!(!store.path_of("a.ckpt").exists());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_tampered_file_fails_hash_check() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf());
        store.save("a.ckpt", CheckpointKind::Best, &snapshot(1, 0.5)).unwrap();
        std::fs::write(store.path_of("a.ckpt"), b"{}").unwrap();
        assert!(matches!(store.load("a.ckpt"), Err(MlError::Checkpoint(_))));
    }

    #[test]
    fn test_unwritable_dir_is_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let store = CheckpointStore::new(blocker.join("ckpt"));
        let err = store
            .save("a.ckpt", CheckpointKind::Best, &snapshot(1, 0.5))
            .unwrap_err();
        assert!(matches!(err, MlError::Checkpoint(_)));
    }
}
