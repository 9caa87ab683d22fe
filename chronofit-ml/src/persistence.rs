//! Atomic file writes and JSON load/save for run artifacts.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

/// Sibling temp path: `<name>.tmp`, keeping the full original name.
fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("artifact"));
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically write raw bytes to a file.
///
/// Writes to a `.tmp` sibling, then renames onto the target. Creates parent
/// directories if they don't exist.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Serialize to pretty JSON and write atomically. Returns the written bytes.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<Vec<u8>> {
    let json = serde_json::to_vec_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, &json)?;
    Ok(json)
}

/// Load and deserialize JSON; `Ok(None)` if the file doesn't exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path)?;
    let value =
        serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        name: String,
        step: u64,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("entry.json");
        let data = Entry {
            name: "last".into(),
            step: 42,
        };
        let bytes = atomic_write_json(&path, &data).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
        let loaded: Option<Entry> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));
    }

    #[test]
    fn test_tmp_keeps_dotted_names() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("epoch=1-step=2-val_loss=0.5000.ckpt");
        assert_eq!(
            tmp_path(&path).file_name().unwrap(),
            "epoch=1-step=2-val_loss=0.5000.ckpt.tmp"
        );
        atomic_write(&path, b"x").unwrap();
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_load_json_nonexistent() {
        let result: io::Result<Option<Entry>> = load_json(Path::new("/nonexistent/file.json"));
        assert!(result.unwrap().is_none());
    }
}
