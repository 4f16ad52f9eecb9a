//! Atomic JSON side-files
//!
//! A handful of state files are read by external tools (dashboards,
//! editors) while the daemon is running, so they stay as JSON on disk.
//! Writes go through a sibling temp file followed by a rename; a reader
//! never observes a partial write.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::warn;

use crate::{Result, StoreError};

/// Write a value as pretty JSON via temp-file + rename
pub fn write_json_atomic<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::Io(std::io::Error::other("path has no file name")))?;
    let tmp_path = path.with_file_name(format!(".{}.tmp-{}", file_name, std::process::id()));

    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Read a JSON file, falling back to the type's default
///
/// A missing file is normal (first run); a corrupted file is logged and
/// treated as empty rather than crashing the caller.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: impl AsRef<Path>) -> T {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupted JSON file, treating as empty");
                T::default()
            }
        },
        Err(_) => T::default(),
    }
}

/// Read a JSON file, returning None when missing or corrupted
pub fn read_json_opt<T: DeserializeOwned>(path: impl AsRef<Path>) -> Option<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupted JSON file, ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_write_and_read_roundtrip() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("sample.json");

        let value = Sample {
            name: "test".to_string(),
            count: 7,
        };
        write_json_atomic(&path, &value).unwrap();

        let read: Sample = read_json_or_default(&path);
        assert_eq!(read, value);
    }

    #[test]
    fn test_write_creates_parent_dirs() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("deep").join("sample.json");

        write_json_atomic(&path, &Sample::default()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let temp = tempdir().unwrap();
        let read: Sample = read_json_or_default(temp.path().join("nope.json"));
        assert_eq!(read, Sample::default());
    }

    #[test]
    fn test_corrupted_file_returns_default() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("bad.json");
        std::fs::write(&path, "{not json!").unwrap();

        let read: Sample = read_json_or_default(&path);
        assert_eq!(read, Sample::default());
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("sample.json");

        write_json_atomic(&path, &Sample::default()).unwrap();

        let entries: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["sample.json".to_string()]);
    }

    #[test]
    fn test_read_json_opt() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("sample.json");

        assert!(read_json_opt::<Sample>(&path).is_none());

        write_json_atomic(&path, &Sample { name: "x".into(), count: 1 }).unwrap();
        assert!(read_json_opt::<Sample>(&path).is_some());

        std::fs::write(&path, "garbage").unwrap();
        assert!(read_json_opt::<Sample>(&path).is_none());
    }
}
