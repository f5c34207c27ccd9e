//! Atomic JSON record read/write
//!
//! Writes go to a uniquely-named temp file in the target directory, then
//! rename into place. Rename is atomic on a single filesystem, so readers
//! see either the old record or the new one, never a torn write.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::error::StateError;

/// Write a JSON record with atomic replace semantics
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;

    // Temp file must live in the same directory as the target so the
    // rename stays on one filesystem.
    let tmp = parent.join(format!(".{}.tmp", Uuid::now_v7()));

    let body = serde_json::to_vec_pretty(value).map_err(|e| StateError::Malformed {
        path: path.to_path_buf(),
        source: e,
    })?;

    fs::write(&tmp, &body).map_err(|e| StateError::io(&tmp, e))?;

    if let Err(e) = fs::rename(&tmp, path) {
        // Best effort: don't leave temp droppings behind
        let _ = fs::remove_file(&tmp);
        return Err(StateError::io(path, e));
    }

    debug!(path = %path.display(), bytes = body.len(), "wrote record");
    Ok(())
}

/// Read a JSON record; `Ok(None)` when the file does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StateError::io(path, e)),
    };

    let value = serde_json::from_str(&content).map_err(|e| StateError::Malformed {
        path: path.to_path_buf(),
        source: e,
    })?;

    Ok(Some(value))
}

/// List the `.json` files directly under a directory
///
/// A missing directory is an empty listing, not an error. Temp files from
/// in-flight atomic writes are skipped.
pub fn list_json_files(dir: &Path) -> Result<Vec<PathBuf>, StateError> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StateError::io(dir, e)),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StateError::io(dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Remove a file, treating "already gone" as success
pub fn remove_file_if_exists(path: &Path) -> Result<bool, StateError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StateError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        id: String,
        count: u32,
    }

    #[test]
    fn test_write_read_round_trip() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("record.json");

        let record = Record {
            id: "r-1".to_string(),
            count: 42,
        };

        write_json_atomic(&path, &record).unwrap();
        let loaded: Record = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_read_missing_is_none() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nope.json");

        let loaded: Option<Record> = read_json(&path).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_write_creates_parent_dirs() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("a").join("b").join("record.json");

        let record = Record {
            id: "deep".to_string(),
            count: 1,
        };
        write_json_atomic(&path, &record).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_overwrite_replaces() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("record.json");

        write_json_atomic(
            &path,
            &Record {
                id: "r".to_string(),
                count: 1,
            },
        )
        .unwrap();
        write_json_atomic(
            &path,
            &Record {
                id: "r".to_string(),
                count: 2,
            },
        )
        .unwrap();

        let loaded: Record = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded.count, 2);
    }

    #[test]
    fn test_no_temp_droppings() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("record.json");

        write_json_atomic(
            &path,
            &Record {
                id: "r".to_string(),
                count: 1,
            },
        )
        .unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_list_json_files() {
        let temp = tempdir().unwrap();

        write_json_atomic(
            &temp.path().join("b.json"),
            &Record {
                id: "b".to_string(),
                count: 1,
            },
        )
        .unwrap();
        write_json_atomic(
            &temp.path().join("a.json"),
            &Record {
                id: "a".to_string(),
                count: 1,
            },
        )
        .unwrap();
        std::fs::write(temp.path().join("notes.txt"), "skip me").unwrap();

        let files = list_json_files(temp.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.json"));
        assert!(files[1].ends_with("b.json"));
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let temp = tempdir().unwrap();
        let files = list_json_files(&temp.path().join("nowhere")).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_remove_if_exists() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("record.json");

        write_json_atomic(
            &path,
            &Record {
                id: "r".to_string(),
                count: 1,
            },
        )
        .unwrap();

        assert!(remove_file_if_exists(&path).unwrap());
        assert!(!remove_file_if_exists(&path).unwrap());
    }
}
