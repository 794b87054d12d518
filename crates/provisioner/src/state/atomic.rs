//! Atomic JSON documents with rotated backups.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::PersistenceError;

/// Read a JSON document. A missing file is `Ok(None)`; a file that does not
/// parse is an error and is left on disk.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistenceError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PersistenceError::io(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| PersistenceError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Write `value` to `path` through a temp file in the same directory and an
/// atomic rename. The previous document is first copied to a timestamped
/// backup, keeping at most `max_backups` of them.
pub(crate) fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
    max_backups: usize,
) -> Result<(), PersistenceError> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir).map_err(|e| PersistenceError::io(dir, e))?;

    let content = serde_json::to_string_pretty(value)?;

    if max_backups > 0 && path.exists() {
        rotate_backups(path, max_backups)?;
    }

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| PersistenceError::io(dir, e))?;
    tmp.write_all(content.as_bytes())
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| PersistenceError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| PersistenceError::io(path, e.error))?;

    debug!(path = %path.display(), "Wrote state document");
    Ok(())
}

/// Existing backups of `path`, oldest first.
#[must_use]
pub fn backups(path: &Path) -> Vec<PathBuf> {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return Vec::new();
    };
    let prefix = format!("{file_name}.");
    let Ok(entries) = fs::read_dir(parent_dir(path)) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".bak"))
        })
        .collect();
    found.sort();
    found
}

fn rotate_backups(path: &Path, max_backups: usize) -> Result<(), PersistenceError> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
    let mut backup = path.as_os_str().to_owned();
    backup.push(format!(".{stamp}.bak"));
    fs::copy(path, &backup).map_err(|e| PersistenceError::io(path, e))?;

    let existing = backups(path);
    let excess = existing.len().saturating_sub(max_backups);
    for old in existing.into_iter().take(excess) {
        if let Err(e) = fs::remove_file(&old) {
            warn!(path = %old.display(), error = %e, "Failed to prune old backup");
        }
    }
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let value: Option<BTreeMap<String, u32>> = read_json(&dir.path().join("none.json")).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_corrupt_file_is_error_and_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        let err = read_json::<BTreeMap<String, u32>>(&path).unwrap_err();
        assert!(matches!(err, PersistenceError::Corrupt { .. }));
        assert!(path.exists());
    }

    #[test]
    fn test_backups_are_rotated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        for i in 0..6u32 {
            write_json_atomic(&path, &i, 3).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let value: u32 = read_json(&path).unwrap().unwrap();
        assert_eq!(value, 5);
        let kept = backups(&path);
        assert_eq!(kept.len(), 3);
        let newest: u32 = read_json(kept.last().unwrap()).unwrap().unwrap();
        assert_eq!(newest, 4);
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &"hello", 0).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("state.json")]);
    }
}
