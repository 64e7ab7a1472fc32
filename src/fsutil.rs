//! Small filesystem helpers shared by the file-backed stores.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::errors::StoreError;

/// Maps an arbitrary key to a safe file name component.
pub(crate) fn file_component(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for c in key.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
            name.push(c);
        } else {
            name.push_str(&format!("_{:02x}", c as u32));
        }
    }
    if name.starts_with('.') {
        name.replace_range(0..1, "_2e");
    }
    name
}

/// Path of a scratch file next to `path`, unique to this process and call.
pub(crate) fn scratch_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.{}.tmp", std::process::id(), uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

/// Replaces `path` with `bytes` so readers never see a partial file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let scratch = scratch_path(path);
    let mut file = fs::File::create(&scratch)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&scratch, path)?;
    Ok(())
}

/// Reads a JSON file, `None` if it does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Removes a file, `false` if it was already gone.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Files in `dir` with the given extension; an absent directory is empty.
pub(crate) fn files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some(extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_component_escapes_separators() {
        assert_eq!(file_component("app-1"), "app-1");
        assert_eq!(file_component("a/b"), "a_2fb");
        assert_eq!(file_component(".."), "_2e.");
        assert!(!file_component("../etc/passwd").contains('/'));
    }

    #[test]
    fn test_write_atomic_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("value.json");
        write_atomic(&path, b"[1, 2, 3]").unwrap();

        let value: Option<Vec<u32>> = read_json(&path).unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
        assert_eq!(files_with_extension(&path.parent().unwrap(), "json").unwrap().len(), 1);
    }

    #[test]
    fn test_missing_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let value: Option<u32> = read_json(&path).unwrap();
        assert!(value.is_none());
        assert!(!remove_if_exists(&path).unwrap());
        assert!(files_with_extension(&dir.path().join("nope"), "json").unwrap().is_empty());
    }
}
