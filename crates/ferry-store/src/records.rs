//! JSON record files: atomic writes, reads, and directory listings.

use crate::{fsync_dir, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Write `content` to `dest` via a temp file in the same directory, then
/// rename and fsync the directory.
pub(crate) fn write_atomic(dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

pub(crate) fn write_json<T: Serialize>(dest: &Path, value: &T) -> Result<(), StoreError> {
    let content = serde_json::to_string_pretty(value)?;
    write_atomic(dest, content.as_bytes())
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Record file name for an id.
pub(crate) fn record_file(id: &str) -> String {
    format!("{id}.json")
}

/// Ids of every `*.json` record in `dir`, sorted. Hidden and temp files are skipped.
pub(crate) fn list_ids(dir: &Path) -> Result<Vec<String>, StoreError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_str().unwrap_or("");
        if name.starts_with('.') {
            continue;
        }
        if let Some(id) = name.strip_suffix(".json") {
            ids.push(id.to_owned());
        }
    }
    ids.sort();
    Ok(ids)
}
