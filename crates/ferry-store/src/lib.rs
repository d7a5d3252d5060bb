//! File-backed record store for ferry.
//!
//! This crate persists the records the build pipeline consumes: modules and
//! their versions (`ModuleStore`, with an atomic publish transition),
//! projects (`ProjectStore`), and builds (`BuildStore`, with an atomic
//! read-modify-write under the store lock). `StoreLayout` owns the directory
//! structure and format version; `StoreLock` serializes writers across
//! threads and processes.

pub mod builds;
pub mod layout;
pub mod lock;
pub mod modules;
pub mod projects;
mod records;

pub use builds::BuildStore;
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use lock::StoreLock;
pub use modules::{ModuleStore, VersionDraft};
pub use projects::ProjectStore;

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for record '{id}': expected {expected}, got {actual}")]
    IntegrityFailure {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("invalid resource path '{}': {reason}", path.display())]
    InvalidResourcePath { path: PathBuf, reason: String },
}

impl StoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<ferry_schema::SchemaError> for StoreError {
    fn from(e: ferry_schema::SchemaError) -> Self {
        StoreError::InvalidName(e.to_string())
    }
}

/// All record stores over one root, sharing a layout.
#[derive(Debug, Clone)]
pub struct Store {
    layout: StoreLayout,
    pub modules: ModuleStore,
    pub projects: ProjectStore,
    pub builds: BuildStore,
}

impl Store {
    /// Open the store at `root`, creating the layout on first use.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let layout = StoreLayout::new(root);
        layout.initialize()?;
        Ok(Self {
            modules: ModuleStore::new(layout.clone()),
            projects: ProjectStore::new(layout.clone()),
            builds: BuildStore::new(layout.clone()),
            layout,
        })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Soft-deactivate a module. Refused while any active project links it.
    pub fn deactivate_module(&self, name: &str) -> Result<(), StoreError> {
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        let users: Vec<String> = self
            .projects
            .list()?
            .into_iter()
            .filter(|p| p.active && p.modules.iter().any(|m| m.module == name))
            .map(|p| p.id.into_inner())
            .collect();
        if !users.is_empty() {
            return Err(StoreError::Conflict(format!(
                "module '{name}' is referenced by active project(s): {}",
                users.join(", ")
            )));
        }
        self.modules.set_active_locked(name, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_not_found() {
        let e = StoreError::not_found("build", "b-1");
        assert_eq!(e.to_string(), "build not found: b-1");
    }

    #[test]
    fn error_display_version_mismatch() {
        let e = StoreError::VersionMismatch {
            expected: 2,
            found: 1,
        };
        let msg = e.to_string();
        assert!(msg.contains('2'));
        assert!(msg.contains('1'));
    }

    #[test]
    fn open_initializes_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(store.layout().modules_dir().is_dir());
        assert!(store.layout().builds_dir().is_dir());
    }
}
