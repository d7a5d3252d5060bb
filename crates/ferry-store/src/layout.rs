use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout under a ferry root.
///
/// ```text
/// <root>/store/{version,.lock,.runner.lock,modules/,projects/,builds/}
/// <root>/resources/<module>/<version>/...
/// <root>/work/<build_id>/
/// <root>/artifacts/<build_id>/installer.tar.gz
/// <root>/staging/
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    #[inline]
    pub fn modules_dir(&self) -> PathBuf {
        self.store_dir().join("modules")
    }

    #[inline]
    pub fn projects_dir(&self) -> PathBuf {
        self.store_dir().join("projects")
    }

    #[inline]
    pub fn builds_dir(&self) -> PathBuf {
        self.store_dir().join("builds")
    }

    #[inline]
    pub fn resources_dir(&self, module: &str, version: &str) -> PathBuf {
        self.root.join("resources").join(module).join(version)
    }

    /// Scratch space owned by one build; image blobs are written here.
    #[inline]
    pub fn work_dir(&self, build_id: &str) -> PathBuf {
        self.root.join("work").join(build_id)
    }

    /// Held by whichever process is executing the build.
    #[inline]
    pub fn build_owner_lock_file(&self, build_id: &str) -> PathBuf {
        self.work_dir(build_id).join(".owner.lock")
    }

    #[inline]
    pub fn artifacts_dir(&self, build_id: &str) -> PathBuf {
        self.root.join("artifacts").join(build_id)
    }

    #[inline]
    pub fn installer_path(&self, build_id: &str) -> PathBuf {
        self.artifacts_dir(build_id).join("installer.tar.gz")
    }

    /// Temporary area for archive assembly before the atomic publish.
    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.store_dir().join(".lock")
    }

    /// Held for the lifetime of the process that executes builds.
    #[inline]
    pub fn runner_lock_file(&self) -> PathBuf {
        self.store_dir().join(".runner.lock")
    }

    /// Installer path as recorded on a build: relative to the root.
    pub fn installer_download(build_id: &str) -> String {
        format!("artifacts/{build_id}/installer.tar.gz")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.modules_dir())?;
        fs::create_dir_all(self.projects_dir())?;
        fs::create_dir_all(self.builds_dir())?;
        fs::create_dir_all(self.root.join("resources"))?;
        fs::create_dir_all(self.root.join("work"))?;
        fs::create_dir_all(self.root.join("artifacts"))?;
        fs::create_dir_all(self.staging_dir())?;

        let version_path = self.store_dir().join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            crate::records::write_atomic(&version_path, content.as_bytes())?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.store_dir().join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
