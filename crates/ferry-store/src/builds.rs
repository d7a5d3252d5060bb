use crate::layout::StoreLayout;
use crate::lock::StoreLock;
use crate::records::{list_ids, read_json, record_file, write_json};
use crate::{now_rfc3339, StoreError};
use ferry_schema::{Build, BuildId, ProjectId};
use std::fs;
use std::path::PathBuf;

/// Compute the checksum over a build record, excluding the checksum field itself.
fn compute_checksum(build: &Build) -> Result<String, StoreError> {
    let mut copy = build.clone();
    copy.checksum = None;
    let json = serde_json::to_string_pretty(&copy)?;
    Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
}

#[derive(Debug, Clone)]
pub struct BuildStore {
    layout: StoreLayout,
}

impl BuildStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.layout.builds_dir().join(record_file(id))
    }

    fn put(&self, build: &Build) -> Result<(), StoreError> {
        let mut with_checksum = build.clone();
        with_checksum.checksum = Some(compute_checksum(build)?);
        write_json(&self.path(&build.id), &with_checksum)
    }

    /// Create a queued build. A fresh v4 UUID is generated when `id` is `None`.
    pub fn create(
        &self,
        id: Option<BuildId>,
        name: &str,
        project: Option<ProjectId>,
        owner: Option<String>,
    ) -> Result<Build, StoreError> {
        let id = id.unwrap_or_else(|| BuildId::new(uuid::Uuid::new_v4().to_string()));
        if id.is_empty() || id.contains(['/', '\\', '.']) {
            return Err(StoreError::InvalidName(format!("invalid build id '{id}'")));
        }
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        if self.path(&id).exists() {
            return Err(StoreError::Conflict(format!("build '{id}' already exists")));
        }
        let mut build = Build::new(id, name.to_owned(), project, now_rfc3339());
        build.owner = owner;
        self.put(&build)?;
        tracing::debug!("created build {}", build.id);
        Ok(build)
    }

    /// Read a build, verifying its checksum when present.
    pub fn get(&self, id: &str) -> Result<Build, StoreError> {
        let path = self.path(id);
        if !path.exists() {
            return Err(StoreError::not_found("build", id));
        }
        let build: Build = read_json(&path)?;
        if let Some(ref expected) = build.checksum {
            let actual = compute_checksum(&build)?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    id: id.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(build)
    }

    /// Builds that are not soft-deleted, oldest first. Corrupted records are
    /// skipped with a warning.
    pub fn list(&self) -> Result<Vec<Build>, StoreError> {
        let mut builds: Vec<Build> = self
            .list_with_errors()?
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(b) => Some(b),
                Err((id, e)) => {
                    tracing::warn!("skipping corrupted build record '{id}': {e}");
                    None
                }
            })
            .filter(|b| !b.deleted)
            .collect();
        builds.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(builds)
    }

    /// Like `list()`, but returns per-entry results so callers can surface
    /// individual corruption errors.
    #[allow(clippy::type_complexity)]
    pub fn list_with_errors(&self) -> Result<Vec<Result<Build, (String, StoreError)>>, StoreError> {
        Ok(list_ids(&self.layout.builds_dir())?
            .into_iter()
            .map(|id| self.get(&id).map_err(|e| (id, e)))
            .collect())
    }

    /// Atomic read-modify-write under the store lock. The mutation may refuse
    /// by returning an error, in which case nothing is written.
    pub fn update<E>(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Build) -> Result<(), E>,
    ) -> Result<Build, E>
    where
        E: From<StoreError>,
    {
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        let mut build = self.get(id)?;
        mutate(&mut build)?;
        build.updated_at = now_rfc3339();
        self.put(&build)?;
        Ok(build)
    }

    /// Mark a terminal build deleted and remove its artifacts.
    pub fn soft_delete(&self, id: &str) -> Result<(), StoreError> {
        self.update(id, |build| {
            if !build.status.is_terminal() {
                return Err(StoreError::Conflict(format!(
                    "build '{id}' is {} and cannot be deleted",
                    build.status
                )));
            }
            build.deleted = true;
            Ok(())
        })?;
        let artifacts = self.layout.artifacts_dir(id);
        if artifacts.exists() {
            fs::remove_dir_all(artifacts)?;
        }
        Ok(())
    }
}
