use crate::layout::StoreLayout;
use crate::lock::StoreLock;
use crate::records::{list_ids, read_json, record_file, write_atomic, write_json};
use crate::{now_rfc3339, StoreError};
use ferry_schema::{validate_name, Module, ModuleDependency, ModuleName, ModuleVersion, VarMap};
use std::path::{Component, Path, PathBuf};

/// Mutable content of an unpublished module version.
#[derive(Debug, Clone, Default)]
pub struct VersionDraft {
    pub version: String,
    pub manifest: String,
    pub variables: VarMap,
    pub dependencies: Vec<ModuleDependency>,
}

#[derive(Debug, Clone)]
pub struct ModuleStore {
    layout: StoreLayout,
}

impl ModuleStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.layout.modules_dir().join(record_file(name))
    }

    pub fn create(
        &self,
        name: &str,
        author: Option<String>,
        description: Option<String>,
        repository: Option<String>,
    ) -> Result<Module, StoreError> {
        validate_name(name)?;
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        if self.exists(name) {
            return Err(StoreError::Conflict(format!("module '{name}' already exists")));
        }
        let module = Module {
            name: ModuleName::new(name),
            author,
            description,
            repository,
            active: true,
            versions: Vec::new(),
            created_at: now_rfc3339(),
        };
        write_json(&self.path(name), &module)?;
        tracing::info!("created module '{name}'");
        Ok(module)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    pub fn get(&self, name: &str) -> Result<Module, StoreError> {
        let path = self.path(name);
        if !path.exists() {
            return Err(StoreError::not_found("module", name));
        }
        read_json(&path)
    }

    pub fn get_version(&self, name: &str, version: &str) -> Result<ModuleVersion, StoreError> {
        self.get(name)?
            .version(version)
            .cloned()
            .ok_or_else(|| StoreError::not_found("module version", format!("{name}@{version}")))
    }

    pub fn list(&self) -> Result<Vec<Module>, StoreError> {
        let mut modules = Vec::new();
        for id in list_ids(&self.layout.modules_dir())? {
            match self.get(&id) {
                Ok(m) => modules.push(m),
                Err(e) => tracing::warn!("skipping unreadable module record '{id}': {e}"),
            }
        }
        Ok(modules)
    }

    /// Append a new draft version. Version strings are unique per module.
    pub fn add_version(&self, name: &str, draft: VersionDraft) -> Result<ModuleVersion, StoreError> {
        validate_version(&draft.version)?;
        self.mutate(name, |module| {
            if module.version(&draft.version).is_some() {
                return Err(StoreError::Conflict(format!(
                    "module '{name}' already has version '{}'",
                    draft.version
                )));
            }
            let version = ModuleVersion {
                version: draft.version,
                manifest: draft.manifest,
                variables: draft.variables,
                resources: Vec::new(),
                dependencies: draft.dependencies,
                published: false,
                published_at: None,
                created_at: now_rfc3339(),
            };
            module.versions.push(version.clone());
            Ok(version)
        })
    }

    /// Replace the manifest, variables, and dependencies of a draft version.
    pub fn update_draft(&self, name: &str, draft: VersionDraft) -> Result<ModuleVersion, StoreError> {
        self.mutate(name, |module| {
            let version = draft_mut(module, &draft.version)?;
            version.manifest = draft.manifest;
            version.variables = draft.variables;
            version.dependencies = draft.dependencies;
            Ok(version.clone())
        })
    }

    /// Store a resource file for a draft version and record its relative path.
    pub fn add_resource(
        &self,
        name: &str,
        version: &str,
        relative: &Path,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let relative = validate_resource_path(relative)?;
        let dest = self.layout.resources_dir(name, version).join(&relative);
        let recorded = relative.to_string_lossy().replace('\\', "/");
        self.mutate(name, |module| {
            let v = draft_mut(module, version)?;
            write_atomic(&dest, data)?;
            if !v.resources.contains(&recorded) {
                v.resources.push(recorded.clone());
                v.resources.sort();
            }
            Ok(())
        })
    }

    /// Freeze a draft version. The transition happens once; a second publish
    /// is a conflict.
    pub fn publish(&self, name: &str, version: &str) -> Result<ModuleVersion, StoreError> {
        self.mutate(name, |module| {
            let v = draft_mut(module, version)?;
            v.published = true;
            v.published_at = Some(now_rfc3339());
            tracing::info!("published module '{name}' version '{version}'");
            Ok(v.clone())
        })
    }

    pub fn activate(&self, name: &str) -> Result<(), StoreError> {
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        self.set_active_locked(name, true)
    }

    /// Caller must hold the store lock.
    pub(crate) fn set_active_locked(&self, name: &str, active: bool) -> Result<(), StoreError> {
        self.mutate_locked(name, |module| {
            module.active = active;
            Ok(())
        })
    }

    fn mutate<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Module) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        self.mutate_locked(name, f)
    }

    fn mutate_locked<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Module) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut module = self.get(name)?;
        let out = f(&mut module)?;
        write_json(&self.path(name), &module)?;
        Ok(out)
    }
}

fn draft_mut<'a>(module: &'a mut Module, version: &str) -> Result<&'a mut ModuleVersion, StoreError> {
    let name = module.name.clone();
    let v = module
        .version_mut(version)
        .ok_or_else(|| StoreError::not_found("module version", format!("{name}@{version}")))?;
    if v.published {
        return Err(StoreError::Conflict(format!(
            "module '{name}' version '{version}' is published and immutable"
        )));
    }
    Ok(v)
}

/// Versions name a resource directory, so they must be a single path segment.
fn validate_version(version: &str) -> Result<(), StoreError> {
    if version.is_empty()
        || version.len() > 64
        || version.starts_with('.')
        || version.contains(['/', '\\'])
        || version.chars().any(char::is_whitespace)
    {
        return Err(StoreError::InvalidName(format!(
            "invalid version '{version}': must be one path segment of 1-64 characters"
        )));
    }
    Ok(())
}

fn validate_resource_path(path: &Path) -> Result<PathBuf, StoreError> {
    let invalid = |reason: &str| StoreError::InvalidResourcePath {
        path: path.to_path_buf(),
        reason: reason.to_owned(),
    };
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("must not contain '..'")),
            Component::RootDir | Component::Prefix(_) => return Err(invalid("must be relative")),
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(invalid("must name a file"));
    }
    Ok(clean)
}
