use crate::layout::StoreLayout;
use crate::lock::StoreLock;
use crate::records::{list_ids, read_json, record_file, write_json};
use crate::{now_rfc3339, StoreError};
use ferry_schema::{validate_name, ModuleName, Project, ProjectId, ProjectModule, VarMap};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ProjectStore {
    layout: StoreLayout,
}

impl ProjectStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.layout.projects_dir().join(record_file(id))
    }

    /// Create a project; its name doubles as its identifier.
    pub fn create(&self, name: &str, owner: Option<String>) -> Result<Project, StoreError> {
        validate_name(name)?;
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        if self.path(name).exists() {
            return Err(StoreError::Conflict(format!("project '{name}' already exists")));
        }
        let project = Project {
            id: ProjectId::new(name),
            name: name.to_owned(),
            owner,
            variables: VarMap::new(),
            environment: BTreeMap::new(),
            active: true,
            modules: Vec::new(),
            created_at: now_rfc3339(),
        };
        write_json(&self.path(name), &project)?;
        Ok(project)
    }

    pub fn get(&self, id: &str) -> Result<Project, StoreError> {
        let path = self.path(id);
        if !path.exists() {
            return Err(StoreError::not_found("project", id));
        }
        read_json(&path)
    }

    pub fn list(&self) -> Result<Vec<Project>, StoreError> {
        let mut projects = Vec::new();
        for id in list_ids(&self.layout.projects_dir())? {
            match self.get(&id) {
                Ok(p) => projects.push(p),
                Err(e) => tracing::warn!("skipping unreadable project record '{id}': {e}"),
            }
        }
        Ok(projects)
    }

    /// Pin a module version at the next position. Returns the assigned order.
    pub fn add_module(
        &self,
        id: &str,
        module: &str,
        version: &str,
        overrides: VarMap,
    ) -> Result<u32, StoreError> {
        self.mutate(id, |project| {
            let order = project.next_order();
            project.modules.push(ProjectModule {
                module: ModuleName::new(module),
                version: version.to_owned(),
                order,
                enabled: true,
                overrides,
            });
            Ok(order)
        })
    }

    pub fn set_overrides(&self, id: &str, order: u32, overrides: VarMap) -> Result<(), StoreError> {
        self.mutate(id, |project| {
            link_mut(project, order)?.overrides = overrides;
            Ok(())
        })
    }

    pub fn set_enabled(&self, id: &str, order: u32, enabled: bool) -> Result<(), StoreError> {
        self.mutate(id, |project| {
            link_mut(project, order)?.enabled = enabled;
            Ok(())
        })
    }

    pub fn set_variables(&self, id: &str, variables: VarMap) -> Result<(), StoreError> {
        self.mutate(id, |project| {
            project.variables = variables;
            Ok(())
        })
    }

    pub fn set_variable(&self, id: &str, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        self.mutate(id, |project| {
            project.variables.insert(key.to_owned(), value);
            Ok(())
        })
    }

    /// Set an install-time environment variable. An empty value marks it as
    /// requiring operator input.
    pub fn set_env(&self, id: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.mutate(id, |project| {
            project.environment.insert(key.to_owned(), value.to_owned());
            Ok(())
        })
    }

    pub fn set_active(&self, id: &str, active: bool) -> Result<(), StoreError> {
        self.mutate(id, |project| {
            project.active = active;
            Ok(())
        })
    }

    fn mutate<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Project) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        let mut project = self.get(id)?;
        let out = f(&mut project)?;
        write_json(&self.path(id), &project)?;
        Ok(out)
    }
}

fn link_mut(project: &mut Project, order: u32) -> Result<&mut ProjectModule, StoreError> {
    let id = project.id.clone();
    project
        .modules
        .iter_mut()
        .find(|m| m.order == order)
        .ok_or_else(|| StoreError::not_found("project module", format!("{id}#{order}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, ProjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, ProjectStore::new(layout))
    }

    #[test]
    fn links_get_increasing_order() {
        let (_dir, projects) = store();
        projects.create("shop", None).unwrap();
        assert_eq!(projects.add_module("shop", "web", "1.0", VarMap::new()).unwrap(), 1);
        assert_eq!(projects.add_module("shop", "db", "2.0", VarMap::new()).unwrap(), 2);
        let p = projects.get("shop").unwrap();
        assert_eq!(p.modules.len(), 2);
        assert_eq!(p.modules[1].module, "db");
    }

    #[test]
    fn disable_link_excludes_it() {
        let (_dir, projects) = store();
        projects.create("shop", None).unwrap();
        projects.add_module("shop", "web", "1.0", VarMap::new()).unwrap();
        projects.add_module("shop", "db", "1.0", VarMap::new()).unwrap();
        projects.set_enabled("shop", 1, false).unwrap();
        let p = projects.get("shop").unwrap();
        let enabled: Vec<&str> = p.enabled_modules().iter().map(|m| m.module.as_str()).collect();
        assert_eq!(enabled, vec!["db"]);
    }

    #[test]
    fn overrides_and_variables_persist() {
        let (_dir, projects) = store();
        projects.create("shop", None).unwrap();
        projects.add_module("shop", "web", "1.0", VarMap::new()).unwrap();
        let overrides: VarMap = [("PORT".to_owned(), json!(9090))].into_iter().collect();
        projects.set_overrides("shop", 1, overrides).unwrap();
        projects.set_variable("shop", "DOMAIN", json!("example.org")).unwrap();
        projects.set_env("shop", "DB_PASSWORD", "").unwrap();

        let p = projects.get("shop").unwrap();
        assert_eq!(p.modules[0].overrides["PORT"], json!(9090));
        assert_eq!(p.variables["DOMAIN"], json!("example.org"));
        assert_eq!(p.environment["DB_PASSWORD"], "");
    }

    #[test]
    fn unknown_link_is_not_found() {
        let (_dir, projects) = store();
        projects.create("shop", None).unwrap();
        assert!(matches!(
            projects.set_enabled("shop", 7, false),
            Err(StoreError::NotFound { .. })
        ));
    }
}
