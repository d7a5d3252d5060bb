//! Stage inputs: what a build request resolves to before merging.

use crate::assembler::ResourceSet;
use crate::CoreError;
use ferry_compose::{
    assign_namespaces, merge, LintContext, LintReport, Linter, MergeOutput, ModuleInput,
    ADHOC_NAMESPACE,
};
use ferry_schema::{layer_variables, ModuleName, Namespace, ProjectId, VarMap};
use ferry_store::Store;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a build composes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildSource {
    Project(ProjectId),
    /// A single manifest merged under the `adhoc` namespace.
    AdHoc { name: String, manifest: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub source: BuildSource,
    /// Highest-precedence variables, applied to every module.
    #[serde(default)]
    pub variables: VarMap,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

impl BuildRequest {
    pub fn project(id: impl Into<String>) -> Self {
        Self {
            source: BuildSource::Project(ProjectId::new(id)),
            variables: VarMap::new(),
            name: None,
            owner: None,
        }
    }

    pub fn adhoc(name: impl Into<String>, manifest: impl Into<String>) -> Self {
        Self {
            source: BuildSource::AdHoc {
                name: name.into(),
                manifest: manifest.into(),
            },
            variables: VarMap::new(),
            name: None,
            owner: None,
        }
    }

    #[must_use]
    pub fn with_variables(mut self, variables: VarMap) -> Self {
        self.variables = variables;
        self
    }

    pub fn project_id(&self) -> Option<&ProjectId> {
        match &self.source {
            BuildSource::Project(id) => Some(id),
            BuildSource::AdHoc { .. } => None,
        }
    }
}

/// Everything the merge and assembly stages need, loaded from the store.
#[derive(Debug, Clone)]
pub struct ResolvedInputs {
    pub name: String,
    pub modules: Vec<ModuleInput>,
    pub resources: Vec<ResourceSet>,
    pub environment: BTreeMap<String, String>,
}

/// Load the request's modules and compute each one's effective variables:
/// version defaults, then project variables, then link overrides, then the
/// request's own variables.
pub fn resolve_inputs(store: &Store, request: &BuildRequest) -> Result<ResolvedInputs, CoreError> {
    match &request.source {
        BuildSource::AdHoc { name, manifest } => Ok(ResolvedInputs {
            name: request.name.clone().unwrap_or_else(|| name.clone()),
            modules: vec![ModuleInput {
                module: ModuleName::new(name.as_str()),
                version: "adhoc".to_owned(),
                namespace: Namespace::new(ADHOC_NAMESPACE),
                manifest: manifest.clone(),
                variables: request.variables.clone(),
                dependencies: Vec::new(),
            }],
            resources: Vec::new(),
            environment: BTreeMap::new(),
        }),
        BuildSource::Project(id) => {
            let project = store.projects.get(id)?;
            if !project.active {
                return Err(CoreError::Config(format!("project '{id}' is inactive")));
            }
            let links = project.enabled_modules();
            if links.is_empty() {
                return Err(CoreError::Config(format!(
                    "project '{id}' has no enabled modules"
                )));
            }
            let keys: Vec<(&str, u32)> = links.iter().map(|l| (l.module.as_str(), l.order)).collect();
            let namespaces = assign_namespaces(&keys);

            let mut modules = Vec::with_capacity(links.len());
            let mut resources = Vec::new();
            for (link, namespace) in links.iter().zip(namespaces) {
                let version = store.modules.get_version(&link.module, &link.version)?;
                if !version.published {
                    return Err(CoreError::Config(format!(
                        "module '{}' version '{}' is not published",
                        link.module, link.version
                    )));
                }
                let variables = layer_variables([
                    &version.variables,
                    &project.variables,
                    &link.overrides,
                    &request.variables,
                ]);
                if !version.resources.is_empty() {
                    resources.push(ResourceSet {
                        module: link.module.clone(),
                        version: version.version.clone(),
                        root: store.layout().resources_dir(&link.module, &version.version),
                        files: version.resources.clone(),
                    });
                }
                modules.push(ModuleInput {
                    module: link.module.clone(),
                    version: version.version,
                    namespace,
                    manifest: version.manifest,
                    variables,
                    dependencies: version.dependencies,
                });
            }

            Ok(ResolvedInputs {
                name: request.name.clone().unwrap_or_else(|| project.name.clone()),
                modules,
                resources,
                environment: project.environment,
            })
        }
    }
}

/// Merge and lint without touching the registry.
#[derive(Debug, Clone)]
pub struct Preview {
    pub inputs: ResolvedInputs,
    pub merged: MergeOutput,
    pub report: LintReport,
}

pub fn preview(store: &Store, linter: &Linter, request: &BuildRequest) -> Result<Preview, CoreError> {
    let inputs = resolve_inputs(store, request)?;
    let merged = merge(&inputs.modules, Some(&inputs.name))?;
    let report = linter.lint(&LintContext::from_merge(&merged));
    Ok(Preview {
        inputs,
        merged,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_store::VersionDraft;
    use serde_json::json;

    fn store_with_project() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.modules.create("web", None, None, None).unwrap();
        store
            .modules
            .add_version(
                "web",
                VersionDraft {
                    version: "1.0".to_owned(),
                    manifest: "services:\n  app:\n    image: nginx:${TAG}\n".to_owned(),
                    variables: VarMap::from([
                        ("TAG".to_owned(), json!("1.24")),
                        ("PORT".to_owned(), json!(80)),
                    ]),
                    dependencies: Vec::new(),
                },
            )
            .unwrap();
        store.modules.publish("web", "1.0").unwrap();
        store.projects.create("shop", None).unwrap();
        store
            .projects
            .add_module("shop", "web", "1.0", VarMap::from([("TAG".to_owned(), json!("1.25"))]))
            .unwrap();
        (dir, store)
    }

    #[test]
    fn variables_layer_in_precedence_order() {
        let (_dir, store) = store_with_project();
        store.projects.set_variable("shop", "PORT", json!(8080)).unwrap();
        store.projects.set_variable("shop", "TAG", json!("project")).unwrap();

        let inputs = resolve_inputs(&store, &BuildRequest::project("shop")).unwrap();
        let vars = &inputs.modules[0].variables;
        assert_eq!(vars["TAG"], json!("1.25"), "link override beats project variable");
        assert_eq!(vars["PORT"], json!(8080), "project variable beats default");

        let request = BuildRequest::project("shop")
            .with_variables(VarMap::from([("TAG".to_owned(), json!("submit"))]));
        let inputs = resolve_inputs(&store, &request).unwrap();
        assert_eq!(inputs.modules[0].variables["TAG"], json!("submit"));
    }

    #[test]
    fn disabled_links_are_excluded() {
        let (_dir, store) = store_with_project();
        store.projects.set_enabled("shop", 1, false).unwrap();
        let err = resolve_inputs(&store, &BuildRequest::project("shop")).unwrap_err();
        assert!(err.to_string().contains("no enabled modules"));
    }

    #[test]
    fn draft_versions_are_not_buildable() {
        let (_dir, store) = store_with_project();
        store
            .modules
            .add_version(
                "web",
                VersionDraft {
                    version: "2.0".to_owned(),
                    manifest: "services: {}\n".to_owned(),
                    ..VersionDraft::default()
                },
            )
            .unwrap();
        store.projects.add_module("shop", "web", "2.0", VarMap::new()).unwrap();
        let err = resolve_inputs(&store, &BuildRequest::project("shop")).unwrap_err();
        assert!(err.to_string().contains("not published"));
    }

    #[test]
    fn repeated_module_gets_distinct_namespaces() {
        let (_dir, store) = store_with_project();
        store.projects.add_module("shop", "web", "1.0", VarMap::new()).unwrap();
        let inputs = resolve_inputs(&store, &BuildRequest::project("shop")).unwrap();
        let ns: Vec<&str> = inputs.modules.iter().map(|m| m.namespace.as_str()).collect();
        assert_eq!(ns, vec!["web-1", "web-2"]);
    }

    #[test]
    fn preview_merges_and_lints() {
        let (_dir, store) = store_with_project();
        let preview = preview(&store, &Linter::default(), &BuildRequest::project("shop")).unwrap();
        let app = &preview.merged.document.services["web__app"];
        assert_eq!(app.image.as_deref(), Some("nginx:1.25"));
        assert_eq!(preview.merged.document.name.as_deref(), Some("shop"));
        assert!(!preview.report.has_errors());
    }

    #[test]
    fn adhoc_uses_fixed_namespace() {
        let (_dir, store) = store_with_project();
        let request = BuildRequest::adhoc("scratch", "services:\n  x:\n    image: busybox\n");
        let inputs = resolve_inputs(&store, &request).unwrap();
        assert_eq!(inputs.modules[0].namespace.as_str(), ADHOC_NAMESPACE);
        assert_eq!(inputs.name, "scratch");
    }

    #[test]
    fn request_roundtrips_as_json() {
        let request = BuildRequest::adhoc("a", "services: {}");
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("ad_hoc"));
        assert_eq!(serde_json::from_str::<BuildRequest>(&json).unwrap(), request);
    }
}
