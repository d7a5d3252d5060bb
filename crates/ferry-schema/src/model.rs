//! Persistent records: modules, projects, and builds.
//!
//! Timestamps are RFC 3339 strings so records stay human-readable on disk.

use crate::types::{BuildId, ModuleName, ProjectId};
use crate::vars::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Module {
    pub name: ModuleName,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    pub active: bool,
    #[serde(default)]
    pub versions: Vec<ModuleVersion>,
    pub created_at: String,
}

impl Module {
    pub fn version(&self, version: &str) -> Option<&ModuleVersion> {
        self.versions.iter().find(|v| v.version == version)
    }

    pub fn version_mut(&mut self, version: &str) -> Option<&mut ModuleVersion> {
        self.versions.iter_mut().find(|v| v.version == version)
    }

    /// Most recently added published version.
    pub fn latest_published(&self) -> Option<&ModuleVersion> {
        self.versions.iter().rev().find(|v| v.published)
    }
}

/// Another module this version expects to find in the same project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleDependency {
    pub module: ModuleName,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleVersion {
    pub version: String,
    /// Orchestration document text, interpolated at merge time.
    pub manifest: String,
    #[serde(default)]
    pub variables: VarMap,
    /// Paths relative to the version's resource directory.
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<ModuleDependency>,
    #[serde(default)]
    pub published: bool,
    #[serde(default)]
    pub published_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub variables: VarMap,
    /// Environment variables the operator must supply at install time.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub active: bool,
    #[serde(default)]
    pub modules: Vec<ProjectModule>,
    pub created_at: String,
}

impl Project {
    /// Enabled links in merge order.
    pub fn enabled_modules(&self) -> Vec<&ProjectModule> {
        let mut links: Vec<&ProjectModule> = self.modules.iter().filter(|m| m.enabled).collect();
        links.sort_by_key(|m| m.order);
        links
    }

    pub fn next_order(&self) -> u32 {
        self.modules.iter().map(|m| m.order + 1).max().unwrap_or(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectModule {
    pub module: ModuleName,
    pub version: String,
    pub order: u32,
    pub enabled: bool,
    #[serde(default)]
    pub overrides: VarMap,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Queued,
    Building,
    Completed,
    Failed,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildStatus::Completed | BuildStatus::Failed)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStatus::Queued => write!(f, "queued"),
            BuildStatus::Building => write!(f, "building"),
            BuildStatus::Completed => write!(f, "completed"),
            BuildStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BuildStage {
    Resolve,
    Merge,
    Lint,
    Images,
    Assemble,
    Persist,
    Cancelled,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStage::Resolve => "resolve",
            BuildStage::Merge => "merge",
            BuildStage::Lint => "lint",
            BuildStage::Images => "images",
            BuildStage::Assemble => "assemble",
            BuildStage::Persist => "persist",
            BuildStage::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildFailure {
    pub stage: BuildStage,
    pub message: String,
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.stage, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Build {
    pub id: BuildId,
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
    /// `None` when the build was submitted from an ad-hoc manifest.
    #[serde(default)]
    pub project: Option<ProjectId>,
    pub status: BuildStatus,
    pub progress: u8,
    #[serde(default)]
    pub merged_manifest: Option<String>,
    #[serde(default)]
    pub installer_manifest: Option<String>,
    /// Archive path relative to the store root, set on completion.
    #[serde(default)]
    pub download: Option<String>,
    #[serde(default)]
    pub error: Option<BuildFailure>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: String,
    pub updated_at: String,
    /// blake3 checksum for integrity verification. `None` for legacy records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Build {
    pub fn new(id: BuildId, name: String, project: Option<ProjectId>, now: String) -> Self {
        Self {
            id,
            name,
            owner: None,
            project,
            status: BuildStatus::Queued,
            progress: 0,
            merged_manifest: None,
            installer_manifest: None,
            download: None,
            error: None,
            warnings: Vec::new(),
            deleted: false,
            created_at: now.clone(),
            updated_at: now,
            checksum: None,
        }
    }
}
