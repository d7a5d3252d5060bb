//! Manifest composition and policy linting for ferry.
//!
//! `merge` unions per-module manifests into one namespaced document and
//! `Linter` evaluates that document against an extensible rule table.

pub mod lint;
pub mod merge;

pub use lint::{
    DanglingReference, Finding, ForbiddenBuild, HostPortCollision, LintContext, LintReport,
    LintRule, Linter, MissingImage, ModuleDependencyRule, PrivilegedCapabilities, Severity,
    UnresolvedVariable,
};
pub use merge::{
    assign_namespaces, is_valid_namespace, merge, MergeOutput, MergedModule, ModuleInput,
    ADHOC_NAMESPACE,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("configuration error in module '{module}': {reason}")]
    Configuration { module: String, reason: String },
    #[error("incompatible top-level '{field}': '{first}' vs '{second}'")]
    IncompatibleSchemaVersion {
        field: String,
        first: String,
        second: String,
    },
    #[error("duplicate namespace '{0}'")]
    DuplicateNamespace(String),
    #[error("invalid namespace '{0}': must be non-empty, without '__', and not end in '_'")]
    InvalidNamespace(String),
    #[error("{kind} '{name}' is declared by more than one module")]
    NameCollision { kind: &'static str, name: String },
}
