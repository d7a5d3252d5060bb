//! Data model, typed manifest documents, and variable handling for ferry.
//!
//! This crate defines the schema layer: module/project/build records
//! (`Module`, `Project`, `Build`), the typed orchestration document
//! (`ComposeDocument`) with its reference-rewriting helpers, `${NAME}`
//! placeholder interpolation, and effective-variable resolution.

pub mod document;
pub mod interpolate;
pub mod model;
pub mod types;
pub mod vars;

pub use document::{
    is_external, ComposeDocument, DependsOn, EntityRenames, External, Extra, FileRef, Flag,
    HostBinding, PortMapping, ResourceDef, Service, ServiceNetworks, VolumeMount,
    OPTIONAL_IMAGE_FIELD,
};
pub use interpolate::{interpolate_str, interpolate_value, Interpolated, UnresolvedVar};
pub use model::{
    Build, BuildFailure, BuildStage, BuildStatus, Module, ModuleDependency, ModuleVersion,
    Project, ProjectModule,
};
pub use types::{BuildId, Digest, ModuleName, Namespace, ProjectId, NAMESPACE_SEPARATOR};
pub use vars::{
    layer_variables, parse_variables, parse_variables_str, resolve_variables, var_to_string,
    VarMap,
};

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Validate a module or project name: 1-64 characters of `[a-zA-Z0-9_.-]`,
/// not starting with a dot.
pub fn validate_name(name: &str) -> Result<(), SchemaError> {
    let invalid = |reason: &str| SchemaError::InvalidName {
        name: name.to_owned(),
        reason: reason.to_owned(),
    };
    if name.is_empty() || name.len() > 64 {
        return Err(invalid("must be 1-64 characters"));
    }
    if name.starts_with('.') {
        return Err(invalid("must not start with '.'"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
    {
        return Err(invalid("must match [a-zA-Z0-9_.-]"));
    }
    Ok(())
}
