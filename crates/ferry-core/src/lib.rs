//! Build orchestration for ferry.
//!
//! This crate drives a build request through the pipeline: resolve module
//! inputs from the store, merge them into one namespaced compose document,
//! lint it, package the referenced images, and assemble a self-contained
//! installer archive. The `Orchestrator` runs builds on a bounded worker pool
//! and records every status and progress change in the build store.

pub mod assembler;
pub mod concurrency;
pub mod config;
pub mod lifecycle;
pub mod orchestrator;
pub mod pipeline;
pub mod scripts;

pub use assembler::{
    assemble, AssembledInstaller, AssemblyInput, ImageEntry, InstallerManifest, ModuleEntry,
    ResourceSet, COMPOSE_FILE, ENV_TEMPLATE, INSTALLER_FORMAT_VERSION, INSTALL_SCRIPT,
    MANIFEST_FILE, VERIFY_SCRIPT,
};
pub use concurrency::{install_signal_handler, shutdown_requested, BuildSlots, SlotGuard};
pub use config::{default_config_path, FerryConfig};
pub use lifecycle::validate_transition;
pub use orchestrator::{build_result, cancel_build, BuildResult, Orchestrator};
pub use pipeline::{preview, resolve_inputs, BuildRequest, BuildSource, Preview, ResolvedInputs};
pub use scripts::{ScriptInput, ScriptRenderer, Scripts, TemplateScripts};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("schema error: {0}")]
    Schema(#[from] ferry_schema::SchemaError),
    #[error("store error: {0}")]
    Store(#[from] ferry_store::StoreError),
    #[error("merge error: {0}")]
    Merge(#[from] ferry_compose::MergeError),
    #[error("registry error: {0}")]
    Registry(#[from] ferry_registry::RegistryError),
    #[error("{0}")]
    Package(#[from] ferry_registry::PackageError),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("build '{id}' is {status}")]
    InvalidState { id: String, status: String },
    #[error("build '{id}' has no result: status is {status}")]
    NotReady { id: String, status: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("archive write failed at {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("orchestrator is shutting down")]
    ShuttingDown,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
