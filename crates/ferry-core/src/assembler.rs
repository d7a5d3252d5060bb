//! Installer Assembler.
//!
//! Lays out the offline installer and publishes it as one gzip'd tar:
//!
//! ```text
//! compose/docker-compose.yml
//! images/<algo>-<hex>.tar            one per distinct digest
//! resources/<module>/<version>/...
//! env/.env.example
//! bin/install.sh
//! bin/verify.sh
//! manifest.json
//! ```
//!
//! Entries are sorted and carry zero mtimes and root ownership, so the same
//! inputs always produce the same bytes. The archive is written to a
//! temporary file and renamed into place; a failed assembly leaves nothing.

use crate::scripts::{ScriptInput, ScriptRenderer};
use crate::CoreError;
use ferry_compose::MergedModule;
use ferry_registry::ImageDigestMap;
use ferry_schema::{BuildId, ComposeDocument, Digest, ModuleName, Namespace, ProjectId};
use flate2::{Compression, GzBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

pub const COMPOSE_FILE: &str = "compose/docker-compose.yml";
pub const ENV_TEMPLATE: &str = "env/.env.example";
pub const INSTALL_SCRIPT: &str = "bin/install.sh";
pub const VERIFY_SCRIPT: &str = "bin/verify.sh";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Bumped only on incompatible changes to `manifest.json`.
pub const INSTALLER_FORMAT_VERSION: u32 = 1;

/// Contents of `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallerManifest {
    pub format_version: u32,
    pub build_id: BuildId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectId>,
    pub created_at: String,
    /// Modules in merge order.
    pub modules: Vec<ModuleEntry>,
    pub images: Vec<ImageEntry>,
    /// Archive path → `sha256:<hex>`, for every file except `manifest.json`.
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleEntry {
    pub module: ModuleName,
    pub version: String,
    pub namespace: Namespace,
    pub digests: Vec<Digest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageEntry {
    pub digest: Digest,
    pub file: String,
    pub references: Vec<String>,
}

/// Resource files one module version ships.
#[derive(Debug, Clone)]
pub struct ResourceSet {
    pub module: ModuleName,
    pub version: String,
    /// Directory the relative `files` are read from.
    pub root: PathBuf,
    pub files: Vec<String>,
}

pub struct AssemblyInput<'a> {
    pub build_id: &'a BuildId,
    pub name: &'a str,
    pub project: Option<&'a ProjectId>,
    /// Digest-pinned merged document.
    pub document: &'a ComposeDocument,
    pub modules: &'a [MergedModule],
    pub images: &'a ImageDigestMap,
    pub resources: &'a [ResourceSet],
    /// Project environment: key → default value. Empty values must be
    /// supplied by the operator.
    pub environment: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct AssembledInstaller {
    pub path: PathBuf,
    pub manifest: InstallerManifest,
    pub manifest_json: String,
    pub compose: String,
    pub size: u64,
}

enum Source {
    Bytes(Vec<u8>),
    File(PathBuf),
}

struct Entry {
    source: Source,
    executable: bool,
}

fn at(path: &Path) -> impl FnOnce(io::Error) -> CoreError + '_ {
    move |source| CoreError::Archive {
        path: path.to_path_buf(),
        source,
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn sha256_file(path: &Path) -> Result<String, CoreError> {
    let mut file = File::open(path).map_err(at(path))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(at(path))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Reject absolute paths and `..` so a declared resource cannot escape its
/// module directory.
fn relative_resource(path: &str) -> Result<&Path, CoreError> {
    let p = Path::new(path);
    let clean = !path.is_empty() && p.components().all(|c| matches!(c, Component::Normal(_)));
    if clean {
        Ok(p)
    } else {
        Err(CoreError::Archive {
            path: p.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "resource path must be relative"),
        })
    }
}

fn env_template(environment: &BTreeMap<String, String>) -> String {
    let mut out = String::from("# Environment for this installation. Copy to .env and fill in empty values.\n");
    for (key, value) in environment {
        out.push_str(&format!("{key}={value}\n"));
    }
    out
}

/// Per-module digest inventory: each module's services mapped through the
/// packaged images.
fn module_entries(input: &AssemblyInput<'_>) -> Vec<ModuleEntry> {
    input
        .modules
        .iter()
        .map(|m| {
            let digests: BTreeSet<Digest> = m
                .services
                .iter()
                .filter_map(|svc| input.document.services.get(svc))
                .filter_map(|svc| svc.image.as_deref())
                .filter_map(|image| input.images.find(image))
                .map(|p| p.digest.clone())
                .collect();
            ModuleEntry {
                module: m.module.clone(),
                version: m.version.clone(),
                namespace: m.namespace.clone(),
                digests: digests.into_iter().collect(),
            }
        })
        .collect()
}

fn image_entries(images: &ImageDigestMap) -> Vec<ImageEntry> {
    let mut by_file: BTreeMap<&str, ImageEntry> = BTreeMap::new();
    for (reference, packaged) in &images.images {
        by_file
            .entry(packaged.file.as_str())
            .or_insert_with(|| ImageEntry {
                digest: packaged.digest.clone(),
                file: packaged.file.clone(),
                references: Vec::new(),
            })
            .references
            .push(reference.clone());
    }
    by_file.into_values().collect()
}

/// Assemble the installer for `input` and publish it at `dest`.
///
/// `staging_dir` must be on the same filesystem as `dest`.
pub fn assemble(
    input: &AssemblyInput<'_>,
    renderer: &dyn ScriptRenderer,
    staging_dir: &Path,
    dest: &Path,
) -> Result<AssembledInstaller, CoreError> {
    let mut entries: BTreeMap<String, Entry> = BTreeMap::new();

    let compose = input.document.to_yaml_string()?;
    let compose_checksum = sha256_hex(compose.as_bytes());
    entries.insert(
        COMPOSE_FILE.to_owned(),
        Entry {
            source: Source::Bytes(compose.clone().into_bytes()),
            executable: false,
        },
    );

    for (file, path) in input.images.files() {
        entries.insert(
            format!("images/{file}"),
            Entry {
                source: Source::File(path.to_path_buf()),
                executable: false,
            },
        );
    }

    for set in input.resources {
        for file in &set.files {
            let rel = relative_resource(file)?;
            let archive_path = format!("resources/{}/{}/{}", set.module, set.version, rel.display());
            entries.insert(
                archive_path,
                Entry {
                    source: Source::File(set.root.join(rel)),
                    executable: false,
                },
            );
        }
    }

    entries.insert(
        ENV_TEMPLATE.to_owned(),
        Entry {
            source: Source::Bytes(env_template(input.environment).into_bytes()),
            executable: false,
        },
    );

    let namespaces: Vec<String> = input.modules.iter().map(|m| m.namespace.to_string()).collect();
    let required_env: Vec<String> = input
        .environment
        .iter()
        .filter(|(_, v)| v.is_empty())
        .map(|(k, _)| k.clone())
        .collect();
    let scripts = renderer.render(&ScriptInput {
        namespaces: &namespaces,
        required_env: &required_env,
        manifest_checksum: &compose_checksum,
    })?;
    entries.insert(
        INSTALL_SCRIPT.to_owned(),
        Entry {
            source: Source::Bytes(scripts.install.into_bytes()),
            executable: true,
        },
    );
    entries.insert(
        VERIFY_SCRIPT.to_owned(),
        Entry {
            source: Source::Bytes(scripts.verify.into_bytes()),
            executable: true,
        },
    );

    let mut files = BTreeMap::new();
    for (path, entry) in &entries {
        let hex = match &entry.source {
            Source::Bytes(data) => sha256_hex(data),
            Source::File(src) => sha256_file(src)?,
        };
        files.insert(path.clone(), format!("sha256:{hex}"));
    }

    let manifest = InstallerManifest {
        format_version: INSTALLER_FORMAT_VERSION,
        build_id: input.build_id.clone(),
        name: input.name.to_owned(),
        project: input.project.cloned(),
        created_at: chrono::Utc::now().to_rfc3339(),
        modules: module_entries(input),
        images: image_entries(input.images),
        files,
    };
    let manifest_json = serde_json::to_string_pretty(&manifest)?;
    entries.insert(
        MANIFEST_FILE.to_owned(),
        Entry {
            source: Source::Bytes(manifest_json.clone().into_bytes()),
            executable: false,
        },
    );

    let size = write_archive(&entries, staging_dir, dest)?;
    tracing::info!(
        "assembled installer {} ({} files, {size} bytes)",
        dest.display(),
        entries.len()
    );

    Ok(AssembledInstaller {
        path: dest.to_path_buf(),
        manifest,
        manifest_json,
        compose,
        size,
    })
}

fn header_for(size: u64, executable: bool) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(if executable { 0o755 } else { 0o644 });
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn write_archive(
    entries: &BTreeMap<String, Entry>,
    staging_dir: &Path,
    dest: &Path,
) -> Result<u64, CoreError> {
    fs::create_dir_all(staging_dir).map_err(at(staging_dir))?;
    let tmp = tempfile::NamedTempFile::new_in(staging_dir).map_err(at(staging_dir))?;

    let gz = GzBuilder::new().mtime(0).write(tmp.as_file(), Compression::default());
    let mut builder = tar::Builder::new(gz);
    for (path, entry) in entries {
        let archive_path = Path::new(path);
        match &entry.source {
            Source::Bytes(data) => {
                let mut header = header_for(data.len() as u64, entry.executable);
                builder
                    .append_data(&mut header, path, data.as_slice())
                    .map_err(at(archive_path))?;
            }
            Source::File(src) => {
                let file = File::open(src).map_err(at(src))?;
                let len = file.metadata().map_err(at(src))?.len();
                let mut header = header_for(len, entry.executable);
                builder
                    .append_data(&mut header, path, file)
                    .map_err(at(src))?;
            }
        }
    }
    let mut gz = builder.into_inner().map_err(at(tmp.path()))?;
    gz.flush().map_err(at(tmp.path()))?;
    gz.finish().map_err(at(tmp.path()))?;
    tmp.as_file().sync_all().map_err(at(tmp.path()))?;

    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(at(parent))?;
    tmp.persist(dest).map_err(|e| CoreError::Archive {
        path: dest.to_path_buf(),
        source: e.error,
    })?;
    File::open(parent)
        .and_then(|d| d.sync_all())
        .map_err(at(parent))?;
    Ok(fs::metadata(dest).map_err(at(dest))?.len())
}
