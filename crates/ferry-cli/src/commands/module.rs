use super::{json_pretty, Context, EXIT_SUCCESS};
use ferry_schema::{parse_variables, ModuleDependency, ModuleName, VarMap};
use ferry_store::VersionDraft;
use std::path::Path;

fn store_err(e: impl std::fmt::Display) -> String {
    format!("store error: {e}")
}

pub fn create(
    ctx: &Context,
    name: &str,
    author: Option<String>,
    description: Option<String>,
    repository: Option<String>,
) -> Result<u8, String> {
    let module = ctx
        .store
        .modules
        .create(name, author, description, repository)
        .map_err(store_err)?;
    if ctx.json {
        println!("{}", json_pretty(&module)?);
    } else {
        println!("created module '{}'", module.name);
    }
    Ok(EXIT_SUCCESS)
}

fn read_vars(path: &Path) -> Result<VarMap, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("invalid variables: failed to read {}: {e}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(VarMap::new());
    }
    let value: serde_json::Value = serde_yaml::from_str(&content)
        .map_err(|e| format!("invalid variables in {}: {e}", path.display()))?;
    parse_variables(&value).map_err(|e| format!("invalid variables in {}: {e}", path.display()))
}

pub fn add_version(
    ctx: &Context,
    name: &str,
    version: &str,
    manifest: &Path,
    vars: Option<&Path>,
    depends: &[String],
    optional_depends: &[String],
) -> Result<u8, String> {
    let manifest_text = std::fs::read_to_string(manifest)
        .map_err(|e| format!("failed to read manifest {}: {e}", manifest.display()))?;
    let variables = vars.map(read_vars).transpose()?.unwrap_or_default();
    let dependencies = depends
        .iter()
        .map(|m| (m, false))
        .chain(optional_depends.iter().map(|m| (m, true)))
        .map(|(m, optional)| ModuleDependency {
            module: ModuleName::new(m.as_str()),
            optional,
        })
        .collect();
    let draft = VersionDraft {
        version: version.to_owned(),
        manifest: manifest_text,
        variables,
        dependencies,
    };

    let existing = ctx.store.modules.get(name).map_err(store_err)?;
    let stored = if existing.version(version).is_some() {
        ctx.store.modules.update_draft(name, draft)
    } else {
        ctx.store.modules.add_version(name, draft)
    }
    .map_err(store_err)?;

    if ctx.json {
        println!("{}", json_pretty(&stored)?);
    } else {
        println!(
            "module '{name}' version '{}' saved as draft ({} variable(s))",
            stored.version,
            stored.variables.len()
        );
    }
    Ok(EXIT_SUCCESS)
}

pub fn add_resource(
    ctx: &Context,
    name: &str,
    version: &str,
    file: &Path,
    target: Option<&Path>,
) -> Result<u8, String> {
    let data = std::fs::read(file).map_err(|e| format!("failed to read {}: {e}", file.display()))?;
    let relative = match target {
        Some(t) => t.to_path_buf(),
        None => file
            .file_name()
            .map(Into::into)
            .ok_or_else(|| format!("'{}' has no file name", file.display()))?,
    };
    ctx.store
        .modules
        .add_resource(name, version, &relative, &data)
        .map_err(store_err)?;
    if !ctx.json {
        println!("added resource '{}' to {name} {version}", relative.display());
    }
    Ok(EXIT_SUCCESS)
}

pub fn publish(ctx: &Context, name: &str, version: &str) -> Result<u8, String> {
    let published = ctx.store.modules.publish(name, version).map_err(store_err)?;
    if ctx.json {
        println!("{}", json_pretty(&published)?);
    } else {
        println!("published {name} {version}");
    }
    Ok(EXIT_SUCCESS)
}

pub fn list(ctx: &Context) -> Result<u8, String> {
    let modules = ctx.store.modules.list().map_err(store_err)?;
    if ctx.json {
        println!("{}", json_pretty(&modules)?);
    } else if modules.is_empty() {
        println!("no modules found");
    } else {
        println!("{:<24} {:<8} {:<9} LATEST", "NAME", "ACTIVE", "VERSIONS");
        for m in &modules {
            println!(
                "{:<24} {:<8} {:<9} {}",
                m.name,
                if m.active { "yes" } else { "no" },
                m.versions.len(),
                m.latest_published().map_or("-", |v| v.version.as_str())
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

pub fn show(ctx: &Context, name: &str) -> Result<u8, String> {
    let module = ctx.store.modules.get(name).map_err(store_err)?;
    if ctx.json {
        println!("{}", json_pretty(&module)?);
        return Ok(EXIT_SUCCESS);
    }
    println!("name:        {}", module.name);
    println!("active:      {}", module.active);
    println!("author:      {}", module.author.as_deref().unwrap_or("(none)"));
    println!("repository:  {}", module.repository.as_deref().unwrap_or("(none)"));
    println!("created_at:  {}", module.created_at);
    for v in &module.versions {
        let state = if v.published { "published" } else { "draft" };
        println!(
            "  {:<12} {:<10} vars={} resources={} deps={}",
            v.version,
            state,
            v.variables.len(),
            v.resources.len(),
            v.dependencies.len()
        );
    }
    Ok(EXIT_SUCCESS)
}

pub fn deactivate(ctx: &Context, name: &str) -> Result<u8, String> {
    ctx.store.deactivate_module(name).map_err(store_err)?;
    if !ctx.json {
        println!("deactivated module '{name}'");
    }
    Ok(EXIT_SUCCESS)
}
