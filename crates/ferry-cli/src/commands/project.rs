use super::{json_pretty, parse_assignment, parse_assignments, Context, EXIT_SUCCESS};
use ferry_schema::var_to_string;

fn store_err(e: impl std::fmt::Display) -> String {
    format!("store error: {e}")
}

pub fn create(ctx: &Context, name: &str, owner: Option<String>) -> Result<u8, String> {
    let project = ctx.store.projects.create(name, owner).map_err(store_err)?;
    if ctx.json {
        println!("{}", json_pretty(&project)?);
    } else {
        println!("created project '{}'", project.id);
    }
    Ok(EXIT_SUCCESS)
}

pub fn add(
    ctx: &Context,
    project: &str,
    module: &str,
    version: &str,
    set: &[String],
) -> Result<u8, String> {
    let overrides = parse_assignments(set)?;
    ctx.store.modules.get_version(module, version).map_err(store_err)?;
    let order = ctx
        .store
        .projects
        .add_module(project, module, version, overrides)
        .map_err(store_err)?;
    if ctx.json {
        println!(
            "{}",
            json_pretty(&serde_json::json!({
                "project": project,
                "module": module,
                "version": version,
                "order": order,
            }))?
        );
    } else {
        println!("linked {module} {version} to '{project}' at position {order}");
    }
    Ok(EXIT_SUCCESS)
}

pub fn set_var(ctx: &Context, project: &str, assignment: &str) -> Result<u8, String> {
    let (key, value) = parse_assignment(assignment)?;
    ctx.store
        .projects
        .set_variable(project, &key, value)
        .map_err(store_err)?;
    if !ctx.json {
        println!("set {key} on '{project}'");
    }
    Ok(EXIT_SUCCESS)
}

pub fn set_env(ctx: &Context, project: &str, key: &str, value: &str) -> Result<u8, String> {
    ctx.store
        .projects
        .set_env(project, key, value)
        .map_err(store_err)?;
    if !ctx.json {
        if value.is_empty() {
            println!("'{project}' installers will require {key}");
        } else {
            println!("set {key} default on '{project}'");
        }
    }
    Ok(EXIT_SUCCESS)
}

pub fn toggle(ctx: &Context, project: &str, order: u32, enabled: bool) -> Result<u8, String> {
    ctx.store
        .projects
        .set_enabled(project, order, enabled)
        .map_err(store_err)?;
    if !ctx.json {
        let state = if enabled { "enabled" } else { "disabled" };
        println!("{state} link {order} of '{project}'");
    }
    Ok(EXIT_SUCCESS)
}

pub fn show(ctx: &Context, project: &str) -> Result<u8, String> {
    let project = ctx.store.projects.get(project).map_err(store_err)?;
    if ctx.json {
        println!("{}", json_pretty(&project)?);
        return Ok(EXIT_SUCCESS);
    }
    println!("project:     {}", project.id);
    println!("owner:       {}", project.owner.as_deref().unwrap_or("(none)"));
    println!("active:      {}", project.active);
    if !project.variables.is_empty() {
        println!("variables:");
        for (k, v) in &project.variables {
            println!("  {k}={}", var_to_string(v));
        }
    }
    if !project.environment.is_empty() {
        println!("environment:");
        for (k, v) in &project.environment {
            if v.is_empty() {
                println!("  {k} (required)");
            } else {
                println!("  {k}={v}");
            }
        }
    }
    println!("modules:");
    let mut links: Vec<_> = project.modules.iter().collect();
    links.sort_by_key(|l| l.order);
    for link in links {
        println!(
            "  {:>3}  {:<20} {:<10} {}{}",
            link.order,
            link.module,
            link.version,
            if link.enabled { "" } else { "(disabled) " },
            if link.overrides.is_empty() {
                String::new()
            } else {
                format!("{} override(s)", link.overrides.len())
            }
        );
    }
    Ok(EXIT_SUCCESS)
}

pub fn list(ctx: &Context) -> Result<u8, String> {
    let projects = ctx.store.projects.list().map_err(store_err)?;
    if ctx.json {
        println!("{}", json_pretty(&projects)?);
    } else if projects.is_empty() {
        println!("no projects found");
    } else {
        println!("{:<24} {:<8} MODULES", "PROJECT", "ACTIVE");
        for p in &projects {
            println!(
                "{:<24} {:<8} {}",
                p.id,
                if p.active { "yes" } else { "no" },
                p.enabled_modules().len()
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
