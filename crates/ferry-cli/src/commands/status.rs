use super::{colorize_status, json_pretty, Context, EXIT_SUCCESS};

pub fn run(ctx: &Context, build_id: &str) -> Result<u8, String> {
    let build = ctx.store.builds.get(build_id).map_err(|e| format!("store error: {e}"))?;
    if ctx.json {
        let payload = serde_json::json!({
            "id": build.id,
            "status": build.status,
            "progress": build.progress,
            "error": build.error,
            "warnings": build.warnings,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("build:       {}", build.id);
        println!("name:        {}", build.name);
        println!("status:      {}", colorize_status(&build.status.to_string()));
        println!("progress:    {}%", build.progress);
        if let Some(ref project) = build.project {
            println!("project:     {project}");
        }
        if let Some(ref error) = build.error {
            println!("error:       {error}");
        }
        for warning in &build.warnings {
            println!("warning:     {warning}");
        }
        println!("created_at:  {}", build.created_at);
        println!("updated_at:  {}", build.updated_at);
    }
    Ok(EXIT_SUCCESS)
}
