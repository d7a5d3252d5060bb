use super::{json_pretty, Context, SourceArgs, EXIT_SUCCESS};
use ferry_compose::Linter;
use ferry_core::preview;

pub fn run(ctx: &Context, source: &SourceArgs) -> Result<u8, String> {
    let request = source.request()?;
    let preview = preview(&ctx.store, &Linter::default(), &request).map_err(|e| e.to_string())?;
    let manifest = preview
        .merged
        .document
        .to_yaml_string()
        .map_err(|e| format!("schema error: {e}"))?;
    if ctx.json {
        let namespaces: Vec<_> = preview
            .merged
            .modules
            .iter()
            .map(|m| {
                serde_json::json!({
                    "module": m.module,
                    "version": m.version,
                    "namespace": m.namespace,
                    "services": m.services,
                })
            })
            .collect();
        let unresolved: Vec<String> = preview
            .merged
            .unresolved
            .iter()
            .map(ToString::to_string)
            .collect();
        let payload = serde_json::json!({
            "manifest": manifest,
            "modules": namespaces,
            "unresolved": unresolved,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        print!("{manifest}");
        for var in &preview.merged.unresolved {
            eprintln!("warning: unresolved {var}");
        }
    }
    Ok(EXIT_SUCCESS)
}
