use super::{colorize_status, json_pretty, Context, EXIT_SUCCESS};

pub fn run(ctx: &Context) -> Result<u8, String> {
    let builds = ctx.store.builds.list().map_err(|e| format!("store error: {e}"))?;
    if ctx.json {
        println!("{}", json_pretty(&builds)?);
    } else if builds.is_empty() {
        println!("no builds found");
    } else {
        println!("{:<38} {:<20} {:<10} {:>4}  CREATED", "BUILD_ID", "NAME", "STATUS", "PCT");
        for b in &builds {
            println!(
                "{:<38} {:<20} {:<10} {:>3}%  {}",
                b.id,
                b.name,
                colorize_status(&b.status.to_string()),
                b.progress,
                b.created_at
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
