use super::{colorize_status, json_pretty, Context, EXIT_SUCCESS};
use ferry_core::cancel_build;

pub fn run(ctx: &Context, build_id: &str) -> Result<u8, String> {
    let build = cancel_build(&ctx.store, build_id).map_err(|e| e.to_string())?;
    if ctx.json {
        println!("{}", json_pretty(&build)?);
    } else if build.status.is_terminal() {
        println!("build {build_id} cancelled");
    } else {
        println!(
            "build {build_id} is {}; it stops at its next checkpoint",
            colorize_status(&build.status.to_string())
        );
    }
    Ok(EXIT_SUCCESS)
}
