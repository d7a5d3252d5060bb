use super::{json_pretty, Context, EXIT_SUCCESS};
use ferry_core::build_result;

pub fn run(ctx: &Context, build_id: &str) -> Result<u8, String> {
    let result = build_result(&ctx.store, build_id).map_err(|e| e.to_string())?;
    if ctx.json {
        println!("{}", json_pretty(&result)?);
    } else {
        println!("{}", result.path.display());
    }
    Ok(EXIT_SUCCESS)
}
