use super::{colorize_severity, json_pretty, Context, SourceArgs, EXIT_FAILURE, EXIT_SUCCESS};
use ferry_compose::Linter;
use ferry_core::preview;

pub fn run(ctx: &Context, source: &SourceArgs) -> Result<u8, String> {
    let request = source.request()?;
    let preview = preview(&ctx.store, &Linter::default(), &request).map_err(|e| e.to_string())?;
    let report = &preview.report;
    if ctx.json {
        println!("{}", json_pretty(report)?);
    } else if report.findings.is_empty() {
        println!("no findings");
    } else {
        for f in &report.findings {
            println!(
                "{:<8} {:<24} {:<32} {}",
                colorize_severity(&f.severity.to_string()),
                f.rule,
                f.location,
                f.message
            );
        }
        println!(
            "{} error(s), {} warning(s)",
            report.errors().count(),
            report.warnings().count()
        );
    }
    Ok(if report.has_errors() {
        EXIT_FAILURE
    } else {
        EXIT_SUCCESS
    })
}
