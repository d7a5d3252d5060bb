use super::{json_pretty, spin_fail, spin_ok, spinner, Context, SourceArgs, EXIT_FAILURE, EXIT_SUCCESS};
use ferry_core::{shutdown_requested, Orchestrator};
use ferry_registry::HttpRegistry;
use ferry_schema::BuildStatus;
use std::sync::Arc;
use std::time::Duration;

const POLL: Duration = Duration::from_millis(200);

pub fn run(ctx: &Context, source: &SourceArgs) -> Result<u8, String> {
    let request = source.request()?;
    let registry = Arc::new(HttpRegistry::new(
        ctx.config.registry.clone(),
        ctx.config.fetch_timeout(),
    ));
    let orchestrator = Orchestrator::start(ctx.store.clone(), registry, ctx.config.clone())
        .map_err(|e| e.to_string())?;
    let id = orchestrator.submit(request).map_err(|e| e.to_string())?;

    let pb = if ctx.json {
        None
    } else {
        Some(spinner(&format!("build {id} queued")))
    };
    let mut cancel_sent = false;
    let build = loop {
        if shutdown_requested() && !cancel_sent {
            cancel_sent = true;
            if let Err(e) = orchestrator.cancel(&id) {
                tracing::debug!("cancel after interrupt: {e}");
            }
            if let Some(ref pb) = pb {
                pb.set_message(format!("cancelling build {id}..."));
            }
        }
        let build = orchestrator.wait(&id, POLL).map_err(|e| e.to_string())?;
        if build.status.is_terminal() {
            break build;
        }
        if let Some(ref pb) = pb {
            if !cancel_sent {
                pb.set_message(format!("build {id} {} {}%", build.status, build.progress));
            }
        }
    };
    orchestrator.shutdown();

    if ctx.json {
        println!("{}", json_pretty(&build)?);
    }
    match build.status {
        BuildStatus::Completed => {
            let download = build.download.as_deref().unwrap_or_default();
            if let Some(ref pb) = pb {
                spin_ok(pb, &format!("build {id} completed"));
                for warning in &build.warnings {
                    println!("warning: {warning}");
                }
                println!("installer: {}", ctx.store.layout().root().join(download).display());
            }
            Ok(EXIT_SUCCESS)
        }
        _ => {
            let reason = build
                .error
                .as_ref()
                .map_or_else(|| "unknown failure".to_owned(), ToString::to_string);
            if let Some(ref pb) = pb {
                spin_fail(pb, &format!("build {id} failed"));
                eprintln!("{reason}");
            }
            Ok(EXIT_FAILURE)
        }
    }
}
