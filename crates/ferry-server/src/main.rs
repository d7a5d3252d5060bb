use clap::Parser;
use ferry_core::{install_signal_handler, shutdown_requested, FerryConfig, Orchestrator};
use ferry_registry::HttpRegistry;
use ferry_store::Store;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ferry-server", version, about = "Serve the ferry build API over HTTP")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8340)]
    port: u16,

    /// Store directory holding modules, projects and builds.
    #[arg(long, default_value = "./ferry-data")]
    store: PathBuf,

    /// Configuration file (defaults to the user config, if present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the concurrent build ceiling.
    #[arg(long)]
    max_builds: Option<usize>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let mut config = match &cli.config {
        Some(path) => FerryConfig::load(path),
        None => FerryConfig::load_default(),
    }
    .map_err(|e| e.to_string())?;
    if let Some(n) = cli.max_builds {
        if n == 0 {
            return Err("--max-builds must be at least 1".to_owned());
        }
        config.max_concurrent_builds = n;
    }

    let store = Store::open(&cli.store).map_err(|e| e.to_string())?;
    info!("store directory: {}", cli.store.display());
    let registry = Arc::new(HttpRegistry::new(
        config.registry.clone(),
        config.fetch_timeout(),
    ));
    let orchestrator = Orchestrator::start(store, registry, config).map_err(|e| e.to_string())?;

    install_signal_handler();
    let addr = format!("{}:{}", cli.host, cli.port);
    let served = ferry_server::run_server(&orchestrator, &addr, shutdown_requested);
    info!("stopping: waiting for running builds");
    orchestrator.shutdown();
    served
}
