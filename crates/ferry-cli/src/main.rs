mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{Context, SourceArgs, EXIT_FAILURE, EXIT_MANIFEST_ERROR, EXIT_STORE_ERROR};
use ferry_core::{install_signal_handler, FerryConfig};
use ferry_store::Store;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "ferry",
    version,
    about = "Compose application modules into offline installers"
)]
struct Cli {
    /// Path to the ferry store directory.
    #[arg(long, default_value = "~/.local/share/ferry", global = true)]
    store: String,

    /// Config file (defaults to ~/.config/ferry/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the maximum number of builds running at once.
    #[arg(long, global = true)]
    max_builds: Option<usize>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage modules and their versions.
    #[command(subcommand)]
    Module(ModuleCommand),
    /// Manage projects and their module links.
    #[command(subcommand)]
    Project(ProjectCommand),
    /// Print the merged compose document without building.
    Merge {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Run the policy rules over the merged document.
    Lint {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Build an offline installer and follow its progress.
    Build {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Show a build's status and progress.
    Status {
        /// Build ID.
        build_id: String,
    },
    /// List builds.
    Builds,
    /// Print the installer location of a completed build.
    Result {
        /// Build ID.
        build_id: String,
    },
    /// Cancel a queued or building build.
    Cancel {
        /// Build ID.
        build_id: String,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum ModuleCommand {
    /// Register a new module.
    Create {
        name: String,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        repository: Option<String>,
    },
    /// Add a draft version, or replace an unpublished one.
    AddVersion {
        name: String,
        version: String,
        /// Compose manifest for this version.
        #[arg(long)]
        manifest: PathBuf,
        /// YAML or JSON map of default variables.
        #[arg(long)]
        vars: Option<PathBuf>,
        /// Module this version requires in the same project.
        #[arg(long = "depends")]
        depends: Vec<String>,
        /// Module this version works with but does not require.
        #[arg(long = "optional-depends")]
        optional_depends: Vec<String>,
    },
    /// Attach a resource file to a draft version.
    AddResource {
        name: String,
        version: String,
        file: PathBuf,
        /// Path inside the installer's resource directory (defaults to the file name).
        #[arg(long = "as")]
        target: Option<PathBuf>,
    },
    /// Freeze a version. Published versions can no longer change.
    Publish { name: String, version: String },
    /// List modules.
    List,
    /// Show a module with its versions.
    Show { name: String },
    /// Deactivate a module no active project uses.
    Deactivate { name: String },
}

#[derive(Debug, Subcommand)]
enum ProjectCommand {
    /// Create a project.
    Create {
        name: String,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Link a module version at the next position.
    Add {
        project: String,
        module: String,
        version: String,
        /// Variable override for this link (KEY=VALUE).
        #[arg(long = "set")]
        set: Vec<String>,
    },
    /// Set a project variable (KEY=VALUE).
    SetVar { project: String, assignment: String },
    /// Declare an installer environment variable; an empty value must be
    /// supplied by the operator at install time.
    SetEnv {
        project: String,
        key: String,
        #[arg(default_value = "")]
        value: String,
    },
    /// Enable or disable the link at ORDER.
    Toggle {
        project: String,
        order: u32,
        #[arg(long, default_value_t = false)]
        disable: bool,
    },
    /// Show a project with its links.
    Show { project: String },
    /// List projects.
    List,
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("FERRY_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
        command => open_context(&cli.store, cli.config.as_deref(), cli.max_builds, cli.json)
            .and_then(|ctx| dispatch(&ctx, command)),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("merge error:")
                || msg.starts_with("schema error:")
                || msg.starts_with("failed to read manifest")
                || msg.starts_with("invalid variables")
            {
                EXIT_MANIFEST_ERROR
            } else if msg.starts_with("store error:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn open_context(
    store: &str,
    config: Option<&std::path::Path>,
    max_builds: Option<usize>,
    json: bool,
) -> Result<Context, String> {
    let mut config = match config {
        Some(path) => FerryConfig::load(path),
        None => FerryConfig::load_default(),
    }
    .map_err(|e| e.to_string())?;
    if let Some(n) = max_builds {
        if n == 0 {
            return Err("--max-builds must be at least 1".to_owned());
        }
        config.max_concurrent_builds = n;
    }
    let store = Store::open(expand_tilde(store)).map_err(|e| format!("store error: {e}"))?;
    Ok(Context {
        store,
        config,
        json,
    })
}

fn dispatch(ctx: &Context, command: Commands) -> Result<u8, String> {
    match command {
        Commands::Module(cmd) => match cmd {
            ModuleCommand::Create {
                name,
                author,
                description,
                repository,
            } => commands::module::create(ctx, &name, author, description, repository),
            ModuleCommand::AddVersion {
                name,
                version,
                manifest,
                vars,
                depends,
                optional_depends,
            } => commands::module::add_version(
                ctx,
                &name,
                &version,
                &manifest,
                vars.as_deref(),
                &depends,
                &optional_depends,
            ),
            ModuleCommand::AddResource {
                name,
                version,
                file,
                target,
            } => commands::module::add_resource(ctx, &name, &version, &file, target.as_deref()),
            ModuleCommand::Publish { name, version } => {
                commands::module::publish(ctx, &name, &version)
            }
            ModuleCommand::List => commands::module::list(ctx),
            ModuleCommand::Show { name } => commands::module::show(ctx, &name),
            ModuleCommand::Deactivate { name } => commands::module::deactivate(ctx, &name),
        },
        Commands::Project(cmd) => match cmd {
            ProjectCommand::Create { name, owner } => commands::project::create(ctx, &name, owner),
            ProjectCommand::Add {
                project,
                module,
                version,
                set,
            } => commands::project::add(ctx, &project, &module, &version, &set),
            ProjectCommand::SetVar {
                project,
                assignment,
            } => commands::project::set_var(ctx, &project, &assignment),
            ProjectCommand::SetEnv {
                project,
                key,
                value,
            } => commands::project::set_env(ctx, &project, &key, &value),
            ProjectCommand::Toggle {
                project,
                order,
                disable,
            } => commands::project::toggle(ctx, &project, order, !disable),
            ProjectCommand::Show { project } => commands::project::show(ctx, &project),
            ProjectCommand::List => commands::project::list(ctx),
        },
        Commands::Merge { source } => commands::merge::run(ctx, &source),
        Commands::Lint { source } => commands::lint::run(ctx, &source),
        Commands::Build { source } => {
            install_signal_handler();
            commands::build::run(ctx, &source)
        }
        Commands::Status { build_id } => commands::status::run(ctx, &build_id),
        Commands::Builds => commands::builds::run(ctx),
        Commands::Result { build_id } => commands::result::run(ctx, &build_id),
        Commands::Cancel { build_id } => commands::cancel::run(ctx, &build_id),
        Commands::Completions { .. } | Commands::ManPages { .. } => Ok(commands::EXIT_SUCCESS),
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
