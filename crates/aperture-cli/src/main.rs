mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, jobs::JobsSubcommand, schedule::ScheduleSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "aperture",
    about = "Provision, remove and watch projects across tracker, wiki, source control, review and build backends",
    version,
    propagate_version = true
)]
struct Cli {
    /// Workspace root (default: auto-detect from .aperture/)
    #[arg(long, global = true, env = "APERTURE_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize .aperture/ in the current directory
    Init,

    /// Read and write settings
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Enqueue or cancel provisioning jobs
    Schedule {
        #[command(subcommand)]
        subcommand: ScheduleSubcommand,
    },

    /// Inspect the job store
    Jobs {
        #[command(subcommand)]
        subcommand: JobsSubcommand,
    },

    /// Dispatch due jobs until interrupted
    Daemon,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Daemon => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Schedule { subcommand } => cmd::schedule::run(&root, subcommand, cli.json),
        Commands::Jobs { subcommand } => cmd::jobs::run(&root, subcommand, cli.json),
        Commands::Daemon => cmd::daemon::run(&root),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
