//! Main entry point for the `vigil` command-line client.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use dotenv::dotenv;
use shared::config::Config;
use url::Url;

mod commands;

use commands::{
    config::ConfigFormat,
    report::ReportArgs,
    session::SessionCommand,
    snapshot::SnapshotArgs,
    watch::WatchArgs,
};

/// Vigil CLI
#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Live, deduplicated responder locations for dispatch consoles", long_about = None)]
struct Cli {
    /// Path to the configuration file (optional)
    #[arg(
        long,
        short,
        global = true,
        help = "Path to the configuration file (e.g., vigil.yaml or vigil.json). If not provided, defaults and VIGIL_* variables are used."
    )]
    config: Option<PathBuf>,

    /// Base URL of the Vigil API, overriding the configuration
    #[arg(
        long,
        global = true,
        help = "Base URL of the Vigil API (e.g., https://dispatch.example.org/). Overrides the configuration file and VIGIL_SERVER_URL."
    )]
    server: Option<Url>,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands for the Vigil CLI
#[derive(Subcommand)]
enum Commands {
    /// Watch the live location view of a scope until Ctrl+C
    Watch(WatchArgs),

    /// Fetch the authoritative snapshot of a scope once
    Snapshot(SnapshotArgs),

    /// Report your own location over the realtime channel
    Report(ReportArgs),

    /// Inspect or manage the shared session token
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },

    /// Generate a configuration file
    Config {
        /// Format of the configuration file to generate (yaml or json). Defaults to yaml.
        #[arg(
            long,
            short,
            value_enum,
            default_value_t = ConfigFormat::Yaml,
            help = "Format of the configuration file to generate (yaml or json). Defaults to yaml."
        )]
        format: ConfigFormat,

        /// Where to write the file; defaults to vigil.<format> in the current directory
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Generate shell completion scripts for the CLI
    Completion {
        /// The shell type for which to generate the completion script (e.g., bash, zsh, fish, powershell)
        #[arg(
            long,
            short,
            value_enum,
            help = "The shell type for which to generate the completion script (e.g., bash, zsh, fish, powershell)"
        )]
        shell: Shell,
    },
}

fn resolve_config(cli: &Cli) -> Result<Config> {
    let config = Config::load_config(cli.config.clone(), cli.server.clone())
        .context("failed to load configuration")?;
    engine::telemetry::initialize_tracing(&config.logging)
        .context("failed to install the log subscriber")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Completion { shell } => {
            commands::completion::generate_completion(*shell);
            Ok(())
        }
        Commands::Config { format, output } => {
            commands::config::generate_config(*format, output.as_deref())
        }
        Commands::Watch(args) => commands::watch::watch(resolve_config(&cli)?, args).await,
        Commands::Snapshot(args) => commands::snapshot::snapshot(resolve_config(&cli)?, args).await,
        Commands::Report(args) => commands::report::report(resolve_config(&cli)?, args).await,
        Commands::Session { command } => commands::session::run(resolve_config(&cli)?, command).await,
    }
}
