//! bundlepatch CLI entry point.

use bundlepatch::config::{Owner, PatchConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cli;

/// bundlepatch - patch and ad-hoc re-sign an installed application bundle
#[derive(Parser, Debug)]
#[command(name = "bundlepatch")]
#[command(about = "Patch and ad-hoc re-sign an installed application bundle")]
#[command(version)]
struct Cli {
    /// Config file (default: <config dir>/bundlepatch/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Patch the target scripts and re-sign the bundle.
    Patch(cli::patch::PatchCmd),

    /// Show the patch state of each target.
    Status(cli::status::StatusCmd),

    /// Manage configuration.
    #[command(subcommand)]
    Config(cli::config::ConfigCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to info
    init_logging(cli.log_json);

    tracing::debug!(version = bundlepatch::VERSION, "starting bundlepatch");

    let result = match cli.command {
        Commands::Config(cmd) => cmd.run(cli.config.as_deref()),
        Commands::Patch(cmd) => load_config(cli.config).and_then(|c| cmd.run(&c)),
        Commands::Status(cmd) => load_config(cli.config).and_then(|c| cmd.run(&c)),
    };

    // Handle errors
    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Load configuration and resolve the invoking user.
fn load_config(path: Option<PathBuf>) -> bundlepatch::Result<PatchConfig> {
    let mut config = match path {
        Some(path) => PatchConfig::load_from(&path)?,
        None => PatchConfig::load()?,
    };
    config.owner = Owner::from_env();
    if let Some(owner) = config.owner {
        tracing::debug!(uid = owner.uid, gid = owner.gid, "running elevated, files go to invoking user");
    }
    Ok(config)
}

/// Initialize the tracing subscriber.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bundlepatch=info,bundlepatch_codesign=info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
