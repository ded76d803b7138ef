//! rollout CLI - deploy a release to a remote host

use camino::Utf8PathBuf;
use clap::Parser;
use miette::Result;
use std::process::ExitCode;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rollout::commands;

/// rollout - deploy a release to a remote host
#[derive(Debug, Parser)]
#[command(name = "rollout")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Directory containing rollout.toml
    #[arg(short = 'c', long)]
    config_dir: Option<Utf8PathBuf>,

    #[command(flatten)]
    deploy: commands::deploy::DeployArgs,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Determine config directory
    let config_dir = if let Some(ref path) = cli.config_dir {
        path.clone()
    } else {
        std::env::current_dir()
            .ok()
            .and_then(|p| Utf8PathBuf::try_from(p).ok())
            .unwrap_or_else(|| Utf8PathBuf::from("."))
    };

    // Secrets may live in a git-ignored .env next to the config
    if dotenvy::from_path(config_dir.join(".env")).is_err() {
        let _ = dotenvy::dotenv();
    }

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Create indicatif layer for the per-step spinners
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .with(filter)
        .init();

    commands::deploy::run(&config_dir, cli.deploy)
}
