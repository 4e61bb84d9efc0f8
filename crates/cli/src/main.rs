//! snapmirror CLI - snap command

use anyhow::Result;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use snap_cli::{cmd, util};
use std::path::PathBuf;
use tracing::Level;

/// snapmirror - content-addressed directory snapshots and live mirrors
#[derive(Parser)]
#[command(name = "snap")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose logging, including every raw filesystem event
    #[arg(long, global = true)]
    debug: bool,

    /// Config file (default: <config dir>/snapmirror/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot a directory and print its ID
    Snapshot {
        /// Directory to snapshot
        dir: PathBuf,
        /// Only include paths matching these patterns
        #[arg(long)]
        include: Vec<String>,
    },
    /// Copy a directory by snapshotting it and checking the snapshot out
    Copy {
        /// Source directory
        src: PathBuf,
        /// Destination directory (created if missing, must be empty)
        dest: PathBuf,
        /// Only include paths matching these patterns
        #[arg(long)]
        include: Vec<String>,
    },
    /// Mirror a directory into a pointer until interrupted
    Mirror {
        /// Directory to watch
        dir: PathBuf,
        /// Pointer name
        #[arg(long, default_value = "main")]
        pointer: String,
        /// Keep this directory checked out at the pointer's head
        #[arg(long)]
        to: Option<PathBuf>,
        /// Only include paths matching these patterns
        #[arg(long)]
        include: Vec<String>,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    snap_core::debug::set_debug(cli.debug);
    let debug = snap_core::debug::init_from_env();
    tracing_subscriber::fmt()
        .with_max_level(if debug { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let (config, config_path) = util::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Snapshot { dir, include } => cmd::snapshot::run(config, &dir, &include).await,
        Commands::Copy { src, dest, include } => {
            cmd::copy::run(config, &src, &dest, &include).await
        }
        Commands::Mirror {
            dir,
            pointer,
            to,
            include,
        } => cmd::mirror::run(config, &dir, &pointer, to.as_deref(), &include).await,
        Commands::Config => cmd::config::run(&config, config_path.as_deref()),
    }
}
