use clap::{Parser, Subcommand};

use std::path::PathBuf;

use super::constants::{
    ENV_CAPTURE_INTERVAL_MS, ENV_CONFIG, ENV_DEBUG, ENV_HOST, ENV_MONITORING_ENABLED,
    ENV_OCR_ENABLED, ENV_PHASH_THRESHOLD, ENV_PORT,
};

#[derive(Parser)]
#[command(name = "glimpse")]
#[command(version, about = "Continuous screen-understanding engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// API host address
    #[arg(long, short = 'H', global = true, env = ENV_HOST)]
    pub host: Option<String>,

    /// API port
    #[arg(long, short = 'p', global = true, env = ENV_PORT)]
    pub port: Option<u16>,

    /// Enable debug mode (verbose pipeline logging)
    #[arg(long, global = true, env = ENV_DEBUG)]
    pub debug: bool,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Base capture interval in milliseconds
    #[arg(long, global = true, env = ENV_CAPTURE_INTERVAL_MS)]
    pub capture_interval_ms: Option<u64>,

    /// Perceptual-hash accept threshold (Hamming distance)
    #[arg(long, global = true, env = ENV_PHASH_THRESHOLD)]
    pub phash_threshold: Option<u32>,

    /// Enable the local OCR stage
    #[arg(long, global = true, env = ENV_OCR_ENABLED)]
    pub ocr: Option<bool>,

    /// Start the monitoring endpoint immediately
    #[arg(long, global = true, env = ENV_MONITORING_ENABLED)]
    pub monitoring: Option<bool>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Start the engine (default command)
    Start,
    /// System maintenance commands
    System {
        #[command(subcommand)]
        command: SystemCommands,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum SystemCommands {
    /// Delete local data directory (database, capture files, index). Requires confirmation.
    Prune {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub debug: bool,
    pub config: Option<PathBuf>,
    pub capture_interval_ms: Option<u64>,
    pub phash_threshold: Option<u32>,
    pub ocr: Option<bool>,
    pub monitoring: Option<bool>,
}

/// Parse CLI arguments and return config with command
pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();
    let config = CliConfig {
        host: cli.host,
        port: cli.port,
        debug: cli.debug,
        config: cli.config,
        capture_interval_ms: cli.capture_interval_ms,
        phash_threshold: cli.phash_threshold,
        ocr: cli.ocr,
        monitoring: cli.monitoring,
    };
    (config, cli.command)
}
