//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// boxd-export resilience engine
#[derive(Parser, Debug)]
#[command(name = "boxd-export")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "BOXD_EXPORT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "BOXD_EXPORT_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "BOXD_EXPORT_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the effective configuration as YAML
    Config,

    /// Drive synthetic flaky operations through the engine and print stats
    Simulate {
        /// Number of operations to run
        #[arg(short, long, default_value_t = 100)]
        jobs: usize,

        /// Probability (0.0-1.0) that a single attempt fails transiently
        #[arg(short, long, default_value_t = 0.2)]
        failure_rate: f64,

        /// Distinct cache keys the operations draw from
        #[arg(long, default_value_t = 20)]
        keys: usize,

        /// Simulated latency per attempt in milliseconds
        #[arg(long, default_value_t = 5)]
        latency_ms: u64,
    },
}
