//! CLI command definitions

use clap::{Parser, Subcommand};

pub mod cache;
pub mod context;
pub mod offline;
pub mod status;

pub use context::CommandContext;

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables and summaries
    #[default]
    Table,
    /// JSON for scripts
    Json,
}

/// Keystone - operator tool for the vulnerability-intelligence resilience layer
#[derive(Parser, Debug)]
#[command(name = "keystone")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (table, json)
    #[arg(
        long,
        global = true,
        env = "KEYSTONE_FORMAT",
        default_value = "table",
        hide_env = true
    )]
    pub format: OutputFormat,

    /// Override config file location
    #[arg(long, global = true, env = "KEYSTONE_CONFIG", hide_env = true)]
    pub config: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true, env = "KEYSTONE_DEBUG", hide_env = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Probe every configured service once and show the operating mode
    Status,

    /// Report what can be served without upstream access
    Capabilities,

    /// Load vulnerability records from a JSON array file into the local store
    Seed {
        /// Path to a JSON file holding an array of records
        file: String,
    },

    /// Look up one vulnerability record through the fallback chain
    Lookup {
        /// Vulnerability identifier, e.g. CVE-2024-3094
        id: String,
    },

    /// Inspect and manage the embedded cache
    #[command(subcommand)]
    Cache(CacheCommands),
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show embedded cache statistics
    Stats,
    /// Remove every embedded cache entry
    Clear,
    /// Print the embedded database location
    Path,
}
