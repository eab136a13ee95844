//! Keystone - operator tool for the vulnerability-intelligence resilience layer

use anyhow::Result;
use clap::Parser;

mod cli;
mod output;

use cli::{CacheCommands, Cli, CommandContext, Commands};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let ctx = CommandContext::new(cli.format, cli.config.as_deref())?;

    match cli.command {
        Commands::Status => cli::status::run(&ctx).await,
        Commands::Capabilities => cli::offline::capabilities(&ctx).await,
        Commands::Seed { file } => cli::offline::seed(&ctx, &file).await,
        Commands::Lookup { id } => cli::offline::lookup(&ctx, &id).await,
        Commands::Cache(cache_cmd) => match cache_cmd {
            CacheCommands::Stats => cli::cache::stats(&ctx),
            CacheCommands::Clear => cli::cache::clear(&ctx),
            CacheCommands::Path => cli::cache::path(&ctx),
        },
    }
}

/// `--debug` forces debug output; otherwise RUST_LOG applies, defaulting to warn.
fn init_logging(debug: bool) {
    let mut builder = if debug {
        let mut b = env_logger::Builder::new();
        b.filter_level(log::LevelFilter::Debug);
        b
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
    };
    builder.format_timestamp_millis().init();
}
