//! Local store and fallback-chain commands

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::cli::status::colored_mode;
use crate::cli::{CommandContext, OutputFormat};
use crate::output::format_json;

/// Seed the local store from a JSON array file.
pub async fn seed(ctx: &CommandContext, file: &str) -> Result<()> {
    let contents =
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file))?;
    let records: Vec<Value> = serde_json::from_str(&contents)
        .with_context(|| format!("{} must contain a JSON array of records", file))?;

    let manager = ctx.manager(false).await?;
    let report = manager.seed_local_store(&records)?;

    match ctx.format {
        OutputFormat::Json => println!("{}", format_json(&report, None)?),
        OutputFormat::Table => {
            println!(
                "{} Seeded {} records into the local store",
                "✓".green(),
                report.inserted
            );
            if report.skipped > 0 {
                println!(
                    "{} Skipped {} records without a cve_id",
                    "⚠".yellow(),
                    report.skipped
                );
            }
        }
    }

    Ok(())
}

/// Show what the system can answer right now.
pub async fn capabilities(ctx: &CommandContext) -> Result<()> {
    let manager = ctx.manager(true).await?;
    let caps = manager.capabilities()?;

    match ctx.format {
        OutputFormat::Json => println!("{}", format_json(&caps, Some(caps.mode))?),
        OutputFormat::Table => {
            println!("{}", "Offline Capabilities".bold());
            println!("────────────────────────────────────────");
            println!("Operating mode:   {}", colored_mode(caps.mode));
            println!("Seeded records:   {}", caps.local_records);
            println!("Fetched records:  {}", caps.cached_records);

            let down = caps.services.iter().filter(|s| !s.is_available).count();
            println!("Services down:    {}/{}", down, caps.services.len());

            if caps.vulnerability_correlation {
                println!("{} Vulnerability correlation available offline", "✓".green());
            } else {
                println!("{} No local records; run 'keystone seed <file>'", "✗".red());
            }
        }
    }

    Ok(())
}

/// Resolve one record through cache, live source and local store.
pub async fn lookup(ctx: &CommandContext, id: &str) -> Result<()> {
    let manager = ctx.manager(true).await?;
    let cancel = CancellationToken::new();

    let record = tokio::select! {
        result = manager.get_vulnerability(id, &cancel) => result?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            anyhow::bail!("Interrupted");
        }
    };

    match ctx.format {
        OutputFormat::Json => println!("{}", format_json(&record, Some(manager.mode()))?),
        OutputFormat::Table => println!("{}", serde_json::to_string_pretty(&record)?),
    }

    Ok(())
}
