//! Cache management commands

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;

use keystone_resilience::cache::EmbeddedStats;

use crate::cli::{CommandContext, OutputFormat};
use crate::output::{format_json, format_size};

#[derive(Serialize)]
struct StatsReport<'a> {
    #[serde(flatten)]
    stats: &'a EmbeddedStats,
    total_size_human: String,
    path: String,
}

/// Show embedded cache statistics
pub fn stats(ctx: &CommandContext) -> Result<()> {
    let cache = ctx.cache()?;
    let stats = cache.embedded().stats(Utc::now())?;
    let path = db_path(ctx);

    match ctx.format {
        OutputFormat::Json => {
            let report = StatsReport {
                stats: &stats,
                total_size_human: format_size(stats.total_size_bytes),
                path,
            };
            println!("{}", format_json(&report, None)?);
        }
        OutputFormat::Table => {
            println!("Cache Status");
            println!("────────────────────────────────────────");
            println!("Location:       {}", path);
            println!("Valid entries:  {}", stats.valid_entries);
            println!("Expired:        {}", stats.expired_entries);
            println!("Total size:     {}", format_size(stats.total_size_bytes));
            if let Some(oldest) = stats.oldest_entry {
                println!("Oldest entry:   {}", local_time(oldest));
            }
            if let Some(newest) = stats.newest_entry {
                println!("Newest entry:   {}", local_time(newest));
            }
        }
    }

    Ok(())
}

/// Clear all embedded cache entries
pub fn clear(ctx: &CommandContext) -> Result<()> {
    let removed = ctx.cache()?.clear().context("Failed to clear cache")?;

    match ctx.format {
        OutputFormat::Json => {
            let json = serde_json::json!({ "entries_removed": removed, "success": true });
            println!("{}", format_json(&json, None)?);
        }
        OutputFormat::Table => {
            if removed > 0 {
                println!("Cleared {} cache entries", removed);
            } else {
                println!("Cache was already empty");
            }
        }
    }

    Ok(())
}

/// Print the embedded database location
pub fn path(ctx: &CommandContext) -> Result<()> {
    println!("{}", db_path(ctx));
    Ok(())
}

fn db_path(ctx: &CommandContext) -> String {
    ctx.db
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| ":memory:".to_string())
}

fn local_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}
