//! Service health status command

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use keystone_resilience::health::{OperatingMode, ServiceStatus};

use crate::cli::{CommandContext, OutputFormat};
use crate::output::{format_json, format_table};

#[derive(Tabled)]
struct ServiceRow {
    #[tabled(rename = "SERVICE")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "CRITICAL")]
    critical: &'static str,
    #[tabled(rename = "STATUS")]
    status: &'static str,
    #[tabled(rename = "LATENCY")]
    latency: String,
    #[tabled(rename = "ERRORS")]
    errors: u32,
    #[tabled(rename = "BREAKER")]
    breaker: String,
    #[tabled(rename = "LAST ERROR")]
    last_error: String,
}

impl From<&ServiceStatus> for ServiceRow {
    fn from(s: &ServiceStatus) -> Self {
        Self {
            id: s.id.clone(),
            name: s.name.clone(),
            critical: if s.critical { "yes" } else { "no" },
            status: if s.is_available { "up" } else { "down" },
            latency: format!("{} ms", s.response_time_ms),
            errors: s.consecutive_errors,
            breaker: s
                .breaker_state
                .map(|state| state.to_string())
                .unwrap_or_else(|| "-".to_string()),
            last_error: s.last_error.clone().unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Probe every service once and print the result.
pub async fn run(ctx: &CommandContext) -> Result<()> {
    let detector = ctx.detector()?;
    let mode = detector.poll_once().await;
    let services = detector.service_status();

    match ctx.format {
        OutputFormat::Json => println!("{}", format_json(&services, Some(mode))?),
        OutputFormat::Table => {
            println!("Operating mode: {}\n", colored_mode(mode));
            let rows: Vec<ServiceRow> = services.iter().map(ServiceRow::from).collect();
            println!("{}", format_table(&rows, "No services configured."));
        }
    }

    Ok(())
}

pub fn colored_mode(mode: OperatingMode) -> String {
    match mode {
        OperatingMode::Online => mode.to_string().green().bold().to_string(),
        OperatingMode::Limited => mode.to_string().yellow().bold().to_string(),
        OperatingMode::Offline => mode.to_string().red().bold().to_string(),
    }
}
