//! JSON output formatting

use chrono::{DateTime, Utc};
use serde::Serialize;

use keystone_resilience::OperatingMode;

/// Every JSON document the binary prints: the payload plus a small header
#[derive(Debug, Serialize)]
pub struct Envelope<'a, T: ?Sized> {
    pub data: &'a T,
    pub meta: Meta,
}

#[derive(Debug, Serialize)]
pub struct Meta {
    pub generated_at: DateTime<Utc>,
    pub version: &'static str,
    /// Operating mode at the time of the report, when the command knows it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<OperatingMode>,
}

/// Pretty-print `data` inside an [`Envelope`].
pub fn format_json<T: Serialize + ?Sized>(
    data: &T,
    mode: Option<OperatingMode>,
) -> Result<String, serde_json::Error> {
    let envelope = Envelope {
        data,
        meta: Meta {
            generated_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION"),
            mode,
        },
    };
    serde_json::to_string_pretty(&envelope)
}
