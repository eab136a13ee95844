//! Keystone resilience layer
//!
//! Keeps vulnerability lookups working while the external intelligence
//! services behind them are slow, rate limited or down. The pieces:
//!
//! - [`circuit::CircuitBreaker`] isolates a failing upstream
//! - [`client::RateLimitedClient`] calls through a breaker and backs off on quota pressure
//! - [`cache::HierarchicalCache`] memory, embedded and remote tiers with promotion
//! - [`health::HealthDetector`] probes services and derives the [`health::OperatingMode`]
//! - [`offline::OfflineModeManager`] picks the data source for the current mode
//! - [`queue::PriorityQueue`] prioritised, batched, retried request dispatch

pub mod cache;
pub mod circuit;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod offline;
pub mod queue;
pub mod storage;
pub mod task;

pub use cache::{CacheConfig, HierarchicalCache};
pub use circuit::{BreakerConfig, CircuitBreaker, CircuitState};
pub use client::{ClientConfig, RateLimitedClient};
pub use config::Config;
pub use error::{Error, Result};
pub use health::{HealthConfig, HealthDetector, OperatingMode};
pub use offline::{OfflineCapabilities, OfflineModeManager};
pub use queue::{Priority, PriorityQueue, QueueConfig};
pub use storage::Database;
