pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod fallback;
pub mod invalidation;
pub mod logging;
pub mod service;
pub mod utils;

pub use cache::{CacheConfig, CacheOptions, CacheStats, KeyMetrics, MetricsCache};
pub use error::{Error, Result};
pub use fallback::{FallbackOptions, FallbackQuerier, FallbackUsage};
pub use invalidation::{BridgeConfig, BridgeState, InvalidationBridge, InvalidationPayload};
pub use service::MetricsService;
