//! Configuration module for the metrics cache service.
//!
//! Values are read from environment variables by figment; durations accept
//! either a bare number of seconds or a string such as `"500ms"` or `"15m"`.

use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

use crate::cache::{CacheConfig, CacheOptions};
use crate::fallback::FallbackOptions;
use crate::invalidation::BridgeConfig;

/// Main application configuration containing all sub-configurations
#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    /// Log level for the application
    ///
    /// This value is used to set the log level for this application's target specifically.
    /// e.g. "debug" would be similar to "warn,metrics_cache=debug"
    ///
    /// Valid values are: "trace", "debug", "info", "warn", "error"
    /// Defaults to "info" if not specified
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Database connection URL
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    /// Server-side cap on any single statement, applied to every pooled connection.
    #[serde(
        default = "default_statement_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub statement_timeout: Duration,

    /// How long a cached value may be served at all.
    #[serde(default = "default_cache_ttl", deserialize_with = "deserialize_duration")]
    pub cache_ttl: Duration,
    /// Age after which a cached value is served stale and refreshed.
    #[serde(
        default = "default_cache_stale_time",
        deserialize_with = "deserialize_duration"
    )]
    pub cache_stale_time: Duration,
    #[serde(
        default = "default_refresh_backoff",
        deserialize_with = "deserialize_duration"
    )]
    pub refresh_backoff: Duration,
    #[serde(
        default = "default_max_refresh_backoff",
        deserialize_with = "deserialize_duration"
    )]
    pub max_refresh_backoff: Duration,

    /// Per-path timeout for view reads and their fallbacks.
    #[serde(
        default = "default_fallback_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub fallback_timeout: Duration,
    #[serde(
        default = "default_fallback_slow_threshold",
        deserialize_with = "deserialize_duration"
    )]
    pub fallback_slow_threshold: Duration,

    #[serde(default = "default_notify_channel")]
    pub notify_channel: String,
    #[serde(default = "default_aggregate_prefix")]
    pub aggregate_prefix: String,
    #[serde(
        default = "default_listener_reconnect_delay",
        deserialize_with = "deserialize_duration"
    )]
    pub listener_reconnect_delay: Duration,
    #[serde(default = "default_listener_max_reconnect_attempts")]
    pub listener_max_reconnect_attempts: u32,

    /// Interval between background view health reports while listening.
    #[serde(
        default = "default_health_check_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub health_check_interval: Duration,
    /// Graceful shutdown timeout duration
    ///
    /// Accepts both numeric values (seconds) and duration strings
    /// Defaults to 8 seconds if not specified
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            default_options: CacheOptions::new(self.cache_ttl, self.cache_stale_time),
            refresh_backoff: self.refresh_backoff,
            max_refresh_backoff: self.max_refresh_backoff,
        }
    }

    pub fn fallback_options(&self) -> FallbackOptions {
        FallbackOptions {
            timeout: self.fallback_timeout,
            slow_threshold: self.fallback_slow_threshold,
            ..FallbackOptions::default()
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            channel: self.notify_channel.clone(),
            aggregate_prefix: self.aggregate_prefix.clone(),
            reconnect_delay: self.listener_reconnect_delay,
            max_reconnect_attempts: self.listener_max_reconnect_attempts,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_db_max_connections() -> u32 {
    4
}

fn default_statement_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_cache_stale_time() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_refresh_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_refresh_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_fallback_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_fallback_slow_threshold() -> Duration {
    Duration::from_secs(2)
}

fn default_notify_channel() -> String {
    "metrics_update".to_string()
}

fn default_aggregate_prefix() -> String {
    "metrics:".to_string()
}

fn default_listener_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_listener_max_reconnect_attempts() -> u32 {
    10
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(8)
}

/// Duration parser configured to handle various time units with seconds as default
///
/// Supports:
/// - Seconds (s) - default unit
/// - Milliseconds (ms)
/// - Minutes (m)
/// - Hours (h)
///
/// Does not support fractions, exponents, or infinity values
const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
    ])
    .parse_multiple(None)
    .allow_time_unit_delimiter()
    .disable_infinity()
    .disable_fraction()
    .disable_exponent()
    .default_unit(TimeUnit::Second)
    .build();

/// Custom deserializer for duration fields that accepts both numeric and string values
///
/// This deserializer handles the flexible duration parsing by accepting:
/// - Unsigned integers (interpreted as seconds)
/// - Signed integers (interpreted as seconds, must be non-negative)
/// - Strings (parsed using the fundu duration parser)
///
/// # Examples
///
/// - `1` -> 1 second
/// - `"30s"` -> 30 seconds
/// - `"2 m"` -> 2 minutes
/// - `"1500ms"` -> 1.5 seconds
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a duration string or number")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            DURATION_PARSER
                .parse(value)
                .map_err(|e| serde::de::Error::custom(format!("Invalid duration '{value}': {e}")))
                .and_then(|d| {
                    Duration::try_from(d).map_err(|e| {
                        serde::de::Error::custom(format!("Duration out of range '{value}': {e}"))
                    })
                })
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value < 0 {
                return Err(serde::de::Error::custom("Duration cannot be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}
