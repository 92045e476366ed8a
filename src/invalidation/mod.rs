//! Bridge from the database's `metrics_update` broadcast to cache evictions.
//!
//! The external refresh job sends `NOTIFY metrics_update, '<json>'` after
//! recomputing materialized views. [`InvalidationBridge`] keeps one dedicated
//! LISTEN connection, parses each payload, and publishes it on a broadcast
//! channel. [`spawn_cache_invalidator`] is the subscriber that evicts the
//! affected cache entries.
//!
//! Delivery is at-most-once: a broadcast sent while the bridge is
//! disconnected is lost for this process, and ttl expiry is the backstop.
//!
//! ```text
//! DISCONNECTED ──▶ CONNECTING ──▶ LISTENING
//!      ▲                │             │
//!      └──── delay ◀────┴── error ────┘
//!      (after max_reconnect_attempts consecutive failures: GAVE UP)
//! ```

mod pg;

pub use pg::PgNotificationConnector;

use crate::cache::MetricsCache;
use crate::error::{Error, Result};
use crate::utils::fmt_duration;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Broadcast channel capacity.
const CHANNEL_CAPACITY: usize = 64;

/// One `metrics_update` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationPayload {
    /// Views that finished refreshing.
    pub views: Vec<String>,
    /// Offset-less timestamps are taken as UTC.
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "success")]
    pub success_count: u32,
    #[serde(rename = "failed")]
    pub failed_count: u32,
}

impl InvalidationPayload {
    pub fn parse(raw: &str) -> Result<Self> {
        let de = &mut serde_json::Deserializer::from_str(raw);
        serde_path_to_error::deserialize(de).map_err(|e| Error::Parse {
            path: e.path().to_string(),
            message: e.inner().to_string(),
        })
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'")))
}

/// Accepts RFC 3339, Postgres text output (`2025-05-01 12:00:00.123+00`) and
/// naive ISO-8601 date-times.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let normalized = raw.trim().replacen(' ', "T", 1);
    if let Ok(ts) = DateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f%#z") {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Connection state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Listening,
    /// Reconnect attempts exhausted; only ttl expiry keeps the cache honest.
    GaveUp,
}

/// Opens LISTEN subscriptions.
#[async_trait]
pub trait NotificationConnector: Send + Sync {
    async fn connect(&self, channel: &str) -> Result<Box<dyn NotificationStream>>;
}

/// An open LISTEN subscription.
#[async_trait]
pub trait NotificationStream: Send {
    /// The next raw payload, or `None` once the connection has ended.
    async fn next_payload(&mut self) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub channel: String,
    /// Prefix of cached values derived from several views; evicted on every update.
    pub aggregate_prefix: String,
    pub reconnect_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel: "metrics_update".to_owned(),
            aggregate_prefix: "metrics:".to_owned(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
        }
    }
}

pub struct InvalidationBridge {
    connector: Arc<dyn NotificationConnector>,
    config: BridgeConfig,
    sender: broadcast::Sender<InvalidationPayload>,
    state: watch::Sender<BridgeState>,
    shutdown: CancellationToken,
}

impl InvalidationBridge {
    pub fn new(connector: Arc<dyn NotificationConnector>, config: BridgeConfig) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (state, _) = watch::channel(BridgeState::Disconnected);
        Self {
            connector,
            config,
            sender,
            state,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Receive every payload parsed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationPayload> {
        self.sender.subscribe()
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    /// Spawn the connect/listen/reconnect loop.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let span = info_span!("invalidation_bridge", channel = %self.config.channel);
        tokio::spawn(
            async move {
                info!("starting invalidation bridge");
                self.run().await
            }
            .instrument(span),
        )
    }

    /// Stop the loop and drop the subscription.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn run(&self) {
        let mut attempts = 0u32;
        loop {
            let err = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                err = self.listen(&mut attempts) => err,
            };
            self.state.send_replace(BridgeState::Disconnected);

            if attempts >= self.config.max_reconnect_attempts {
                error!(
                    error = %err,
                    attempts,
                    "max reconnection attempts reached, invalidation bridge giving up"
                );
                self.state.send_replace(BridgeState::GaveUp);
                return;
            }
            attempts += 1;
            warn!(
                error = %err,
                attempt = attempts,
                max_attempts = self.config.max_reconnect_attempts,
                delay = fmt_duration(self.config.reconnect_delay),
                "invalidation bridge disconnected, reconnecting"
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
        self.state.send_replace(BridgeState::Disconnected);
        info!("invalidation bridge stopped");
    }

    /// Connect and forward notifications until the connection fails.
    async fn listen(&self, attempts: &mut u32) -> Error {
        self.state.send_replace(BridgeState::Connecting);
        let mut stream = match self.connector.connect(&self.config.channel).await {
            Ok(stream) => stream,
            Err(e) => return e,
        };
        *attempts = 0;
        self.state.send_replace(BridgeState::Listening);
        info!(channel = %self.config.channel, "listening for metrics updates");

        loop {
            match stream.next_payload().await {
                Ok(Some(raw)) => self.dispatch(&raw),
                Ok(None) => return Error::ConnectionClosed,
                Err(e) => return e,
            }
        }
    }

    fn dispatch(&self, raw: &str) {
        match InvalidationPayload::parse(raw) {
            Ok(payload) => {
                info!(
                    views = ?payload.views,
                    success = payload.success_count,
                    failed = payload.failed_count,
                    refreshed_at = %payload.timestamp,
                    "metrics update received"
                );
                if self.sender.send(payload).is_err() {
                    debug!("metrics update has no subscribers");
                }
            }
            Err(e) => warn!(error = %e, payload = raw, "dropping malformed metrics update"),
        }
    }
}

/// Evict everything derived from the refreshed views. Returns the number of
/// entries removed.
pub fn apply_invalidation(
    cache: &MetricsCache,
    payload: &InvalidationPayload,
    aggregate_prefix: &str,
) -> usize {
    let mut removed = payload
        .views
        .iter()
        .map(|view| cache.invalidate_by_prefix(view))
        .sum::<usize>();
    if !aggregate_prefix.is_empty() {
        removed += cache.invalidate_by_prefix(aggregate_prefix);
    }
    info!(views = payload.views.len(), removed, "invalidated cache after view refresh");
    removed
}

/// Subscribe `cache` to the bridge's payloads.
///
/// If the subscriber falls behind and payloads are dropped, the whole cache
/// is cleared since the missed views are unknown.
pub fn spawn_cache_invalidator(
    cache: MetricsCache,
    mut rx: broadcast::Receiver<InvalidationPayload>,
    aggregate_prefix: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(payload) => {
                    apply_invalidation(&cache, &payload, &aggregate_prefix);
                }
                Err(RecvError::Lagged(skipped)) => {
                    let removed = cache.clear();
                    warn!(skipped, removed, "cache invalidator lagged, cleared cache");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("cache invalidator stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tracing::Subscriber;
    use tracing_subscriber::Layer;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::registry::LookupSpan;

    /// Records the innermost span name of every event.
    #[derive(Clone, Default)]
    struct EventSpans(Arc<Mutex<Vec<Option<String>>>>);

    impl<S> Layer<S> for EventSpans
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        fn on_event(&self, _event: &tracing::Event<'_>, ctx: Context<'_, S>) {
            let span = ctx.lookup_current().map(|span| span.name().to_owned());
            self.0.lock().unwrap().push(span);
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl NotificationConnector for RefusingConnector {
        async fn connect(&self, _channel: &str) -> Result<Box<dyn NotificationStream>> {
            Err(Error::ConnectionClosed)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bridge_loop_logs_inside_its_span() {
        let spans = EventSpans::default();
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(spans.clone()),
        );

        let bridge = Arc::new(InvalidationBridge::new(
            Arc::new(RefusingConnector),
            BridgeConfig {
                reconnect_delay: Duration::from_millis(10),
                max_reconnect_attempts: 1,
                ..BridgeConfig::default()
            },
        ));
        bridge.clone().start().await.unwrap();
        assert_eq!(bridge.state(), BridgeState::GaveUp);

        let recorded = spans.0.lock().unwrap();
        // starting, one reconnect warning, give-up error
        assert!(recorded.len() >= 3, "{recorded:?}");
        assert!(
            recorded
                .iter()
                .all(|span| span.as_deref() == Some("invalidation_bridge")),
            "{recorded:?}"
        );
    }

    #[test]
    fn parses_refresh_job_payload() {
        let payload = InvalidationPayload::parse(
            r#"{"views":["mv_student_velocity","mv_assignment_funnel"],"timestamp":"2025-05-01T12:00:00.000Z","success":2,"failed":0}"#,
        )
        .unwrap();
        assert_eq!(payload.views, ["mv_student_velocity", "mv_assignment_funnel"]);
        assert_eq!(payload.success_count, 2);
        assert_eq!(payload.failed_count, 0);
        assert_eq!(payload.timestamp.to_rfc3339(), "2025-05-01T12:00:00+00:00");
    }

    #[test]
    fn missing_field_reports_path() {
        let err = InvalidationPayload::parse(r#"{"views":["a"],"timestamp":"2025-05-01T12:00:00Z","success":1}"#)
            .unwrap_err();
        match err {
            Error::Parse { message, .. } => assert!(message.contains("failed"), "{message}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn wrong_type_reports_nested_path() {
        let err = InvalidationPayload::parse(
            r#"{"views":["a", 3],"timestamp":"2025-05-01T12:00:00Z","success":1,"failed":0}"#,
        )
        .unwrap_err();
        match err {
            Error::Parse { path, .. } => assert_eq!(path, "views[1]"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn timestamp_without_offset_is_utc() {
        let payload = InvalidationPayload::parse(
            r#"{"views":["mv_student_velocity"],"timestamp":"2025-05-01T12:00:00","success":1,"failed":0}"#,
        )
        .unwrap();
        assert_eq!(payload.timestamp.to_rfc3339(), "2025-05-01T12:00:00+00:00");
    }

    #[test]
    fn postgres_text_timestamp_is_accepted() {
        let payload = InvalidationPayload::parse(
            r#"{"views":["mv_student_velocity"],"timestamp":"2025-05-01 14:00:00.123+02","success":1,"failed":0}"#,
        )
        .unwrap();
        assert_eq!(payload.views, ["mv_student_velocity"]);
        assert_eq!(
            payload.timestamp.to_rfc3339(),
            "2025-05-01T12:00:00.123+00:00"
        );
    }

    #[test]
    fn unparseable_timestamp_reports_path() {
        let err = InvalidationPayload::parse(
            r#"{"views":["a"],"timestamp":"yesterday","success":1,"failed":0}"#,
        )
        .unwrap_err();
        match err {
            Error::Parse { path, message } => {
                assert_eq!(path, "timestamp");
                assert!(message.contains("yesterday"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_json_is_a_parse_error() {
        assert!(matches!(
            InvalidationPayload::parse("not json"),
            Err(Error::Parse { .. })
        ));
    }
}
