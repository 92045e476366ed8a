#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use metrics_cache::data::catalog::{ViewCatalog, ViewStats};
use metrics_cache::error::{Error, Result};
use metrics_cache::invalidation::{NotificationConnector, NotificationStream};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// In-memory view catalog. Views not registered are reported as missing.
#[derive(Default)]
pub struct FakeCatalog {
    views: Mutex<HashMap<String, anyhow::Result<ViewStats>>>,
    pub exists_calls: AtomicUsize,
}

impl FakeCatalog {
    pub fn with_view(self, name: &str, row_count: i64) -> Self {
        self.views.lock().unwrap().insert(
            name.to_owned(),
            Ok(ViewStats {
                last_refresh: None,
                row_count,
            }),
        );
        self
    }

    /// A view that exists but whose statistics cannot be read.
    pub fn with_broken_view(self, name: &str) -> Self {
        self.views
            .lock()
            .unwrap()
            .insert(name.to_owned(), Err(anyhow!("permission denied for {name}")));
        self
    }
}

#[async_trait]
impl ViewCatalog for FakeCatalog {
    async fn view_exists(&self, name: &str) -> anyhow::Result<bool> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.views.lock().unwrap().contains_key(name))
    }

    async fn view_stats(&self, name: &str) -> anyhow::Result<ViewStats> {
        match self.views.lock().unwrap().get(name) {
            Some(Ok(stats)) => Ok(stats.clone()),
            Some(Err(e)) => Err(anyhow!("{e}")),
            None => Err(anyhow!("relation \"{name}\" does not exist")),
        }
    }
}

/// Outcome of one scripted `connect` call.
pub enum ConnectStep {
    /// Hand out a stream fed by the paired sender.
    Stream(mpsc::UnboundedReceiver<String>),
    Fail,
}

/// Connector whose connection attempts follow a script; once the script is
/// exhausted every attempt fails.
#[derive(Default)]
pub struct ScriptedConnector {
    steps: Mutex<VecDeque<ConnectStep>>,
    pub connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(steps: impl IntoIterator<Item = ConnectStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

/// A stream step plus the sender that feeds it. Dropping the sender ends the stream.
pub fn stream_step() -> (mpsc::UnboundedSender<String>, ConnectStep) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ConnectStep::Stream(rx))
}

#[async_trait]
impl NotificationConnector for ScriptedConnector {
    async fn connect(&self, _channel: &str) -> Result<Box<dyn NotificationStream>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(ConnectStep::Stream(rx)) => Ok(Box::new(ChannelStream { rx })),
            Some(ConnectStep::Fail) | None => Err(Error::Connection(std::sync::Arc::new(
                sqlx::Error::PoolTimedOut,
            ))),
        }
    }
}

struct ChannelStream {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl NotificationStream for ChannelStream {
    async fn next_payload(&mut self) -> Result<Option<String>> {
        Ok(self.rx.recv().await)
    }
}

/// Poll `condition` every 5ms until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn payload(views: &[&str]) -> String {
    serde_json::json!({
        "views": views,
        "timestamp": "2025-05-01T12:00:00.000Z",
        "success": views.len(),
        "failed": 0,
    })
    .to_string()
}
