//! Fast-path/slow-path query orchestration for materialized views.
//!
//! A read first tries the pre-aggregated view. If that fails or exceeds its
//! deadline, the view's existence is checked for the logs and the slow path,
//! which recomputes the same rows from source tables, is raced against the
//! same deadline.
//!
//! Deadlines drop the losing future, which makes sqlx abandon the statement;
//! the pool's `statement_timeout` makes Postgres abort anything that keeps
//! running server-side.

use crate::data::catalog::ViewCatalog;
use crate::error::{Error, Result};
use crate::utils::{fmt_duration, log_if_slow};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

/// Upper bound for the existence diagnostic, so total failure stays close to
/// the sum of both path deadlines.
const DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackOptions {
    /// Deadline applied to each path separately.
    pub timeout: Duration,
    /// Log fallback usage and run the existence diagnostic.
    pub log_fallback: bool,
    /// Fast paths slower than this are logged as slow.
    pub slow_threshold: Duration,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            log_fallback: true,
            slow_threshold: Duration::from_secs(2),
        }
    }
}

/// Which path served reads for one resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackUsage {
    /// Served by the fast path.
    pub primary: u64,
    /// Served by the slow path after the fast path failed.
    pub fallback: u64,
    /// Both paths failed, or the fast path failed without a slow path.
    pub failed: u64,
}

#[derive(Clone)]
pub struct FallbackQuerier {
    catalog: Arc<dyn ViewCatalog>,
    usage: Arc<DashMap<String, FallbackUsage>>,
}

impl FallbackQuerier {
    pub fn new(catalog: Arc<dyn ViewCatalog>) -> Self {
        Self {
            catalog,
            usage: Arc::new(DashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<dyn ViewCatalog> {
        &self.catalog
    }

    /// Run `fast`, falling back to `slow` when it fails or times out.
    ///
    /// `slow` is never polled if `fast` succeeds. When both fail, the slow
    /// path's error is returned; without a slow path the fast path's error is.
    pub async fn query_with_fallback<'a, T, Fast>(
        &self,
        resource: &str,
        fast: Fast,
        slow: Option<BoxFuture<'a, anyhow::Result<T>>>,
        options: &FallbackOptions,
    ) -> Result<T>
    where
        Fast: Future<Output = anyhow::Result<T>> + 'a,
    {
        let started = Instant::now();
        let fast_err = match race(format!("{resource} query"), fast, options.timeout).await {
            Ok(value) => {
                log_if_slow(started, options.slow_threshold, resource);
                self.record(resource, |u| u.primary += 1);
                return Ok(value);
            }
            Err(err) => err,
        };

        if options.log_fallback {
            warn!(resource, error = %fast_err, "materialized view query failed");
            self.diagnose(resource, options.timeout.min(DIAGNOSTIC_TIMEOUT)).await;
        }

        let Some(slow) = slow else {
            self.record(resource, |u| u.failed += 1);
            return Err(fast_err);
        };

        if options.log_fallback {
            info!(resource, "using direct query fallback");
        }
        match race(format!("{resource} fallback query"), slow, options.timeout).await {
            Ok(value) => {
                self.record(resource, |u| u.fallback += 1);
                debug!(resource, duration = fmt_duration(started.elapsed()), "fallback query succeeded");
                Ok(value)
            }
            Err(err) => {
                self.record(resource, |u| u.failed += 1);
                if options.log_fallback {
                    error!(resource, error = %err, "fallback query failed");
                }
                Err(err)
            }
        }
    }

    /// Existence check for the logs only; never affects the outcome.
    async fn diagnose(&self, resource: &str, deadline: Duration) {
        match timeout(deadline, self.catalog.view_exists(resource)).await {
            Ok(Ok(true)) => debug!(resource, "materialized view exists"),
            Ok(Ok(false)) => error!(resource, "materialized view does not exist"),
            Ok(Err(e)) => warn!(resource, error = ?e, "failed to check materialized view existence"),
            Err(_) => warn!(resource, "materialized view existence check timed out"),
        }
    }

    fn record(&self, resource: &str, update: impl FnOnce(&mut FallbackUsage)) {
        let mut usage = self.usage.entry(resource.to_owned()).or_default();
        update(usage.value_mut());
    }

    pub fn usage(&self, resource: &str) -> FallbackUsage {
        self.usage.get(resource).map(|u| *u).unwrap_or_default()
    }

    pub fn all_usage(&self) -> BTreeMap<String, FallbackUsage> {
        self.usage
            .iter()
            .map(|item| (item.key().clone(), *item.value()))
            .collect()
    }
}

async fn race<T>(
    operation: String,
    query: impl Future<Output = anyhow::Result<T>>,
    deadline: Duration,
) -> Result<T> {
    match timeout(deadline, query).await {
        Ok(result) => result.map_err(Error::fetch),
        Err(_) => Err(Error::timeout(operation, deadline)),
    }
}
