//! Error types shared by the cache, the fallback orchestrator and the
//! invalidation bridge.
//!
//! `Error` is `Clone` so a single coalesced fetch can hand the same outcome to
//! every waiter; non-clonable sources are kept behind an `Arc`.

use crate::utils::fmt_duration;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The underlying read failed.
    #[error("fetch failed: {0:#}")]
    Fetch(Arc<anyhow::Error>),
    /// A race against the configured deadline was lost.
    #[error("{operation} timed out after {}", fmt_duration(*.timeout))]
    Timeout {
        operation: String,
        timeout: Duration,
    },
    /// An inbound broadcast payload was malformed or missing fields.
    #[error("malformed invalidation payload at `{path}`: {message}")]
    Parse { path: String, message: String },
    /// The bridge's subscription failed or ended.
    #[error("notification connection failed: {0}")]
    Connection(Arc<sqlx::Error>),
    /// The stream of notifications ended without an error.
    #[error("notification stream ended")]
    ConnectionClosed,
    /// The cache instance was disposed before the fetch could run.
    #[error("metrics cache has been disposed")]
    Disposed,
}

impl Error {
    pub fn fetch(err: impl Into<anyhow::Error>) -> Self {
        Self::Fetch(Arc::new(err.into()))
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Connection(Arc::new(err))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_includes_operation_and_duration() {
        let err = Error::timeout("mv_student_velocity fast path", Duration::from_millis(1500));
        assert_eq!(
            err.to_string(),
            "mv_student_velocity fast path timed out after 1.50s"
        );
    }

    #[test]
    fn fetch_message_keeps_context_chain() {
        let err = Error::fetch(anyhow::anyhow!("view missing").context("querying view"));
        assert_eq!(err.to_string(), "fetch failed: querying view: view missing");
    }

    #[test]
    fn clones_share_the_source() {
        let err = Error::fetch(anyhow::anyhow!("boom"));
        let copy = err.clone();
        match (err, copy) {
            (Error::Fetch(a), Error::Fetch(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => unreachable!(),
        }
    }
}
