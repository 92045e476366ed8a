//! Materialized-view catalog lookups.
//!
//! The [`ViewCatalog`] trait is the seam used by the fallback orchestrator's
//! diagnostics and by the health checker, so both can run against a fake in
//! tests.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Approximate freshness and size of a materialized view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewStats {
    pub last_refresh: Option<DateTime<Utc>>,
    pub row_count: i64,
}

#[async_trait]
pub trait ViewCatalog: Send + Sync {
    /// Whether a materialized view with this name exists in the `public` schema.
    async fn view_exists(&self, name: &str) -> Result<bool>;

    /// Last (auto)analyze time and current row count of the view.
    async fn view_stats(&self, name: &str) -> Result<ViewStats>;
}

/// Catalog backed by `pg_matviews` and the statistics collector.
#[derive(Clone)]
pub struct PgViewCatalog {
    pool: PgPool,
}

impl PgViewCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ViewCatalog for PgViewCatalog {
    async fn view_exists(&self, name: &str) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (
                SELECT 1 FROM pg_matviews
                WHERE schemaname = 'public' AND matviewname = $1
            )",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to check whether {name} exists"))
    }

    async fn view_stats(&self, name: &str) -> Result<ViewStats> {
        if !is_plain_identifier(name) {
            bail!("refusing to count rows of {name:?}: not a plain identifier");
        }

        let last_refresh = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT GREATEST(
                pg_stat_get_last_analyze_time(c.oid),
                pg_stat_get_last_autoanalyze_time(c.oid)
            )
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relname = $1 AND n.nspname = 'public'",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to read statistics for {name}"))?
        .flatten();

        // The name cannot be bound as a parameter; it was validated above.
        let row_count = sqlx::query_scalar::<_, i64>(&format!("SELECT count(*) FROM public.{name}"))
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to count rows of {name}"))?;

        Ok(ViewStats {
            last_refresh,
            row_count,
        })
    }
}

/// Lowercase ASCII identifier that is safe to splice into SQL unquoted.
fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_identifiers_accepted() {
        assert!(is_plain_identifier("mv_student_velocity"));
        assert!(is_plain_identifier("_v2"));
    }

    #[test]
    fn suspicious_identifiers_rejected() {
        assert!(!is_plain_identifier(""));
        assert!(!is_plain_identifier("2fast"));
        assert!(!is_plain_identifier("mv; DROP TABLE users"));
        assert!(!is_plain_identifier("MV_Upper"));
        assert!(!is_plain_identifier("\"quoted\""));
    }
}
