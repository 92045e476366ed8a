//! Database and materialized-view health checks.
//!
//! Purely informational: nothing here gates reads.

use super::catalog::ViewCatalog;
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use sqlx::PgPool;
use tracing::error;

/// Every materialized view the dashboards read from.
pub const REGISTERED_VIEWS: &[&str] = &[
    "mv_student_velocity",
    "mv_assignment_funnel",
    "mv_srs_health",
    "mv_genre_engagement",
    "mv_activity_heatmap",
    "mv_cefr_ra_alignment",
    "mv_daily_activity_rollups",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewHealth {
    pub name: String,
    pub exists: bool,
    pub last_refresh: Option<DateTime<Utc>>,
    /// `None` when the count could not be obtained.
    pub row_count: Option<i64>,
}

impl ViewHealth {
    /// Present and countable; an empty view is still healthy.
    pub fn is_healthy(&self) -> bool {
        self.exists && self.row_count.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatviewsHealth {
    pub healthy: bool,
    pub views: Vec<ViewHealth>,
}

/// Verify the database connection is alive.
pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await?;
    Ok(())
}

/// Check every registered view concurrently.
pub async fn check_matviews_health(catalog: &dyn ViewCatalog) -> MatviewsHealth {
    check_views(catalog, REGISTERED_VIEWS).await
}

pub async fn check_views(catalog: &dyn ViewCatalog, names: &[&str]) -> MatviewsHealth {
    let views = join_all(names.iter().map(|name| check_view(catalog, name))).await;
    MatviewsHealth {
        healthy: views.iter().all(ViewHealth::is_healthy),
        views,
    }
}

async fn check_view(catalog: &dyn ViewCatalog, name: &str) -> ViewHealth {
    let (exists, stats) = tokio::join!(catalog.view_exists(name), catalog.view_stats(name));

    let exists = exists.unwrap_or_else(|e| {
        error!(view = name, error = ?e, "failed to check view existence");
        false
    });
    let (last_refresh, row_count) = match stats {
        Ok(stats) => (stats.last_refresh, Some(stats.row_count)),
        Err(e) => {
            error!(view = name, error = ?e, "failed to read view statistics");
            (None, None)
        }
    };

    ViewHealth {
        name: name.to_owned(),
        exists,
        last_refresh,
        row_count,
    }
}
