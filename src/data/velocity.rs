//! Per-student reading velocity.

use super::{Aggregates, round2};
use crate::error::Result;
use crate::fallback::FallbackOptions;
use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use serde::Serialize;
use sqlx::PgPool;

pub const VIEW: &str = "mv_student_velocity";

/// One student's reading volume over the trailing 7 and 30 days.
#[derive(sqlx::FromRow, Serialize, Debug, Clone, PartialEq)]
pub struct StudentVelocity {
    pub user_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub school_id: Option<String>,
    pub articles_last_7d: i64,
    pub avg_per_day_7d: f64,
    pub articles_last_30d: i64,
    pub avg_per_day_30d: f64,
    pub articles_all_time: i64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

const VIEW_QUERY: &str = "SELECT user_id, email, display_name, school_id, \
     articles_last_7d::bigint AS articles_last_7d, \
     avg_per_day_7d::float8 AS avg_per_day_7d, \
     articles_last_30d::bigint AS articles_last_30d, \
     avg_per_day_30d::float8 AS avg_per_day_30d, \
     articles_all_time::bigint AS articles_all_time, \
     last_activity_at \
     FROM mv_student_velocity WHERE user_id = $1";

#[derive(sqlx::FromRow, Debug)]
pub(crate) struct UserRow {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub school_id: Option<String>,
}

#[derive(sqlx::FromRow, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LessonCounts {
    pub last_7d: i64,
    pub last_30d: i64,
    pub all_time: i64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl StudentVelocity {
    /// Build the view's row shape from raw lesson counts.
    pub(crate) fn from_counts(user: UserRow, counts: LessonCounts) -> Self {
        Self {
            user_id: user.id,
            email: user.email,
            display_name: user.name,
            school_id: user.school_id,
            articles_last_7d: counts.last_7d,
            avg_per_day_7d: round2(counts.last_7d as f64 / 7.0),
            articles_last_30d: counts.last_30d,
            avg_per_day_30d: round2(counts.last_30d as f64 / 30.0),
            articles_all_time: counts.all_time,
            last_activity_at: counts.last_activity_at,
        }
    }
}

async fn from_view(pool: &PgPool, user_id: &str) -> anyhow::Result<Vec<StudentVelocity>> {
    sqlx::query_as::<_, StudentVelocity>(VIEW_QUERY)
        .bind(user_id)
        .fetch_all(pool)
        .await
        .context("failed to read mv_student_velocity")
}

/// Recompute velocity from `lesson_records`; empty if the user does not exist.
async fn recompute(
    pool: &PgPool,
    user_id: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<StudentVelocity>> {
    let user = sqlx::query_as::<_, UserRow>(
        "SELECT id, email, name, school_id FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool);

    let counts = sqlx::query_as::<_, LessonCounts>(
        "SELECT count(*) FILTER (WHERE created_at >= $2) AS last_7d, \
                count(*) FILTER (WHERE created_at >= $3) AS last_30d, \
                count(*) AS all_time, \
                max(created_at) AS last_activity_at \
         FROM lesson_records WHERE user_id = $1",
    )
    .bind(user_id)
    .bind(now - TimeDelta::days(7))
    .bind(now - TimeDelta::days(30))
    .fetch_one(pool);

    let (user, counts) = tokio::try_join!(user, counts).context("failed to recompute velocity")?;
    Ok(user
        .map(|user| vec![StudentVelocity::from_counts(user, counts)])
        .unwrap_or_default())
}

impl Aggregates {
    /// Reading velocity for one student, from the view or recomputed.
    pub async fn student_velocity(
        &self,
        user_id: &str,
        options: &FallbackOptions,
    ) -> Result<Vec<StudentVelocity>> {
        let pool = &self.pool;
        self.fallback
            .query_with_fallback(
                VIEW,
                from_view(pool, user_id),
                Some(recompute(pool, user_id, Utc::now()).boxed()),
                options,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserRow {
        UserRow {
            id: "u1".into(),
            email: Some("ana@example.com".into()),
            name: Some("Ana".into()),
            school_id: Some("s1".into()),
        }
    }

    #[test]
    fn averages_are_rounded_to_two_decimals() {
        let row = StudentVelocity::from_counts(
            user(),
            LessonCounts {
                last_7d: 10,
                last_30d: 31,
                all_time: 120,
                last_activity_at: None,
            },
        );
        assert_eq!(row.avg_per_day_7d, 1.43);
        assert_eq!(row.avg_per_day_30d, 1.03);
        assert_eq!(row.articles_all_time, 120);
        assert_eq!(row.display_name.as_deref(), Some("Ana"));
    }

    #[test]
    fn idle_student_has_zero_velocity() {
        let row = StudentVelocity::from_counts(user(), LessonCounts::default());
        assert_eq!(row.articles_last_7d, 0);
        assert_eq!(row.avg_per_day_7d, 0.0);
        assert_eq!(row.last_activity_at, None);
    }
}
