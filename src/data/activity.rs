//! Per-organization daily activity rollups.

use super::{Aggregates, round2};
use crate::error::Result;
use crate::fallback::FallbackOptions;
use anyhow::Context;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashSet};

pub const VIEW: &str = "mv_daily_activity_rollups";

/// Student activity of one organization on one UTC day.
#[derive(sqlx::FromRow, Serialize, Debug, Clone, PartialEq)]
pub struct DailyActivity {
    pub school_id: String,
    pub activity_date: NaiveDate,
    pub total_activities: i64,
    pub active_students: i64,
    pub completed_activities: i64,
    pub total_time_minutes: f64,
    pub avg_time_per_activity: f64,
}

const VIEW_QUERY: &str = "SELECT school_id, activity_date::date AS activity_date, \
     total_activities::bigint AS total_activities, \
     active_students::bigint AS active_students, \
     completed_activities::bigint AS completed_activities, \
     total_time_minutes::float8 AS total_time_minutes, \
     avg_time_per_activity::float8 AS avg_time_per_activity \
     FROM mv_daily_activity_rollups \
     WHERE school_id = $1 AND activity_date >= $2 AND activity_date <= $3 \
     ORDER BY activity_date DESC";

/// A raw `user_activity` row; `timer` is in milliseconds.
#[derive(sqlx::FromRow, Debug, Clone)]
pub(crate) struct ActivityRow {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub timer: Option<i64>,
    pub completed: bool,
}

#[derive(Default)]
struct DayAccumulator<'a> {
    activities: i64,
    students: HashSet<&'a str>,
    completed: i64,
    timer_ms: i64,
}

/// Group activity rows by UTC date, newest day first.
pub(crate) fn rollup(school_id: &str, rows: &[ActivityRow]) -> Vec<DailyActivity> {
    let mut days: BTreeMap<NaiveDate, DayAccumulator<'_>> = BTreeMap::new();
    for row in rows {
        let day = days.entry(row.created_at.date_naive()).or_default();
        day.activities += 1;
        day.students.insert(row.user_id.as_str());
        day.completed += i64::from(row.completed);
        day.timer_ms += row.timer.unwrap_or(0);
    }

    days.into_iter()
        .rev()
        .map(|(date, day)| {
            let minutes = day.timer_ms as f64 / 1000.0 / 60.0;
            DailyActivity {
                school_id: school_id.to_owned(),
                activity_date: date,
                total_activities: day.activities,
                active_students: day.students.len() as i64,
                completed_activities: day.completed,
                total_time_minutes: round2(minutes),
                avg_time_per_activity: if day.activities > 0 {
                    round2(minutes / day.activities as f64)
                } else {
                    0.0
                },
            }
        })
        .collect()
}

async fn from_view(
    pool: &PgPool,
    school_id: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> anyhow::Result<Vec<DailyActivity>> {
    sqlx::query_as::<_, DailyActivity>(VIEW_QUERY)
        .bind(school_id)
        .bind(start)
        .bind(end)
        .fetch_all(pool)
        .await
        .context("failed to read mv_daily_activity_rollups")
}

/// Recompute rollups from student rows of `user_activity` within `[start, end]`.
async fn recompute(
    pool: &PgPool,
    school_id: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> anyhow::Result<Vec<DailyActivity>> {
    let from = start.and_time(NaiveTime::MIN).and_utc();
    let until = end
        .checked_add_days(Days::new(1))
        .unwrap_or(end)
        .and_time(NaiveTime::MIN)
        .and_utc();

    let rows = sqlx::query_as::<_, ActivityRow>(
        "SELECT ua.user_id, ua.created_at, ua.timer::bigint AS timer, \
                COALESCE(ua.completed, false) AS completed \
         FROM user_activity ua \
         JOIN users u ON u.id = ua.user_id \
         WHERE u.school_id = $1 AND u.role = 'STUDENT' \
           AND ua.created_at >= $2 AND ua.created_at < $3",
    )
    .bind(school_id)
    .bind(from)
    .bind(until)
    .fetch_all(pool)
    .await
    .context("failed to recompute daily activity rollups")?;

    Ok(rollup(school_id, &rows))
}

impl Aggregates {
    /// Daily rollups for an organization between two inclusive dates.
    pub async fn daily_activity_rollups(
        &self,
        school_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        options: &FallbackOptions,
    ) -> Result<Vec<DailyActivity>> {
        let pool = &self.pool;
        self.fallback
            .query_with_fallback(
                VIEW,
                from_view(pool, school_id, start, end),
                Some(recompute(pool, school_id, start, end).boxed()),
                options,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(user: &str, day: u32, hour: u32, timer_ms: Option<i64>, completed: bool) -> ActivityRow {
        ActivityRow {
            user_id: user.into(),
            created_at: Utc.with_ymd_and_hms(2025, 4, day, hour, 0, 0).unwrap(),
            timer: timer_ms,
            completed,
        }
    }

    #[test]
    fn groups_by_day_newest_first() {
        let rows = [
            row("u1", 1, 9, Some(60_000), true),
            row("u1", 1, 10, Some(120_000), false),
            row("u2", 1, 23, None, true),
            row("u2", 3, 0, Some(30_000), false),
        ];
        let days = rollup("s1", &rows);
        assert_eq!(days.len(), 2);

        assert_eq!(days[0].activity_date, NaiveDate::from_ymd_opt(2025, 4, 3).unwrap());
        assert_eq!(days[0].total_activities, 1);
        assert_eq!(days[0].total_time_minutes, 0.5);

        let first = &days[1];
        assert_eq!(first.activity_date, NaiveDate::from_ymd_opt(2025, 4, 1).unwrap());
        assert_eq!(first.total_activities, 3);
        assert_eq!(first.active_students, 2);
        assert_eq!(first.completed_activities, 2);
        assert_eq!(first.total_time_minutes, 3.0);
        assert_eq!(first.avg_time_per_activity, 1.0);
        assert_eq!(first.school_id, "s1");
    }

    #[test]
    fn no_rows_no_days() {
        assert!(rollup("s1", &[]).is_empty());
    }
}
