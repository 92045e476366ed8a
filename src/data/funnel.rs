//! Per-assignment completion funnel.

use super::{Aggregates, round2};
use crate::error::Result;
use crate::fallback::FallbackOptions;
use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use sqlx::PgPool;

pub const VIEW: &str = "mv_assignment_funnel";

const IN_PROGRESS: &str = "IN_PROGRESS";
const COMPLETED: &str = "COMPLETED";

/// How far the students of one assignment have progressed.
#[derive(sqlx::FromRow, Serialize, Debug, Clone, PartialEq)]
pub struct AssignmentFunnel {
    pub assignment_id: String,
    pub classroom_id: Option<String>,
    pub school_id: Option<String>,
    pub article_id: Option<String>,
    pub assigned_at: DateTime<Utc>,
    pub total_students: i64,
    pub started_count: i64,
    pub completed_count: i64,
    pub started_pct: f64,
    pub completed_pct: f64,
    pub avg_completion_hours: Option<f64>,
}

const VIEW_QUERY: &str = "SELECT assignment_id, classroom_id, school_id, article_id, assigned_at, \
     total_students::bigint AS total_students, \
     started_count::bigint AS started_count, \
     completed_count::bigint AS completed_count, \
     started_pct::float8 AS started_pct, \
     completed_pct::float8 AS completed_pct, \
     avg_completion_hours::float8 AS avg_completion_hours \
     FROM mv_assignment_funnel WHERE assignment_id = $1";

#[derive(sqlx::FromRow, Debug)]
pub(crate) struct AssignmentRow {
    pub id: String,
    pub classroom_id: Option<String>,
    pub school_id: Option<String>,
    pub article_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub(crate) struct StudentAssignmentRow {
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AssignmentFunnel {
    /// Summarize per-student assignment state into the view's row shape.
    pub(crate) fn summarize(assignment: AssignmentRow, students: &[StudentAssignmentRow]) -> Self {
        let total = students.len() as i64;
        let started = students
            .iter()
            .filter(|s| s.status == IN_PROGRESS || s.status == COMPLETED)
            .count() as i64;
        let completed = students.iter().filter(|s| s.status == COMPLETED).count() as i64;

        let durations: Vec<f64> = students
            .iter()
            .filter(|s| s.status == COMPLETED)
            .filter_map(|s| Some((s.completed_at? - s.started_at?).num_seconds() as f64 / 3600.0))
            .collect();
        let avg_completion_hours =
            (!durations.is_empty()).then(|| durations.iter().sum::<f64>() / durations.len() as f64);

        let pct = |count: i64| {
            if total > 0 {
                round2(count as f64 / total as f64 * 100.0)
            } else {
                0.0
            }
        };

        Self {
            assignment_id: assignment.id,
            classroom_id: assignment.classroom_id,
            school_id: assignment.school_id,
            article_id: assignment.article_id,
            assigned_at: assignment.created_at,
            total_students: total,
            started_count: started,
            completed_count: completed,
            started_pct: pct(started),
            completed_pct: pct(completed),
            avg_completion_hours,
        }
    }
}

async fn from_view(pool: &PgPool, assignment_id: &str) -> anyhow::Result<Vec<AssignmentFunnel>> {
    sqlx::query_as::<_, AssignmentFunnel>(VIEW_QUERY)
        .bind(assignment_id)
        .fetch_all(pool)
        .await
        .context("failed to read mv_assignment_funnel")
}

async fn recompute(pool: &PgPool, assignment_id: &str) -> anyhow::Result<Vec<AssignmentFunnel>> {
    let assignment = sqlx::query_as::<_, AssignmentRow>(
        "SELECT a.id, a.classroom_id, c.school_id, a.article_id, a.created_at \
         FROM assignments a \
         LEFT JOIN classrooms c ON c.id = a.classroom_id \
         WHERE a.id = $1",
    )
    .bind(assignment_id)
    .fetch_optional(pool);

    let students = sqlx::query_as::<_, StudentAssignmentRow>(
        "SELECT status::text AS status, started_at, completed_at \
         FROM student_assignments WHERE assignment_id = $1",
    )
    .bind(assignment_id)
    .fetch_all(pool);

    let (assignment, students) =
        tokio::try_join!(assignment, students).context("failed to recompute assignment funnel")?;
    Ok(assignment
        .map(|a| vec![AssignmentFunnel::summarize(a, &students)])
        .unwrap_or_default())
}

impl Aggregates {
    /// Completion funnel for one assignment, from the view or recomputed.
    pub async fn assignment_funnel(
        &self,
        assignment_id: &str,
        options: &FallbackOptions,
    ) -> Result<Vec<AssignmentFunnel>> {
        let pool = &self.pool;
        self.fallback
            .query_with_fallback(
                VIEW,
                from_view(pool, assignment_id),
                Some(recompute(pool, assignment_id).boxed()),
                options,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn assignment() -> AssignmentRow {
        AssignmentRow {
            id: "a1".into(),
            classroom_id: Some("c1".into()),
            school_id: Some("s1".into()),
            article_id: Some("art1".into()),
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap(),
        }
    }

    fn student(status: &str, hours: Option<i64>) -> StudentAssignmentRow {
        let started = Utc.with_ymd_and_hms(2025, 3, 2, 9, 0, 0).unwrap();
        StudentAssignmentRow {
            status: status.into(),
            started_at: hours.map(|_| started),
            completed_at: hours.map(|h| started + chrono::TimeDelta::hours(h)),
        }
    }

    #[test]
    fn counts_started_and_completed() {
        let students = [
            student("NOT_STARTED", None),
            student(IN_PROGRESS, None),
            student(COMPLETED, Some(2)),
            student(COMPLETED, Some(4)),
        ];
        let funnel = AssignmentFunnel::summarize(assignment(), &students);
        assert_eq!(funnel.total_students, 4);
        assert_eq!(funnel.started_count, 3);
        assert_eq!(funnel.completed_count, 2);
        assert_eq!(funnel.started_pct, 75.0);
        assert_eq!(funnel.completed_pct, 50.0);
        assert_eq!(funnel.avg_completion_hours, Some(3.0));
        assert_eq!(funnel.school_id.as_deref(), Some("s1"));
    }

    #[test]
    fn completed_without_timestamps_is_excluded_from_average() {
        let students = [student(COMPLETED, None), student(COMPLETED, Some(5))];
        let funnel = AssignmentFunnel::summarize(assignment(), &students);
        assert_eq!(funnel.completed_count, 2);
        assert_eq!(funnel.avg_completion_hours, Some(5.0));
    }

    #[test]
    fn empty_assignment_has_zero_percentages() {
        let funnel = AssignmentFunnel::summarize(assignment(), &[]);
        assert_eq!(funnel.total_students, 0);
        assert_eq!(funnel.started_pct, 0.0);
        assert_eq!(funnel.avg_completion_hours, None);
    }
}
