//! Cached aggregate reads, as consumed by request handlers.
//!
//! Cache keys start with the backing view's name so a `metrics_update`
//! broadcast naming that view evicts them.

use crate::cache::{CacheOptions, MetricsCache};
use crate::data::Aggregates;
use crate::data::activity::{self, DailyActivity};
use crate::data::funnel::{self, AssignmentFunnel};
use crate::data::health::{MatviewsHealth, check_matviews_health};
use crate::data::velocity::{self, StudentVelocity};
use crate::error::Result;
use crate::fallback::FallbackOptions;
use chrono::NaiveDate;

pub fn velocity_key(user_id: &str) -> String {
    format!("{}:{user_id}", velocity::VIEW)
}

pub fn funnel_key(assignment_id: &str) -> String {
    format!("{}:{assignment_id}", funnel::VIEW)
}

pub fn rollups_key(school_id: &str, start: NaiveDate, end: NaiveDate) -> String {
    format!("{}:{school_id}:{start}:{end}", activity::VIEW)
}

#[derive(Clone)]
pub struct MetricsService {
    cache: MetricsCache,
    aggregates: Aggregates,
    fallback_options: FallbackOptions,
}

impl MetricsService {
    pub fn new(cache: MetricsCache, aggregates: Aggregates, fallback_options: FallbackOptions) -> Self {
        Self {
            cache,
            aggregates,
            fallback_options,
        }
    }

    pub fn cache(&self) -> &MetricsCache {
        &self.cache
    }

    pub fn aggregates(&self) -> &Aggregates {
        &self.aggregates
    }

    pub async fn student_velocity(
        &self,
        user_id: &str,
        options: Option<CacheOptions>,
    ) -> Result<Vec<StudentVelocity>> {
        let aggregates = self.aggregates.clone();
        let fallback = self.fallback_options;
        let user_id = user_id.to_owned();
        self.cache
            .get(
                &velocity_key(&user_id),
                move || async move { aggregates.student_velocity(&user_id, &fallback).await },
                options,
            )
            .await
    }

    pub async fn assignment_funnel(
        &self,
        assignment_id: &str,
        options: Option<CacheOptions>,
    ) -> Result<Vec<AssignmentFunnel>> {
        let aggregates = self.aggregates.clone();
        let fallback = self.fallback_options;
        let assignment_id = assignment_id.to_owned();
        self.cache
            .get(
                &funnel_key(&assignment_id),
                move || async move { aggregates.assignment_funnel(&assignment_id, &fallback).await },
                options,
            )
            .await
    }

    pub async fn daily_activity_rollups(
        &self,
        school_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        options: Option<CacheOptions>,
    ) -> Result<Vec<DailyActivity>> {
        let aggregates = self.aggregates.clone();
        let fallback = self.fallback_options;
        let school_id = school_id.to_owned();
        self.cache
            .get(
                &rollups_key(&school_id, start, end),
                move || async move {
                    aggregates
                        .daily_activity_rollups(&school_id, start, end, &fallback)
                        .await
                },
                options,
            )
            .await
    }

    /// Uncached; health is only used for operational visibility.
    pub async fn matviews_health(&self) -> MatviewsHealth {
        check_matviews_health(self.aggregates.fallback().catalog().as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed_by_view_name() {
        assert_eq!(velocity_key("u1"), "mv_student_velocity:u1");
        assert_eq!(funnel_key("a9"), "mv_assignment_funnel:a9");
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 1, 31).unwrap();
        assert_eq!(
            rollups_key("s1", start, end),
            "mv_daily_activity_rollups:s1:2025-01-01:2025-01-31"
        );
    }
}
