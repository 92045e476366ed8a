//! Aggregate accessors, view catalog, and health checks.

pub mod activity;
pub mod catalog;
pub mod funnel;
pub mod health;
pub mod velocity;

use crate::fallback::FallbackQuerier;
use sqlx::PgPool;

/// Read access to the aggregate views, each with a direct-query fallback.
///
/// Accessor methods live next to their row types in the submodules.
#[derive(Clone)]
pub struct Aggregates {
    pool: PgPool,
    fallback: FallbackQuerier,
}

impl Aggregates {
    pub fn new(pool: PgPool, fallback: FallbackQuerier) -> Self {
        Self { pool, fallback }
    }

    pub fn fallback(&self) -> &FallbackQuerier {
        &self.fallback
    }
}

/// Round to two decimal places, as the views do.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
