//! Materialized view health reporting against a fake catalog.

mod helpers;

use helpers::FakeCatalog;
use metrics_cache::data::health::{REGISTERED_VIEWS, check_matviews_health, check_views};

fn all_views(row_count: i64) -> FakeCatalog {
    REGISTERED_VIEWS
        .iter()
        .fold(FakeCatalog::default(), |catalog, name| catalog.with_view(name, row_count))
}

#[tokio::test]
async fn all_views_present_is_healthy() {
    let health = check_matviews_health(&all_views(250)).await;

    assert!(health.healthy);
    assert_eq!(health.views.len(), REGISTERED_VIEWS.len());
    assert!(health.views.iter().all(|v| v.row_count == Some(250)));
}

#[tokio::test]
async fn empty_view_is_still_healthy() {
    let health = check_views(&FakeCatalog::default().with_view("mv_student_velocity", 0), &["mv_student_velocity"]).await;

    assert!(health.healthy);
    assert_eq!(health.views[0].row_count, Some(0));
}

#[tokio::test]
async fn missing_view_is_unhealthy() {
    let catalog = FakeCatalog::default().with_view("mv_student_velocity", 3);
    let health = check_views(&catalog, &["mv_student_velocity", "mv_assignment_funnel"]).await;

    assert!(!health.healthy);
    let missing = &health.views[1];
    assert_eq!(missing.name, "mv_assignment_funnel");
    assert!(!missing.exists);
    assert_eq!(missing.row_count, None);
    assert!(health.views[0].is_healthy());
}

#[tokio::test]
async fn unreadable_statistics_make_view_unhealthy() {
    let catalog = FakeCatalog::default().with_broken_view("mv_srs_health");
    let health = check_views(&catalog, &["mv_srs_health"]).await;

    assert!(!health.healthy);
    let view = &health.views[0];
    assert!(view.exists);
    assert_eq!(view.row_count, None);
    assert_eq!(view.last_refresh, None);
}

#[tokio::test]
async fn report_serializes_in_camel_case() {
    let health = check_views(&FakeCatalog::default().with_view("mv_student_velocity", 1), &["mv_student_velocity"]).await;
    let json = serde_json::to_value(&health).unwrap();

    assert_eq!(json["healthy"], true);
    assert_eq!(json["views"][0]["rowCount"], 1);
    assert!(json["views"][0]["lastRefresh"].is_null());
}
