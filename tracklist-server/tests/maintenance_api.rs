mod common;

use axum::http::StatusCode;
use serde_json::Value;
use std::time::Duration;

use common::{ORIGIN, test_app};

#[tokio::test]
async fn health_reports_cache_structure() {
    let app = test_app().await;
    let body: Value = app.server.get("/health").await.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["cache"]["root_exists"], true);
    assert_eq!(body["scheduler_running"], true);
}

#[tokio::test]
async fn cleanup_endpoints_report_runs() {
    let app = test_app().await;

    let status: Value = app.server.get("/cache/cleanup-status").await.json();
    assert_eq!(status["total_entries"], 0);
    assert_eq!(status["retention_days"], 365);

    let response = app
        .server
        .post("/cache/cleanup")
        .add_query_param("dry_run", true)
        .add_query_param("retention_days", 90)
        .await;
    response.assert_status_ok();
    let run: Value = response.json();
    assert_eq!(run["dry_run"], true);
    assert_eq!(run["complete"], true);
    assert_eq!(run["retention_days"], 90);
    assert_eq!(run["records_deleted"], 0);
    assert!(run["report_path"].is_string());

    app.server
        .post("/cache/cleanup")
        .add_query_param("retention_days", 0)
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn memory_stats_and_clear() {
    let app = test_app().await;
    app.album(1, Some(ORIGIN)).await;
    app.server
        .get("/artwork-url")
        .add_query_param("entity_id", 1)
        .await
        .assert_status_ok();

    let stats: Value = app.server.get("/cache/memory-stats").await.json();
    assert_eq!(stats["capacity"]["max_entries"], 200);
    assert_eq!(stats["resolver"]["cache_misses"], 1);

    assert!(app.state.scheduler.wait_until_idle(Duration::from_secs(10)).await);
    app.server
        .get("/artwork-url")
        .add_query_param("entity_id", 1)
        .add_query_param("size", "large")
        .await
        .assert_status_ok();

    let cleared: Value = app.server.post("/cache/memory/clear").await.json();
    assert_eq!(cleared["entries_cleared"], 1);
    let stats: Value = app.server.get("/cache/memory-stats").await.json();
    assert_eq!(stats["capacity"]["current_entries"], 0);
}

#[tokio::test]
async fn integrity_full_and_quick_checks() {
    let app = test_app().await;
    app.album(5, Some(ORIGIN)).await;
    // one album fans out to five variant records
    app.server
        .post("/artwork/cache-missing")
        .await
        .assert_status_ok();
    assert!(app.state.scheduler.wait_until_idle(Duration::from_secs(10)).await);

    let full: Value = app.server.get("/cache/integrity").await.json();
    assert_eq!(full["integrity_score"], 100.0);
    assert_eq!(full["summary"]["total_records"], 5);
    assert_eq!(full["repair"], false);

    let quick: Value = app
        .server
        .get("/cache/integrity")
        .add_query_param("quick", true)
        .await
        .json();
    assert_eq!(quick["sample_size"], 5);
    assert_eq!(quick["sample_missing"], 0);

    let stats: Value = app.server.get("/cache/statistics").await.json();
    assert_eq!(stats["index"]["entries"], 5);
    assert_eq!(stats["filesystem"]["total_files"], 5);

    let repaired = app
        .server
        .post("/cache/integrity")
        .add_query_param("repair", true)
        .await;
    repaired.assert_status_ok();
    let body: Value = repaired.json();
    assert_eq!(body["repair"], true);
}

#[tokio::test]
async fn task_status_history_and_manual_cleanup() {
    let app = test_app().await;

    let status: Value = app.server.get("/tasks/status").await.json();
    assert_eq!(status["scheduler"]["max_concurrent"], 3);
    assert_eq!(status["scheduled"]["running"], false);

    let queued: Value = app
        .server
        .post("/tasks/scheduled/cleanup-now")
        .add_query_param("dry_run", true)
        .await
        .json();
    let task_id = queued["task_id"].as_str().unwrap().to_string();
    assert_eq!(queued["dry_run"], true);

    assert!(app.state.scheduler.wait_until_idle(Duration::from_secs(10)).await);

    let task = app.server.get(&format!("/tasks/{task_id}")).await;
    task.assert_status_ok();
    let task: Value = task.json();
    assert_eq!(task["name"], "manual_cache_cleanup");
    assert_eq!(task["state"], "completed");

    // manual runs leave the daily schedule untouched
    let status: Value = app.server.get("/tasks/status").await.json();
    let cleanup = &status["scheduled"]["tasks"]["cache_cleanup"];
    assert_eq!(cleanup["running"], false);
    assert!(cleanup["last_run"].is_null());

    let history: Value = app
        .server
        .get("/tasks/history")
        .add_query_param("limit", 5)
        .await
        .json();
    assert_eq!(history["completed"].as_array().unwrap().len(), 1);

    app.server
        .get("/tasks/task_0_0")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}
