mod common;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracklist_core::file_cache::CacheLayout;

use common::{ORIGIN, test_app};

const SESSION: HeaderName = HeaderName::from_static("x-session-id");

#[tokio::test]
async fn unknown_or_malformed_entities_get_the_placeholder() {
    let app = test_app().await;

    let response = app
        .server
        .get("/artwork-url")
        .add_query_param("entity_id", "not-a-number")
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["url"], "/static/img/album-placeholder.svg");
    assert_eq!(body["size"], "medium");

    let response = app
        .server
        .get("/artwork-url")
        .add_query_param("entity_id", 404)
        .add_query_param("size", "huge")
        .add_query_param("fallback", "/img/none.png")
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["url"], "/img/none.png");
    assert_eq!(body["size"], "medium");
}

#[tokio::test]
async fn miss_serves_origin_then_cached_file() {
    let app = test_app().await;
    app.album(1, Some(ORIGIN)).await;

    let first: Value = app
        .server
        .get("/artwork-url")
        .add_query_param("entity_id", 1)
        .add_query_param("size", "small")
        .await
        .json();
    assert_eq!(first["url"], ORIGIN);

    assert!(app.state.scheduler.wait_until_idle(Duration::from_secs(10)).await);

    let status: Value = app
        .server
        .get("/artwork/status")
        .add_query_param("entity_id", 1)
        .await
        .json();
    assert_eq!(status["status"], "completed");

    let second: Value = app
        .server
        .get("/artwork-url")
        .add_query_param("entity_id", 1)
        .add_query_param("size", "small")
        .await
        .json();
    let key = CacheLayout::generate_cache_key(ORIGIN);
    let local = format!("/static/artwork_cache/small/{key}.jpg");
    assert_eq!(second["url"], local);

    let file = app.server.get(&local).await;
    file.assert_status_ok();
    assert!(!file.as_bytes().is_empty());
}

#[tokio::test]
async fn refresh_rejections_use_structured_errors() {
    let app = test_app().await;
    app.album(2, None).await;

    let missing_id = app.server.post("/artwork/refresh").await;
    missing_id.assert_status(StatusCode::BAD_REQUEST);

    let unknown = app
        .server
        .post("/artwork/refresh")
        .add_query_param("entity_id", 999)
        .await;
    unknown.assert_status(StatusCode::NOT_FOUND);
    let body: Value = unknown.json();
    assert_eq!(body["error"]["kind"], "not_found");
    assert_eq!(body["error"]["status"], 404);

    let no_origin = app
        .server
        .post("/artwork/refresh")
        .add_query_param("entity_id", 2)
        .await;
    no_origin.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = no_origin.json();
    assert_eq!(body["error"]["kind"], "validation");
}

#[tokio::test]
async fn sixth_refresh_is_rate_limited_per_session() {
    let app = test_app().await;
    app.album(3, Some(ORIGIN)).await;

    for _ in 0..5 {
        let response = app
            .server
            .post("/artwork/refresh")
            .add_query_param("entity_id", 3)
            .add_header(SESSION, HeaderValue::from_static("s1"))
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["success"], true);
        assert!(body["task_id"].as_str().is_some());
    }

    let limited = app
        .server
        .post("/artwork/refresh")
        .add_query_param("entity_id", 3)
        .add_header(SESSION, HeaderValue::from_static("s1"))
        .await;
    limited.assert_status(StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = limited
        .header("retry-after")
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0 && retry_after <= 3600);
    let body: Value = limited.json();
    assert_eq!(body["error"]["kind"], "rate_limited");
    assert_eq!(body["error"]["retry_after"], retry_after);

    // The query parameter identifies a different client.
    app.server
        .post("/artwork/refresh")
        .add_query_param("entity_id", 3)
        .add_query_param("session_id", "s2")
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn bulk_triggers_report_per_entity_results() {
    let app = test_app().await;
    app.album(10, Some(ORIGIN)).await;
    app.album(11, Some("https://img.example/b.jpg")).await;
    app.album(12, None).await;

    let missing: Value = app
        .server
        .post("/artwork/cache-missing")
        .add_query_param("batch_size", 5)
        .await
        .json();
    assert_eq!(missing["queued"], 2);

    assert!(app.state.scheduler.wait_until_idle(Duration::from_secs(10)).await);
    let overview: Value = app.server.get("/artwork/status/overview").await.json();
    assert_eq!(overview["completed"], 2);

    let batch = app
        .server
        .post("/artwork/cache-batch")
        .json(&serde_json::json!({ "entity_ids": [12, 404] }))
        .await;
    batch.assert_status_ok();
    let body: Value = batch.json();
    assert_eq!(body["requested"], 2);
    assert!(body["results"][0]["error"].is_string());
    assert!(body["results"][1]["error"].is_string());

    app.server
        .post("/artwork/cache-missing")
        .add_query_param("batch_size", 0)
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}
