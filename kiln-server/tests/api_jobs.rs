use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use kiln_job_queue::{JobQueueClient, JobRequest};
use kiln_server::{build_router, state::AppState};
use serde_json::{json, Value};
use tower::util::ServiceExt;
use uuid::Uuid;

fn app_with(client: JobQueueClient, token: Option<&str>) -> Router {
    let state = AppState::new(client).with_admin_token(token.map(str::to_owned));
    build_router(Arc::new(state))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, value)
}

/// Enqueue, claim and complete one job of `group`.
async fn seed_completed(client: &JobQueueClient, group: &str) -> Uuid {
    let enqueued = client
        .enqueue(JobRequest::new("echo", json!({})).with_group_key(group))
        .await
        .unwrap();
    let job = client.claim_next("seed-worker").await.unwrap().unwrap();
    assert_eq!(job.id, enqueued.job_id());
    client.complete(&job, json!({"ok": true})).await.unwrap();
    job.id
}

#[tokio::test]
async fn enqueue_returns_201_then_200_for_repeated_key() {
    let app = app_with(JobQueueClient::in_memory(), None);
    let body = json!({
        "type": "claude_extraction",
        "payload": {"prompt": "p", "targetPath": "/tmp"},
        "idempotencyKey": "abc",
    });

    let (status, first) = send(&app, Method::POST, "/api/jobs", Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["status"], "pending");
    assert_eq!(first["deduplicated"], false);
    assert!(first["createdAt"].as_str().unwrap().ends_with('Z'));

    let (status, second) = send(&app, Method::POST, "/api/jobs", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["id"], first["id"]);
    assert_eq!(second["deduplicated"], true);

    let (_, list) = send(&app, Method::GET, "/api/jobs", None).await;
    assert_eq!(list["pagination"]["total"], 1);
}

#[tokio::test]
async fn enqueue_rejects_invalid_bodies() {
    let app = app_with(JobQueueClient::in_memory(), None);

    let (status, body) = send(&app, Method::POST, "/api/jobs", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["validation"]["type"].is_object());
    assert!(body["validation"]["payload"].is_object());

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/jobs",
        Some(json!({"type": "bad type!", "payload": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, Method::POST, "/api/jobs", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn list_filters_and_paginates() {
    let client = JobQueueClient::in_memory();
    let app = app_with(client.clone(), None);
    seed_completed(&client, "g1").await;
    for n in 0..3 {
        client
            .enqueue(JobRequest::new("echo", json!({ "n": n })))
            .await
            .unwrap();
    }

    let (status, page) = send(&app, Method::GET, "/api/jobs?limit=2&offset=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["items"].as_array().unwrap().len(), 2);
    assert_eq!(page["pagination"]["limit"], 2);
    assert_eq!(page["pagination"]["offset"], 1);
    assert_eq!(page["pagination"]["total"], 4);

    let (_, completed) = send(&app, Method::GET, "/api/jobs?status=completed", None).await;
    let items = completed["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["groupKey"], "g1");
    assert_eq!(items[0]["result"]["ok"], true);

    let (status, _) = send(&app, Method::GET, "/api/jobs?status=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, Method::GET, "/api/jobs?limit=0", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stats_count_every_status() {
    let client = JobQueueClient::in_memory();
    let app = app_with(client.clone(), None);
    seed_completed(&client, "g").await;
    client
        .enqueue(JobRequest::new("echo", json!({})))
        .await
        .unwrap();

    let (status, stats) = send(&app, Method::GET, "/api/jobs/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["pending"], 1);
    assert_eq!(stats["claimed"], 0);
    assert_eq!(stats["completed"], 1);
    assert_eq!(stats["failed"], 0);
    assert_eq!(stats["total"], 2);
}

#[tokio::test]
async fn get_and_progress_report_unknown_jobs_as_404() {
    let client = JobQueueClient::in_memory();
    let app = app_with(client.clone(), None);
    let id = seed_completed(&client, "g").await;
    client
        .record_progress(id, "halfway", Some(&json!({"pct": 50})))
        .await
        .unwrap();

    let (status, job) = send(&app, Method::GET, &format!("/api/jobs/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "completed");
    assert_eq!(job["attempts"], 1);

    let (status, progress) =
        send(&app, Method::GET, &format!("/api/jobs/{id}/progress"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["items"][0]["message"], "halfway");
    assert_eq!(progress["items"][0]["data"]["pct"], 50);

    let missing = Uuid::new_v4();
    let (status, _) = send(&app, Method::GET, &format!("/api/jobs/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) =
        send(&app, Method::GET, &format!("/api/jobs/{missing}/progress"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, Method::GET, "/api/jobs/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn retry_maps_status_codes() {
    let client = JobQueueClient::in_memory();
    let app = app_with(client.clone(), None);
    let done = seed_completed(&client, "g").await;
    let pending = client
        .enqueue(JobRequest::new("echo", json!({})))
        .await
        .unwrap()
        .job_id();

    let (status, job) = send(&app, Method::POST, &format!("/api/jobs/{done}/retry"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "pending");
    assert_eq!(job["result"], Value::Null);
    assert_eq!(job["attempts"], 1);

    let (status, _) =
        send(&app, Method::POST, &format!("/api/jobs/{pending}/retry"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let missing = Uuid::new_v4();
    let (status, _) =
        send(&app, Method::POST, &format!("/api/jobs/{missing}/retry"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_and_purge() {
    let client = JobQueueClient::in_memory();
    let app = app_with(client.clone(), None);
    let first = seed_completed(&client, "g").await;
    seed_completed(&client, "g").await;
    let pending = client
        .enqueue(JobRequest::new("echo", json!({})))
        .await
        .unwrap()
        .job_id();

    let (status, body) = send(&app, Method::DELETE, &format!("/api/jobs/{first}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);
    let (status, _) = send(&app, Method::DELETE, &format!("/api/jobs/{first}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, Method::POST, "/api/jobs/purge-completed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["purged"], 1);

    let (_, body) = send(&app, Method::POST, "/api/jobs/purge-completed", None).await;
    assert_eq!(body["purged"], 0);
    assert!(client.get_job(pending).await.unwrap().is_some());
}

#[tokio::test]
async fn lock_batch_stamps_completed_jobs_once() {
    let client = JobQueueClient::in_memory();
    let app = app_with(client.clone(), None);
    seed_completed(&client, "source-1").await;
    seed_completed(&client, "source-1").await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/jobs/batches/lock",
        Some(json!({"groupKey": "source-1", "batchId": "batch-7"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["batchId"], "batch-7");
    assert_eq!(body["lockedCount"], 2);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/jobs/batches/lock",
        Some(json!({"groupKey": "source-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/jobs/batches/lock",
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["validation"]["groupKey"].is_object());

    let (_, listed) = send(&app, Method::GET, "/api/jobs?batchId=batch-7", None).await;
    assert_eq!(listed["pagination"]["total"], 2);
}

#[tokio::test]
async fn admin_token_guards_job_routes_only() {
    let app = app_with(JobQueueClient::in_memory(), Some("s3cret"));

    let (status, body) = send(&app, Method::GET, "/api/jobs", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let req = Request::builder()
        .uri("/api/jobs/stats")
        .header(header::AUTHORIZATION, "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri("/api/jobs/stats")
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let (status, _) = send(&app, Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn health_and_ready_against_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("api.sqlite").display());
    let pool = kiln_db_connection::create_pool(&kiln_db_connection::DbConnectionConfig::new(url))
        .await
        .unwrap();
    kiln_migrations::sqlite_migrator().run(&pool).await.unwrap();
    let app = app_with(JobQueueClient::sql(pool.clone()), None);

    let (status, body) = send(&app, Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");

    let (status, _) = send(&app, Method::GET, "/api/ready", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, created) = send(
        &app,
        Method::POST,
        "/api/jobs",
        Some(json!({"type": "echo", "payload": {"a": 1}, "idempotencyKey": "k"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (_, job) = send(
        &app,
        Method::GET,
        &format!("/api/jobs/{}", created["id"].as_str().unwrap()),
        None,
    )
    .await;
    assert_eq!(job["payload"]["a"], 1);
    assert_eq!(job["idempotencyKey"], "k");

    pool.close().await;
    let (status, _) = send(&app, Method::GET, "/api/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
