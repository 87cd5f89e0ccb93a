mod common;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

use orbit_judge::api;
use orbit_judge::scheduler::{JobStatus, Verdict};

use common::{sh_sandbox, wait_terminal, Harness};

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>, axum::http::HeaderMap) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, body, headers)
}

fn submit_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/submit")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_submit_returns_job_id_immediately() {
    // No workers: the job must still be accepted and stay queued
    let h = Harness::new(sh_sandbox(Duration::from_secs(5)), 8, 1);
    let app = api::router(h.service());

    let (status, body, _) = send(
        &app,
        submit_request(json!({ "code": "sleep 10", "expected_output": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_slice(&body).unwrap();
    let job_id: Uuid = json["job_id"].as_str().unwrap().parse().unwrap();

    let (status, body, _) = send(&app, get(&format!("/status/{}", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["job_id"], job_id.to_string());
    assert_eq!(json["status"], "queued");
    assert!(json.get("verdict").is_none());
    assert!(json.get("actual_output").is_none());
}

#[tokio::test]
async fn test_expected_output_defaults_to_empty() {
    let h = Harness::new(sh_sandbox(Duration::from_secs(5)), 8, 1);
    let app = api::router(h.service());

    let (status, body, _) = send(&app, submit_request(json!({ "code": "true" }))).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    let job_id: Uuid = json["job_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(h.store.get(&job_id).unwrap().expected_output, "");
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let h = Harness::new(sh_sandbox(Duration::from_secs(5)), 8, 1);
    let app = api::router(h.service());

    let (status, body, _) = send(&app, submit_request(json!({ "code": "   " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["error"].as_str().unwrap().contains("empty"));

    let oversized = "x".repeat(64 * 1024 + 1);
    let (status, _, _) = send(&app, submit_request(json!({ "code": oversized }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(&app, submit_request(json!({ "expected_output": "1" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let malformed = Request::builder()
        .method("POST")
        .uri("/submit")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body, _) = send(&app, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["error"].is_string());

    assert!(h.store.is_empty());
    // Bodies that never parse do not reach the service
    assert_eq!(h.metrics.validation_failures.get(), 2);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let h = Harness::new(sh_sandbox(Duration::from_secs(5)), 8, 1);
    let app = api::router(h.service());

    let (status, body, _) = send(&app, get(&format!("/status/{}", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["error"].as_str().unwrap().contains("not found"));

    let (status, _, _) = send(&app, get("/status/not-a-uuid")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_saturated_queue_returns_503_and_discards_job() {
    // Capacity 1 and no workers: the second submission cannot be queued
    let h = Harness::new(sh_sandbox(Duration::from_secs(5)), 1, 1);
    let app = api::router(h.service());

    let (status, _, _) = send(&app, submit_request(json!({ "code": "echo 1" }))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body, headers) = send(&app, submit_request(json!({ "code": "echo 2" }))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers.get(header::RETRY_AFTER).unwrap(), "1");
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["error"].as_str().unwrap().contains("capacity"));

    assert_eq!(h.store.len(), 1);
    assert_eq!(h.metrics.jobs_rejected.get(), 1);
    assert_eq!(h.metrics.jobs_submitted.get(), 1);
}

#[tokio::test]
async fn test_status_reports_terminal_result() {
    let h = Harness::new(sh_sandbox(Duration::from_secs(5)), 8, 2);
    let service = h.service();
    let app = api::router(service.clone());
    let shutdown = CancellationToken::new();
    let pool = h.spawn_pool(&shutdown, Duration::from_secs(5));

    let (_, body, _) = send(
        &app,
        submit_request(json!({ "code": "echo 'Hello World'", "expected_output": "Hello World" })),
    )
    .await;
    let json: Value = serde_json::from_slice(&body).unwrap();
    let job_id: Uuid = json["job_id"].as_str().unwrap().parse().unwrap();
    wait_terminal(&service, &job_id, Duration::from_secs(10)).await;

    let (status, body, _) = send(&app, get(&format!("/status/{}", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    let first: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(first["status"], "completed");
    assert_eq!(first["verdict"], "Accepted");
    assert_eq!(first["actual_output"], "Hello World");
    assert_eq!(first["exit_code"], 0);

    // Repeated reads of a terminal job are identical
    let (_, body, _) = send(&app, get(&format!("/status/{}", job_id))).await;
    let second: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(first, second);

    shutdown.cancel();
    pool.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_http_submissions_get_distinct_ids() {
    let h = Harness::new(sh_sandbox(Duration::from_secs(5)), 32, 5);
    let service = h.service();
    let app = api::router(service.clone());
    let shutdown = CancellationToken::new();
    let pool = h.spawn_pool(&shutdown, Duration::from_secs(5));

    let started = Instant::now();
    let requests = (0..10).map(|i| {
        let app = app.clone();
        tokio::spawn(async move {
            let body = json!({ "code": format!("sleep 1\necho {}", i), "expected_output": i.to_string() });
            let (status, body, _) = send(&app, submit_request(body)).await;
            assert_eq!(status, StatusCode::OK);
            let json: Value = serde_json::from_slice(&body).unwrap();
            json["job_id"].as_str().unwrap().parse::<Uuid>().unwrap()
        })
    });
    let ids: Vec<Uuid> = futures::future::try_join_all(requests).await.unwrap();
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 10);

    for id in &ids {
        let view = wait_terminal(&service, id, Duration::from_secs(20)).await;
        assert_eq!(view.verdict, Some(Verdict::Accepted));
    }
    // Two rounds of five workers, not ten serial seconds
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);
    assert_eq!(h.metrics.jobs_submitted.get(), 10);

    shutdown.cancel();
    pool.join().await;
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_counters() {
    let h = Harness::new(sh_sandbox(Duration::from_secs(5)), 8, 1);
    let service = h.service();
    let app = api::router(service.clone());
    let shutdown = CancellationToken::new();
    let pool = h.spawn_pool(&shutdown, Duration::from_secs(5));

    let id = service.submit("echo 10".into(), "11".into()).await.unwrap();
    let view = wait_terminal(&service, &id, Duration::from_secs(10)).await;
    assert_eq!(view.status, JobStatus::Completed);

    let (status, body, headers) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("orbit_jobs_submitted_total 1\n"));
    assert!(text.contains("orbit_jobs_processed_total{verdict=\"WrongAnswer\"} 1\n"));
    assert!(text.contains("orbit_active_workers 0\n"));
    assert!(text.contains("orbit_queue_depth 0\n"));

    shutdown.cancel();
    pool.join().await;
}

#[tokio::test]
async fn test_health_endpoint() {
    let h = Harness::new(sh_sandbox(Duration::from_secs(5)), 4, 3);
    let app = api::router(h.service());
    h.enqueue("echo 1", "1");

    let (status, body, _) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["workers"], 3);
    assert_eq!(json["queue_depth"], 1);
    assert_eq!(json["queue_capacity"], 4);
    assert_eq!(json["jobs"], 1);
}
