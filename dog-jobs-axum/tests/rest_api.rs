use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderValue, Request};
use dog_jobs::{JobContext, JobError, MemoryStore, QueueAdapter};
use dog_jobs_axum::{axum, jobs_app, JobsApp};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app() -> JobsApp {
    let adapter = QueueAdapter::builder(Arc::new(MemoryStore::new()))
        .register_fn("email", |_job: JobContext, _payload: Vec<u8>| async move {
            Ok::<(), JobError>(())
        })
        .unwrap()
        .build()
        .unwrap();
    jobs_app(adapter)
}

async fn json_body(res: axum::response::Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_job(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/jobs")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn submit_returns_accepted_with_job_id() {
    let ax = app();
    let body = json!({"jobType": "email", "payload": {"to": "a@b.c"}, "idempotencyKey": "k-1"});

    let res = ax.router.oneshot(post_job(&body.to_string())).await.unwrap();

    assert_eq!(res.status().as_u16(), 202);
    assert!(res.headers().get("x-request-id").is_some());
    let body = json_body(res).await;
    assert!(body["jobId"].as_str().is_some());
    assert_eq!(body["state"], "PENDING");
}

#[tokio::test]
async fn replayed_submission_returns_same_job() {
    let ax = app();
    let body = json!({"jobType": "email", "payload": {}, "idempotencyKey": "k-dup"}).to_string();

    let first = json_body(ax.router.clone().oneshot(post_job(&body)).await.unwrap()).await;
    let res = ax.router.clone().oneshot(post_job(&body)).await.unwrap();
    assert_eq!(res.status().as_u16(), 202);
    let second = json_body(res).await;

    assert_eq!(first["jobId"], second["jobId"]);
    assert_eq!(ax.adapter.metrics().global.jobs_submitted, 1);
}

#[tokio::test]
async fn submitted_job_can_be_fetched_by_id_and_key() {
    let ax = app();
    let body = json!({
        "jobType": "email",
        "payload": {"to": "x@y.z"},
        "idempotencyKey": "k-fetch",
        "maxRetries": 5
    });
    let receipt = json_body(
        ax.router
            .clone()
            .oneshot(post_job(&body.to_string()))
            .await
            .unwrap(),
    )
    .await;
    let id = receipt["jobId"].as_str().unwrap();

    let res = ax
        .router
        .clone()
        .oneshot(get(&format!("/jobs/{}", id)))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let view = json_body(res).await;
    assert_eq!(view["id"], id);
    assert_eq!(view["jobType"], "email");
    assert_eq!(view["payload"]["to"], "x@y.z");
    assert_eq!(view["maxRetries"], 5);
    assert_eq!(view["retryCount"], 0);

    let res = ax
        .router
        .oneshot(get("/jobs?idempotencyKey=k-fetch"))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(json_body(res).await["id"], id);
}

#[tokio::test]
async fn malformed_json_returns_bad_request() {
    let ax = app();

    let res = ax
        .router
        .oneshot(post_job("{\"jobType\":\"email\""))
        .await
        .unwrap();

    assert_eq!(res.status().as_u16(), 400);
    let body = json_body(res).await;
    assert_eq!(body["name"], "BadRequest");
    assert_eq!(body["code"], 400);
    assert_eq!(body["className"], "bad-request");
    assert!(body.get("errors").is_some());
}

#[tokio::test]
async fn blank_idempotency_key_is_rejected() {
    let ax = app();
    let body = json!({"jobType": "email", "payload": {}, "idempotencyKey": "  "});

    let res = ax.router.oneshot(post_job(&body.to_string())).await.unwrap();

    assert_eq!(res.status().as_u16(), 400);
    let body = json_body(res).await;
    assert_eq!(body["name"], "BadRequest");
    assert!(body["message"].as_str().unwrap().contains("idempotencyKey"));
}

#[tokio::test]
async fn unknown_job_returns_not_found() {
    let ax = app();

    let res = ax
        .router
        .oneshot(get("/jobs/7f1d2b4e-3c5a-4e6f-8a9b-0c1d2e3f4a5b"))
        .await
        .unwrap();

    assert_eq!(res.status().as_u16(), 404);
    let body = json_body(res).await;
    assert_eq!(body["name"], "NotFound");
    assert_eq!(body["className"], "not-found");
}

#[tokio::test]
async fn invalid_job_id_returns_bad_request() {
    let ax = app();

    let res = ax.router.oneshot(get("/jobs/not-a-uuid")).await.unwrap();

    assert_eq!(res.status().as_u16(), 400);
    assert_eq!(json_body(res).await["code"], 400);
}

#[tokio::test]
async fn request_id_is_preserved_when_provided() {
    let ax = app();
    let provided = HeaderValue::from_static("req-test-123");

    let res = ax
        .router
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", provided.clone())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(res.headers().get("x-request-id").unwrap(), &provided);
    let body = json_body(res).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["jobTypes"], json!(["email"]));
}

#[tokio::test]
async fn metrics_reflect_submissions() {
    let ax = app();
    let body = json!({"jobType": "email", "payload": null, "idempotencyKey": "k-m"});
    ax.router
        .clone()
        .oneshot(post_job(&body.to_string()))
        .await
        .unwrap();

    let res = ax.router.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(res.status().as_u16(), 200);
    let body = json_body(res).await;
    assert_eq!(body["global"]["jobs_submitted"], 1);
}
