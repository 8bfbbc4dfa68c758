use axum::{
    extract::rejection::JsonRejection,
    extract::{Path, Query, State},
    http::StatusCode,
    routing, Json, Router,
};
use chrono::{DateTime, Utc};
use dog_jobs::{JobId, JobRecord, JobState, MetricsSnapshot, Submission, SubmitReceipt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{JobsApiError, JobsState};

fn map_json_rejection(rejection: JsonRejection) -> JobsApiError {
    JobsApiError::bad_request("Failed to parse the request body as JSON")
        .with_errors(json!({"_schema": [rejection.to_string()]}))
}

fn parse_job_id(raw: &str) -> Result<JobId, JobsApiError> {
    raw.parse::<JobId>().map_err(|e| {
        JobsApiError::bad_request(format!("Invalid job id '{}'", raw))
            .with_errors(json!({"id": [e.to_string()]}))
    })
}

/// Body of `POST /jobs`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBody {
    pub job_type: String,

    /// Any JSON value; stored as its serialized bytes
    #[serde(default)]
    pub payload: Value,
    pub idempotency_key: String,
    pub max_retries: Option<u32>,
}

impl SubmitBody {
    fn into_submission(self) -> Result<Submission, JobsApiError> {
        let payload = serde_json::to_vec(&self.payload)
            .map_err(|e| JobsApiError::bad_request(format!("Unencodable payload: {}", e)))?;
        let mut submission = Submission::new(self.job_type, payload, self.idempotency_key);
        if let Some(max) = self.max_retries {
            submission = submission.max_retries(max);
        }
        Ok(submission)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyQuery {
    pub idempotency_key: String,
}

/// Public view of a job record
///
/// Payloads that are valid JSON are inlined; anything else is reported as
/// a byte array.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub job_type: String,
    pub payload: Value,
    pub idempotency_key: String,
    pub state: JobState,
    pub lease_owner: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl From<JobRecord> for JobView {
    fn from(record: JobRecord) -> Self {
        let payload = serde_json::from_slice(&record.payload)
            .unwrap_or_else(|_| json!(record.payload));
        Self {
            id: record.id,
            job_type: record.job_type,
            payload,
            idempotency_key: record.idempotency_key,
            state: record.state,
            lease_owner: record.lease_owner.map(|w| w.0),
            lease_expiry: record.lease_expiry,
            retry_count: record.retry_count,
            max_retries: record.max_retries,
            created_at: record.created_at,
            updated_at: record.updated_at,
            last_error: record.last_error,
        }
    }
}

/// Routes for submitting and inspecting jobs
///
/// - `POST /jobs` answers `202` with `{jobId, state}`, also when the key was
///   already taken (the existing job is returned)
/// - `GET /jobs?idempotencyKey=...` and `GET /jobs/{id}` return a [`JobView`]
/// - `GET /metrics` and `GET /health`
pub fn jobs_router(state: JobsState) -> Router<()> {
    Router::new()
        .route(
            "/jobs",
            routing::post(
                |State(state): State<JobsState>,
                 body: Result<Json<SubmitBody>, JsonRejection>| async move {
                    let Json(body) = body.map_err(map_json_rejection)?;
                    let receipt: SubmitReceipt =
                        state.adapter.submit_request(body.into_submission()?).await?;
                    Ok::<_, JobsApiError>((StatusCode::ACCEPTED, Json(receipt)))
                },
            )
            .get(
                |State(state): State<JobsState>, Query(query): Query<KeyQuery>| async move {
                    let record = state
                        .adapter
                        .job_by_key(&query.idempotency_key)
                        .await?
                        .ok_or_else(|| {
                            JobsApiError::not_found(format!(
                                "No job for idempotency key '{}'",
                                query.idempotency_key
                            ))
                        })?;
                    Ok::<_, JobsApiError>(Json(JobView::from(record)))
                },
            ),
        )
        .route(
            "/jobs/{id}",
            routing::get(
                |State(state): State<JobsState>, Path(id): Path<String>| async move {
                    let id = parse_job_id(&id)?;
                    let record = state.adapter.job(id).await?;
                    Ok::<_, JobsApiError>(Json(JobView::from(record)))
                },
            ),
        )
        .route(
            "/metrics",
            routing::get(|State(state): State<JobsState>| async move {
                Json::<MetricsSnapshot>(state.adapter.metrics())
            }),
        )
        .route(
            "/health",
            routing::get(|State(state): State<JobsState>| async move {
                Json(json!({
                    "status": "ok",
                    "jobTypes": state.adapter.registry().registered_types(),
                }))
            }),
        )
        .with_state(state)
}
