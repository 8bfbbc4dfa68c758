use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dog_jobs::QueueError;
use serde_json::{json, Value};
use tracing::error;

/// Feathers-style error classes used by the HTTP surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    GeneralError,
    Unavailable,
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::GeneralError => 500,
            ErrorKind::Unavailable => 503,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::GeneralError => "GeneralError",
            ErrorKind::Unavailable => "Unavailable",
        }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad-request",
            ErrorKind::NotFound => "not-found",
            ErrorKind::GeneralError => "general-error",
            ErrorKind::Unavailable => "unavailable",
        }
    }
}

/// Error returned by the jobs API, rendered as `{name, message, code, className}`
#[derive(Debug)]
pub struct JobsApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub errors: Option<Value>,
}

impl JobsApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            errors: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn with_errors(mut self, errors: Value) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "name": self.kind.name(),
            "message": self.message,
            "code": self.kind.status_code(),
            "className": self.kind.class_name(),
        });
        if let Some(errors) = &self.errors {
            body["errors"] = errors.clone();
        }
        body
    }
}

impl From<QueueError> for JobsApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::InvalidSubmission(msg) => Self::bad_request(msg),
            QueueError::JobNotFound(id) => Self::not_found(format!("Job {} not found", id)),
            // Store details stay in the logs, not in the response.
            QueueError::Store(store) => {
                error!(error = %store, "Job store failure");
                Self::new(ErrorKind::Unavailable, "Job store unavailable")
            }
            other => {
                error!(error = %other, "Unexpected queue error");
                Self::new(ErrorKind::GeneralError, other.to_string())
            }
        }
    }
}

impl IntoResponse for JobsApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_json())).into_response()
    }
}
