//! HTTP surface for `dog-jobs`: submit jobs, look them up, read metrics.

pub mod app;
pub mod config;
pub mod error;
pub mod rest;
pub mod state;

pub use app::{jobs_app, JobsApp};
pub use config::ServerConfig;
pub use error::{ErrorKind, JobsApiError};
pub use rest::{jobs_router, JobView, SubmitBody};
pub use state::JobsState;

pub use axum;
