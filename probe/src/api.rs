use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{QueueSnapshot, TestId, TestStatus};

/// Failure taxonomy of the control-plane API. Subsystem failures inside a
/// running test never surface here; they become a test outcome with
/// `success=false` instead.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request is invalid: {0}")]
    ValidationFailed(String),
    #[error("unknown test {0}")]
    UnknownTest(TestId),
    #[error("{0}")]
    Conflict(String),
    #[error("the harness did not answer in time")]
    ServiceTimeout,
    #[error("the harness is unavailable, please retry later")]
    ServiceUnavailable,
    #[error("internal error")]
    Internal,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownTest(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ServiceTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            ApiError::ValidationFailed(_) => "validation-failed",
            ApiError::UnknownTest(_) => "unknown-test",
            ApiError::Conflict(_) => "conflict",
            ApiError::ServiceTimeout => "service-timeout",
            ApiError::ServiceUnavailable => "service-unavailable",
            ApiError::Internal => "internal",
        }
    }
}

/// RFC-7807 inspired error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Problem {
            problem_type: format!("probe:{}", self.title()),
            title: self.title().to_string(),
            status: status.as_u16(),
            detail: self.to_string(),
            instance: match &self {
                ApiError::UnknownTest(id) => Some(format!("/api/v1/test/{id}")),
                _ => None,
            },
        };
        (status, Json(body)).into_response()
    }
}

// Wire DTOs. The wire speaks kebab-case; the internal model stays Rust
// camelCase and is mapped here, never exposed directly.

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InitializeTestResponse {
    pub test_id: TestId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StartTestRequest {
    pub test_id: TestId,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StartTestResponse {
    pub test_id: TestId,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestStatusResponse {
    pub test_id: TestId,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<TestStatus> for TestStatusResponse {
    fn from(status: TestStatus) -> Self {
        Self {
            test_id: status.test_id,
            state: status.state.to_string(),
            bucket: status.bucket,
            test_type: status.test_type,
            start_time: status.start_time.map(|t| t.to_rfc3339()),
            end_time: status.end_time.map(|t| t.to_rfc3339()),
            success: status.success,
            error: status.error,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QueueStatusResponse {
    pub setup: usize,
    pub loading: usize,
    pub loaded: usize,
    pub testing: usize,
    pub completed: usize,
    pub exception: usize,
    pub shutting_down: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub testing_test_id: Option<TestId>,
}

impl From<QueueSnapshot> for QueueStatusResponse {
    fn from(snapshot: QueueSnapshot) -> Self {
        Self {
            setup: snapshot.setup,
            loading: snapshot.loading,
            loaded: snapshot.loaded,
            testing: snapshot.testing,
            completed: snapshot.completed,
            exception: snapshot.exception,
            shutting_down: snapshot.shutting_down,
            testing_test_id: snapshot.testing_test_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CancelTestResponse {
    pub test_id: TestId,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
