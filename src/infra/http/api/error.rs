use std::error::Error as StdError;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::error::ErrorReport;
use crate::application::repository::RepositoryError;

const SOURCE: &str = "infra::http::api";

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const NOT_FOUND: &str = "not_found";
    pub const DUPLICATE: &str = "duplicate";
    pub const STORE_UNAVAILABLE: &str = "store_unavailable";
    pub const BUS_UNAVAILABLE: &str = "bus_unavailable";
    pub const TIMEOUT: &str = "timeout";
    pub const CACHE_INVARIANT: &str = "cache_invariant";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
    report: Option<ErrorReport>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
            report: None,
        }
    }

    /// Like [`ApiError::new`], keeping the full error chain for the response log.
    pub fn from_error(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
        error: &dyn StdError,
    ) -> Self {
        Self {
            report: Some(ErrorReport::from_error(SOURCE, status, error)),
            ..Self::new(status, code, message, hint)
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn not_found(message: &'static str) -> Self {
        Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, message, None)
    }

    pub fn conflict(message: &'static str) -> Self {
        Self::new(StatusCode::CONFLICT, codes::DUPLICATE, message, None)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request("invalid request body", Some(rejection.body_text()))
    }
}

impl From<RepositoryError> for ApiError {
    fn from(error: RepositoryError) -> Self {
        let (status, code, message, hint) = match &error {
            RepositoryError::Store { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                codes::STORE_UNAVAILABLE,
                "durable store unavailable",
                error
                    .is_retryable()
                    .then(|| "retry the request".to_string()),
            ),
            RepositoryError::Timeout { operation, .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                codes::TIMEOUT,
                "durable store did not answer in time",
                Some(format!("`{operation}` timed out; retry the request")),
            ),
            RepositoryError::Publish { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                codes::BUS_UNAVAILABLE,
                "invalidation bus unavailable",
                Some("the change was stored but other nodes were not notified".to_string()),
            ),
            RepositoryError::Cache(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::CACHE_INVARIANT,
                "internal cache error",
                None,
            ),
        };
        Self::from_error(status, code, message, hint, &error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let report = self.report.unwrap_or_else(|| {
            ErrorReport::from_message(
                SOURCE,
                self.status,
                format!(
                    "{}: {}",
                    self.code,
                    self.hint.as_deref().unwrap_or(self.message)
                ),
            )
        });
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        report.attach(&mut response);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::bus::BusError;
    use crate::application::repos::RepoError;
    use crate::cache::CacheError;

    #[test]
    fn repository_errors_map_to_statuses() {
        let cases = [
            (
                RepositoryError::Store {
                    operation: "store.add",
                    source: RepoError::from_persistence("down"),
                },
                StatusCode::SERVICE_UNAVAILABLE,
                codes::STORE_UNAVAILABLE,
            ),
            (
                RepositoryError::Timeout {
                    operation: "store.try_get",
                    elapsed_ms: 2000,
                },
                StatusCode::SERVICE_UNAVAILABLE,
                codes::TIMEOUT,
            ),
            (
                RepositoryError::Publish {
                    key: "k".to_string(),
                    attempts: 3,
                    source: BusError::Closed,
                },
                StatusCode::SERVICE_UNAVAILABLE,
                codes::BUS_UNAVAILABLE,
            ),
            (
                RepositoryError::Cache(CacheError::Missing("k".to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::CACHE_INVARIANT,
            ),
        ];

        for (error, status, code) in cases {
            let api = ApiError::from(error);
            assert_eq!(api.status(), status);
            assert_eq!(api.code(), code);
        }
    }

    #[test]
    fn response_carries_report_with_source_chain() {
        let error = RepositoryError::Store {
            operation: "store.add",
            source: RepoError::from_persistence("connection refused"),
        };

        let response = ApiError::from(error).into_response();
        let report = response
            .extensions()
            .get::<ErrorReport>()
            .expect("report attached");

        assert_eq!(report.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(report.messages.len(), 2);
        assert!(report.messages[1].contains("connection refused"));
    }
}
