use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use shared::models::StreamErrorPayload;
use thiserror::Error;
use tracing::error;

use super::problem::ProblemDetails;
use crate::services::{
    EventLogError, EventRequestError, PublishError, listener_registry::RegistryError,
};

pub type AppResult<T> = Result<T, ApiError>;

/// Error returned by the JSON endpoints, rendered as problem details.
#[derive(Debug, Error)]
#[error("{status}: {}", .payload.text)]
pub struct ApiError {
    status: StatusCode,
    payload: StreamErrorPayload,
}

impl ApiError {
    pub fn new(status: StatusCode, payload: StreamErrorPayload) -> Self {
        Self { status, payload }
    }

    pub fn bad_request(reason: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::BAD_REQUEST, StreamErrorPayload::bad_request(reason))
    }

    pub fn service_unavailable(text: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            StreamErrorPayload::internal(text),
        )
    }

    pub fn internal_server_error(text: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            StreamErrorPayload::internal(text),
        )
    }

    #[must_use]
    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.payload = self.payload.with_extra(key, value);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        ProblemDetails::from_stream_error(self.status, self.payload).into_response()
    }
}

impl From<EventRequestError> for ApiError {
    fn from(err: EventRequestError) -> Self {
        let extra = match &err {
            EventRequestError::ChannelLimitExceeded { limit, .. } => Some(json!(limit)),
            _ => None,
        };
        let api = Self::new(StatusCode::BAD_REQUEST, err.payload());
        match extra {
            Some(limit) => api.with_extra("limit", limit),
            None => api,
        }
    }
}

impl From<EventLogError> for ApiError {
    fn from(err: EventLogError) -> Self {
        match err {
            EventLogError::Database(db_err) => {
                error!(error = %db_err, "event log query failed");
                let api = Self::internal_server_error("Event log unavailable");
                match &db_err {
                    sqlx::Error::Database(db) => match db.code() {
                        Some(code) => api.with_extra("sqlstate", Value::from(code.into_owned())),
                        None => api,
                    },
                    _ => api,
                }
            }
            EventLogError::Serialization(err) => Self::bad_request(err),
            EventLogError::EventDoesNotExist {
                last_id,
                current_id,
            } => Self::internal_server_error("Event log position not found")
                .with_extra("last_id", json!(last_id))
                .with_extra("current_id", json!(current_id)),
        }
    }
}

impl From<PublishError> for ApiError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::Log(err) => Self::from(err),
            err => Self::bad_request(err),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        Self::service_unavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::CONTENT_TYPE;

    async fn problem(error: ApiError) -> (StatusCode, Value) {
        let response = error.into_response();
        let status = response.status();
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
        let bytes = axum::body::to_bytes(response.into_body(), 4096)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn bad_request_renders_problem_details() {
        let (status, body) = problem(ApiError::bad_request("missing channel")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["condition"], "bad-request");
        assert_eq!(body["detail"], "Invalid request: missing channel.");
    }

    #[tokio::test]
    async fn channel_limit_reports_the_limit() {
        let err = EventRequestError::ChannelLimitExceeded {
            requested: 12,
            limit: 10,
        };
        let (status, body) = problem(err.into()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "Invalid request: Channel limit exceeded.");
        assert_eq!(body["limit"], 10);
    }

    #[tokio::test]
    async fn event_log_errors_are_internal() {
        let (status, body) =
            problem(EventLogError::Database(sqlx::Error::PoolTimedOut).into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["condition"], "internal-error");
        assert_eq!(body["detail"], "Event log unavailable");

        let missing = ApiError::from(EventLogError::EventDoesNotExist {
            last_id: 4,
            current_id: 2,
        });
        assert_eq!(missing.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let (_, body) = problem(missing).await;
        assert_eq!(body["current_id"], 2);
    }

    #[tokio::test]
    async fn rejected_publish_is_a_bad_request() {
        let (status, body) = problem(PublishError::InvalidEventType.into()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["detail"],
            "Invalid request: event type must be a single non-empty line."
        );
    }

    #[test]
    fn shutdown_maps_to_service_unavailable() {
        let error = ApiError::from(RegistryError::ShuttingDown);
        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
