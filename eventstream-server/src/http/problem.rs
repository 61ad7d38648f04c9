//! `application/problem+json` bodies for the JSON endpoints.
//!
//! Problems reuse the stream-error vocabulary: `condition` carries the same
//! value a `stream-error` frame would, and the payload's extra fields become
//! problem extension members.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Map, Value};
use shared::models::StreamErrorPayload;

const PROBLEM_JSON: &str = "application/problem+json";

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub condition: String,
    pub detail: String,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn from_stream_error(status: StatusCode, payload: StreamErrorPayload) -> Self {
        Self {
            problem_type: format!("https://eventstream.dev/problems/{}", payload.condition),
            title: status.canonical_reason().unwrap_or("Error").to_string(),
            status: status.as_u16(),
            condition: payload.condition,
            detail: payload.text,
            extensions: payload.extra,
        }
    }
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(self)).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(PROBLEM_JSON));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }
}
