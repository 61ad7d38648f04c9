//! `GET /events` and `GET /events/{channel}`.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, Request, State},
    http::{HeaderValue, StatusCode, header, request::Parts},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
};
use futures_util::StreamExt;
use shared::models::{SseFrame, StreamErrorPayload};
use tracing::{debug, info};

use crate::{
    app_state::AppState,
    middleware::request_context::RequestContext,
    services::{EventRequest, EventRequestError},
};

const EVENT_STREAM: &str = "text/event-stream";

/// Maps a frame onto axum's SSE event builder.
pub(crate) fn to_sse_event(frame: SseFrame) -> Event {
    match frame {
        SseFrame::Comment(text) => Event::default().comment(text),
        SseFrame::Event { event, id, data } => {
            let builder = Event::default().event(event);
            let builder = match id {
                Some(id) => builder.id(id),
                None => builder,
            };
            builder.data(data)
        }
    }
}

/// Single `stream-error` frame answering a request that never streamed.
pub(crate) fn sse_error_response(payload: &StreamErrorPayload) -> Response {
    count_stream_error(&payload.condition);
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(EVENT_STREAM)),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        SseFrame::stream_error(payload).encode(),
    )
        .into_response()
}

fn count_stream_error(condition: &str) {
    metrics::counter!("eventstream_stream_errors_total", "condition" => condition.to_string())
        .increment(1);
}

fn resume_refused_response(err: &EventRequestError) -> Response {
    (
        StatusCode::BAD_REQUEST,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("Invalid request: {err}.\n"),
    )
        .into_response()
}

fn open_stream(state: &AppState, parts: &Parts, path_channel: Option<String>) -> Response {
    let session = parts
        .extensions
        .get::<RequestContext>()
        .and_then(|context| context.session.clone());

    let request = match EventRequest::from_parts(
        parts,
        path_channel,
        session,
        state.channel_manager.as_ref(),
        state.config.stream.channel_limit,
    ) {
        Ok(request) => request,
        Err(err @ EventRequestError::ResumeNotAllowed) => {
            debug!("refusing to resume after stream-error");
            return resume_refused_response(&err);
        }
        Err(err) => {
            debug!(error = %err, "rejected stream request");
            return sse_error_response(&err.payload());
        }
    };

    match state.coordinator.open(request) {
        Ok(frames) => {
            let events = frames.map(|frame| {
                if frame.is_terminal() {
                    let condition = serde_json::from_str::<StreamErrorPayload>(frame.data())
                        .map_or_else(
                            |_| StreamErrorPayload::INTERNAL_ERROR.to_string(),
                            |payload| payload.condition,
                        );
                    count_stream_error(&condition);
                }
                Ok::<_, Infallible>(to_sse_event(frame))
            });
            Sse::new(events).into_response()
        }
        Err(err) => {
            info!(error = %err, "stream refused");
            sse_error_response(&err.payload())
        }
    }
}

#[utoipa::path(
    get,
    path = "/events",
    params(
        ("channel" = Vec<String>, Query, description = "Channels to subscribe to"),
        ("lastEventId" = Option<String>, Query, description = "Resume cursor when the Last-Event-ID header cannot be set"),
        ("Last-Event-ID" = Option<String>, Header, description = "Resume cursor"),
    ),
    responses(
        (status = 200, description = "Event stream", body = String, content_type = "text/event-stream"),
        (status = 400, description = "Resuming after a stream-error", body = String, content_type = "text/plain")
    ),
    tag = "Events"
)]
pub async fn stream_events(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, _) = request.into_parts();
    open_stream(&state, &parts, None)
}

#[utoipa::path(
    get,
    path = "/events/{channel}",
    params(
        ("channel" = String, Path, description = "Channel to subscribe to"),
        ("Last-Event-ID" = Option<String>, Header, description = "Resume cursor"),
    ),
    responses(
        (status = 200, description = "Event stream", body = String, content_type = "text/event-stream"),
        (status = 400, description = "Resuming after a stream-error", body = String, content_type = "text/plain")
    ),
    tag = "Events"
)]
pub async fn stream_channel_events(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    request: Request,
) -> Response {
    let (parts, _) = request.into_parts();
    open_stream(&state, &parts, Some(channel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::models::Cursor;

    #[test]
    fn message_with_line_breaks_in_type_converts_without_panicking() {
        let mut cursor = Cursor::new();
        cursor.set("c", 1);
        let frame = SseFrame::message("bad\ntype\r", &json!(1), Some(&cursor));

        let _event = to_sse_event(frame);
    }

    #[tokio::test]
    async fn error_response_is_a_single_event_stream_frame() {
        let response = sse_error_response(&StreamErrorPayload::forbidden(&["a"]));

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], EVENT_STREAM);
        let bytes = axum::body::to_bytes(response.into_body(), 4096)
            .await
            .unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.starts_with("event: stream-error\n"));
        assert!(body.contains("\"condition\":\"forbidden\""));
    }
}
