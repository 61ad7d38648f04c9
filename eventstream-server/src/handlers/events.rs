//! Publishing and cursor endpoints.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, RawQuery, State},
    http::StatusCode,
};
use shared::models::{Cursor, CursorResponse, PublishEventRequest, PublishEventResponse};
use tracing::instrument;

use crate::{
    app_state::AppState,
    http::error::AppResult,
    services::EventRequestError,
};

#[utoipa::path(
    post,
    path = "/api/events/{channel}",
    params(("channel" = String, Path, description = "Target channel")),
    request_body = PublishEventRequest,
    responses(
        (status = 201, description = "Event stored and delivered", body = PublishEventResponse),
        (status = 400, description = "Invalid request"),
        (status = 500, description = "Event log failure")
    ),
    tag = "Events"
)]
#[instrument(skip(state, body))]
pub async fn publish_event(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Json(body): Json<PublishEventRequest>,
) -> AppResult<(StatusCode, Json<PublishEventResponse>)> {
    let event = state
        .publisher()
        .send_event(&channel, &body.event_type, body.data)
        .await?;

    let cursor = event.id.map(|id| {
        let mut cursor = Cursor::new();
        cursor.set(event.channel.clone(), id);
        cursor.encode()
    });

    Ok((
        StatusCode::CREATED,
        Json(PublishEventResponse { event, cursor }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/cursor",
    params(("channel" = Vec<String>, Query, description = "Channels to include")),
    responses(
        (status = 200, description = "Cursor at the current heads", body = CursorResponse),
        (status = 400, description = "No channel given")
    ),
    tag = "Events"
)]
pub async fn current_cursor(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> AppResult<Json<CursorResponse>> {
    let channels: Vec<String> = query
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .filter(|(key, _)| key == "channel")
                .map(|(_, value)| value.into_owned())
                .filter(|value| !value.is_empty())
                .collect()
        })
        .unwrap_or_default();

    if channels.is_empty() {
        return Err(EventRequestError::NoChannels.into());
    }
    let limit = state.config.stream.channel_limit;
    if channels.len() > limit {
        return Err(EventRequestError::ChannelLimitExceeded {
            requested: channels.len(),
            limit,
        }
        .into());
    }

    let cursor = state.publisher().current_cursor(&channels).await?;
    Ok(Json(CursorResponse {
        cursor: cursor.encode(),
    }))
}
