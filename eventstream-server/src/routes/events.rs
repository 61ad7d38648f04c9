use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::{
    app_state::AppState,
    handlers::{events, streaming},
};

/// Streaming endpoints.
pub fn create_stream_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/events", get(streaming::stream_events))
        .route("/events/{channel}", get(streaming::stream_channel_events))
}

/// JSON endpoints, nested under `/api`.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/events/{channel}", post(events::publish_event))
        .route("/cursor", get(events::current_cursor))
}
