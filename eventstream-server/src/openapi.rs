#![allow(clippy::needless_for_each)] // Derive macro emits a for_each internally

use shared::models::{CursorResponse, Event, PublishEventRequest, PublishEventResponse};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "EventStream API",
        version = "0.1.0",
        description = "Server-Sent Events fan-out with per-channel replay"
    ),
    paths(
        crate::handlers::streaming::stream_events,
        crate::handlers::streaming::stream_channel_events,
        crate::handlers::events::publish_event,
        crate::handlers::events::current_cursor,
    ),
    components(
        schemas(
            Event,
            PublishEventRequest,
            PublishEventResponse,
            CursorResponse,
        )
    ),
    tags(
        (name = "Events", description = "Publishing and streaming events")
    )
)]
pub struct ApiDoc;
