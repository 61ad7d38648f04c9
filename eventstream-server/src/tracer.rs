use axum::{body::Body, http::Request};
use std::time::Duration;
use tower_http::classify::{ServerErrorsAsFailures, ServerErrorsFailureClass, SharedClassifier};
use tower_http::trace::{DefaultOnBodyChunk, DefaultOnResponse, MakeSpan, TraceLayer};
use tracing::{Level, Span, debug, error, info};

use crate::middleware::request_context::RequestContext;

type OnRequest = fn(&Request<Body>, &Span);
type OnEos = fn(Option<&http::HeaderMap>, Duration, &Span);
type OnFailure = fn(ServerErrorsFailureClass, Duration, &Span);

type TraceLayerType = TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    HttpMakeSpan,
    OnRequest,
    DefaultOnResponse,
    DefaultOnBodyChunk,
    OnEos,
    OnFailure,
>;

/// Coarse classification of a request, recorded on its span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Stream,
    Probe,
    Api,
}

impl RequestKind {
    pub(crate) fn of<B>(request: &Request<B>) -> Self {
        let path = request.uri().path();
        if request.method() == http::Method::GET
            && (path == "/events" || path.starts_with("/events/"))
        {
            Self::Stream
        } else if matches!(path, "/healthz" | "/readyz" | "/metrics") {
            Self::Probe
        } else {
            Self::Api
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Probe => "probe",
            Self::Api => "api",
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct HttpMakeSpan;

impl<B> MakeSpan<B> for HttpMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let context = request.extensions().get::<RequestContext>();
        let request_id = context.map_or("n/a", |ctx| ctx.request_id.as_str());
        let user_id = context
            .and_then(RequestContext::user_id)
            .map_or_else(|| "anonymous".to_string(), |id| id.to_string());

        tracing::info_span!(
            "http_request",
            kind = RequestKind::of(request).as_str(),
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
            user_id = %user_id,
        )
    }
}

pub(crate) fn on_request_handler(req: &Request<Body>, span: &Span) {
    let _entered = span.enter();
    if RequestKind::of(req) == RequestKind::Probe {
        debug!(uri = %req.uri(), "probe");
    } else {
        info!(method = %req.method(), uri = %req.uri(), "request received");
    }
}

/// Event streams finish long after the response head; this marks the moment
/// the body actually closed.
pub(crate) fn on_eos_handler(_trailers: Option<&http::HeaderMap>, duration: Duration, span: &Span) {
    let _entered = span.enter();
    info!(open_for = ?duration, "response body closed");
}

pub(crate) fn on_failure_handler(error: ServerErrorsFailureClass, latency: Duration, span: &Span) {
    let _entered = span.enter();
    error!(error = %error, latency = ?latency, "request failed");
}

pub fn create_trace_layer() -> TraceLayerType {
    TraceLayer::new_for_http()
        .make_span_with(HttpMakeSpan)
        .on_request(on_request_handler as OnRequest)
        .on_response(DefaultOnResponse::new().level(Level::DEBUG))
        .on_eos(on_eos_handler as OnEos)
        .on_failure(on_failure_handler as OnFailure)
}
