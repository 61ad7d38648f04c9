use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use anyhow::Context;
use axum::{
    Extension, Router,
    http::{HeaderValue, Method, StatusCode, header},
    response::IntoResponse,
    routing::get,
    serve,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shared::config::server::{Config, LogFormat, StorageBackend, StorageConfig};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{
    app_state::AppState,
    middleware::request_context::{self, RequestIdState},
    routes,
    services::{
        DefaultChannelManager, ListenerRegistry, MemoryEventLog, PgEventLog, RetentionPolicy,
        SharedEventLog,
    },
    tracer,
};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Process-wide Prometheus handle. The recorder is installed on first use;
/// if another recorder already owns the global slot the handle renders an
/// empty exposition.
pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if metrics::set_global_recorder(recorder).is_err() {
                error!("a metrics recorder was already installed");
            }
            handle
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Initializes the tracing subscriber for logging using the provided configuration.
pub fn initialize_tracing(config: &Config) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };
    if installed.is_err() {
        info!("tracing subscriber already installed");
    }

    config.logging.level.clone()
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// Creates a database connection pool for the Postgres event log.
///
/// # Errors
/// Returns an error if the URL is missing or the pool cannot connect.
pub async fn create_database_pool(storage: &StorageConfig) -> anyhow::Result<sqlx::PgPool> {
    let url = storage
        .database_url
        .as_deref()
        .context("storage.database_url is required for the postgres backend")?;

    let pool = PgPoolOptions::new()
        .max_connections(storage.max_connections)
        .connect(url)
        .await
        .context("failed to connect to the event log database")?;
    metrics::gauge!("db_pool_max_connections").set(f64::from(storage.max_connections));
    Ok(pool)
}

/// Builds the configured event log.
///
/// # Errors
/// Returns an error if the Postgres backend cannot be reached or bootstrapped.
pub async fn create_event_log(config: &Config) -> anyhow::Result<SharedEventLog> {
    let retention = RetentionPolicy::from_config(&config.storage);

    match config.storage.backend {
        StorageBackend::Memory => {
            info!("using in-memory event log");
            let log = Arc::new(MemoryEventLog::new(retention));
            Arc::clone(&log).spawn_retention_sweep(RETENTION_SWEEP_INTERVAL);
            Ok(log)
        }
        StorageBackend::Postgres => {
            let pool = create_database_pool(&config.storage).await?;
            let log = PgEventLog::new(pool, retention);
            log.ensure_schema()
                .await
                .context("failed to create event log schema")?;
            info!("using postgres event log");
            Ok(Arc::new(log))
        }
    }
}

/// Composes the application state around `log`.
pub fn create_app_state(config: Arc<Config>, log: SharedEventLog) -> Arc<AppState> {
    Arc::new(AppState::new(config, log, Arc::new(DefaultChannelManager)))
}

/// Creates the CORS layer. Without a configured origin the request origin
/// is mirrored back.
pub fn create_cors_layer(config: &Config) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods(AllowMethods::list([Method::GET, Method::POST, Method::OPTIONS]))
        .allow_headers(AllowHeaders::any())
        .max_age(Duration::from_secs(600));

    match config
        .server
        .allow_origin
        .as_deref()
        .and_then(|origin| HeaderValue::from_str(origin).ok())
    {
        Some(origin) => cors.allow_origin(AllowOrigin::exact(origin)),
        None => cors.allow_origin(AllowOrigin::mirror_request()),
    }
}

/// Creates the main application router with all middleware and routes.
pub fn create_app_router(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let config = Arc::clone(&state.config);
    let request_id_state = RequestIdState::from_config(&config);

    Router::new()
        .merge(routes::events::create_stream_router())
        .nest("/api", routes::events::create_api_router())
        .merge(routes::health::create_health_router())
        .merge(routes::openapi::openapi_routes())
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(Extension(metrics_handle))
        .layer(create_cors_layer(&config))
        .layer(tracer::create_trace_layer())
        .layer(axum::middleware::from_fn_with_state(
            request_id_state,
            request_context::assign_request_context,
        ))
}

/// Resolves on Ctrl-C after closing every open stream, so graceful shutdown
/// does not wait on idle SSE connections.
pub async fn create_shutdown_signal(registry: Arc<ListenerRegistry>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
    registry.shutdown();
}

/// Starts the server and binds it to the configured port.
///
/// # Errors
/// Returns an error if the event log cannot be created or the server fails.
pub async fn run(config: Config) -> anyhow::Result<()> {
    initialize_tracing(&config);
    info!("Starting server...");

    let metrics_handle = metrics_handle();
    let config = Arc::new(config);

    let log = create_event_log(&config).await?;
    let state = create_app_state(Arc::clone(&config), log);
    let registry = Arc::clone(state.registry());

    let app = create_app_router(state, metrics_handle);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);

    serve(listener, app)
        .with_graceful_shutdown(create_shutdown_signal(registry))
        .await?;

    Ok(())
}
