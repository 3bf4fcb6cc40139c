//! REST API module
//!
//! Organized into domain-specific submodules for maintainability.

mod changes;
mod chunks;
mod error;
mod files;
mod machines;
mod storage;
mod trash;
mod types;

use crate::api::AppState;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::GovernorLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

pub use error::AppError;

async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

fn app_router(state: AppState) -> Router {
    let cors_origins: Vec<HeaderValue> = state
        .config
        .cors_origins
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    tracing::info!(?cors_origins, "CORS allowed origins");

    let cors = CorsLayer::new()
        .allow_origin(cors_origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers(vec![header::HeaderName::from_static("x-request-id")]);

    let x_request_id = header::HeaderName::from_static("x-request-id");
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // `POST /api/machines/register` is unauthenticated and consumes a
    // single-use invitation token; rate-limit it per source IP so a
    // guessing script can't burn through invitations or hammer the
    // machine-name uniqueness check.
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(2)
            .burst_size(5)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("static governor config is valid"),
    );
    let register_routes = machines::register_routes().layer(GovernorLayer { config: governor_conf.clone() });

    // tower_governor doesn't evict its rate-limit entries on its own;
    // without this a long-running server would leak one entry per
    // distinct IP that has ever hit the register endpoint.
    let limiter = governor_conf.limiter().clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_secs(60));
        limiter.retain_recent();
    });

    Router::new()
        .route("/health", get(health))
        .route("/ws/client/:token", get(crate::api::ws::client_ws_handler))
        .route("/ws/dashboard", get(crate::api::ws::dashboard_ws_handler))
        .merge(register_routes)
        .merge(machines::routes())
        .merge(files::routes())
        .merge(chunks::routes())
        .merge(storage::routes())
        .merge(trash::routes())
        .merge(changes::routes())
        .layer(cors)
        // Chunk ceiling is 16 MiB (fastcdc max); this leaves slack for the
        // nonce/tag overhead and JSON request bodies without accommodating
        // whole-file uploads, since every write here is a single chunk.
        .layer(DefaultBodyLimit::max(32 * 1024 * 1024))
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
        .layer(trace_layer)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "REST API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        },
    }
}
