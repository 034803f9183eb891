//! # Communication Surface
//!
//! The daemon's network-facing edge: a WebSocket endpoint streaming
//! telemetry frames and a health probe. The REST control surface lives in a
//! separate service; this module only carries the real-time feed.

pub mod ws;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use tokio::sync::RwLock;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::controller::Controller;
use crate::telemetry::TelemetryPublisher;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<RwLock<Controller>>,
    pub publisher: TelemetryPublisher,
}

/// Creates the complete application router.
pub fn create_app_router(state: AppState, allowed_origins: &[String]) -> Router {
    let cors = build_cors(allowed_origins);

    Router::new()
        .route("/ws", get(ws::ws_upgrade_handler))
        .route("/healthz", get(ws::health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn build_cors(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new().allow_origin(AllowOrigin::list(origins))
}
