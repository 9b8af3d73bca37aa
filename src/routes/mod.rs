//! API Routes
//!
//! This module organizes all HTTP endpoints for the application:
//! - `/api/upload/` - CSV upload, creates a dataset
//! - `/api/datasets/` - List, detail, analytics, records, reports, delete
//! - `/api/health` - Health checks

pub mod datasets;
pub mod health;
pub mod upload;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::middleware::cors_layer;
use crate::models::AppState;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");

    let cors = cors_layer(&state.config.server.cors_allowed_origins);

    Router::new()
        .merge(upload::router())
        .merge(datasets::router())
        .merge(health::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
