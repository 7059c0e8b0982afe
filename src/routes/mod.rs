//! Route modules and router assembly
//!
//! Organizes all API routes with proper versioning:
//! - Health endpoints at root level (/health, /ready)
//! - Feature endpoints under /api/v1/ prefix

use axum::{routing::get, Router};
use std::sync::Arc;

use crate::services::CoreServices;

pub mod challenge;
pub mod handshake;
pub mod health;
pub mod siteverify;
pub mod verify;

/// Shared application state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<CoreServices>,
}

/// Creates the main API router with all routes.
///
/// Route structure:
/// - `/health`, `/ready` - monitoring (root level)
/// - `/api/v1/handshake` - session establishment
/// - `/api/v1/challenge` - challenge issuance
/// - `/api/v1/verify` - solution verification
/// - `/api/v1/siteverify` - server-to-server token exchange
pub fn api_router(state: AppState) -> Router {
    let health_router = Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check));

    let v1_router = Router::new()
        .merge(handshake::router())
        .merge(challenge::router())
        .merge(verify::router())
        .merge(siteverify::router());

    Router::new()
        .merge(health_router)
        .nest("/api/v1", v1_router)
        .with_state(state)
}
