//! Handshake route
//!
//! POST /api/v1/handshake - establishes a session via authenticated ECDH.

use axum::{
    extract::{ConnectInfo, Extension, State},
    routing::post,
    Json, Router,
};
use std::net::SocketAddr;
use uuid::Uuid;

use super::AppState;
use crate::error::ApiErrorWithRequestId;
use crate::services::{domain, get_client_ip};
use crate::types::{HandshakeRequest, HandshakeResponse};

/// Creates the handshake router.
pub fn router() -> Router<AppState> {
    Router::new().route("/handshake", post(perform_handshake))
}

/// POST /handshake
async fn perform_handshake(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Extension(request_id): Extension<Uuid>,
    headers: axum::http::HeaderMap,
    Json(req): Json<HandshakeRequest>,
) -> Result<Json<HandshakeResponse>, ApiErrorWithRequestId> {
    let client_ip = get_client_ip(&headers, peer);
    let origin_domain = domain::extract_request_domain(&headers);

    state
        .core
        .handshake(req, &client_ip, origin_domain.as_deref())
        .await
        .map(Json)
        .map_err(|error| ApiErrorWithRequestId { error, request_id })
}
