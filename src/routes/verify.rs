//! Verify route
//!
//! POST /api/v1/verify - verifies a submitted solution. Rejections at or
//! past the signature check all surface as the same `Verification failed`
//! body so callers cannot enumerate which check tripped.

use axum::{
    extract::{ConnectInfo, Extension, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use std::net::SocketAddr;
use uuid::Uuid;

use super::AppState;
use crate::error::{ApiError, ApiErrorWithRequestId};
use crate::services::{domain, get_client_ip};
use crate::types::{VerifyRequest, VerifyResponse};

/// Creates the verify router.
pub fn router() -> Router<AppState> {
    Router::new().route("/verify", post(verify_solution))
}

/// POST /verify
async fn verify_solution(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Extension(request_id): Extension<Uuid>,
    headers: axum::http::HeaderMap,
    Json(req): Json<VerifyRequest>,
) -> Response {
    let client_ip = get_client_ip(&headers, peer);
    let origin_domain = domain::extract_request_domain(&headers);
    let country = domain::extract_country(&headers);

    match state
        .core
        .verify_solution(
            req,
            &client_ip,
            country.as_deref(),
            origin_domain.as_deref(),
        )
        .await
    {
        Ok(response) => Json(response).into_response(),
        // The generic verification failure keeps the contract's body shape.
        Err(ApiError::ReplayOrExpired) => {
            (StatusCode::FORBIDDEN, Json(VerifyResponse::failed())).into_response()
        }
        Err(error) => ApiErrorWithRequestId { error, request_id }.into_response(),
    }
}
