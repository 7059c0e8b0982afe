//! Challenge route
//!
//! POST /api/v1/challenge - issues a challenge. Request and response bodies
//! travel inside the base64 obfuscation envelope.

use axum::{
    extract::{ConnectInfo, Extension, State},
    routing::post,
    Json, Router,
};
use std::net::SocketAddr;
use uuid::Uuid;

use super::AppState;
use crate::error::{ApiError, ApiErrorWithRequestId};
use crate::services::{domain, get_client_ip};
use crate::types::{ChallengeRequest, ObfuscatedEnvelope};

/// Upper bound on the advanced fingerprint payload.
const MAX_FINGERPRINT_BYTES: usize = 10 * 1024;

/// Upper bound on the encrypted client metadata blob (base64 form).
const MAX_ENCRYPTED_METADATA_BYTES: usize = 64 * 1024;

/// Creates the challenge router.
pub fn router() -> Router<AppState> {
    Router::new().route("/challenge", post(issue_challenge))
}

/// POST /challenge
async fn issue_challenge(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Extension(request_id): Extension<Uuid>,
    headers: axum::http::HeaderMap,
    Json(envelope): Json<ObfuscatedEnvelope>,
) -> Result<Json<ObfuscatedEnvelope>, ApiErrorWithRequestId> {
    let client_ip = get_client_ip(&headers, peer);
    let origin_domain = domain::extract_request_domain(&headers);
    let country = domain::extract_country(&headers);

    let result = async {
        let req: ChallengeRequest = envelope.unwrap_into()?;
        enforce_size_limits(&req)?;

        let response = state
            .core
            .issue_challenge(
                req,
                &client_ip,
                country.as_deref(),
                origin_domain.as_deref(),
            )
            .await?;

        ObfuscatedEnvelope::wrap(&response)
    }
    .await;

    result
        .map(Json)
        .map_err(|error| ApiErrorWithRequestId { error, request_id })
}

/// Length caps applied before any parsing or crypto work.
fn enforce_size_limits(req: &ChallengeRequest) -> Result<(), ApiError> {
    if req
        .fingerprint
        .as_ref()
        .is_some_and(|f| f.len() > MAX_FINGERPRINT_BYTES)
    {
        return Err(ApiError::InvalidRequest(
            "fingerprint payload too large".to_string(),
        ));
    }
    if req
        .encrypted_client_data
        .as_ref()
        .is_some_and(|blob| blob.ciphertext.len() > MAX_ENCRYPTED_METADATA_BYTES)
    {
        return Err(ApiError::InvalidRequest(
            "encrypted payload too large".to_string(),
        ));
    }
    Ok(())
}
