//! Site-verify route
//!
//! GET or POST /api/v1/siteverify - relying-backend token exchange. Accepts
//! query parameters, an urlencoded form, or JSON; malformed input maps to
//! the contract's error codes rather than HTTP errors.

use axum::{
    body::Bytes,
    extract::{Extension, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use super::AppState;
use crate::error::ApiErrorWithRequestId;
use crate::types::{SiteVerifyRequest, SiteVerifyResponse};

/// Creates the site-verify router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/siteverify", get(site_verify_get))
        .route("/siteverify", post(site_verify_post))
}

/// GET /siteverify?secret=...&response=...
async fn site_verify_get(
    State(state): State<AppState>,
    Extension(request_id): Extension<Uuid>,
    Query(req): Query<SiteVerifyRequest>,
) -> Result<Json<SiteVerifyResponse>, ApiErrorWithRequestId> {
    state
        .core
        .site_verify(req)
        .await
        .map(Json)
        .map_err(|error| ApiErrorWithRequestId { error, request_id })
}

/// POST /siteverify with a form or JSON body.
async fn site_verify_post(
    State(state): State<AppState>,
    Extension(request_id): Extension<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SiteVerifyResponse>, ApiErrorWithRequestId> {
    let req = parse_body(&headers, &body);
    state
        .core
        .site_verify(req)
        .await
        .map(Json)
        .map_err(|error| ApiErrorWithRequestId { error, request_id })
}

/// Content-type driven body parse. Anything unparseable becomes the empty
/// request, which the service answers with missing-input error codes.
fn parse_body(headers: &HeaderMap, body: &[u8]) -> SiteVerifyRequest {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let parsed = if content_type.starts_with("application/json") {
        serde_json::from_slice(body).ok()
    } else {
        serde_urlencoded::from_bytes(body).ok()
    };

    parsed.unwrap_or(SiteVerifyRequest {
        secret: None,
        response: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_body() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().expect("value"));
        let req = parse_body(
            &headers,
            br#"{"secret": "sk_1", "response": "tok"}"#,
        );
        assert_eq!(req.secret.as_deref(), Some("sk_1"));
        assert_eq!(req.response.as_deref(), Some("tok"));
    }

    #[test]
    fn parses_urlencoded_body() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            "application/x-www-form-urlencoded".parse().expect("value"),
        );
        let req = parse_body(&headers, b"secret=sk_1&response=tok");
        assert_eq!(req.secret.as_deref(), Some("sk_1"));
        assert_eq!(req.response.as_deref(), Some("tok"));
    }

    #[test]
    fn garbage_body_becomes_empty_request() {
        let headers = HeaderMap::new();
        let req = parse_body(&headers, &[0xff, 0xfe]);
        assert!(req.secret.is_none());
        assert!(req.response.is_none());
    }
}
