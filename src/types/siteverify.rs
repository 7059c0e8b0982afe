//! Site-verify endpoint types
//!
//! Server-to-server token exchange. The response format follows the
//! conventions relying backends already integrate against: `success`,
//! `challenge_ts`, `hostname`, and kebab-case `error-codes`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// GET or POST /api/v1/siteverify input (query, form or JSON).
#[derive(Debug, Deserialize)]
pub struct SiteVerifyRequest {
    #[serde(default)]
    pub secret: Option<String>,

    /// The verification token the widget handed to the page.
    #[serde(default)]
    pub response: Option<String>,
}

/// Site-verify response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct SiteVerifyResponse {
    pub success: bool,

    /// When the challenge was solved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_ts: Option<DateTime<Utc>>,

    /// The domain the challenge was issued for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(rename = "error-codes", skip_serializing_if = "Option::is_none")]
    pub error_codes: Option<Vec<String>>,
}

/// Error codes defined by the site-verify contract.
pub mod error_codes {
    pub const MISSING_INPUT_SECRET: &str = "missing-input-secret";
    pub const MISSING_INPUT_RESPONSE: &str = "missing-input-response";
    pub const INVALID_INPUT_SECRET: &str = "invalid-input-secret";
    pub const INVALID_INPUT_RESPONSE: &str = "invalid-input-response";
    pub const TIMEOUT_OR_DUPLICATE: &str = "timeout-or-duplicate";
}

impl SiteVerifyResponse {
    pub fn ok(challenge_ts: DateTime<Utc>, hostname: String) -> Self {
        Self {
            success: true,
            challenge_ts: Some(challenge_ts),
            hostname: Some(hostname),
            error_codes: None,
        }
    }

    pub fn error(code: &str) -> Self {
        Self {
            success: false,
            challenge_ts: None,
            hostname: None,
            error_codes: Some(vec![code.to_string()]),
        }
    }
}
