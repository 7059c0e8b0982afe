//! Site-verify orchestration
//!
//! Backend-to-backend exchange of a verification token. Replay is tracked
//! in the dedicated used-token set, independently of the challenge's used
//! flag: a challenge consumed by /verify still authorises exactly one
//! site-verify call. Session-binding and fingerprint checks are skipped on
//! purpose; there is no browser on this leg.

use chrono::{DateTime, TimeZone, Utc};

use super::{challenge_store, domain, tokens, CoreServices};
use crate::error::ApiError;
use crate::types::siteverify::error_codes;
use crate::types::{SiteVerifyRequest, SiteVerifyResponse};

impl CoreServices {
    /// Exchanges a verification token for a yes/no answer.
    ///
    /// All rejections map to the contract's error codes; only storage
    /// failures surface as errors.
    pub async fn site_verify(
        &self,
        req: SiteVerifyRequest,
    ) -> Result<SiteVerifyResponse, ApiError> {
        let Some(secret) = req.secret.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(SiteVerifyResponse::error(error_codes::MISSING_INPUT_SECRET));
        };
        let Some(response) = req.response.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(SiteVerifyResponse::error(
                error_codes::MISSING_INPUT_RESPONSE,
            ));
        };

        // Generic miss for unknown and inactive keys alike.
        let Some(api_key) = challenge_store::get_api_key_by_secret(&self.db, secret)
            .await?
            .filter(|k| k.is_active)
        else {
            return Ok(SiteVerifyResponse::error(error_codes::INVALID_INPUT_SECRET));
        };

        let claims = match tokens::decode_verification_token(api_key.secret.as_bytes(), response) {
            Ok(claims) => claims,
            Err(tokens::TokenError::Expired) => {
                return Ok(SiteVerifyResponse::error(error_codes::TIMEOUT_OR_DUPLICATE));
            }
            Err(tokens::TokenError::Invalid) => {
                return Ok(SiteVerifyResponse::error(
                    error_codes::INVALID_INPUT_RESPONSE,
                ));
            }
        };

        let Some(challenge) = challenge_store::get_by_id(&self.db, claims.challenge_id).await?
        else {
            return Ok(SiteVerifyResponse::error(
                error_codes::INVALID_INPUT_RESPONSE,
            ));
        };
        if challenge.api_key_id != api_key.id {
            return Ok(SiteVerifyResponse::error(
                error_codes::INVALID_INPUT_RESPONSE,
            ));
        }

        // Domain agreement after normalisation: token vs stored vs (when the
        // key restricts one) the key's configured domain.
        let token_domain = domain::normalize_domain(&claims.domain);
        let stored_domain = domain::normalize_domain(&challenge.validated_domain);
        if token_domain != stored_domain {
            return Ok(SiteVerifyResponse::error(
                error_codes::INVALID_INPUT_RESPONSE,
            ));
        }
        if api_key.allowed_domain != "*"
            && stored_domain != "*"
            && !api_key.domain_allowed(&stored_domain)
        {
            return Ok(SiteVerifyResponse::error(
                error_codes::INVALID_INPUT_RESPONSE,
            ));
        }

        // One exchange per token, tracked independently of is_used.
        if !self.replay.mark_used(claims.challenge_id, &claims.nonce) {
            tracing::warn!(
                challenge_id = %claims.challenge_id,
                "Verification token replay at site-verify"
            );
            return Ok(SiteVerifyResponse::error(error_codes::TIMEOUT_OR_DUPLICATE));
        }

        // Close the unused-but-verified path: consume the challenge if the
        // widget verify never did.
        if !challenge.is_used {
            let transitioned = challenge_store::mark_used(&self.db, challenge.id).await?;
            if !transitioned {
                tracing::debug!(
                    challenge_id = %challenge.id,
                    "Challenge consumed concurrently with site-verify"
                );
            }
        }

        let challenge_ts = solve_timestamp(claims.timestamp, challenge.created_at);

        tracing::info!(
            challenge_id = %claims.challenge_id,
            hostname = %stored_domain,
            "Site-verify success"
        );

        Ok(SiteVerifyResponse::ok(challenge_ts, stored_domain))
    }
}

/// The solve timestamp from the token, falling back to the challenge's
/// creation time if the millisecond value does not parse.
fn solve_timestamp(timestamp_ms: i64, fallback: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(timestamp_ms).single().unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solve_timestamp_parses_millis() {
        let fallback = Utc::now();
        let ts = solve_timestamp(1_750_000_000_000, fallback);
        assert_eq!(ts.timestamp_millis(), 1_750_000_000_000);
    }

    #[test]
    fn solve_timestamp_falls_back_on_nonsense() {
        let fallback = Utc::now();
        let ts = solve_timestamp(i64::MAX, fallback);
        assert_eq!(ts, fallback);
    }
}
