//! Signed token envelopes
//!
//! Two HS256 envelopes travel outside the process: the challenge token
//! (signed with the process-wide secret, carries only non-sensitive puzzle
//! parameters) and the verification token (signed with the owning API key's
//! secret, exchanged by the relying backend at site-verify). MAC comparison
//! is constant-time inside the JWT layer; authenticity failures surface as
//! values, not exceptions.

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Clock-skew grace applied when validating expiry, in seconds.
const EXPIRY_LEEWAY_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token signature or structure invalid")]
    Invalid,

    #[error("token expired")]
    Expired,
}

/// Claims inside a challenge token. Only parameters the client needs to
/// solve the proof of work; the secret number and puzzle answer never leave
/// the server.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChallengeTokenClaims {
    /// Challenge id.
    pub cid: Uuid,
    /// Puzzle type.
    pub typ: String,
    /// Owning API key id.
    pub kid: Uuid,
    /// PoW salt (base64 string form, hashed as-is).
    pub salt: String,
    /// PoW search-space cap.
    pub max_number: u64,
    /// PoW target hash, hex.
    pub challenge_hash: String,
    /// Expiry, seconds since epoch.
    pub exp: i64,
    /// Issued-at, seconds since epoch.
    pub iat: i64,
}

/// Claims inside a verification token.
#[derive(Debug, Serialize, Deserialize)]
pub struct VerificationTokenClaims {
    /// The solved challenge.
    pub challenge_id: Uuid,
    /// Domain the challenge was validated for.
    pub domain: String,
    /// Solve timestamp, milliseconds since epoch.
    pub timestamp: i64,
    /// Replay-tracking nonce; `(challenge_id, nonce)` keys the used-set.
    pub nonce: String,
    /// Session fingerprint hash at solve time, or "none".
    pub fingerprint: String,
    /// Expiry, seconds since epoch.
    pub exp: i64,
}

fn classify(err: &jsonwebtoken::errors::Error) -> TokenError {
    match err.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
        _ => TokenError::Invalid,
    }
}

fn hs256_validation() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = EXPIRY_LEEWAY_SECS;
    validation
}

/// Signs a challenge token with the process-wide secret.
pub fn issue_challenge_token(
    server_secret: &[u8],
    claims: &ChallengeTokenClaims,
) -> Result<String, TokenError> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(server_secret),
    )
    .map_err(|_| TokenError::Invalid)
}

/// Validates and decodes a challenge token.
pub fn decode_challenge_token(
    server_secret: &[u8],
    token: &str,
) -> Result<ChallengeTokenClaims, TokenError> {
    decode::<ChallengeTokenClaims>(
        token,
        &DecodingKey::from_secret(server_secret),
        &hs256_validation(),
    )
    .map(|data| data.claims)
    .map_err(|e| classify(&e))
}

/// Signs a verification token with the API key's secret.
pub fn create_verification_token(
    api_secret: &[u8],
    challenge_id: Uuid,
    domain: &str,
    fingerprint: &str,
    expires_at: DateTime<Utc>,
) -> Result<(String, String), TokenError> {
    let nonce = super::crypto::random_string(24);
    let claims = VerificationTokenClaims {
        challenge_id,
        domain: domain.to_string(),
        timestamp: Utc::now().timestamp_millis(),
        nonce: nonce.clone(),
        fingerprint: fingerprint.to_string(),
        exp: expires_at.timestamp(),
    };

    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(api_secret),
    )
    .map_err(|_| TokenError::Invalid)?;

    Ok((token, nonce))
}

/// Validates and decodes a verification token with the API key's secret.
pub fn decode_verification_token(
    api_secret: &[u8],
    token: &str,
) -> Result<VerificationTokenClaims, TokenError> {
    decode::<VerificationTokenClaims>(
        token,
        &DecodingKey::from_secret(api_secret),
        &hs256_validation(),
    )
    .map(|data| data.claims)
    .map_err(|e| classify(&e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Duration;

    fn challenge_claims(exp: DateTime<Utc>) -> ChallengeTokenClaims {
        ChallengeTokenClaims {
            cid: Uuid::new_v4(),
            typ: "grid".to_string(),
            kid: Uuid::new_v4(),
            salt: "c2FsdA==".to_string(),
            max_number: 400,
            challenge_hash: "ab".repeat(32),
            exp: exp.timestamp(),
            iat: Utc::now().timestamp(),
        }
    }

    #[test]
    fn challenge_token_round_trips() {
        let claims = challenge_claims(Utc::now() + Duration::minutes(2));
        let token = issue_challenge_token(b"server-secret", &claims).expect("sign");
        let decoded = decode_challenge_token(b"server-secret", &token).expect("decode");
        assert_eq!(decoded.cid, claims.cid);
        assert_eq!(decoded.max_number, 400);
    }

    #[test]
    fn challenge_token_rejects_wrong_secret() {
        let claims = challenge_claims(Utc::now() + Duration::minutes(2));
        let token = issue_challenge_token(b"server-secret", &claims).expect("sign");
        assert_matches!(
            decode_challenge_token(b"other-secret", &token),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn expired_challenge_token_is_rejected_past_leeway() {
        let claims = challenge_claims(Utc::now() - Duration::minutes(5));
        let token = issue_challenge_token(b"server-secret", &claims).expect("sign");
        assert_matches!(
            decode_challenge_token(b"server-secret", &token),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let claims = challenge_claims(Utc::now() + Duration::minutes(2));
        let token = issue_challenge_token(b"server-secret", &claims).expect("sign");

        // Splice the payload from a higher-difficulty token onto the original
        // signature.
        let mut other = challenge_claims(Utc::now() + Duration::minutes(2));
        other.max_number = 50;
        let other_token = issue_challenge_token(b"server-secret", &other).expect("sign");

        let parts: Vec<&str> = token.split('.').collect();
        let other_parts: Vec<&str> = other_token.split('.').collect();
        let forged = format!("{}.{}.{}", parts[0], other_parts[1], parts[2]);

        assert_matches!(
            decode_challenge_token(b"server-secret", &forged),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn verification_token_round_trips_with_fresh_nonce() {
        let id = Uuid::new_v4();
        let exp = Utc::now() + Duration::minutes(5);
        let (t1, n1) =
            create_verification_token(b"sk", id, "example.com", "fp", exp).expect("sign");
        let (_, n2) = create_verification_token(b"sk", id, "example.com", "fp", exp).expect("sign");
        assert_ne!(n1, n2);

        let decoded = decode_verification_token(b"sk", &t1).expect("decode");
        assert_eq!(decoded.challenge_id, id);
        assert_eq!(decoded.domain, "example.com");
        assert_eq!(decoded.nonce, n1);
    }

    #[test]
    fn verification_token_bound_to_api_secret() {
        let (token, _) = create_verification_token(
            b"sk_a",
            Uuid::new_v4(),
            "example.com",
            "fp",
            Utc::now() + Duration::minutes(5),
        )
        .expect("sign");
        assert!(decode_verification_token(b"sk_b", &token).is_err());
    }
}
