//! Challenge engine
//!
//! Builds proof-of-work parameters for a given difficulty and binds them to
//! their issuance context with an HMAC keyed by the process-wide secret.
//! Neither the hash nor the parameters can be tampered with afterwards, and
//! a puzzle issued for one site key or fingerprint cannot be replayed under
//! another.

use sha2::{Digest, Sha256};

use super::crypto;
use crate::models::PowParams;

/// Base search-space size at difficulty 1.
const BASE_MAX_NUMBER: u64 = 50;

/// Issuance context the challenge signature commits to.
#[derive(Debug, Clone)]
pub struct ChallengeContext {
    /// Milliseconds since epoch at issuance.
    pub timestamp_ms: i64,
    /// Per-challenge CSPRNG nonce.
    pub nonce: String,
    /// Site key the challenge was issued to.
    pub api_public_ident: String,
    /// Session fingerprint hash, or "none" when fingerprinting is off.
    pub device_fingerprint_hash: String,
}

/// Search-space cap for a difficulty level: `50 * 2^(difficulty-1)`,
/// with difficulty clamped to `[1, 10]`.
pub fn max_number_for(difficulty: u8) -> u64 {
    let d = difficulty.clamp(1, 10);
    BASE_MAX_NUMBER << (d - 1)
}

/// Builds fresh proof-of-work parameters.
///
/// The salt is 32 CSPRNG bytes rendered as base64; the client hashes the
/// rendered string, so the rendered string is what gets committed to.
pub fn build_pow(difficulty: u8) -> PowParams {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    let salt = STANDARD.encode(crypto::random_bytes::<32>());
    let max_number = max_number_for(difficulty);
    let secret_number = crypto::random_int_below(max_number);
    let challenge_hash = pow_hash(&salt, secret_number);

    PowParams {
        salt,
        max_number,
        challenge_hash,
        secret_number,
    }
}

/// `SHA256(salt || decimal(n))` as lowercase hex.
fn pow_hash(salt: &str, n: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(n.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonical signature input for a challenge.
fn canonical_sig_data(pow: &PowParams, context: &ChallengeContext) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}",
        pow.challenge_hash,
        pow.salt,
        pow.max_number,
        context.timestamp_ms,
        context.nonce,
        context.api_public_ident,
        context.device_fingerprint_hash,
    )
}

/// HMAC-SHA256 signature over the challenge and its issuance context,
/// rendered as hex.
pub fn sign_challenge(server_secret: &[u8], pow: &PowParams, context: &ChallengeContext) -> String {
    let sig_data = canonical_sig_data(pow, context);
    hex::encode(crypto::hmac_sha256(server_secret, sig_data.as_bytes()))
}

/// Recomputes the signature from stored server-side inputs and compares it
/// to the stored value in constant time.
pub fn verify_challenge_signature(
    server_secret: &[u8],
    pow: &PowParams,
    context: &ChallengeContext,
    stored_signature: &str,
) -> bool {
    let expected = sign_challenge(server_secret, pow, context);
    crypto::constant_time_eq(expected.as_bytes(), stored_signature.as_bytes())
}

/// Checks a submitted proof-of-work preimage. Accepts iff `n` is inside the
/// search space and hashes to the stored challenge hash.
pub fn verify_pow_solution(pow: &PowParams, n: u64) -> bool {
    if n >= pow.max_number {
        return false;
    }
    let candidate = pow_hash(&pow.salt, n);
    crypto::constant_time_eq(candidate.as_bytes(), pow.challenge_hash.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn context() -> ChallengeContext {
        ChallengeContext {
            timestamp_ms: 1_750_000_000_000,
            nonce: "n-123".to_string(),
            api_public_ident: "pk_demo".to_string(),
            device_fingerprint_hash: "fp-hash".to_string(),
        }
    }

    #[rstest]
    #[case(1, 50)]
    #[case(4, 400)]
    #[case(10, 25_600)]
    // Out-of-range difficulties clamp rather than explode the search space.
    #[case(0, 50)]
    #[case(11, 25_600)]
    fn difficulty_ladder(#[case] difficulty: u8, #[case] expected: u64) {
        assert_eq!(max_number_for(difficulty), expected);
    }

    #[test]
    fn secret_number_is_inside_search_space() {
        let pow = build_pow(3);
        assert!(pow.secret_number < pow.max_number);
        assert_eq!(pow.max_number, 200);
    }

    #[test]
    fn secret_number_solves_its_own_challenge() {
        let pow = build_pow(2);
        assert!(verify_pow_solution(&pow, pow.secret_number));
    }

    #[test]
    fn wrong_preimage_is_rejected() {
        let pow = build_pow(2);
        let wrong = (pow.secret_number + 1) % pow.max_number;
        assert!(!verify_pow_solution(&pow, wrong));
    }

    #[test]
    fn out_of_range_preimage_is_rejected_even_if_hash_matched() {
        let pow = build_pow(1);
        assert!(!verify_pow_solution(&pow, pow.max_number + pow.secret_number));
    }

    #[test]
    fn brute_force_finds_exactly_one_solution_at_difficulty_one() {
        let pow = build_pow(1);
        let solutions: Vec<u64> = (0..pow.max_number)
            .filter(|n| verify_pow_solution(&pow, *n))
            .collect();
        assert_eq!(solutions, vec![pow.secret_number]);
    }

    #[test]
    fn signature_round_trips() {
        let pow = build_pow(4);
        let ctx = context();
        let sig = sign_challenge(b"server-secret", &pow, &ctx);
        assert!(verify_challenge_signature(b"server-secret", &pow, &ctx, &sig));
    }

    #[test]
    fn signature_rejects_tampered_max_number() {
        let mut pow = build_pow(4);
        let ctx = context();
        let sig = sign_challenge(b"server-secret", &pow, &ctx);

        pow.max_number = 50;
        assert!(!verify_challenge_signature(b"server-secret", &pow, &ctx, &sig));
    }

    #[test]
    fn signature_rejects_foreign_context() {
        let pow = build_pow(4);
        let ctx = context();
        let sig = sign_challenge(b"server-secret", &pow, &ctx);

        let mut other = context();
        other.api_public_ident = "pk_other".to_string();
        assert!(!verify_challenge_signature(b"server-secret", &pow, &other, &sig));
    }

    #[test]
    fn signature_rejects_wrong_server_secret() {
        let pow = build_pow(4);
        let ctx = context();
        let sig = sign_challenge(b"server-secret", &pow, &ctx);
        assert!(!verify_challenge_signature(b"other-secret", &pow, &ctx, &sig));
    }
}
