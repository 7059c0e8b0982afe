//! Verify endpoint types
//!
//! A solution submission either arrives fully encrypted (session clients:
//! `publicKey` + `encrypted` + `encryptedMetadata`) or fully plaintext
//! (legacy clients). Mixing the two modes is refused as a downgrade attempt.

use serde::{Deserialize, Serialize};

use super::{ClientMetadata, EncryptedBlob};

/// POST /api/v1/verify request body.
#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    /// The challenge token returned at issuance.
    pub token: String,

    /// Site key; present iff the client holds a session.
    #[serde(rename = "publicKey", default)]
    pub public_key: Option<String>,

    /// Raw fingerprint material for the session lookup, as at handshake.
    #[serde(default)]
    pub fingerprint: Option<String>,

    /// AEAD blob of the solution payload.
    #[serde(default)]
    pub encrypted: Option<EncryptedBlob>,

    /// AEAD blob of the client metadata/fingerprint report.
    #[serde(rename = "encryptedMetadata", default)]
    pub encrypted_metadata: Option<EncryptedBlob>,

    /// Legacy plaintext solution.
    #[serde(default)]
    pub solution: Option<SolutionPayload>,

    /// Legacy plaintext metadata.
    #[serde(default)]
    pub metadata: Option<ClientMetadata>,
}

/// The decrypted (or legacy plaintext) solution body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionPayload {
    /// The proof-of-work preimage the client found.
    pub pow_solution: u64,

    /// Puzzle-type-specific answer, dispatched to the matching validator.
    pub answer: serde_json::Value,

    /// Milliseconds the client spent solving, for analytics.
    #[serde(default)]
    pub solve_time_ms: Option<u64>,
}

/// POST /api/v1/verify response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub success: bool,

    /// Bearer credential for the relying backend, present on success.
    #[serde(rename = "verificationToken", skip_serializing_if = "Option::is_none")]
    pub verification_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl VerifyResponse {
    pub fn ok(verification_token: String) -> Self {
        Self {
            success: true,
            verification_token: Some(verification_token),
            message: None,
        }
    }

    /// The generic failure body. Every verify-stage rejection surfaces
    /// through this constructor so responses stay indistinguishable.
    pub fn failed() -> Self {
        Self {
            success: false,
            verification_token: None,
            message: Some("Verification failed".to_string()),
        }
    }
}
