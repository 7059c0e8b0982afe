//! Challenge entity model
//!
//! One issued puzzle: proof-of-work parameters, the hidden answer, the HMAC
//! signature binding everything to the issuance context, and the single-use
//! flag. `challenge_data` stays server-side; the client only ever sees the
//! stripped payload the challenge service builds from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

/// A persisted challenge row.
#[derive(Debug, sqlx::FromRow)]
pub struct ChallengeRecord {
    pub id: Uuid,

    /// Opaque signed envelope handed to the client; unique.
    pub token: String,

    pub puzzle_type: String,

    /// Effective difficulty after risk adjustment, 1..=10.
    pub difficulty: i32,

    /// Server-only puzzle state, including the correct answer.
    pub challenge_data: Json<ChallengeData>,

    pub api_key_id: Uuid,

    /// Domain the server observed at issuance. Authoritative; never taken
    /// from client input.
    pub validated_domain: String,

    /// Hex HMAC over the issuance context (see the challenge engine).
    pub signature: String,

    /// Present when session binding was enabled at issuance.
    pub session_fingerprint_hash: Option<String>,

    /// Transitions false -> true exactly once.
    pub is_used: bool,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Server-side challenge state stored in the JSONB column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeData {
    pub pow: PowParams,

    /// Issuance timestamp (ms) and nonce the signature was computed over.
    pub issued_at_ms: i64,
    pub nonce: String,

    /// Fingerprint hash bound into the signature ("none" when absent).
    pub fingerprint_hash: String,

    /// Puzzle payload as shown to the client (answer stripped).
    pub client_payload: serde_json::Value,

    /// The hidden correct answer, compared by the puzzle validator.
    pub answer: serde_json::Value,
}

/// Proof-of-work parameters for one challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowParams {
    /// 32-byte CSPRNG salt, base64.
    pub salt: String,

    /// Exclusive upper bound of the search space: 50 * 2^(difficulty-1).
    pub max_number: u64,

    /// Hex SHA-256 of salt || decimal(secret_number).
    pub challenge_hash: String,

    /// The preimage the client must find. Server-only.
    pub secret_number: u64,
}
