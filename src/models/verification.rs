//! Verification log entity model
//!
//! One row per verify attempt that reached the challenge-lookup stage.
//! Consumed by analytics and by the challenge cleanup sweep, which only
//! deletes expired challenges no verification row references.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A recorded verification attempt.
#[derive(Debug, sqlx::FromRow)]
pub struct VerificationRecord {
    pub id: Uuid,
    pub challenge_id: Uuid,
    pub api_key_id: Uuid,
    pub success: bool,
    pub client_ip: String,
    pub country: Option<String>,
    pub solve_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}
