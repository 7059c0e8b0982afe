//! Challenge persistence
//!
//! Database operations for issued challenges and verification rows. The
//! conditional `mark_used` update is the authoritative single-use guard:
//! `SET is_used = TRUE ... WHERE is_used = FALSE` is atomic at the store,
//! so two racing verifications on the same token see exactly one success.

use chrono::Utc;
use sqlx::PgPool;
use std::borrow::Cow;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{ApiKey, ChallengeRecord};

/// Inserts a new challenge row. Fails with `ReplayOrExpired` on a token
/// collision, which in practice means a token was re-submitted for creation.
pub async fn create_challenge(pool: &PgPool, record: &ChallengeRecord) -> Result<(), ApiError> {
    sqlx::query(
        r#"
        INSERT INTO challenges (
            id, token, puzzle_type, difficulty, challenge_data,
            api_key_id, validated_domain, signature, session_fingerprint_hash,
            is_used, created_at, expires_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(record.id)
    .bind(&record.token)
    .bind(&record.puzzle_type)
    .bind(record.difficulty)
    .bind(&record.challenge_data)
    .bind(record.api_key_id)
    .bind(&record.validated_domain)
    .bind(&record.signature)
    .bind(&record.session_fingerprint_hash)
    .bind(record.is_used)
    .bind(record.created_at)
    .bind(record.expires_at)
    .execute(pool)
    .await
    .map_err(|e| {
        if let sqlx::Error::Database(db_err) = &e {
            if db_err.code() == Some(Cow::Borrowed("23505")) {
                tracing::warn!(token = %record.token, "Challenge token collision");
                return ApiError::ReplayOrExpired;
            }
        }
        ApiError::Database(e)
    })?;
    Ok(())
}

/// Fetches a challenge by its token.
pub async fn get_by_token(pool: &PgPool, token: &str) -> Result<Option<ChallengeRecord>, ApiError> {
    let record = sqlx::query_as::<_, ChallengeRecord>(
        r#"
        SELECT id, token, puzzle_type, difficulty, challenge_data,
               api_key_id, validated_domain, signature, session_fingerprint_hash,
               is_used, created_at, expires_at
        FROM challenges
        WHERE token = $1
        "#,
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Fetches a challenge by id.
pub async fn get_by_id(pool: &PgPool, id: Uuid) -> Result<Option<ChallengeRecord>, ApiError> {
    let record = sqlx::query_as::<_, ChallengeRecord>(
        r#"
        SELECT id, token, puzzle_type, difficulty, challenge_data,
               api_key_id, validated_domain, signature, session_fingerprint_hash,
               is_used, created_at, expires_at
        FROM challenges
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Conditionally flips `is_used` from false to true. Returns whether the
/// transition happened; `false` means another caller got there first, the
/// challenge is unknown, or it has expired. An expired challenge never
/// transitions; clock-skew tolerance lives in the token layer's expiry
/// leeway, not here. Either way the caller treats a false as a replay.
pub async fn mark_used(pool: &PgPool, id: Uuid) -> Result<bool, ApiError> {
    let result = sqlx::query(
        r#"
        UPDATE challenges
        SET is_used = TRUE
        WHERE id = $1
          AND is_used = FALSE
          AND expires_at > now()
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Records a verification attempt for analytics and cleanup accounting.
pub async fn record_verification(
    pool: &PgPool,
    challenge_id: Uuid,
    api_key_id: Uuid,
    success: bool,
    client_ip: &str,
    country: Option<&str>,
    solve_time_ms: Option<i64>,
) -> Result<(), ApiError> {
    sqlx::query(
        r#"
        INSERT INTO verifications (
            id, challenge_id, api_key_id, success, client_ip, country, solve_time_ms, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(challenge_id)
    .bind(api_key_id)
    .bind(success)
    .bind(client_ip)
    .bind(country)
    .bind(solve_time_ms)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Deletes expired challenges no verification row references. Returns the
/// number of rows removed.
pub async fn delete_expired_unreferenced(pool: &PgPool) -> Result<u64, ApiError> {
    let result = sqlx::query(
        r#"
        DELETE FROM challenges c
        WHERE c.expires_at < now()
          AND NOT EXISTS (
              SELECT 1 FROM verifications v WHERE v.challenge_id = c.id
          )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Looks up an active API key by its public identifier.
pub async fn get_api_key_by_public_ident(
    pool: &PgPool,
    public_ident: &str,
) -> Result<Option<ApiKey>, ApiError> {
    let key = sqlx::query_as::<_, ApiKey>(
        r#"
        SELECT id, public_ident, secret, allowed_domain, is_active, settings, created_at
        FROM api_keys
        WHERE public_ident = $1
        "#,
    )
    .bind(public_ident)
    .fetch_optional(pool)
    .await?;
    Ok(key)
}

/// Looks up an API key by its server-side secret (site-verify path).
pub async fn get_api_key_by_secret(
    pool: &PgPool,
    secret: &str,
) -> Result<Option<ApiKey>, ApiError> {
    let key = sqlx::query_as::<_, ApiKey>(
        r#"
        SELECT id, public_ident, secret, allowed_domain, is_active, settings, created_at
        FROM api_keys
        WHERE secret = $1
        "#,
    )
    .bind(secret)
    .fetch_optional(pool)
    .await?;
    Ok(key)
}

/// Looks up an API key by id.
pub async fn get_api_key_by_id(pool: &PgPool, id: Uuid) -> Result<Option<ApiKey>, ApiError> {
    let key = sqlx::query_as::<_, ApiKey>(
        r#"
        SELECT id, public_ident, secret, allowed_domain, is_active, settings, created_at
        FROM api_keys
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(key)
}

/// Spawns the hourly cleanup sweep over expired challenges.
pub fn spawn_cleanup_task(pool: PgPool) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            match delete_expired_unreferenced(&pool).await {
                Ok(removed) if removed > 0 => {
                    tracing::debug!(removed = removed, "Expired challenges reclaimed");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Challenge cleanup sweep failed"),
            }
        }
    })
}
