//! Solution verification orchestration
//!
//! Walks the full verification pipeline: token envelope validation, the
//! domain check (deliberately before the API-key load, so cross-domain
//! probing cannot use error timing to enumerate tokens), downgrade refusal,
//! signature recomputation, single-use transition, expiry, payload
//! decryption, risk re-checks, puzzle validation and the proof-of-work
//! check. Every rejection at or past the signature check externalises as
//! the same generic failure.

use chrono::{Duration, Utc};

use super::crypto::KeyDirection;
use super::{
    challenge_engine, challenge_store, crypto, domain, fingerprint, puzzle, risk, tokens,
    CoreServices, PuzzleType,
};
use crate::error::ApiError;
use crate::models::ChallengeRecord;
use crate::types::{ClientMetadata, SolutionPayload, VerifyRequest, VerifyResponse};

impl CoreServices {
    /// Verifies one submitted solution and issues a verification token.
    pub async fn verify_solution(
        &self,
        req: VerifyRequest,
        client_ip: &str,
        country: Option<&str>,
        origin_domain: Option<&str>,
    ) -> Result<VerifyResponse, ApiError> {
        // Token envelope first: a forged or expired token proves nothing and
        // records nothing.
        let claims =
            tokens::decode_challenge_token(self.config.session_secret.as_bytes(), &req.token)
                .map_err(|_| ApiError::ReplayOrExpired)?;

        let challenge = challenge_store::get_by_token(&self.db, &req.token)
            .await?
            .ok_or(ApiError::ReplayOrExpired)?;
        if challenge.id != claims.cid {
            return Err(ApiError::ReplayOrExpired);
        }

        // Domain check before anything else touches the API key row.
        if challenge.validated_domain != "*" {
            let observed = origin_domain.map(domain::normalize_domain);
            if observed.as_deref() != Some(challenge.validated_domain.as_str()) {
                return self
                    .reject_forbidden(&challenge, client_ip, country, "domain mismatch")
                    .await;
            }
        }

        let api_key = challenge_store::get_api_key_by_id(&self.db, challenge.api_key_id)
            .await?
            .filter(|k| k.is_active)
            .ok_or(ApiError::ReplayOrExpired)?;
        let settings = api_key.settings.0.clone().clamped();

        // Downgrade refusal: a session client must submit everything
        // encrypted; a legacy client must not present session fields.
        let encrypted_mode = req.public_key.is_some();
        if encrypted_mode && (req.encrypted.is_none() || req.encrypted_metadata.is_none()) {
            return self
                .reject_forbidden(&challenge, client_ip, country, "plaintext downgrade refused")
                .await;
        }
        if !encrypted_mode && req.solution.is_none() {
            return self
                .reject(&challenge, client_ip, country, "missing solution")
                .await;
        }

        if self.ip_blocker.is_blocked(client_ip).is_some() {
            return Err(ApiError::ReplayOrExpired);
        }
        if self
            .ip_blocker
            .check_security_blocking(client_ip, country, &settings)
            .is_err()
        {
            return self
                .reject_forbidden(&challenge, client_ip, country, "blocklist at verify")
                .await;
        }

        // Recompute the challenge signature from stored server-side inputs.
        let data = &challenge.challenge_data.0;
        let context = challenge_engine::ChallengeContext {
            timestamp_ms: data.issued_at_ms,
            nonce: data.nonce.clone(),
            api_public_ident: api_key.public_ident.clone(),
            device_fingerprint_hash: data.fingerprint_hash.clone(),
        };
        if !challenge_engine::verify_challenge_signature(
            self.config.session_secret.as_bytes(),
            &data.pow,
            &context,
            &challenge.signature,
        ) {
            return self
                .reject(&challenge, client_ip, country, "signature mismatch")
                .await;
        }

        // Single-use and expiry in one atomic transition: exactly one caller
        // may win it, and an expired challenge never does.
        if !challenge_store::mark_used(&self.db, challenge.id).await? {
            return self
                .reject(&challenge, client_ip, country, "challenge used or expired")
                .await;
        }

        let (solution, metadata) = match self.resolve_solution(&req, &challenge, client_ip) {
            Ok(pair) => pair,
            Err(err) => {
                self.record_failure_row(&challenge, client_ip, country).await;
                return Err(err);
            }
        };

        // Automation re-check with the solve-time telemetry.
        let assessment = self.risk.assess(
            client_ip,
            &metadata,
            self.ip_blocker.failure_count(client_ip),
            risk::RiskInputsEnabled {
                automation_detection: settings.automation_detection,
                behavioral_analysis: settings.behavioral_analysis,
                advanced_fingerprinting: settings.advanced_fingerprinting,
            },
        );
        if assessment.is_bot {
            return self
                .reject_forbidden(&challenge, client_ip, country, "automation at verify")
                .await;
        }

        // Session binding: the solve-time fingerprint must stay similar to
        // the issuance-time one.
        if settings.session_binding {
            if let Some(stored) = challenge.session_fingerprint_hash.as_deref() {
                let current = metadata
                    .fingerprint
                    .as_ref()
                    .map(fingerprint::session_fingerprint_hash);
                let matches = current
                    .as_deref()
                    .is_some_and(|c| fingerprint::matches_stored(stored, c));
                if !matches {
                    return self
                        .reject(&challenge, client_ip, country, "fingerprint drift")
                        .await;
                }
            }
        }

        let puzzle_type: PuzzleType = challenge
            .puzzle_type
            .parse()
            .map_err(|()| ApiError::Internal(anyhow::anyhow!("stored puzzle type unknown")))?;

        let answer_ok = puzzle::validate_answer(puzzle_type, &data.answer, &solution.answer);
        let pow_ok = challenge_engine::verify_pow_solution(&data.pow, solution.pow_solution);
        if !(answer_ok && pow_ok) {
            return self
                .reject(&challenge, client_ip, country, "wrong solution")
                .await;
        }

        let solve_time_ms = solution.solve_time_ms.and_then(|t| i64::try_from(t).ok());
        challenge_store::record_verification(
            &self.db,
            challenge.id,
            challenge.api_key_id,
            true,
            client_ip,
            country,
            solve_time_ms,
        )
        .await?;

        let token_expires = Utc::now() + Duration::seconds(i64::from(settings.token_expiry_secs));
        let (verification_token, _nonce) = tokens::create_verification_token(
            api_key.secret.as_bytes(),
            challenge.id,
            &challenge.validated_domain,
            &data.fingerprint_hash,
            token_expires,
        )
        .map_err(|_| ApiError::Internal(anyhow::anyhow!("verification token signing failed")))?;

        tracing::info!(
            challenge_id = %challenge.id,
            solve_time_ms = ?solve_time_ms,
            "Challenge verified"
        );

        Ok(VerifyResponse::ok(verification_token))
    }

    /// Obtains the solution and metadata, decrypting under the session's
    /// per-challenge sub-keys in encrypted mode.
    fn resolve_solution(
        &self,
        req: &VerifyRequest,
        challenge: &ChallengeRecord,
        client_ip: &str,
    ) -> Result<(SolutionPayload, ClientMetadata), ApiError> {
        let Some(public_key) = req.public_key.as_deref() else {
            let solution = req
                .solution
                .clone()
                .ok_or_else(|| ApiError::InvalidRequest("missing solution".to_string()))?;
            return Ok((solution, req.metadata.clone().unwrap_or_default()));
        };

        let device_fingerprint_id = fingerprint::fingerprint_id(req.fingerprint.as_deref());
        let session = self
            .sessions
            .get_session(public_key, client_ip, &device_fingerprint_id)
            .ok_or(ApiError::SessionMissing)?;

        let context_id = challenge.id.to_string();
        let aad = challenge.token.as_bytes();

        let solution_blob = req
            .encrypted
            .as_ref()
            .ok_or_else(|| ApiError::InvalidRequest("missing encrypted solution".to_string()))?;
        let solution_key =
            crypto::derive_challenge_key(&session.master_key, &context_id, KeyDirection::Decrypt)?;
        let (iv, ciphertext, tag) = solution_blob.decode()?;
        let solution_plain = crypto::aes_gcm_decrypt(&solution_key, &iv, &ciphertext, &tag, aad)?;
        let solution: SolutionPayload =
            serde_json::from_slice(&solution_plain).map_err(|_| ApiError::EncryptionFailure)?;

        let metadata_blob = req
            .encrypted_metadata
            .as_ref()
            .ok_or_else(|| ApiError::InvalidRequest("missing encrypted metadata".to_string()))?;
        let metadata_key =
            crypto::derive_challenge_key(&session.master_key, &context_id, KeyDirection::Metadata)?;
        let (iv, ciphertext, tag) = metadata_blob.decode()?;
        let metadata_plain = crypto::aes_gcm_decrypt(&metadata_key, &iv, &ciphertext, &tag, aad)?;
        let metadata: ClientMetadata =
            serde_json::from_slice(&metadata_plain).map_err(|_| ApiError::EncryptionFailure)?;

        Ok((solution, metadata))
    }

    /// Shared rejection path for replay-category failures (used or expired
    /// challenge, signature mismatch, wrong solution, fingerprint drift):
    /// log the internal reason, record the verification row, surface the
    /// generic error. Does not count toward the IP failure window; a wrong
    /// answer or a reused token is an ordinary outcome, not proof of abuse.
    async fn reject(
        &self,
        challenge: &ChallengeRecord,
        client_ip: &str,
        country: Option<&str>,
        reason: &str,
    ) -> Result<VerifyResponse, ApiError> {
        tracing::warn!(
            challenge_id = %challenge.id,
            ip = %client_ip,
            reason = %reason,
            "Verification rejected"
        );
        self.record_failure_row(challenge, client_ip, country).await;
        Err(ApiError::ReplayOrExpired)
    }

    /// Rejection path for forbidden-category failures (domain mismatch,
    /// blocklist hit, high-confidence automation, downgrade attempt).
    /// These also count toward the IP failure window.
    async fn reject_forbidden(
        &self,
        challenge: &ChallengeRecord,
        client_ip: &str,
        country: Option<&str>,
        reason: &str,
    ) -> Result<VerifyResponse, ApiError> {
        self.ip_blocker.record_failure(client_ip);
        self.reject(challenge, client_ip, country, reason).await
    }

    async fn record_failure_row(
        &self,
        challenge: &ChallengeRecord,
        client_ip: &str,
        country: Option<&str>,
    ) {
        if let Err(e) = challenge_store::record_verification(
            &self.db,
            challenge.id,
            challenge.api_key_id,
            false,
            client_ip,
            country,
            None,
        )
        .await
        {
            tracing::warn!(error = %e, "Failed to record verification outcome");
        }
    }
}
