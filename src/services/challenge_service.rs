//! Challenge issuance orchestration
//!
//! Runs the full issuance pipeline: protocol validation, API key and
//! blocking checks, client metadata decryption, risk assessment, puzzle
//! selection and generation, proof-of-work construction, contextual
//! signing, persistence, and payload encryption when a session exists.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::types::Json;
use uuid::Uuid;

use super::crypto::KeyDirection;
use super::{
    challenge_engine, challenge_store, crypto, fingerprint, puzzle, risk, tokens, CoreServices,
    PuzzleType, SessionKey,
};
use crate::error::ApiError;
use crate::models::{ApiKey, ChallengeData, ChallengeRecord, SecuritySettings};
use crate::types::{
    ChallengeRequest, ClientMetadata, ClientSecurityConfig, EncryptedBlob, IssueChallengeResponse,
    PROTOCOL_ENCRYPTED_V1, PROTOCOL_PLAINTEXT,
};

/// Client-visible challenge payload: PoW parameters plus the puzzle content,
/// with every answer-bearing field stripped.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientChallengePayload<'a> {
    salt: &'a str,
    max_number: u64,
    challenge_hash: &'a str,
    puzzle: Value,
}

impl CoreServices {
    /// Issues one challenge.
    pub async fn issue_challenge(
        &self,
        req: ChallengeRequest,
        client_ip: &str,
        country: Option<&str>,
        origin_domain: Option<&str>,
    ) -> Result<IssueChallengeResponse, ApiError> {
        // The encrypted protocol tag must not silently fall back to
        // plaintext: both encrypted fields are mandatory under it.
        let encrypted_protocol = req.protocol.as_deref() == Some(PROTOCOL_ENCRYPTED_V1);
        if req.protocol.is_some() && !encrypted_protocol {
            return Err(ApiError::InvalidRequest("unknown protocol".to_string()));
        }
        if encrypted_protocol
            && (req.encrypted_client_data.is_none() || req.request_nonce.is_none())
        {
            return Err(ApiError::InvalidRequest(
                "encrypted-v1 requires encryptedClientData and requestNonce".to_string(),
            ));
        }

        let api_key = challenge_store::get_api_key_by_public_ident(&self.db, &req.public_key)
            .await?
            .filter(|k| k.is_active)
            .ok_or(ApiError::AuthFailure)?;
        let settings = api_key.settings.0.clone().clamped();

        if let Some(remaining_secs) = self.ip_blocker.is_blocked(client_ip) {
            return Err(ApiError::RateLimited { remaining_secs });
        }

        if let Err(reason) = self
            .ip_blocker
            .check_security_blocking(client_ip, country, &settings)
        {
            self.ip_blocker.record_failure(client_ip);
            return Err(ApiError::Forbidden(reason));
        }

        if settings.ip_rate_limiting {
            self.ip_blocker
                .check_challenge_rate(client_ip, settings.rate_limit_per_minute)
                .map_err(|remaining_secs| ApiError::RateLimited { remaining_secs })?;
        }

        if req.is_refresh {
            self.ip_blocker.record_refresh(client_ip);
            if let Some(remaining_secs) = self.ip_blocker.is_blocked(client_ip) {
                return Err(ApiError::RateLimited { remaining_secs });
            }
        }

        let device_fingerprint_id = fingerprint::fingerprint_id(req.fingerprint.as_deref());
        let session =
            self.sessions
                .get_session(&req.public_key, client_ip, &device_fingerprint_id);

        let metadata = self.resolve_metadata(&req, session.as_ref(), encrypted_protocol)?;

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
        if assessment.is_bot || assessment.level == risk::RiskLevel::Critical {
            tracing::warn!(
                ip = %client_ip,
                score = assessment.score,
                level = assessment.level.as_str(),
                "Challenge refused at critical risk"
            );
            self.ip_blocker.record_failure(client_ip);
            return Err(ApiError::Forbidden("critical risk score".to_string()));
        }

        let validated_domain = self.validate_origin(&api_key, origin_domain, client_ip)?;

        let puzzle_type = select_puzzle_type(&req, &settings)?;
        if session.is_none() && puzzle_type.requires_encrypted_delivery() {
            // The payload of these types reveals the answer; without a
            // session there is no way to deliver it safely.
            return Err(ApiError::InvalidRequest(format!(
                "puzzle type {puzzle_type} requires an established session"
            )));
        }

        let difficulty = if settings.risk_adaptive_difficulty {
            risk::adaptive_difficulty(settings.difficulty, assessment.score)
        } else {
            settings.difficulty
        };

        let generated = self.puzzles.generate(puzzle_type, difficulty);
        let pow = challenge_engine::build_pow(difficulty);

        let session_fingerprint_hash = if settings.session_binding {
            metadata
                .fingerprint
                .as_ref()
                .map(fingerprint::session_fingerprint_hash)
        } else {
            None
        };

        let now = Utc::now();
        let context = challenge_engine::ChallengeContext {
            timestamp_ms: now.timestamp_millis(),
            nonce: crypto::random_string(32),
            api_public_ident: req.public_key.clone(),
            device_fingerprint_hash: session_fingerprint_hash
                .clone()
                .unwrap_or_else(|| fingerprint::NO_FINGERPRINT.to_string()),
        };
        let signature = challenge_engine::sign_challenge(
            self.config.session_secret.as_bytes(),
            &pow,
            &context,
        );

        let challenge_id = Uuid::new_v4();
        let expires_at = now + Duration::seconds(i64::from(settings.challenge_timeout_secs));
        let token = tokens::issue_challenge_token(
            self.config.session_secret.as_bytes(),
            &tokens::ChallengeTokenClaims {
                cid: challenge_id,
                typ: puzzle_type.to_string(),
                kid: api_key.id,
                salt: pow.salt.clone(),
                max_number: pow.max_number,
                challenge_hash: pow.challenge_hash.clone(),
                exp: expires_at.timestamp(),
                iat: now.timestamp(),
            },
        )
        .map_err(|_| ApiError::Internal(anyhow::anyhow!("token signing failed")))?;

        let record = ChallengeRecord {
            id: challenge_id,
            token: token.clone(),
            puzzle_type: puzzle_type.to_string(),
            difficulty: i32::from(difficulty),
            challenge_data: Json(ChallengeData {
                pow: pow.clone(),
                issued_at_ms: context.timestamp_ms,
                nonce: context.nonce.clone(),
                fingerprint_hash: context.device_fingerprint_hash.clone(),
                client_payload: generated.client_payload.clone(),
                answer: generated.answer,
            }),
            api_key_id: api_key.id,
            validated_domain,
            signature,
            session_fingerprint_hash,
            is_used: false,
            created_at: now,
            expires_at,
        };
        challenge_store::create_challenge(&self.db, &record).await?;

        tracing::info!(
            challenge_id = %challenge_id,
            puzzle_type = %puzzle_type,
            difficulty = difficulty,
            risk_score = assessment.score,
            "Challenge issued"
        );

        self.build_response(
            &record,
            puzzle_type,
            generated.client_payload,
            &settings,
            session.as_ref(),
        )
    }

    /// Decrypts or reads the client metadata depending on protocol flavour.
    fn resolve_metadata(
        &self,
        req: &ChallengeRequest,
        session: Option<&SessionKey>,
        encrypted_protocol: bool,
    ) -> Result<ClientMetadata, ApiError> {
        if !encrypted_protocol {
            return Ok(req.plaintext_metadata.clone().unwrap_or_default());
        }

        // Checked at the protocol gate already.
        let blob = req
            .encrypted_client_data
            .as_ref()
            .ok_or_else(|| ApiError::InvalidRequest("missing encrypted payload".to_string()))?;
        let request_nonce = req
            .request_nonce
            .as_deref()
            .ok_or_else(|| ApiError::InvalidRequest("missing request nonce".to_string()))?;

        // An encrypted call without a live session fails closed.
        let session = session.ok_or(ApiError::SessionMissing)?;

        let key =
            crypto::derive_challenge_key(&session.master_key, request_nonce, KeyDirection::Decrypt)?;
        let (iv, ciphertext, tag) = blob.decode()?;
        let plaintext = crypto::aes_gcm_decrypt(
            &key,
            &iv,
            &ciphertext,
            &tag,
            request_nonce.as_bytes(),
        )?;

        serde_json::from_slice(&plaintext).map_err(|_| ApiError::EncryptionFailure)
    }

    /// Validates the request origin against the key's allowed domain and
    /// returns the server-observed domain stored with the challenge.
    fn validate_origin(
        &self,
        api_key: &ApiKey,
        origin_domain: Option<&str>,
        client_ip: &str,
    ) -> Result<String, ApiError> {
        match origin_domain {
            Some(domain) if api_key.domain_allowed(domain) => Ok(domain.to_string()),
            Some(domain) => {
                self.ip_blocker.record_failure(client_ip);
                Err(ApiError::Forbidden(format!("domain {domain} not allowed")))
            }
            None if api_key.allowed_domain == "*" => Ok("*".to_string()),
            None => {
                self.ip_blocker.record_failure(client_ip);
                Err(ApiError::Forbidden("request without origin".to_string()))
            }
        }
    }

    /// Assembles the response, encrypting payload and security config when a
    /// session exists. Mixed modes are never produced: with a session both
    /// blobs are encrypted, without one both are plaintext.
    fn build_response(
        &self,
        record: &ChallengeRecord,
        puzzle_type: PuzzleType,
        puzzle_payload: Value,
        settings: &SecuritySettings,
        session: Option<&SessionKey>,
    ) -> Result<IssueChallengeResponse, ApiError> {
        let pow = &record.challenge_data.0.pow;
        let security_config = ClientSecurityConfig {
            anti_debug: settings.anti_debug,
            behavioral_analysis: settings.behavioral_analysis,
            automation_detection: settings.automation_detection,
            advanced_fingerprinting: settings.advanced_fingerprinting,
            challenge_timeout_secs: settings.challenge_timeout_secs,
        };

        if let Some(session) = session {
            let context_id = record.id.to_string();
            let payload = ClientChallengePayload {
                salt: &pow.salt,
                max_number: pow.max_number,
                challenge_hash: &pow.challenge_hash,
                puzzle: puzzle_payload,
            };
            let encrypted = encrypt_for_client(
                &session.master_key,
                &context_id,
                KeyDirection::Encrypt,
                &payload,
                record.token.as_bytes(),
            )?;
            let encrypted_security_config = encrypt_for_client(
                &session.master_key,
                &context_id,
                KeyDirection::Config,
                &security_config,
                record.token.as_bytes(),
            )?;

            return Ok(IssueChallengeResponse {
                token: record.token.clone(),
                puzzle_type: puzzle_type.to_string(),
                expires_at: record.expires_at,
                protocol: PROTOCOL_ENCRYPTED_V1.to_string(),
                encrypted: Some(encrypted),
                challenge: None,
                encrypted_security_config: Some(encrypted_security_config),
                security_config: None,
            });
        }

        let payload = ClientChallengePayload {
            salt: &pow.salt,
            max_number: pow.max_number,
            challenge_hash: &pow.challenge_hash,
            puzzle: puzzle::strip_sensitive_fields(puzzle_type, &puzzle_payload),
        };
        Ok(IssueChallengeResponse {
            token: record.token.clone(),
            puzzle_type: puzzle_type.to_string(),
            expires_at: record.expires_at,
            protocol: PROTOCOL_PLAINTEXT.to_string(),
            encrypted: None,
            challenge: Some(
                serde_json::to_value(&payload)
                    .map_err(|e| ApiError::Internal(anyhow::anyhow!("payload encode: {e}")))?,
            ),
            encrypted_security_config: None,
            security_config: Some(security_config),
        })
    }
}

/// Picks the puzzle type: an explicit request must name an enabled type;
/// "random" or absence selects among the enabled set with the CSPRNG.
fn select_puzzle_type(
    req: &ChallengeRequest,
    settings: &SecuritySettings,
) -> Result<PuzzleType, ApiError> {
    let enabled: Vec<PuzzleType> = settings
        .enabled_puzzle_types
        .iter()
        .filter_map(|name| name.parse().ok())
        .collect();

    match req.puzzle_type.as_deref() {
        None | Some("random") => Ok(PuzzleType::random_among(&enabled)),
        Some(requested) => {
            let parsed: PuzzleType = requested
                .parse()
                .map_err(|()| ApiError::InvalidRequest(format!("unknown puzzle type {requested}")))?;
            if !enabled.contains(&parsed) {
                return Err(ApiError::InvalidRequest(format!(
                    "puzzle type {requested} not enabled"
                )));
            }
            Ok(parsed)
        }
    }
}

/// Serialises and AEAD-encrypts a value under a per-challenge directional
/// sub-key, with the challenge token as associated data.
fn encrypt_for_client<T: Serialize>(
    master_key: &[u8; 32],
    context_id: &str,
    direction: KeyDirection,
    value: &T,
    aad: &[u8],
) -> Result<EncryptedBlob, ApiError> {
    let key = crypto::derive_challenge_key(master_key, context_id, direction)?;
    let plaintext = serde_json::to_vec(value)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("encrypt encode: {e}")))?;
    let (iv, ciphertext, tag) = crypto::aes_gcm_encrypt(&key, &plaintext, aad)?;
    Ok(EncryptedBlob::encode(&iv, &ciphertext, &tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with(types: &[&str]) -> SecuritySettings {
        SecuritySettings {
            enabled_puzzle_types: types.iter().map(|s| (*s).to_string()).collect(),
            ..SecuritySettings::default()
        }
    }

    fn request(puzzle_type: Option<&str>) -> ChallengeRequest {
        ChallengeRequest {
            public_key: "pk_demo".to_string(),
            puzzle_type: puzzle_type.map(str::to_string),
            is_refresh: false,
            protocol: None,
            fingerprint: None,
            encrypted_client_data: None,
            request_nonce: None,
            plaintext_metadata: None,
        }
    }

    #[test]
    fn explicit_enabled_type_is_honoured() {
        let settings = settings_with(&["grid", "jigsaw"]);
        let picked = select_puzzle_type(&request(Some("jigsaw")), &settings).expect("type");
        assert_eq!(picked, PuzzleType::Jigsaw);
    }

    #[test]
    fn disabled_type_is_rejected() {
        let settings = settings_with(&["grid"]);
        assert!(select_puzzle_type(&request(Some("audio")), &settings).is_err());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let settings = settings_with(&["grid"]);
        assert!(select_puzzle_type(&request(Some("sudoku")), &settings).is_err());
    }

    #[test]
    fn random_selection_stays_inside_enabled_set() {
        let settings = settings_with(&["grid", "checkbox"]);
        for _ in 0..20 {
            let picked = select_puzzle_type(&request(Some("random")), &settings).expect("type");
            assert!(matches!(picked, PuzzleType::Grid | PuzzleType::Checkbox));
        }
    }

    #[test]
    fn absent_type_selects_randomly() {
        let settings = settings_with(&["gesture"]);
        let picked = select_puzzle_type(&request(None), &settings).expect("type");
        assert_eq!(picked, PuzzleType::Gesture);
    }

    #[test]
    fn encrypted_blob_round_trips_through_directional_key() {
        let master = [5u8; 32];
        let blob = encrypt_for_client(
            &master,
            "ctx-1",
            KeyDirection::Encrypt,
            &serde_json::json!({ "salt": "abc" }),
            b"token",
        )
        .expect("encrypt");

        let key = crypto::derive_challenge_key(&master, "ctx-1", KeyDirection::Encrypt)
            .expect("derive");
        let (iv, ciphertext, tag) = blob.decode().expect("decode");
        let plaintext =
            crypto::aes_gcm_decrypt(&key, &iv, &ciphertext, &tag, b"token").expect("decrypt");
        assert_eq!(plaintext, br#"{"salt":"abc"}"#);
    }
}
