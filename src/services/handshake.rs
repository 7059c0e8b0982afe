//! Handshake orchestration
//!
//! Establishes one session: API key resolution, per-key rate limiting,
//! origin validation, strict client public key validation, ECDH + HKDF key
//! derivation, session storage, and the transcript signature that lets the
//! client detect a substituted key. A rejected handshake reveals its failure
//! category and nothing more.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;

use super::{challenge_store, crypto, fingerprint, CoreServices, SessionKey};
use crate::error::ApiError;
use crate::types::{HandshakeRequest, HandshakeResponse};

impl CoreServices {
    /// Performs the full handshake for one request.
    pub async fn handshake(
        &self,
        req: HandshakeRequest,
        client_ip: &str,
        origin_domain: Option<&str>,
    ) -> Result<HandshakeResponse, ApiError> {
        let api_key = challenge_store::get_api_key_by_public_ident(&self.db, &req.public_key)
            .await?
            .filter(|k| k.is_active)
            .ok_or(ApiError::AuthFailure)?;

        self.ip_blocker
            .check_handshake_limit(api_key.id, self.config.handshake_rate_limit_per_minute)
            .map_err(|remaining_secs| ApiError::RateLimited { remaining_secs })?;

        if api_key.allowed_domain != "*" {
            let domain = origin_domain
                .ok_or_else(|| ApiError::Forbidden("handshake without origin".to_string()))?;
            if !api_key.domain_allowed(domain) {
                return Err(ApiError::Forbidden(format!(
                    "origin {domain} not allowed for key"
                )));
            }
        }

        let client_pub_bytes = STANDARD
            .decode(&req.client_public_key)
            .map_err(|_| ApiError::InvalidRequest("invalid base64 public key".to_string()))?;
        let client_pub = crypto::validate_client_public_key(&client_pub_bytes)
            .map_err(|_| ApiError::InvalidRequest("invalid public key".to_string()))?;

        let server_pair = self.sessions.current_server_keypair();
        let shared = crypto::derive_shared_secret(&server_pair.secret, &client_pub);

        let server_nonce = crypto::random_string(32);
        let master_key = crypto::derive_master_key(&shared, &server_pair.public, &server_nonce)?;

        let device_fingerprint_id = fingerprint::fingerprint_id(req.fingerprint.as_deref());
        let now = Utc::now();
        let ttl = self.sessions.session_ttl();

        self.sessions.store_session(SessionKey {
            master_key,
            server_public_key: server_pair.public.clone(),
            client_public_key: client_pub_bytes,
            server_nonce: server_nonce.clone(),
            api_public_ident: req.public_key.clone(),
            client_ip: client_ip.to_string(),
            device_fingerprint_id: device_fingerprint_id.clone(),
            created_at: now,
            expires_at: now + ttl,
        });

        tracing::info!(
            api_key = %req.public_key,
            fingerprint = %device_fingerprint_id,
            "Session established"
        );

        let timestamp = now.timestamp_millis();
        let server_public_key = STANDARD.encode(&server_pair.public);
        let transcript = format!("{server_public_key}{}{timestamp}", req.client_public_key);
        let signature = hex::encode(crypto::hmac_sha256(
            api_key.secret.as_bytes(),
            transcript.as_bytes(),
        ));

        Ok(HandshakeResponse {
            server_public_key,
            timestamp,
            expires_in: ttl.num_seconds(),
            nonce: server_nonce,
            signature,
        })
    }
}
