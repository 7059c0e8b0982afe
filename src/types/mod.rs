//! API request/response types
//!
//! Defines the standard error response format, the base64 obfuscation
//! envelope used by the challenge endpoint, and the AEAD blob encoding
//! shared by every encrypted field on the wire.

pub mod challenge;
pub mod handshake;
pub mod siteverify;
pub mod verify;

pub use challenge::{
    AutomationSignals, BehaviorTelemetry, ChallengeRequest, ClientMetadata,
    ClientSecurityConfig, DeviceFingerprint, IssueChallengeResponse, PROTOCOL_ENCRYPTED_V1,
    PROTOCOL_PLAINTEXT,
};
pub use handshake::{HandshakeRequest, HandshakeResponse};
pub use siteverify::{SiteVerifyRequest, SiteVerifyResponse};
pub use verify::{SolutionPayload, VerifyRequest, VerifyResponse};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

/// Standard API error response wrapper.
///
/// ```json
/// {
///   "error": { "code": "VALIDATION_ERROR", "message": "..." },
///   "meta": { "request_id": "uuid", "timestamp": "2026-08-01T10:00:00Z" }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ErrorBody,
    pub meta: Meta,
}

impl ApiErrorResponse {
    /// Creates a new error response.
    pub fn new(code: impl Into<String>, message: impl Into<String>, request_id: Uuid) -> Self {
        Self {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
            },
            meta: Meta::new(request_id),
        }
    }
}

/// Error body containing code and message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Response metadata: request ID and server timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl Meta {
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            timestamp: Utc::now(),
        }
    }
}

/// Transport obfuscation envelope: `{"data": "<base64 of the real JSON>"}`.
///
/// Applied to challenge-endpoint requests and responses. This hides payloads
/// from casual inspection only; confidentiality comes from the AEAD layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObfuscatedEnvelope {
    pub data: String,
}

impl ObfuscatedEnvelope {
    /// Wraps a serializable value.
    pub fn wrap<T: Serialize>(value: &T) -> Result<Self, ApiError> {
        let json = serde_json::to_vec(value)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("envelope encode: {e}")))?;
        Ok(Self {
            data: STANDARD.encode(json),
        })
    }

    /// Unwraps into the expected inner type.
    pub fn unwrap_into<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        let json = STANDARD
            .decode(&self.data)
            .map_err(|_| ApiError::InvalidRequest("invalid base64 envelope".to_string()))?;
        serde_json::from_slice(&json)
            .map_err(|_| ApiError::InvalidRequest("malformed envelope payload".to_string()))
    }
}

/// An AES-256-GCM ciphertext as it travels on the wire.
///
/// All three fields are base64. The 16-byte tag is carried separately from
/// the ciphertext so either side can reject on length before decrypting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub iv: String,
    pub ciphertext: String,
    pub tag: String,
}

impl EncryptedBlob {
    /// Decodes the three base64 fields into raw bytes.
    pub fn decode(&self) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), ApiError> {
        let iv = STANDARD
            .decode(&self.iv)
            .map_err(|_| ApiError::InvalidRequest("invalid base64 iv".to_string()))?;
        let ciphertext = STANDARD
            .decode(&self.ciphertext)
            .map_err(|_| ApiError::InvalidRequest("invalid base64 ciphertext".to_string()))?;
        let tag = STANDARD
            .decode(&self.tag)
            .map_err(|_| ApiError::InvalidRequest("invalid base64 tag".to_string()))?;
        Ok((iv, ciphertext, tag))
    }

    /// Encodes raw AEAD output for the wire.
    pub fn encode(iv: &[u8], ciphertext: &[u8], tag: &[u8]) -> Self {
        Self {
            iv: STANDARD.encode(iv),
            ciphertext: STANDARD.encode(ciphertext),
            tag: STANDARD.encode(tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Inner {
        token: String,
        n: u32,
    }

    #[test]
    fn envelope_round_trip() {
        let inner = Inner {
            token: "abc".to_string(),
            n: 7,
        };
        let wrapped = ObfuscatedEnvelope::wrap(&inner).expect("wrap");
        let out: Inner = wrapped.unwrap_into().expect("unwrap");
        assert_eq!(inner, out);
    }

    #[test]
    fn envelope_rejects_bad_base64() {
        let env = ObfuscatedEnvelope {
            data: "not-base64!!!".to_string(),
        };
        assert!(env.unwrap_into::<Inner>().is_err());
    }

    #[test]
    fn blob_round_trip() {
        let blob = EncryptedBlob::encode(&[1; 12], &[2, 3, 4], &[5; 16]);
        let (iv, ct, tag) = blob.decode().expect("decode");
        assert_eq!(iv, vec![1; 12]);
        assert_eq!(ct, vec![2, 3, 4]);
        assert_eq!(tag, vec![5; 16]);
    }
}
