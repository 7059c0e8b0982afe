//! Handshake endpoint types
//!
//! One request/response pair establishes a session: the client sends its
//! ephemeral P-256 public key, the server answers with its own key, a
//! freshness nonce and an HMAC over the transcript.

use serde::{Deserialize, Serialize};

/// POST /api/v1/handshake request body.
#[derive(Debug, Deserialize)]
pub struct HandshakeRequest {
    /// The site key (public identifier of the API key).
    #[serde(rename = "publicKey")]
    pub public_key: String,

    /// Base64 of the client's raw uncompressed P-256 public key (65 bytes).
    #[serde(rename = "clientPublicKey")]
    pub client_public_key: String,

    /// Client-computed device fingerprint material, reduced to an id
    /// server-side. Optional: absent for clients that disable fingerprinting.
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// POST /api/v1/handshake response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Base64 of the server's raw uncompressed P-256 public key.
    #[serde(rename = "serverPublicKey")]
    pub server_public_key: String,

    /// Server clock at signing time, milliseconds since epoch.
    pub timestamp: i64,

    /// Session lifetime in seconds.
    #[serde(rename = "expiresIn")]
    pub expires_in: i64,

    /// Server freshness nonce, mixed into the HKDF salt.
    pub nonce: String,

    /// Hex HMAC over `serverPublicKey || clientPublicKey || timestamp`,
    /// keyed with the API secret. Lets the client detect a MITM that
    /// substituted keys.
    pub signature: String,
}
