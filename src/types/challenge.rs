//! Challenge endpoint types
//!
//! The outer body travels inside the base64 obfuscation envelope. Clients
//! with a live session speak `encrypted-v1`; clients that never completed a
//! handshake fall back to the legacy plaintext fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::EncryptedBlob;

/// Protocol tag for the encrypted request/response flavour.
pub const PROTOCOL_ENCRYPTED_V1: &str = "encrypted-v1";
/// Protocol tag for the legacy plaintext flavour.
pub const PROTOCOL_PLAINTEXT: &str = "plaintext";

/// POST /api/v1/challenge request (inside the obfuscation envelope).
#[derive(Debug, Deserialize)]
pub struct ChallengeRequest {
    /// The site key.
    #[serde(rename = "publicKey")]
    pub public_key: String,

    /// Requested puzzle type; "random" or absent selects among enabled types.
    #[serde(rename = "type", default)]
    pub puzzle_type: Option<String>,

    /// True when the widget is refreshing an unsolved challenge.
    #[serde(rename = "isRefresh", default)]
    pub is_refresh: bool,

    /// "encrypted-v1" or absent for legacy plaintext.
    #[serde(default)]
    pub protocol: Option<String>,

    /// Raw fingerprint material, identical to what the handshake carried.
    /// Only a session-lookup handle; possession of the master key is what
    /// actually proves continuity.
    #[serde(default)]
    pub fingerprint: Option<String>,

    /// AEAD blob of [`ClientMetadata`]. Mandatory under encrypted-v1.
    #[serde(rename = "encryptedClientData", default)]
    pub encrypted_client_data: Option<EncryptedBlob>,

    /// Nonce the per-request decrypt sub-key was derived with.
    #[serde(rename = "requestNonce", default)]
    pub request_nonce: Option<String>,

    /// Legacy plaintext telemetry, read only when no protocol tag is set.
    #[serde(rename = "metadata", default)]
    pub plaintext_metadata: Option<ClientMetadata>,
}

/// Client-side environment report, normally delivered encrypted.
///
/// Everything here is client-asserted and feeds the risk engine as signals,
/// never as facts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientMetadata {
    /// Names of client-side detections that fired (e.g. "devtools_open").
    #[serde(default)]
    pub detections: Vec<String>,

    /// Browser automation indicators.
    #[serde(default)]
    pub signals: Option<AutomationSignals>,

    /// Advanced fingerprint descriptor.
    #[serde(default)]
    pub fingerprint: Option<DeviceFingerprint>,

    /// Interaction telemetry for behavioural analysis.
    #[serde(default)]
    pub behavior: Option<BehaviorTelemetry>,

    /// Values of hidden form fields; any non-empty value is a honeypot hit.
    #[serde(default)]
    pub honeypot_fields: BTreeMap<String, String>,
}

/// Browser automation indicators reported by the widget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationSignals {
    #[serde(default)]
    pub webdriver: bool,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default = "default_true")]
    pub has_local_storage: bool,
    #[serde(default = "default_true")]
    pub has_session_storage: bool,
    #[serde(default)]
    pub plugin_count: u32,
    #[serde(default)]
    pub language_count: u32,
}

fn default_true() -> bool {
    true
}

/// Advanced device fingerprint descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    /// Stable identifier derived client-side from the components.
    pub id: String,

    /// Named fingerprint components (canvas hash, webgl renderer, ...).
    #[serde(default)]
    pub components: BTreeMap<String, String>,

    /// Client's own confidence that the components are stable.
    #[serde(default)]
    pub reliability: f32,
}

/// Interaction telemetry collected while the widget was on screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorTelemetry {
    #[serde(default)]
    pub mouse_movements: u32,
    #[serde(default)]
    pub keyboard_events: u32,
    /// Milliseconds between widget render and submission.
    #[serde(default)]
    pub submission_time_ms: u64,
}

/// POST /api/v1/challenge response (inside the obfuscation envelope).
#[derive(Debug, Serialize, Deserialize)]
pub struct IssueChallengeResponse {
    /// Signed challenge token; also the AAD for every AEAD blob below.
    pub token: String,

    /// Puzzle type actually issued.
    #[serde(rename = "type")]
    pub puzzle_type: String,

    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,

    /// "encrypted-v1" or "plaintext".
    pub protocol: String,

    /// AEAD blob of the client-visible challenge payload (encrypted flavour).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<EncryptedBlob>,

    /// Plaintext client-visible challenge payload (legacy flavour).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<serde_json::Value>,

    /// AEAD blob of the security configuration (encrypted flavour).
    #[serde(rename = "encryptedSecurityConfig", skip_serializing_if = "Option::is_none")]
    pub encrypted_security_config: Option<EncryptedBlob>,

    /// Minimal non-sensitive security configuration (legacy flavour).
    #[serde(rename = "securityConfig", skip_serializing_if = "Option::is_none")]
    pub security_config: Option<ClientSecurityConfig>,
}

/// The slice of [`SecuritySettings`](crate::models::SecuritySettings) a
/// client is allowed to see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSecurityConfig {
    pub anti_debug: bool,
    pub behavioral_analysis: bool,
    pub automation_detection: bool,
    pub advanced_fingerprinting: bool,
    /// Seconds the client has to solve before the challenge expires.
    pub challenge_timeout_secs: u32,
}
