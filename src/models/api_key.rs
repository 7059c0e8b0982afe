//! API key entity model
//!
//! An application registration owns one credential pair: a public site key
//! embedded in pages and a server-side secret that signs verification tokens.
//! Per-key security policy lives in a JSONB settings column.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

/// A registered API key with its security policy.
#[derive(Debug, sqlx::FromRow)]
pub struct ApiKey {
    /// Unique identifier; challenges reference it.
    pub id: Uuid,

    /// Site key, freely exposed in embedding pages.
    pub public_ident: String,

    /// Server-side secret: HMAC key for handshake transcripts and the
    /// verification-token signing key. Never serialized outward.
    pub secret: String,

    /// Domain the widget may be embedded on, or "*" to opt out of the check.
    pub allowed_domain: String,

    /// Deactivation revokes all future issuance.
    pub is_active: bool,

    /// Configurable security policy.
    pub settings: Json<SecuritySettings>,

    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// Whether `domain` is the allowed domain or a subdomain of it.
    /// `"*"` opts out of domain validation entirely.
    pub fn domain_allowed(&self, domain: &str) -> bool {
        if self.allowed_domain == "*" {
            return true;
        }
        let domain = domain.to_ascii_lowercase();
        let allowed = self.allowed_domain.to_ascii_lowercase();
        domain == allowed || domain.ends_with(&format!(".{allowed}"))
    }
}

/// Per-key configurable security features.
///
/// Domain validation and payload encryption are always enforced and therefore
/// have no toggle here. Unknown fields are a hard reject so stray JSON cannot
/// smuggle in toggles the dashboard never exposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SecuritySettings {
    /// Base proof-of-work difficulty, 1..=10.
    pub difficulty: u8,

    /// Challenge issuances allowed per IP per minute window.
    pub rate_limit_per_minute: u32,

    /// Seconds a challenge stays solvable, 10..=300.
    pub challenge_timeout_secs: u32,

    /// Seconds a verification token stays exchangeable, 30..=600.
    pub token_expiry_secs: u32,

    pub anti_debug: bool,
    pub advanced_fingerprinting: bool,
    pub session_binding: bool,
    pub behavioral_analysis: bool,
    pub automation_detection: bool,
    pub risk_adaptive_difficulty: bool,
    pub ip_rate_limiting: bool,

    /// Blocked IP patterns: exact, wildcard suffix, or CIDR /8 /16 /24.
    pub blocked_ips: Vec<String>,

    /// Blocked ISO-3166 alpha-2 country codes.
    pub blocked_countries: Vec<String>,

    /// Puzzle types this key may issue.
    pub enabled_puzzle_types: Vec<String>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            difficulty: 4,
            rate_limit_per_minute: 30,
            challenge_timeout_secs: 120,
            token_expiry_secs: 300,
            anti_debug: true,
            advanced_fingerprinting: true,
            session_binding: true,
            behavioral_analysis: true,
            automation_detection: true,
            risk_adaptive_difficulty: true,
            ip_rate_limiting: true,
            blocked_ips: Vec::new(),
            blocked_countries: Vec::new(),
            enabled_puzzle_types: vec![
                "grid".to_string(),
                "jigsaw".to_string(),
                "gesture".to_string(),
                "checkbox".to_string(),
            ],
        }
    }
}

impl SecuritySettings {
    /// Clamps numeric fields into their legal ranges. Settings written by
    /// older dashboard versions may carry out-of-range values; reads always
    /// pass through here.
    pub fn clamped(mut self) -> Self {
        self.difficulty = self.difficulty.clamp(1, 10);
        self.challenge_timeout_secs = self.challenge_timeout_secs.clamp(10, 300);
        self.token_expiry_secs = self.token_expiry_secs.clamp(30, 600);
        self
    }
}
