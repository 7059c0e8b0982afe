//! Session key cache
//!
//! In-process map of active session keys established by the handshake, plus
//! the rotating server ephemeral ECDH key pair. Sessions are keyed by
//! `(api_public_ident, device_fingerprint_id)`; the client IP is left out
//! of the key on purpose, because load balancers legitimately rotate it
//! mid-session. Master keys never leave the process.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use p256::SecretKey;
use std::sync::{Arc, RwLock};

use super::crypto;

/// The process's current ephemeral ECDH pair. Only the newest pair serves
/// handshakes; sessions derived under older pairs stay valid until their own
/// expiry because the master key is already derived.
#[derive(Clone)]
pub struct ServerKeyPair {
    pub secret: SecretKey,
    /// Raw uncompressed SEC1 public key (65 bytes).
    pub public: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for ServerKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKeyPair")
            .field("public", &hex::encode(&self.public))
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// One established session.
#[derive(Clone)]
pub struct SessionKey {
    /// 32-byte AES root key. Only used to derive per-challenge sub-keys.
    pub master_key: [u8; 32],
    pub server_public_key: Vec<u8>,
    pub client_public_key: Vec<u8>,
    pub server_nonce: String,
    pub api_public_ident: String,
    pub client_ip: String,
    pub device_fingerprint_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // master_key intentionally absent
        f.debug_struct("SessionKey")
            .field("api_public_ident", &self.api_public_ident)
            .field("device_fingerprint_id", &self.device_fingerprint_id)
            .field("client_ip", &self.client_ip)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Thread-safe session store with per-entry locking.
pub struct SessionCache {
    sessions: DashMap<(String, String), SessionKey>,
    server_key: RwLock<Option<ServerKeyPair>>,
    session_ttl: Duration,
    key_rotation: Duration,
}

impl SessionCache {
    /// Creates a new cache wrapped in an Arc for shared ownership.
    pub fn new(session_ttl_secs: i64, key_rotation_secs: i64) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            server_key: RwLock::new(None),
            session_ttl: Duration::seconds(session_ttl_secs),
            key_rotation: Duration::seconds(key_rotation_secs),
        })
    }

    /// Returns the active ephemeral pair, generating a fresh one if none
    /// exists or the rotation interval elapsed.
    pub fn current_server_keypair(&self) -> ServerKeyPair {
        let now = Utc::now();

        {
            let guard = self.server_key.read().expect("server key lock poisoned");
            if let Some(pair) = guard.as_ref() {
                if pair.expires_at > now {
                    return pair.clone();
                }
            }
        }

        let mut guard = self.server_key.write().expect("server key lock poisoned");
        // Another writer may have rotated while we waited for the lock.
        if let Some(pair) = guard.as_ref() {
            if pair.expires_at > now {
                return pair.clone();
            }
        }

        let (secret, public) = crypto::generate_ecdh_keypair();
        let pair = ServerKeyPair {
            secret,
            public,
            created_at: now,
            expires_at: now + self.key_rotation,
        };
        tracing::info!(
            expires_at = %pair.expires_at,
            "Rotated server ephemeral ECDH key pair"
        );
        *guard = Some(pair.clone());
        pair
    }

    /// Session TTL applied at store time.
    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    /// Stores a session under `(api_public_ident, device_fingerprint_id)`.
    /// A re-handshake for the same binding replaces the previous session.
    pub fn store_session(&self, session: SessionKey) {
        let key = (
            session.api_public_ident.clone(),
            session.device_fingerprint_id.clone(),
        );
        self.sessions.insert(key, session);
    }

    /// Retrieves a live session for the binding, or `None`.
    ///
    /// A miss is an ordinary outcome; encrypted-only call paths fail closed
    /// on it. An IP mismatch is logged and tolerated.
    pub fn get_session(
        &self,
        api_public_ident: &str,
        client_ip: &str,
        device_fingerprint_id: &str,
    ) -> Option<SessionKey> {
        let key = (api_public_ident.to_string(), device_fingerprint_id.to_string());

        let entry = self.sessions.get(&key)?;
        if entry.expires_at <= Utc::now() {
            drop(entry);
            self.sessions.remove(&key);
            return None;
        }

        if entry.client_ip != client_ip {
            tracing::debug!(
                stored_ip = %entry.client_ip,
                request_ip = %client_ip,
                "Session IP changed since handshake; tolerating load-balancer churn"
            );
        }

        Some(entry.clone())
    }

    /// Drops a session regardless of expiry.
    pub fn invalidate_session(&self, api_public_ident: &str, device_fingerprint_id: &str) {
        self.sessions.remove(&(
            api_public_ident.to_string(),
            device_fingerprint_id.to_string(),
        ));
    }

    /// Removes all expired sessions. Called periodically from the sweep task.
    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.expires_at > now);
        let removed = before - self.sessions.len();
        if removed > 0 {
            tracing::debug!(removed = removed, "Cleaned up expired sessions");
        }
    }

    /// Spawns a background task that sweeps expired sessions every 60s.
    pub fn spawn_cleanup_task(cache: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                cache.cleanup_expired();
            }
        })
    }

    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(api: &str, fp: &str, ip: &str, expires_at: DateTime<Utc>) -> SessionKey {
        SessionKey {
            master_key: [1u8; 32],
            server_public_key: vec![4u8; 65],
            client_public_key: vec![4u8; 65],
            server_nonce: "nonce".to_string(),
            api_public_ident: api.to_string(),
            client_ip: ip.to_string(),
            device_fingerprint_id: fp.to_string(),
            created_at: Utc::now(),
            expires_at,
        }
    }

    #[test]
    fn store_then_get_returns_same_session() {
        let cache = SessionCache::new(300, 3600);
        cache.store_session(session("pk", "fp", "1.2.3.4", Utc::now() + Duration::minutes(5)));

        let got = cache.get_session("pk", "1.2.3.4", "fp").expect("session");
        assert_eq!(got.master_key, [1u8; 32]);
    }

    #[test]
    fn binding_mismatch_misses() {
        let cache = SessionCache::new(300, 3600);
        cache.store_session(session("pk", "fp", "1.2.3.4", Utc::now() + Duration::minutes(5)));

        assert!(cache.get_session("other", "1.2.3.4", "fp").is_none());
        assert!(cache.get_session("pk", "1.2.3.4", "other-fp").is_none());
    }

    #[test]
    fn ip_churn_is_tolerated() {
        let cache = SessionCache::new(300, 3600);
        cache.store_session(session("pk", "fp", "1.2.3.4", Utc::now() + Duration::minutes(5)));

        assert!(cache.get_session("pk", "9.9.9.9", "fp").is_some());
    }

    #[test]
    fn expired_session_misses_and_evicts() {
        let cache = SessionCache::new(300, 3600);
        cache.store_session(session("pk", "fp", "1.2.3.4", Utc::now() - Duration::seconds(1)));

        assert!(cache.get_session("pk", "1.2.3.4", "fp").is_none());
        assert_eq!(cache.session_count(), 0);
    }

    #[test]
    fn invalidate_removes_session() {
        let cache = SessionCache::new(300, 3600);
        cache.store_session(session("pk", "fp", "1.2.3.4", Utc::now() + Duration::minutes(5)));
        cache.invalidate_session("pk", "fp");
        assert!(cache.get_session("pk", "1.2.3.4", "fp").is_none());
    }

    #[test]
    fn cleanup_removes_only_expired() {
        let cache = SessionCache::new(300, 3600);
        cache.store_session(session("a", "fp", "1.1.1.1", Utc::now() - Duration::seconds(1)));
        cache.store_session(session("b", "fp", "1.1.1.1", Utc::now() + Duration::minutes(5)));

        cache.cleanup_expired();
        assert_eq!(cache.session_count(), 1);
        assert!(cache.get_session("b", "1.1.1.1", "fp").is_some());
    }

    #[test]
    fn server_keypair_is_reused_until_rotation() {
        let cache = SessionCache::new(300, 3600);
        let p1 = cache.current_server_keypair();
        let p2 = cache.current_server_keypair();
        assert_eq!(p1.public, p2.public);
    }

    #[test]
    fn expired_server_keypair_rotates() {
        let cache = SessionCache::new(300, 0);
        let p1 = cache.current_server_keypair();
        let p2 = cache.current_server_keypair();
        assert_ne!(p1.public, p2.public);
    }
}
