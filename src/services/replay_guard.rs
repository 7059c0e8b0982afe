//! Verification-token replay guard
//!
//! Short-lived in-memory set of `(challenge_id, nonce)` pairs. Tracked
//! independently of the challenge's used flag because a verification token
//! outlives the challenge's used transition: an already-used challenge must
//! still authorise exactly one site-verify call.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// How long a consumed token id stays in the set.
const REPLAY_TTL_SECS: i64 = 600;

/// Sweep cadence.
const CLEANUP_INTERVAL_SECS: u64 = 300;

/// Thread-safe used-token set with per-entry expiry.
pub struct ReplayGuard {
    used: DashMap<(Uuid, String), DateTime<Utc>>,
}

impl ReplayGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            used: DashMap::new(),
        })
    }

    /// Marks a token id as used. Returns `true` exactly once per id; a
    /// second call inside the TTL is a replay.
    pub fn mark_used(&self, challenge_id: Uuid, nonce: &str) -> bool {
        let now = Utc::now();
        match self.used.entry((challenge_id, nonce.to_string())) {
            dashmap::Entry::Occupied(mut occupied) => {
                if *occupied.get() <= now {
                    // Lapsed entry not yet swept; treat as fresh.
                    occupied.insert(now + Duration::seconds(REPLAY_TTL_SECS));
                    true
                } else {
                    false
                }
            }
            dashmap::Entry::Vacant(vacant) => {
                vacant.insert(now + Duration::seconds(REPLAY_TTL_SECS));
                true
            }
        }
    }

    /// Removes lapsed entries.
    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        let before = self.used.len();
        self.used.retain(|_, expires_at| *expires_at > now);
        let removed = before - self.used.len();
        if removed > 0 {
            tracing::debug!(removed = removed, "Replay set entries reclaimed");
        }
    }

    /// Spawns the 5-minute sweep task.
    pub fn spawn_cleanup_task(guard: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(CLEANUP_INTERVAL_SECS));
            loop {
                interval.tick().await;
                guard.cleanup_expired();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_succeeds_second_is_replay() {
        let guard = ReplayGuard::new();
        let id = Uuid::new_v4();
        assert!(guard.mark_used(id, "nonce-1"));
        assert!(!guard.mark_used(id, "nonce-1"));
    }

    #[test]
    fn distinct_nonces_are_independent() {
        let guard = ReplayGuard::new();
        let id = Uuid::new_v4();
        assert!(guard.mark_used(id, "nonce-1"));
        assert!(guard.mark_used(id, "nonce-2"));
    }

    #[test]
    fn cleanup_drops_lapsed_entries() {
        let guard = ReplayGuard::new();
        let id = Uuid::new_v4();
        assert!(guard.mark_used(id, "nonce-1"));
        if let Some(mut e) = guard.used.get_mut(&(id, "nonce-1".to_string())) {
            *e = Utc::now() - Duration::seconds(1);
        }
        guard.cleanup_expired();
        assert!(guard.used.is_empty());
    }
}
