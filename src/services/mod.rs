//! Service modules for the challenge-response core
//!
//! Business logic lives here; route handlers stay thin. `CoreServices`
//! bundles the shared state every orchestration path needs; the endpoint
//! orchestrations are `impl CoreServices` blocks in their own files.

pub mod challenge_engine;
pub mod challenge_service;
pub mod challenge_store;
pub mod crypto;
pub mod domain;
pub mod fingerprint;
pub mod handshake;
pub mod ip_blocker;
pub mod puzzle;
pub mod replay_guard;
pub mod risk;
pub mod session_cache;
pub mod site_verify;
pub mod tokens;
pub mod verify_service;

pub use ip_blocker::{get_client_ip, IpBlocker};
pub use puzzle::{BuiltinPuzzleProvider, PuzzleProvider, PuzzleType};
pub use replay_guard::ReplayGuard;
pub use risk::{adaptive_difficulty, RiskEngine};
pub use session_cache::{SessionCache, SessionKey};

use sqlx::PgPool;
use std::sync::Arc;

use crate::config::Config;

/// Shared state for all orchestration services.
pub struct CoreServices {
    pub db: PgPool,
    pub sessions: Arc<SessionCache>,
    pub ip_blocker: Arc<IpBlocker>,
    pub risk: Arc<RiskEngine>,
    pub replay: Arc<ReplayGuard>,
    pub puzzles: Arc<dyn PuzzleProvider>,
    pub config: Arc<Config>,
}

impl CoreServices {
    pub fn new(db: PgPool, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            db,
            sessions: SessionCache::new(config.session_ttl_secs, config.server_key_rotation_secs),
            ip_blocker: IpBlocker::new(),
            risk: RiskEngine::new(),
            replay: ReplayGuard::new(),
            puzzles: Arc::new(BuiltinPuzzleProvider),
            config,
        })
    }

    /// Spawns every background sweep and returns the handles.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            SessionCache::spawn_cleanup_task(self.sessions.clone()),
            IpBlocker::spawn_cleanup_task(self.ip_blocker.clone()),
            ReplayGuard::spawn_cleanup_task(self.replay.clone()),
            challenge_store::spawn_cleanup_task(self.db.clone()),
        ]
    }
}
