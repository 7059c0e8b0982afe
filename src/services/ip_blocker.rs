//! IP blocking and abuse counters
//!
//! Tracks per-IP failure and refresh windows, temporary and manual blocks,
//! the per-API-key handshake rate limit, and evaluates configured blocking
//! rules (exact / wildcard suffix / CIDR / country). All maps are sharded
//! concurrent maps; read paths evict expired entries opportunistically and a
//! background sweep reclaims the rest.

use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::SecuritySettings;

/// Failure window: 3 failures in 10 minutes blocks for 2 hours.
const FAILURE_WINDOW_SECS: i64 = 600;
const FAILURE_THRESHOLD: u32 = 3;
const FAILURE_BLOCK_SECS: i64 = 7200;

/// Refresh window: 3 refreshes in 5 minutes blocks for 1 hour.
const REFRESH_WINDOW_SECS: i64 = 300;
const REFRESH_THRESHOLD: u32 = 3;
const REFRESH_BLOCK_SECS: i64 = 3600;

/// Sliding window for handshake and challenge rate limits.
const RATE_WINDOW_SECS: i64 = 60;

fn failure_window() -> Duration {
    Duration::seconds(FAILURE_WINDOW_SECS)
}

fn refresh_window() -> Duration {
    Duration::seconds(REFRESH_WINDOW_SECS)
}

fn rate_window() -> Duration {
    Duration::seconds(RATE_WINDOW_SECS)
}

#[derive(Debug, Clone)]
struct FailureEntry {
    count: u32,
    window_start: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct RefreshEntry {
    count: u32,
    window_start: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct WindowCounter {
    count: u32,
    window_start: DateTime<Utc>,
}

/// An active block on an IP.
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Thread-safe IP abuse tracker.
pub struct IpBlocker {
    failures: DashMap<String, FailureEntry>,
    refreshes: DashMap<String, RefreshEntry>,
    blocked: DashMap<String, BlockEntry>,
    handshake_counters: DashMap<Uuid, WindowCounter>,
    challenge_counters: DashMap<String, WindowCounter>,
}

impl IpBlocker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            failures: DashMap::new(),
            refreshes: DashMap::new(),
            blocked: DashMap::new(),
            handshake_counters: DashMap::new(),
            challenge_counters: DashMap::new(),
        })
    }

    /// Records a verification/security failure for `ip`. At the third
    /// failure inside the window the IP transitions to blocked; further
    /// failures do not extend an existing block.
    pub fn record_failure(&self, ip: &str) {
        let now = Utc::now();
        let mut entry = self.failures.entry(ip.to_string()).or_insert(FailureEntry {
            count: 0,
            window_start: now,
            last_seen: now,
        });

        if now - entry.window_start > failure_window() {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;
        entry.last_seen = now;

        if entry.count == FAILURE_THRESHOLD {
            drop(entry);
            self.block(ip, "repeated failures", Duration::seconds(FAILURE_BLOCK_SECS));
        }
    }

    /// Records a challenge refresh for `ip`; blocks for an hour at the
    /// third refresh inside five minutes.
    pub fn record_refresh(&self, ip: &str) {
        let now = Utc::now();
        let mut entry = self.refreshes.entry(ip.to_string()).or_insert(RefreshEntry {
            count: 0,
            window_start: now,
        });

        if now - entry.window_start > refresh_window() {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;

        if entry.count == REFRESH_THRESHOLD {
            drop(entry);
            self.block(ip, "excessive refreshes", Duration::seconds(REFRESH_BLOCK_SECS));
        }
    }

    /// Inserts a block. A live block is never extended; a lapsed one not
    /// yet swept is replaced.
    pub fn block(&self, ip: &str, reason: &str, duration: Duration) {
        let now = Utc::now();
        match self.blocked.entry(ip.to_string()) {
            dashmap::Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    occupied.insert(BlockEntry {
                        reason: reason.to_string(),
                        blocked_at: now,
                        expires_at: now + duration,
                    });
                    tracing::warn!(ip = %ip, reason = %reason, "IP blocked");
                }
            }
            dashmap::Entry::Vacant(vacant) => {
                vacant.insert(BlockEntry {
                    reason: reason.to_string(),
                    blocked_at: now,
                    expires_at: now + duration,
                });
                tracing::warn!(ip = %ip, reason = %reason, "IP blocked");
            }
        }
    }

    /// Returns seconds remaining if `ip` is blocked. Lapsed entries are
    /// deleted eagerly.
    pub fn is_blocked(&self, ip: &str) -> Option<i64> {
        let now = Utc::now();
        let entry = self.blocked.get(ip)?;
        if entry.expires_at <= now {
            drop(entry);
            self.blocked.remove(ip);
            return None;
        }
        Some((entry.expires_at - now).num_seconds().max(1))
    }

    /// Number of failures recorded for `ip` inside the live window.
    pub fn failure_count(&self, ip: &str) -> u32 {
        let now = Utc::now();
        self.failures
            .get(ip)
            .filter(|e| now - e.window_start <= failure_window())
            .map_or(0, |e| e.count)
    }

    /// Sliding-window handshake rate limit per API key. Returns seconds
    /// until the window clears when the limit is hit.
    pub fn check_handshake_limit(&self, api_key_id: Uuid, limit: u32) -> Result<(), i64> {
        let now = Utc::now();
        let mut entry = self
            .handshake_counters
            .entry(api_key_id)
            .or_insert(WindowCounter {
                count: 0,
                window_start: now,
            });

        if now - entry.window_start > rate_window() {
            entry.count = 0;
            entry.window_start = now;
        }
        if entry.count >= limit {
            let remaining = (entry.window_start + rate_window() - now).num_seconds().max(1);
            return Err(remaining);
        }
        entry.count += 1;
        Ok(())
    }

    /// Per-IP challenge issuance rate limit (applied when the key's
    /// settings enable IP rate limiting).
    pub fn check_challenge_rate(&self, ip: &str, limit: u32) -> Result<(), i64> {
        let now = Utc::now();
        let mut entry = self
            .challenge_counters
            .entry(ip.to_string())
            .or_insert(WindowCounter {
                count: 0,
                window_start: now,
            });

        if now - entry.window_start > rate_window() {
            entry.count = 0;
            entry.window_start = now;
        }
        if entry.count >= limit {
            let remaining = (entry.window_start + rate_window() - now).num_seconds().max(1);
            return Err(remaining);
        }
        entry.count += 1;
        Ok(())
    }

    /// Evaluates the configured blocked-IP patterns and country list.
    /// `Err` carries the internal reason; callers externalise it generically.
    pub fn check_security_blocking(
        &self,
        ip: &str,
        country: Option<&str>,
        settings: &SecuritySettings,
    ) -> Result<(), String> {
        for pattern in &settings.blocked_ips {
            if matches_rule(ip, pattern) {
                return Err(format!("ip matches blocked pattern {pattern}"));
            }
        }
        if let Some(country) = country {
            let country = country.to_ascii_uppercase();
            if settings
                .blocked_countries
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&country))
            {
                return Err(format!("country {country} on blocklist"));
            }
        }
        Ok(())
    }

    /// Drops expired windows and lapsed blocks. Runs from the sweep task.
    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        self.failures
            .retain(|_, e| now - e.last_seen <= failure_window());
        self.refreshes
            .retain(|_, e| now - e.window_start <= refresh_window());
        self.handshake_counters
            .retain(|_, e| now - e.window_start <= rate_window());
        self.challenge_counters
            .retain(|_, e| now - e.window_start <= rate_window());

        let before = self.blocked.len();
        self.blocked.retain(|_, e| e.expires_at > now);
        let removed = before - self.blocked.len();
        if removed > 0 {
            tracing::debug!(removed = removed, "Expired IP blocks reclaimed");
        }
    }

    /// Spawns the 60s counter GC task.
    pub fn spawn_cleanup_task(blocker: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                blocker.cleanup_expired();
            }
        })
    }

    #[cfg(test)]
    fn force_block_expiry(&self, ip: &str) {
        if let Some(mut e) = self.blocked.get_mut(ip) {
            e.expires_at = Utc::now() - Duration::seconds(1);
        }
    }
}

/// Extracts the client IP for a request.
///
/// Walks, in order: the Replit edge header, the `X-Forwarded-For` chain
/// (first public address wins), `CF-Connecting-IP`, then the socket peer.
/// Under chained proxies the real client is the first non-private address
/// in the chain; if nothing public appears anywhere, the last private
/// address seen is used. IPv4-mapped IPv6 forms are de-mapped.
pub fn get_client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    let mut last_private: Option<IpAddr> = None;

    let mut candidates: Vec<IpAddr> = Vec::new();
    if let Some(ip) = header_ip(headers, "x-replit-user-ip") {
        candidates.push(ip);
    }
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        for part in xff.split(',') {
            if let Ok(ip) = part.trim().parse::<IpAddr>() {
                candidates.push(demap(ip));
            }
        }
    }
    if let Some(ip) = header_ip(headers, "cf-connecting-ip") {
        candidates.push(ip);
    }
    candidates.push(demap(peer.ip()));

    for ip in candidates {
        if is_private(ip) {
            last_private = Some(ip);
        } else {
            return ip.to_string();
        }
    }

    last_private
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| demap(peer.ip()).to_string())
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    headers
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse::<IpAddr>()
        .ok()
        .map(demap)
}

/// Converts `::ffff:a.b.c.d` back to plain IPv4.
fn demap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Whether `ip` matches a blocking pattern.
///
/// Supported patterns:
/// - exact: `203.0.113.7`
/// - wildcard suffix: `203.0.113.*`, `203.0.*`, `203.*` (the `*` must be the
///   final component and covers all remaining octets)
/// - CIDR with /8, /16 or /24: `10.0.0.0/24`
pub fn matches_rule(ip: &str, pattern: &str) -> bool {
    if let Some((base, prefix)) = pattern.split_once('/') {
        let Ok(prefix) = prefix.parse::<u8>() else {
            return false;
        };
        if !matches!(prefix, 8 | 16 | 24) {
            return false;
        }
        let (Ok(ip), Ok(base)) = (ip.parse::<Ipv4Addr>(), base.parse::<Ipv4Addr>()) else {
            return false;
        };
        let octets = usize::from(prefix / 8);
        return ip.octets()[..octets] == base.octets()[..octets];
    }

    if pattern.contains('*') {
        let parts: Vec<&str> = pattern.split('.').collect();
        let Some((last, prefix)) = parts.split_last() else {
            return false;
        };
        // The wildcard must be the final component, with at least one
        // literal octet before it.
        if *last != "*" || prefix.is_empty() || prefix.iter().any(|p| p.contains('*')) {
            return false;
        }
        let ip_parts: Vec<&str> = ip.split('.').collect();
        if ip_parts.len() != 4 || prefix.len() >= 4 {
            return false;
        }
        return prefix.iter().zip(ip_parts.iter()).all(|(p, o)| p == o);
    }

    ip == pattern
}

/// Validates a blocked-IP pattern before it is written into settings.
pub fn validate_ip_pattern(pattern: &str) -> bool {
    if let Some((base, prefix)) = pattern.split_once('/') {
        return matches!(prefix, "8" | "16" | "24") && base.parse::<Ipv4Addr>().is_ok();
    }
    if pattern.contains('*') {
        let parts: Vec<&str> = pattern.split('.').collect();
        let Some((last, prefix)) = parts.split_last() else {
            return false;
        };
        return *last == "*"
            && !prefix.is_empty()
            && prefix.len() < 4
            && prefix.iter().all(|p| p.parse::<u8>().is_ok());
    }
    pattern.parse::<IpAddr>().is_ok()
}

/// Validates an ISO-3166 alpha-2 country code.
pub fn validate_country_code(code: &str) -> bool {
    code.len() == 2 && code.chars().all(|c| c.is_ascii_uppercase())
}
