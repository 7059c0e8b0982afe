//! Risk scoring engine
//!
//! Folds automation signals, behavioural telemetry, fingerprint quality,
//! honeypot results, request timing and IP failure history into a single
//! bounded score, a coarse level, and a bot verdict. High-confidence
//! automation signals force the bot verdict outright; everything else only
//! accumulates score. Missing behavioural data raises the score for the
//! next issuance but never blocks a first interaction on its own.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::types::{BehaviorTelemetry, ClientMetadata};

/// Score cap.
const MAX_SCORE: u32 = 100;

/// Requests inside [`BURST_WINDOW_SECS`] that count as a burst.
const BURST_THRESHOLD: usize = 5;
const BURST_WINDOW_SECS: i64 = 10;

/// Timestamps retained per IP for timing analysis.
const TIMING_HISTORY: usize = 10;

/// Submissions faster than this are treated as a honeypot trigger.
const MIN_HUMAN_SUBMISSION_MS: u64 = 1000;

/// User-agent substrings that identify automation frameworks outright.
const HEADLESS_UA_MARKERS: [&str; 5] = [
    "headlesschrome",
    "phantomjs",
    "puppeteer",
    "playwright",
    "selenium",
];

/// Coarse risk bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    fn from_score(score: u32) -> Self {
        match score {
            0..=24 => RiskLevel::Low,
            25..=49 => RiskLevel::Medium,
            50..=74 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

/// The engine's verdict for one request.
#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub score: u32,
    pub level: RiskLevel,
    pub is_bot: bool,
}

/// Which score components to run, taken from the API key's settings.
#[derive(Debug, Clone, Copy)]
pub struct RiskInputsEnabled {
    pub automation_detection: bool,
    pub behavioral_analysis: bool,
    pub advanced_fingerprinting: bool,
}

/// Risk engine with per-IP request-timing state.
pub struct RiskEngine {
    timings: DashMap<String, VecDeque<DateTime<Utc>>>,
}

impl RiskEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            timings: DashMap::new(),
        })
    }

    /// Scores one issuance request.
    ///
    /// `recent_failures` comes from the IP blocker's failure window.
    pub fn assess(
        &self,
        ip: &str,
        metadata: &ClientMetadata,
        recent_failures: u32,
        enabled: RiskInputsEnabled,
    ) -> RiskAssessment {
        let mut score: u32 = 0;
        let mut is_bot = false;

        score += self.timing_score(ip);

        if enabled.automation_detection {
            let (automation_score, automation_bot) = automation_score(metadata);
            score += automation_score;
            is_bot |= automation_bot;
        }

        if enabled.behavioral_analysis {
            score += behavior_score(metadata.behavior.as_ref());
        }

        let (honeypot_score, honeypot_bot) = honeypot_score(metadata);
        score += honeypot_score;
        is_bot |= honeypot_bot;

        score += detections_score(&metadata.detections);

        if enabled.advanced_fingerprinting {
            score += fingerprint_score(metadata);
        }

        score += failure_history_score(recent_failures);

        let score = score.min(MAX_SCORE);
        let mut level = RiskLevel::from_score(score);
        if is_bot {
            level = RiskLevel::Critical;
        }

        RiskAssessment {
            score,
            level,
            is_bot,
        }
    }

    /// Records a request and scores burst / overly-regular timing.
    fn timing_score(&self, ip: &str) -> u32 {
        let now = Utc::now();
        let mut history = self.timings.entry(ip.to_string()).or_default();
        history.push_back(now);
        while history.len() > TIMING_HISTORY {
            history.pop_front();
        }

        let mut score = 0;

        let burst_cutoff = now - Duration::seconds(BURST_WINDOW_SECS);
        let recent = history.iter().filter(|t| **t >= burst_cutoff).count();
        if recent >= BURST_THRESHOLD {
            score += 15;
        }

        // Machine-regular spacing: at least four intervals whose spread is
        // under 50ms.
        if history.len() >= 5 {
            let intervals: Vec<i64> = history
                .iter()
                .zip(history.iter().skip(1))
                .map(|(a, b)| (*b - *a).num_milliseconds())
                .collect();
            let min = intervals.iter().min().copied().unwrap_or(0);
            let max = intervals.iter().max().copied().unwrap_or(0);
            if max - min < 50 {
                score += 10;
            }
        }

        score
    }

    /// Drops timing entries with no activity in the last 10 minutes.
    pub fn cleanup_expired(&self) {
        let cutoff = Utc::now() - Duration::minutes(10);
        self.timings
            .retain(|_, history| history.back().is_some_and(|t| *t > cutoff));
    }
}

fn automation_score(metadata: &ClientMetadata) -> (u32, bool) {
    let Some(signals) = metadata.signals.as_ref() else {
        // No report at all is suspicious but not conclusive.
        return (15, false);
    };

    let mut score = 0;
    let mut is_bot = false;

    if signals.webdriver {
        score += 40;
        is_bot = true;
    }
    let ua = signals.user_agent.to_ascii_lowercase();
    if HEADLESS_UA_MARKERS.iter().any(|m| ua.contains(m)) {
        score += 30;
        is_bot = true;
    }
    if !signals.has_local_storage || !signals.has_session_storage {
        score += 10;
    }
    if signals.plugin_count == 0 {
        score += 5;
    }
    if signals.language_count == 0 {
        score += 5;
    }

    (score, is_bot)
}

fn behavior_score(behavior: Option<&BehaviorTelemetry>) -> u32 {
    let Some(behavior) = behavior else {
        // Raises the next issuance's difficulty, never blocks outright.
        return 10;
    };

    let interactions = behavior.mouse_movements + behavior.keyboard_events;
    if interactions == 0 && behavior.submission_time_ms > 2000 {
        // Zero interaction over a meaningful dwell is the largest single
        // behavioural component.
        25
    } else if u64::from(interactions) * 1000 < behavior.submission_time_ms / 10 {
        // Interaction rate far below the dwell time.
        10
    } else {
        0
    }
}

fn honeypot_score(metadata: &ClientMetadata) -> (u32, bool) {
    let filled = metadata
        .honeypot_fields
        .values()
        .any(|v| !v.trim().is_empty());
    if filled {
        return (35, true);
    }

    if let Some(behavior) = metadata.behavior.as_ref() {
        if behavior.submission_time_ms > 0 && behavior.submission_time_ms < MIN_HUMAN_SUBMISSION_MS
        {
            return (20, false);
        }
    }

    (0, false)
}

/// Client-side detections that fired (devtools, tampered globals, ...).
/// Self-reported, so they only accumulate score, capped.
fn detections_score(detections: &[String]) -> u32 {
    (detections.len() as u32 * 5).min(15)
}

fn fingerprint_score(metadata: &ClientMetadata) -> u32 {
    match metadata.fingerprint.as_ref() {
        Some(fp) if fp.reliability < 0.3 => 10,
        Some(_) => 0,
        None => 5,
    }
}

fn failure_history_score(recent_failures: u32) -> u32 {
    (recent_failures * 10).min(20)
}

/// Risk-adaptive difficulty: `base + score / 25`, clamped to `[1, 10]`.
/// Monotone non-decreasing in both arguments.
pub fn adaptive_difficulty(base: u8, score: u32) -> u8 {
    let bumped = u32::from(base.clamp(1, 10)) + score.min(MAX_SCORE) / 25;
    u8::try_from(bumped.min(10)).unwrap_or(10).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AutomationSignals, DeviceFingerprint};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn all_enabled() -> RiskInputsEnabled {
        RiskInputsEnabled {
            automation_detection: true,
            behavioral_analysis: true,
            advanced_fingerprinting: true,
        }
    }

    fn human_metadata() -> ClientMetadata {
        ClientMetadata {
            detections: vec![],
            signals: Some(AutomationSignals {
                webdriver: false,
                user_agent: "Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0".to_string(),
                has_local_storage: true,
                has_session_storage: true,
                plugin_count: 3,
                language_count: 2,
            }),
            fingerprint: Some(DeviceFingerprint {
                id: "fp-1".to_string(),
                components: Default::default(),
                reliability: 0.9,
            }),
            behavior: Some(BehaviorTelemetry {
                mouse_movements: 40,
                keyboard_events: 5,
                submission_time_ms: 6000,
            }),
            honeypot_fields: Default::default(),
        }
    }

    #[test]
    fn clean_human_scores_low() {
        let engine = RiskEngine::new();
        let assessment = engine.assess("203.0.113.1", &human_metadata(), 0, all_enabled());
        assert!(!assessment.is_bot);
        assert_eq!(assessment.level, RiskLevel::Low);
    }

    #[test]
    fn webdriver_forces_bot_and_critical() {
        let engine = RiskEngine::new();
        let mut metadata = human_metadata();
        metadata.signals.as_mut().expect("signals").webdriver = true;

        let assessment = engine.assess("203.0.113.2", &metadata, 0, all_enabled());
        assert!(assessment.is_bot);
        assert_eq!(assessment.level, RiskLevel::Critical);
    }

    #[test]
    fn headless_user_agent_forces_bot() {
        let engine = RiskEngine::new();
        let mut metadata = human_metadata();
        metadata.signals.as_mut().expect("signals").user_agent =
            "Mozilla/5.0 HeadlessChrome/124.0".to_string();

        let assessment = engine.assess("203.0.113.3", &metadata, 0, all_enabled());
        assert!(assessment.is_bot);
    }

    #[test]
    fn filled_honeypot_field_forces_bot_even_with_detection_off() {
        let engine = RiskEngine::new();
        let mut metadata = human_metadata();
        metadata
            .honeypot_fields
            .insert("website".to_string(), "http://spam.example".to_string());

        let enabled = RiskInputsEnabled {
            automation_detection: false,
            behavioral_analysis: false,
            advanced_fingerprinting: false,
        };
        let assessment = engine.assess("203.0.113.4", &metadata, 0, enabled);
        assert!(assessment.is_bot);
    }

    #[test]
    fn instant_submission_raises_score_without_bot_verdict() {
        let engine = RiskEngine::new();
        let mut metadata = human_metadata();
        metadata.behavior.as_mut().expect("behavior").submission_time_ms = 200;

        let assessment = engine.assess("203.0.113.5", &metadata, 0, all_enabled());
        assert!(!assessment.is_bot);
        assert!(assessment.score >= 20);
    }

    #[test]
    fn zero_interaction_is_the_largest_behavioural_component() {
        let engine = RiskEngine::new();
        let mut metadata = human_metadata();
        {
            let behavior = metadata.behavior.as_mut().expect("behavior");
            behavior.mouse_movements = 0;
            behavior.keyboard_events = 0;
        }

        let assessment = engine.assess("203.0.113.6", &metadata, 0, all_enabled());
        assert!(assessment.score >= 25);
        assert!(!assessment.is_bot);
    }

    #[test]
    fn missing_behaviour_raises_but_stays_low() {
        let engine = RiskEngine::new();
        let mut metadata = human_metadata();
        metadata.behavior = None;

        let assessment = engine.assess("203.0.113.7", &metadata, 0, all_enabled());
        assert!(!assessment.is_bot);
        assert!(assessment.level <= RiskLevel::Medium);
    }

    #[test]
    fn client_detections_accumulate_capped() {
        assert_eq!(detections_score(&[]), 0);
        assert_eq!(detections_score(&["devtools_open".to_string()]), 5);
        let many: Vec<String> = (0..10).map(|i| format!("d{i}")).collect();
        assert_eq!(detections_score(&many), 15);
    }

    #[test]
    fn failure_history_contributes_capped() {
        assert_eq!(failure_history_score(0), 0);
        assert_eq!(failure_history_score(1), 10);
        assert_eq!(failure_history_score(2), 20);
        assert_eq!(failure_history_score(9), 20);
    }

    #[test]
    fn burst_requests_raise_the_score() {
        let engine = RiskEngine::new();
        let metadata = human_metadata();
        let mut last = 0;
        for _ in 0..6 {
            last = engine
                .assess("203.0.113.8", &metadata, 0, all_enabled())
                .score;
        }
        let fresh = engine
            .assess("203.0.113.99", &metadata, 0, all_enabled())
            .score;
        assert!(last > fresh);
    }

    #[test]
    fn score_is_bounded() {
        let engine = RiskEngine::new();
        let mut metadata = human_metadata();
        {
            let signals = metadata.signals.as_mut().expect("signals");
            signals.webdriver = true;
            signals.user_agent = "puppeteer".to_string();
            signals.has_local_storage = false;
            signals.plugin_count = 0;
            signals.language_count = 0;
        }
        metadata.behavior = None;
        metadata.fingerprint = None;
        metadata
            .honeypot_fields
            .insert("hidden".to_string(), "x".to_string());

        let assessment = engine.assess("203.0.113.9", &metadata, 10, all_enabled());
        assert_eq!(assessment.score, 100);
    }

    #[rstest]
    #[case(1, 0, 1)]
    #[case(4, 0, 4)]
    #[case(4, 25, 5)]
    #[case(4, 100, 8)]
    #[case(10, 100, 10)]
    #[case(1, 100, 5)]
    fn adaptive_difficulty_values(#[case] base: u8, #[case] score: u32, #[case] expected: u8) {
        assert_eq!(adaptive_difficulty(base, score), expected);
    }

    #[test]
    fn adaptive_difficulty_is_monotone_and_clamped() {
        for base in 1..=10u8 {
            for score in 0..=100u32 {
                let d = adaptive_difficulty(base, score);
                assert!((1..=10).contains(&d));
                if score > 0 {
                    assert!(d >= adaptive_difficulty(base, score - 1));
                }
                if base > 1 {
                    assert!(d >= adaptive_difficulty(base - 1, score));
                }
            }
        }
    }

    #[test]
    fn timing_cleanup_drops_idle_entries() {
        let engine = RiskEngine::new();
        engine.assess("203.0.113.10", &human_metadata(), 0, all_enabled());
        {
            let mut entry = engine.timings.get_mut("203.0.113.10").expect("entry");
            for t in entry.iter_mut() {
                *t = Utc::now() - Duration::minutes(11);
            }
        }
        engine.cleanup_expired();
        assert!(engine.timings.is_empty());
    }
}
