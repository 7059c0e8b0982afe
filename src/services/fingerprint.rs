//! Device and session fingerprints
//!
//! Client-reported fingerprint material is reduced server-side to digests.
//! The session fingerprint hash stored with a challenge is a list of
//! per-component digests rather than one flat hash, which lets the verify
//! path compare by similarity instead of all-or-nothing: browsers legitimately
//! change a component or two between issuance and solve.

use crate::types::DeviceFingerprint;

use super::crypto;

/// Fraction of fingerprint components that must agree for a session-binding
/// match.
pub const SIMILARITY_THRESHOLD: f32 = 0.6;

/// Placeholder identity when no fingerprint was reported.
pub const NO_FINGERPRINT: &str = "none";

/// Stable id for raw handshake fingerprint material.
pub fn fingerprint_id(material: Option<&str>) -> String {
    match material {
        Some(material) if !material.trim().is_empty() => {
            crypto::sha256_hex(material.trim().as_bytes())
        }
        _ => NO_FINGERPRINT.to_string(),
    }
}

/// Compact per-component digest string, e.g. `id=1f2e3d4c;canvas=aabbccdd`.
/// Components are sorted by name so the encoding is deterministic.
pub fn session_fingerprint_hash(fp: &DeviceFingerprint) -> String {
    let mut parts = Vec::with_capacity(fp.components.len() + 1);
    parts.push(format!("id={}", short_digest(&fp.id)));
    for (name, value) in &fp.components {
        parts.push(format!("{name}={}", short_digest(value)));
    }
    parts.join(";")
}

fn short_digest(value: &str) -> String {
    crypto::sha256_hex(value.as_bytes())[..8].to_string()
}

/// Component-wise similarity of two encoded fingerprint hashes in `[0, 1]`.
/// Compares digests pairwise by component name over the union of names.
pub fn similarity(stored: &str, current: &str) -> f32 {
    let stored: Vec<(&str, &str)> = parse(stored);
    let current: Vec<(&str, &str)> = parse(current);
    if stored.is_empty() || current.is_empty() {
        return 0.0;
    }

    let mut names: Vec<&str> = stored
        .iter()
        .map(|(n, _)| *n)
        .chain(current.iter().map(|(n, _)| *n))
        .collect();
    names.sort_unstable();
    names.dedup();

    let matching = names
        .iter()
        .filter(|name| {
            let a = stored.iter().find(|(n, _)| n == *name).map(|(_, v)| v);
            let b = current.iter().find(|(n, _)| n == *name).map(|(_, v)| v);
            matches!((a, b), (Some(a), Some(b)) if a == b)
        })
        .count();

    matching as f32 / names.len() as f32
}

/// Whether the current fingerprint is close enough to the stored one.
pub fn matches_stored(stored: &str, current: &str) -> bool {
    if stored == current {
        return true;
    }
    similarity(stored, current) >= SIMILARITY_THRESHOLD
}

fn parse(encoded: &str) -> Vec<(&str, &str)> {
    encoded
        .split(';')
        .filter_map(|part| part.split_once('='))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn fp(id: &str, components: &[(&str, &str)]) -> DeviceFingerprint {
        DeviceFingerprint {
            id: id.to_string(),
            components: components
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            reliability: 0.9,
        }
    }

    #[test]
    fn material_reduces_to_stable_id() {
        let a = fingerprint_id(Some("canvas:abc|webgl:def"));
        let b = fingerprint_id(Some("canvas:abc|webgl:def"));
        assert_eq!(a, b);
        assert_ne!(a, fingerprint_id(Some("canvas:abc|webgl:xyz")));
        assert_eq!(fingerprint_id(None), NO_FINGERPRINT);
        assert_eq!(fingerprint_id(Some("  ")), NO_FINGERPRINT);
    }

    #[test]
    fn identical_fingerprints_match() {
        let h = session_fingerprint_hash(&fp("dev-1", &[("canvas", "a"), ("webgl", "b")]));
        assert!(matches_stored(&h, &h));
    }

    #[test]
    fn one_changed_component_out_of_four_still_matches() {
        let stored = session_fingerprint_hash(&fp(
            "dev-1",
            &[("canvas", "a"), ("webgl", "b"), ("fonts", "c")],
        ));
        let current = session_fingerprint_hash(&fp(
            "dev-1",
            &[("canvas", "a"), ("webgl", "b"), ("fonts", "changed")],
        ));
        // 3 of 4 components (incl. id) agree: 0.75 >= threshold.
        assert!(matches_stored(&stored, &current));
    }

    #[test]
    fn mostly_different_fingerprint_is_rejected() {
        let stored = session_fingerprint_hash(&fp(
            "dev-1",
            &[("canvas", "a"), ("webgl", "b"), ("fonts", "c")],
        ));
        let current = session_fingerprint_hash(&fp(
            "dev-2",
            &[("canvas", "x"), ("webgl", "y"), ("fonts", "z")],
        ));
        assert!(!matches_stored(&stored, &current));
    }

    #[test]
    fn missing_components_count_against_similarity() {
        let stored =
            session_fingerprint_hash(&fp("dev-1", &[("canvas", "a"), ("webgl", "b")]));
        let current = session_fingerprint_hash(&fp("dev-1", &[]));
        // Only the id digest agrees out of three names.
        assert!(!matches_stored(&stored, &current));
    }
}
