//! Puzzle types, generation interface and answer validation
//!
//! The core treats puzzle content as opaque: a pluggable provider produces a
//! client payload plus a hidden answer, and a validator compares the
//! submitted answer against the stored one. Everything position- or
//! sequence-shaped compares in constant time so timing cannot reveal which
//! element differed.
//!
//! Content generation (images, audio clips) lives outside the core; the
//! built-in provider emits abstract payloads with the same shapes.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;

use super::crypto;

/// The interactive puzzle variants the service can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PuzzleType {
    /// Select the matching cells in a 3x3 grid.
    Grid,
    /// Drag a piece to its slot.
    Jigsaw,
    /// Repeat a gesture sequence.
    Gesture,
    /// Pick the upside-down images. The orientation list is itself the
    /// answer, so the payload must never travel in plaintext.
    UpsideDown,
    /// Type the spoken digits. Target list is the answer; encrypted only.
    Audio,
    /// Single checkbox backed by behavioural analysis.
    Checkbox,
}

impl PuzzleType {
    pub const ALL: [PuzzleType; 6] = [
        PuzzleType::Grid,
        PuzzleType::Jigsaw,
        PuzzleType::Gesture,
        PuzzleType::UpsideDown,
        PuzzleType::Audio,
        PuzzleType::Checkbox,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PuzzleType::Grid => "grid",
            PuzzleType::Jigsaw => "jigsaw",
            PuzzleType::Gesture => "gesture",
            PuzzleType::UpsideDown => "upside_down",
            PuzzleType::Audio => "audio",
            PuzzleType::Checkbox => "checkbox",
        }
    }

    /// Whether the client payload reveals the answer, which restricts the
    /// type to sessions with end-to-end encryption.
    pub fn requires_encrypted_delivery(self) -> bool {
        matches!(self, PuzzleType::UpsideDown | PuzzleType::Audio)
    }

    /// Picks a random type among `enabled` using the CSPRNG. Falls back to
    /// checkbox when the enabled set is empty.
    pub fn random_among(enabled: &[PuzzleType]) -> PuzzleType {
        if enabled.is_empty() {
            return PuzzleType::Checkbox;
        }
        let idx = crypto::random_int_below(enabled.len() as u64) as usize;
        enabled[idx]
    }
}

impl FromStr for PuzzleType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grid" => Ok(PuzzleType::Grid),
            "jigsaw" => Ok(PuzzleType::Jigsaw),
            "gesture" => Ok(PuzzleType::Gesture),
            "upside_down" => Ok(PuzzleType::UpsideDown),
            "audio" => Ok(PuzzleType::Audio),
            "checkbox" => Ok(PuzzleType::Checkbox),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for PuzzleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A generated puzzle: what the client sees, and what the server keeps.
#[derive(Debug, Clone)]
pub struct GeneratedPuzzle {
    /// Client-visible payload. For encrypted-only types this still carries
    /// the sensitive fields; the delivery layer enforces encryption.
    pub client_payload: Value,
    /// The hidden correct answer.
    pub answer: Value,
}

/// Pluggable puzzle content source.
pub trait PuzzleProvider: Send + Sync {
    fn generate(&self, puzzle_type: PuzzleType, difficulty: u8) -> GeneratedPuzzle;
}

/// Abstract built-in provider. Emits the canonical payload shapes without
/// real media content.
pub struct BuiltinPuzzleProvider;

const GRID_CELLS: u64 = 9;
const GESTURE_DIRECTIONS: [&str; 4] = ["up", "down", "left", "right"];
const JIGSAW_BOARD: u64 = 300;
/// Max squared pixel distance accepted for a jigsaw placement.
const JIGSAW_TOLERANCE_SQ: i64 = 64;

impl PuzzleProvider for BuiltinPuzzleProvider {
    fn generate(&self, puzzle_type: PuzzleType, difficulty: u8) -> GeneratedPuzzle {
        match puzzle_type {
            PuzzleType::Grid => {
                // 3 target cells out of 9, distinct, CSPRNG-picked.
                let mut targets: Vec<u64> = Vec::with_capacity(3);
                while targets.len() < 3 {
                    let cell = crypto::random_int_below(GRID_CELLS);
                    if !targets.contains(&cell) {
                        targets.push(cell);
                    }
                }
                targets.sort_unstable();
                GeneratedPuzzle {
                    client_payload: json!({ "cells": GRID_CELLS, "target_count": targets.len() }),
                    answer: json!(targets),
                }
            }
            PuzzleType::Jigsaw => {
                let x = crypto::random_int_below(JIGSAW_BOARD);
                let y = crypto::random_int_below(JIGSAW_BOARD);
                GeneratedPuzzle {
                    client_payload: json!({ "board": JIGSAW_BOARD, "piece": 40 }),
                    answer: json!({ "x": x, "y": y }),
                }
            }
            PuzzleType::Gesture => {
                let len = 3 + u64::from(difficulty.clamp(1, 10)) / 4;
                let seq: Vec<&str> = (0..len)
                    .map(|_| {
                        GESTURE_DIRECTIONS
                            [crypto::random_int_below(GESTURE_DIRECTIONS.len() as u64) as usize]
                    })
                    .collect();
                GeneratedPuzzle {
                    client_payload: json!({ "length": seq.len() }),
                    answer: json!(seq),
                }
            }
            PuzzleType::UpsideDown => {
                // 2 of 6 images flipped; the orientation list is the secret.
                let mut flipped: Vec<u64> = Vec::with_capacity(2);
                while flipped.len() < 2 {
                    let idx = crypto::random_int_below(6);
                    if !flipped.contains(&idx) {
                        flipped.push(idx);
                    }
                }
                flipped.sort_unstable();
                GeneratedPuzzle {
                    client_payload: json!({ "images": 6, "flipped": flipped }),
                    answer: json!(flipped),
                }
            }
            PuzzleType::Audio => {
                let digits: String = (0..6)
                    .map(|_| char::from(b'0' + crypto::random_int_below(10) as u8))
                    .collect();
                GeneratedPuzzle {
                    client_payload: json!({ "digits": 6, "target": digits }),
                    answer: json!(digits),
                }
            }
            PuzzleType::Checkbox => GeneratedPuzzle {
                client_payload: json!({}),
                answer: json!(true),
            },
        }
    }
}

/// Strips answer-revealing fields from a payload before any plaintext
/// delivery. Encrypted-only types never reach this path, but the stripping
/// still runs as a second line.
pub fn strip_sensitive_fields(puzzle_type: PuzzleType, payload: &Value) -> Value {
    let mut payload = payload.clone();
    if let Some(obj) = payload.as_object_mut() {
        match puzzle_type {
            PuzzleType::UpsideDown => {
                obj.remove("flipped");
            }
            PuzzleType::Audio => {
                obj.remove("target");
            }
            _ => {}
        }
    }
    payload
}

/// Dispatches to the puzzle-specific validator.
///
/// Array and position comparisons run in constant time over equal-length
/// inputs; shape mismatches (wrong arity, wrong type) fail without touching
/// the stored answer.
pub fn validate_answer(puzzle_type: PuzzleType, stored: &Value, submitted: &Value) -> bool {
    match puzzle_type {
        PuzzleType::Grid | PuzzleType::UpsideDown => {
            match (positions(stored), positions(submitted)) {
                (Some(mut a), Some(mut b)) => {
                    a.sort_unstable();
                    b.sort_unstable();
                    crypto::constant_time_eq_u64(&a, &b)
                }
                _ => false,
            }
        }
        PuzzleType::Jigsaw => match (point(stored), point(submitted)) {
            (Some((ax, ay)), Some((bx, by))) => {
                // i128 arithmetic: client-supplied coordinates must not be
                // able to overflow the distance computation.
                let dx = i128::from(ax) - i128::from(bx);
                let dy = i128::from(ay) - i128::from(by);
                dx * dx + dy * dy <= i128::from(JIGSAW_TOLERANCE_SQ)
            }
            _ => false,
        },
        PuzzleType::Gesture => match (gesture_indices(stored), gesture_indices(submitted)) {
            (Some(a), Some(b)) => crypto::constant_time_eq_u64(&a, &b),
            _ => false,
        },
        PuzzleType::Audio => match (stored.as_str(), submitted.as_str()) {
            (Some(a), Some(b)) => crypto::constant_time_eq(a.as_bytes(), b.trim().as_bytes()),
            _ => false,
        },
        PuzzleType::Checkbox => submitted.as_bool() == Some(true),
    }
}

fn positions(value: &Value) -> Option<Vec<u64>> {
    serde_json::from_value(value.clone()).ok()
}

fn point(value: &Value) -> Option<(i64, i64)> {
    let obj = value.as_object()?;
    Some((obj.get("x")?.as_i64()?, obj.get("y")?.as_i64()?))
}

fn gesture_indices(value: &Value) -> Option<Vec<u64>> {
    let seq: Vec<String> = serde_json::from_value(value.clone()).ok()?;
    seq.iter()
        .map(|d| {
            GESTURE_DIRECTIONS
                .iter()
                .position(|g| g == d)
                .map(|i| i as u64)
        })
        .collect()
}
