//! Database entity models
//!
//! Row types for the api_keys, challenges and verifications tables.

pub mod api_key;
pub mod challenge;
pub mod verification;

pub use api_key::{ApiKey, SecuritySettings};
pub use challenge::{ChallengeData, ChallengeRecord, PowParams};
pub use verification::VerificationRecord;
