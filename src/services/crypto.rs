//! Cryptographic primitives
//!
//! Pure functions over the RustCrypto stack: P-256 ECDH with strict public
//! key validation, the HKDF-SHA256 key hierarchy, AES-256-GCM with detached
//! tags, HMAC-SHA256, and constant-time comparison. Every random value that
//! influences a secret, a position or a selection comes from `OsRng`.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::{ecdh, elliptic_curve::sec1::ToEncodedPoint, PublicKey, SecretKey};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Length of a raw uncompressed SEC1 P-256 public key.
pub const UNCOMPRESSED_POINT_LEN: usize = 65;
/// SEC1 tag byte for an uncompressed point.
const UNCOMPRESSED_POINT_TAG: u8 = 0x04;
/// AES-GCM IV length in bytes.
pub const GCM_IV_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
pub const GCM_TAG_LEN: usize = 16;

/// Errors from the primitive layer. Deliberately coarse: callers translate
/// these into the generic external messages, never the other way around.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid key material")]
    InvalidKeyMaterial,

    #[error("decryption failed")]
    DecryptFailed,

    #[error("key derivation failed")]
    DerivationFailed,
}

/// Sub-key direction tags. Separating keys by direction prevents a
/// ciphertext produced for one leg of the protocol from being replayed on
/// another (e.g. a server challenge payload resubmitted as a solution).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    /// Server -> client challenge payload.
    Encrypt,
    /// Client -> server solution payload.
    Decrypt,
    /// Client -> server telemetry/fingerprint report.
    Metadata,
    /// Server -> client security configuration.
    Config,
}

impl KeyDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyDirection::Encrypt => "encrypt",
            KeyDirection::Decrypt => "decrypt",
            KeyDirection::Metadata => "metadata",
            KeyDirection::Config => "config",
        }
    }
}

/// Generates an ephemeral P-256 key pair.
///
/// Returns the secret key and the raw uncompressed public key (65 bytes,
/// leading `0x04`).
pub fn generate_ecdh_keypair() -> (SecretKey, Vec<u8>) {
    let secret = SecretKey::random(&mut OsRng);
    let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
    (secret, public)
}

/// Validates a client-supplied public key.
///
/// Rejects anything that is not exactly a 65-byte uncompressed SEC1 point
/// with both coordinates below the field prime, on the curve, and not the
/// identity. Skipping any of these checks opens invalid-curve and
/// small-subgroup attacks, so the structural checks run first and the
/// decoded point is only accepted once `p256` has verified the curve
/// equation.
pub fn validate_client_public_key(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    if bytes.len() != UNCOMPRESSED_POINT_LEN {
        return Err(CryptoError::InvalidPublicKey);
    }
    if bytes[0] != UNCOMPRESSED_POINT_TAG {
        return Err(CryptoError::InvalidPublicKey);
    }
    // from_sec1_bytes enforces coordinate range, the curve equation, and
    // rejects the point at infinity.
    PublicKey::from_sec1_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Derives the raw ECDH shared secret. Never used directly as a key; it is
/// always fed through [`derive_master_key`].
pub fn derive_shared_secret(server_secret: &SecretKey, client_public: &PublicKey) -> [u8; 32] {
    let shared = ecdh::diffie_hellman(server_secret.to_nonzero_scalar(), client_public.as_affine());
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes());
    out
}

/// HKDF-SHA256 expand to `out.len()` bytes.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(info, out).map_err(|_| CryptoError::DerivationFailed)
}

/// Derives a session master key from an ECDH shared secret.
///
/// `master = HKDF(IKM=shared, salt=serverPublicKey || serverNonce,
/// info="captcha-session-v1", L=32)`.
pub fn derive_master_key(
    shared: &[u8; 32],
    server_public: &[u8],
    server_nonce: &str,
) -> Result<[u8; 32], CryptoError> {
    let mut salt = Vec::with_capacity(server_public.len() + server_nonce.len());
    salt.extend_from_slice(server_public);
    salt.extend_from_slice(server_nonce.as_bytes());

    let mut master = [0u8; 32];
    hkdf_sha256(shared, &salt, b"captcha-session-v1", &mut master)?;
    Ok(master)
}

/// Derives a per-challenge directional sub-key from a session master key.
///
/// `context_id` is the challenge id once one exists, or the client's request
/// nonce for the pre-issuance metadata decrypt.
pub fn derive_challenge_key(
    master: &[u8; 32],
    context_id: &str,
    direction: KeyDirection,
) -> Result<[u8; 32], CryptoError> {
    let context_hash = sha256_hex(context_id.as_bytes());
    let info = format!("captcha-challenge-v1:{}:{}", direction.as_str(), context_hash);

    let mut child = [0u8; 32];
    hkdf_sha256(master, &[], info.as_bytes(), &mut child)?;
    Ok(child)
}

/// AES-256-GCM encrypt with a fresh random 12-byte IV.
///
/// Returns `(iv, ciphertext, tag)` with the 16-byte tag detached.
pub fn aes_gcm_encrypt(
    key: &[u8; 32],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; GCM_IV_LEN], Vec<u8>, [u8; GCM_TAG_LEN]), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyMaterial)?;

    let mut iv = [0u8; GCM_IV_LEN];
    OsRng.fill(&mut iv[..]);

    let mut combined = cipher
        .encrypt(Nonce::from_slice(&iv), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::InvalidKeyMaterial)?;

    let tag_start = combined.len() - GCM_TAG_LEN;
    let mut tag = [0u8; GCM_TAG_LEN];
    tag.copy_from_slice(&combined[tag_start..]);
    combined.truncate(tag_start);

    Ok((iv, combined, tag))
}

/// AES-256-GCM decrypt. Fails on any tampering of key, IV, ciphertext, tag
/// or associated data; the error carries no detail about which.
pub fn aes_gcm_decrypt(
    key: &[u8; 32],
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != GCM_IV_LEN || tag.len() != GCM_TAG_LEN {
        return Err(CryptoError::DecryptFailed);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyMaterial)?;

    let mut combined = Vec::with_capacity(ciphertext.len() + GCM_TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    cipher
        .decrypt(Nonce::from_slice(iv), Payload { msg: &combined, aad })
        .map_err(|_| CryptoError::DecryptFailed)
}

/// HMAC-SHA256 over `message`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .expect("HMAC accepts keys of any length");
    mac.update(message);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Constant-time byte-string equality. Unequal lengths return false without
/// touching the contents.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Constant-time equality over integer arrays of equal length, accumulated
/// with XOR so the running time does not depend on which element differs.
pub fn constant_time_eq_u64(a: &[u64], b: &[u64]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u64 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Uniform random integer in `[0, n)` from the OS CSPRNG.
///
/// # Panics
///
/// Panics when `n == 0`; the search space is always at least 50.
pub fn random_int_below(n: u64) -> u64 {
    assert!(n > 0, "empty range");
    OsRng.gen_range(0..n)
}

/// Random alphanumeric string of `len` characters from the OS CSPRNG.
pub fn random_string(len: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Random bytes from the OS CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill(&mut buf[..]);
    buf
}

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn keypair_public_key_is_uncompressed_sec1() {
        let (_, public) = generate_ecdh_keypair();
        assert_eq!(public.len(), UNCOMPRESSED_POINT_LEN);
        assert_eq!(public[0], UNCOMPRESSED_POINT_TAG);
    }

    #[test]
    fn generated_keys_pass_validation() {
        let (_, public) = generate_ecdh_keypair();
        assert!(validate_client_public_key(&public).is_ok());
    }

    #[test]
    fn validation_rejects_wrong_length() {
        let (_, public) = generate_ecdh_keypair();
        assert!(validate_client_public_key(&public[..64]).is_err());
    }

    #[test]
    fn validation_rejects_compressed_prefix() {
        let (_, mut public) = generate_ecdh_keypair();
        public[0] = 0x02;
        assert!(validate_client_public_key(&public).is_err());
    }

    #[test]
    fn validation_rejects_off_curve_point() {
        let (_, mut public) = generate_ecdh_keypair();
        // Flip a bit in the y coordinate: overwhelmingly likely off-curve.
        public[64] ^= 0x01;
        assert!(validate_client_public_key(&public).is_err());
    }

    #[test]
    fn ecdh_agrees_in_both_directions() {
        let (server_secret, server_public) = generate_ecdh_keypair();
        let (client_secret, client_public) = generate_ecdh_keypair();

        let client_pub = validate_client_public_key(&client_public).expect("valid");
        let server_pub = validate_client_public_key(&server_public).expect("valid");

        let s1 = derive_shared_secret(&server_secret, &client_pub);
        let s2 = derive_shared_secret(&client_secret, &server_pub);
        assert_eq!(s1, s2);
    }

    #[test]
    fn hkdf_matches_rfc5869_case_1() {
        let ikm = [0x0b_u8; 22];
        let salt: Vec<u8> = (0x00..=0x0c).collect();
        let info: Vec<u8> = (0xf0..=0xf9).collect();
        let mut okm = [0u8; 42];
        hkdf_sha256(&ikm, &salt, &info, &mut okm).expect("expand");
        assert_eq!(
            hex::encode(okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn directional_keys_differ() {
        let master = [7u8; 32];
        let enc = derive_challenge_key(&master, "c-1", KeyDirection::Encrypt).expect("derive");
        let dec = derive_challenge_key(&master, "c-1", KeyDirection::Decrypt).expect("derive");
        let other = derive_challenge_key(&master, "c-2", KeyDirection::Encrypt).expect("derive");
        assert_ne!(enc, dec);
        assert_ne!(enc, other);
    }

    #[test]
    fn aes_gcm_round_trip() {
        let key = [3u8; 32];
        let (iv, ct, tag) = aes_gcm_encrypt(&key, b"payload", b"token").expect("encrypt");
        let pt = aes_gcm_decrypt(&key, &iv, &ct, &tag, b"token").expect("decrypt");
        assert_eq!(pt, b"payload");
    }

    #[test]
    fn aes_gcm_rejects_wrong_aad() {
        let key = [3u8; 32];
        let (iv, ct, tag) = aes_gcm_encrypt(&key, b"payload", b"token-a").expect("encrypt");
        assert!(aes_gcm_decrypt(&key, &iv, &ct, &tag, b"token-b").is_err());
    }

    #[test]
    fn aes_gcm_rejects_flipped_ciphertext_bit() {
        let key = [3u8; 32];
        let (iv, mut ct, tag) = aes_gcm_encrypt(&key, b"payload", b"aad").expect("encrypt");
        ct[0] ^= 0x80;
        assert!(aes_gcm_decrypt(&key, &iv, &ct, &tag, b"aad").is_err());
    }

    #[test]
    fn aes_gcm_rejects_wrong_key() {
        let (iv, ct, tag) = aes_gcm_encrypt(&[3u8; 32], b"payload", b"aad").expect("encrypt");
        assert!(aes_gcm_decrypt(&[4u8; 32], &iv, &ct, &tag, b"aad").is_err());
    }

    #[test]
    fn fresh_iv_per_encryption() {
        let key = [9u8; 32];
        let (iv1, _, _) = aes_gcm_encrypt(&key, b"m", b"").expect("encrypt");
        let (iv2, _, _) = aes_gcm_encrypt(&key, b"m", b"").expect("encrypt");
        assert_ne!(iv1, iv2);
    }

    #[test]
    fn constant_time_eq_semantics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq_u64(&[1, 2, 3], &[1, 2, 3]));
        assert!(!constant_time_eq_u64(&[1, 2, 3], &[1, 2, 4]));
        assert!(!constant_time_eq_u64(&[1, 2], &[1, 2, 3]));
    }

    #[test]
    fn random_int_below_stays_in_range() {
        for _ in 0..1000 {
            assert!(random_int_below(50) < 50);
        }
    }

    #[test]
    fn random_string_has_requested_length() {
        assert_eq!(random_string(32).len(), 32);
    }
}
