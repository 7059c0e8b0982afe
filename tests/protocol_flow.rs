//! End-to-end exercise of the protocol core without a database
//!
//! Plays both sides of the wire protocol: the client's half of the
//! handshake, master-key agreement, challenge construction and signing,
//! brute-forcing the proof of work the way the widget does, the AEAD
//! round trips under directional sub-keys, and verification-token
//! issuance with replay tracking.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{Duration, Utc};
use uuid::Uuid;

use proofgate_api::services::challenge_engine::{self, ChallengeContext};
use proofgate_api::services::crypto::{self, KeyDirection};
use proofgate_api::services::puzzle::{
    validate_answer, BuiltinPuzzleProvider, PuzzleProvider, PuzzleType,
};
use proofgate_api::services::replay_guard::ReplayGuard;
use proofgate_api::services::session_cache::SessionCache;
use proofgate_api::services::tokens;

const SERVER_SECRET: &[u8] = b"test-session-secret-0123456789abcdef";
const API_SECRET: &[u8] = b"sk_demo_secret";

#[test]
fn handshake_agrees_on_master_key_and_transcript() {
    let cache = SessionCache::new(300, 3600);
    let server_pair = cache.current_server_keypair();

    // Client side of the exchange.
    let (client_secret, client_public) = crypto::generate_ecdh_keypair();

    // Server validates the client point and derives the session key.
    let client_pub = crypto::validate_client_public_key(&client_public).expect("client point");
    let server_shared = crypto::derive_shared_secret(&server_pair.secret, &client_pub);
    let server_nonce = crypto::random_string(32);
    let server_master =
        crypto::derive_master_key(&server_shared, &server_pair.public, &server_nonce)
            .expect("master");

    // Client derives the same master from its own half.
    let server_pub = crypto::validate_client_public_key(&server_pair.public).expect("server point");
    let client_shared = crypto::derive_shared_secret(&client_secret, &server_pub);
    let client_master =
        crypto::derive_master_key(&client_shared, &server_pair.public, &server_nonce)
            .expect("master");

    assert_eq!(server_master, client_master);

    // The transcript signature lets the client detect substituted keys.
    let timestamp = Utc::now().timestamp_millis();
    let server_pub_b64 = STANDARD.encode(&server_pair.public);
    let client_pub_b64 = STANDARD.encode(&client_public);
    let transcript = format!("{server_pub_b64}{client_pub_b64}{timestamp}");
    let signature = crypto::hmac_sha256(API_SECRET, transcript.as_bytes());

    let recomputed = crypto::hmac_sha256(API_SECRET, transcript.as_bytes());
    assert!(crypto::constant_time_eq(&signature, &recomputed));

    let tampered = format!("{server_pub_b64}{client_pub_b64}{}", timestamp + 1);
    let tampered_sig = crypto::hmac_sha256(API_SECRET, tampered.as_bytes());
    assert!(!crypto::constant_time_eq(&signature, &tampered_sig));
}

#[test]
fn challenge_solve_and_verify_round_trip() {
    // Server issues a difficulty-2 challenge bound to its context.
    let pow = challenge_engine::build_pow(2);
    let context = ChallengeContext {
        timestamp_ms: Utc::now().timestamp_millis(),
        nonce: crypto::random_string(32),
        api_public_ident: "pk_demo".to_string(),
        device_fingerprint_hash: "none".to_string(),
    };
    let signature = challenge_engine::sign_challenge(SERVER_SECRET, &pow, &context);

    // The widget brute-forces the preimage from the public parameters.
    let solution = (0..pow.max_number)
        .find(|n| challenge_engine::verify_pow_solution(&pow, *n))
        .expect("search space contains the preimage");
    assert_eq!(solution, pow.secret_number);

    // Verification re-checks signature and preimage; neither alone passes.
    assert!(challenge_engine::verify_challenge_signature(
        SERVER_SECRET,
        &pow,
        &context,
        &signature
    ));
    let mut foreign = context.clone();
    foreign.api_public_ident = "pk_other".to_string();
    assert!(!challenge_engine::verify_challenge_signature(
        SERVER_SECRET,
        &pow,
        &foreign,
        &signature
    ));
}

#[test]
fn directional_keys_isolate_payload_legs() {
    let master = [42u8; 32];
    let challenge_id = Uuid::new_v4().to_string();
    let token = "signed-token-aad";

    // Server -> client challenge payload.
    let enc_key = crypto::derive_challenge_key(&master, &challenge_id, KeyDirection::Encrypt)
        .expect("derive");
    let (iv, ct, tag) =
        crypto::aes_gcm_encrypt(&enc_key, br#"{"salt":"s"}"#, token.as_bytes()).expect("encrypt");

    // The client decrypts with the same directional key.
    let plain =
        crypto::aes_gcm_decrypt(&enc_key, &iv, &ct, &tag, token.as_bytes()).expect("decrypt");
    assert_eq!(plain, br#"{"salt":"s"}"#);

    // Replaying the server payload as a solution fails: the solution leg
    // uses a different sub-key.
    let dec_key = crypto::derive_challenge_key(&master, &challenge_id, KeyDirection::Decrypt)
        .expect("derive");
    assert!(crypto::aes_gcm_decrypt(&dec_key, &iv, &ct, &tag, token.as_bytes()).is_err());

    // Binding to another challenge's token also fails.
    assert!(crypto::aes_gcm_decrypt(&enc_key, &iv, &ct, &tag, b"other-token").is_err());
}

#[test]
fn client_solves_encrypted_grid_challenge() {
    let provider = BuiltinPuzzleProvider;
    let puzzle = provider.generate(PuzzleType::Grid, 4);
    let master = [7u8; 32];
    let challenge_id = Uuid::new_v4().to_string();
    let token = "token-grid";

    // Client encrypts its answer under the solution-direction key.
    let key = crypto::derive_challenge_key(&master, &challenge_id, KeyDirection::Decrypt)
        .expect("derive");
    let answer_bytes = serde_json::to_vec(&puzzle.answer).expect("encode");
    let (iv, ct, tag) =
        crypto::aes_gcm_encrypt(&key, &answer_bytes, token.as_bytes()).expect("encrypt");

    // Server decrypts and validates.
    let plain = crypto::aes_gcm_decrypt(&key, &iv, &ct, &tag, token.as_bytes()).expect("decrypt");
    let submitted: serde_json::Value = serde_json::from_slice(&plain).expect("decode");
    assert!(validate_answer(PuzzleType::Grid, &puzzle.answer, &submitted));
}

#[test]
fn verification_token_single_use_at_site_verify() {
    let challenge_id = Uuid::new_v4();
    let expires = Utc::now() + Duration::minutes(5);
    let (token, _) = tokens::create_verification_token(
        API_SECRET,
        challenge_id,
        "example.com",
        "none",
        expires,
    )
    .expect("sign");

    let claims = tokens::decode_verification_token(API_SECRET, &token).expect("decode");
    assert_eq!(claims.challenge_id, challenge_id);
    assert_eq!(claims.domain, "example.com");

    // First exchange succeeds, the second is a replay.
    let guard = ReplayGuard::new();
    assert!(guard.mark_used(claims.challenge_id, &claims.nonce));
    assert!(!guard.mark_used(claims.challenge_id, &claims.nonce));

    // A token for the same challenge with a fresh nonce is independent.
    let (token2, _) = tokens::create_verification_token(
        API_SECRET,
        challenge_id,
        "example.com",
        "none",
        expires,
    )
    .expect("sign");
    let claims2 = tokens::decode_verification_token(API_SECRET, &token2).expect("decode");
    assert!(guard.mark_used(claims2.challenge_id, &claims2.nonce));
}

#[test]
fn session_lifecycle_survives_ip_churn_but_not_expiry() {
    let cache = SessionCache::new(1, 3600);
    let server_pair = cache.current_server_keypair();
    let (_, client_public) = crypto::generate_ecdh_keypair();
    let now = Utc::now();

    cache.store_session(proofgate_api::services::SessionKey {
        master_key: [9u8; 32],
        server_public_key: server_pair.public.clone(),
        client_public_key: client_public,
        server_nonce: "nonce".to_string(),
        api_public_ident: "pk_demo".to_string(),
        client_ip: "203.0.113.1".to_string(),
        device_fingerprint_id: "fp-1".to_string(),
        created_at: now,
        expires_at: now + Duration::seconds(1),
    });

    // Lookup from a different IP still resolves the session.
    assert!(cache.get_session("pk_demo", "198.51.100.9", "fp-1").is_some());

    // But an expired session is gone.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    assert!(cache.get_session("pk_demo", "203.0.113.1", "fp-1").is_none());
}
