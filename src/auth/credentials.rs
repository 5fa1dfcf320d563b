//! Password hashing and API key generation/verification.
//!
//! Passwords are salted and stretched with PBKDF2-HMAC-SHA256, an
//! iteration-hard function resistant to offline brute force.
//! API keys are 128-bit random values rendered as lowercase hex and
//! checked with a constant-time comparison to avoid timing side channels
//! on the stored value.

use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{NexaError, Result};

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;
const API_KEY_BYTES: usize = 16;

pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

pub fn hash_password(password: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut out = vec![0u8; HASH_LEN];
    pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, iterations, &mut out);
    out
}

pub fn verify_password(password: &str, salt: &[u8], iterations: u32, expected_hash: &[u8]) -> bool {
    let actual = hash_password(password, salt, iterations);
    actual.ct_eq(expected_hash).into()
}

/// Generates a fresh API key, rendered as lowercase hex.
pub fn generate_api_key() -> String {
    let mut key = vec![0u8; API_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut key);
    hex::encode(key)
}

pub fn verify_api_key(presented: &str, stored: &str) -> bool {
    if presented.len() != stored.len() {
        return false;
    }
    presented.as_bytes().ct_eq(stored.as_bytes()).into()
}

pub fn decode_api_key(s: &str) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|e| NexaError::InvalidMessage(format!("malformed api key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_password_accepts_correct_password() {
        let salt = generate_salt();
        let hash = hash_password("correct horse", &salt, 1000);
        assert!(verify_password("correct horse", &salt, 1000, &hash));
    }

    #[test]
    fn verify_password_rejects_wrong_password() {
        let salt = generate_salt();
        let hash = hash_password("correct horse", &salt, 1000);
        assert!(!verify_password("wrong", &salt, 1000, &hash));
    }

    #[test]
    fn generated_api_keys_are_32_lowercase_hex_chars() {
        let key = generate_api_key();
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn verify_api_key_is_exact() {
        let key = generate_api_key();
        assert!(verify_api_key(&key, &key));
        assert!(!verify_api_key("0000", &key));
    }
}
