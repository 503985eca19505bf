//! Challenge/response login verification.
//!
//! The broker never sees a password: the client proves possession of the
//! account secret by signing a single-use random challenge with
//! HMAC-SHA256.

use arbor_core::KEY_SIZE;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Generate a fresh random challenge.
#[must_use]
pub fn challenge() -> [u8; KEY_SIZE] {
    let mut nonce = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Compute `HMAC-SHA256(challenge, secret)`; used by clients and tests.
#[must_use]
pub fn sign(challenge: &[u8; KEY_SIZE], secret: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(challenge);
    let mut signature = [0u8; KEY_SIZE];
    signature.copy_from_slice(&mac.finalize().into_bytes());
    signature
}

/// Verify a signature in constant time.
#[must_use]
pub fn verify(challenge: &[u8; KEY_SIZE], secret: &[u8; KEY_SIZE], signature: &[u8; KEY_SIZE]) -> bool {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(challenge);
    mac.verify_slice(signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips() {
        let secret = [7u8; KEY_SIZE];
        let nonce = challenge();
        let signature = sign(&nonce, &secret);
        assert!(verify(&nonce, &secret, &signature));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let nonce = challenge();
        let signature = sign(&nonce, &[7u8; KEY_SIZE]);
        assert!(!verify(&nonce, &[8u8; KEY_SIZE], &signature));
    }

    #[test]
    fn challenges_are_single_use_material() {
        // Two challenges colliding would let a replayed signature pass; the
        // nonce space makes that effectively impossible.
        assert_ne!(challenge(), challenge());
    }
}
