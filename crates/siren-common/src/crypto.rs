//! Cryptographic primitives for the Siren protocol.
//!
//! Payload confidentiality uses an authenticated public-key sealed box
//! (X25519 + XSalsa20-Poly1305, the NaCl `box` construction) between two
//! long-lived keypairs. Each seal draws a fresh random 24-byte nonce which is
//! transmitted as the first 24 bytes of the sealed output, so a given
//! ciphertext is self-contained: `nonce ‖ ciphertext`.
//!
//! User identity signing uses Ed25519.

use crate::types::Pubkey;
use crypto_box::aead::{Aead, AeadCore};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

/// Length of a Curve25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Length of a Curve25519 secret key in bytes.
pub const SECRET_KEY_LEN: usize = 32;
/// Length of the sealed-box nonce in bytes.
pub const NONCE_LEN: usize = 24;
/// Poly1305 authentication tag overhead in bytes.
pub const SEAL_OVERHEAD: usize = 16;
/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Errors that can occur during sealing or opening.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("failed to seal payload")]
    SealFailed,
    /// The sealed input is shorter than a nonce plus authentication tag.
    #[error("sealed payload too short: {0} bytes")]
    SealedTooShort(usize),
    /// Decryption or authentication failed.
    #[error("failed to open sealed payload")]
    OpenFailed,
    /// A signing public key was not a valid Ed25519 point.
    #[error("invalid signing public key")]
    BadSigningKey,
}

/// Generates a fresh Curve25519 keypair for payload encryption.
#[must_use]
pub fn generate_keypair() -> (Pubkey, [u8; SECRET_KEY_LEN]) {
    let secret = SecretKey::generate(&mut OsRng);
    let public = secret.public_key();
    (*public.as_bytes(), secret.to_bytes())
}

/// Derives the public key for a stored secret key.
#[must_use]
pub fn public_key_of(secret: &[u8; SECRET_KEY_LEN]) -> Pubkey {
    *SecretKey::from(*secret).public_key().as_bytes()
}

/// Seals a plaintext from `own_secret` to `peer_public`.
///
/// Returns `nonce ‖ ciphertext`; the nonce is freshly random per call.
///
/// # Errors
///
/// Returns [`CryptoError::SealFailed`] if encryption fails.
pub fn seal(
    peer_public: &Pubkey,
    own_secret: &[u8; SECRET_KEY_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let sbox = SalsaBox::new(&PublicKey::from(*peer_public), &SecretKey::from(*own_secret));
    let nonce = SalsaBox::generate_nonce(&mut OsRng);
    let ciphertext = sbox
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::SealFailed)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Opens a sealed payload produced by the peer's [`seal`].
///
/// # Errors
///
/// Returns [`CryptoError::SealedTooShort`] if the input cannot contain a
/// nonce and tag, or [`CryptoError::OpenFailed`] if authentication fails.
pub fn open(
    peer_public: &Pubkey,
    own_secret: &[u8; SECRET_KEY_LEN],
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN + SEAL_OVERHEAD {
        return Err(CryptoError::SealedTooShort(sealed.len()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let sbox = SalsaBox::new(&PublicKey::from(*peer_public), &SecretKey::from(*own_secret));
    sbox.decrypt(crypto_box::Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::OpenFailed)
}

/// Generates a fresh Ed25519 signing keypair for user identities.
#[must_use]
pub fn generate_signing_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Signs a message, returning the raw 64-byte signature.
#[must_use]
pub fn sign(key: &SigningKey, message: &[u8]) -> [u8; SIGNATURE_LEN] {
    key.sign(message).to_bytes()
}

/// Verifies a signature against a raw 32-byte Ed25519 public key.
///
/// # Errors
///
/// Returns [`CryptoError::BadSigningKey`] if the public key is not a valid
/// Ed25519 point.
pub fn verify(
    public_key: &[u8; 32],
    message: &[u8],
    signature: &[u8; SIGNATURE_LEN],
) -> Result<bool, CryptoError> {
    let key = VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::BadSigningKey)?;
    let sig = Signature::from_bytes(signature);
    Ok(key.verify(message, &sig).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open_round_trip() {
        let (alice_pub, alice_sec) = generate_keypair();
        let (bob_pub, bob_sec) = generate_keypair();

        let sealed = seal(&bob_pub, &alice_sec, b"hello siren").unwrap();
        let opened = open(&alice_pub, &bob_sec, &sealed).unwrap();
        assert_eq!(opened, b"hello siren");
    }

    #[test]
    fn sealed_length_is_nonce_plus_overhead() {
        let (_, alice_sec) = generate_keypair();
        let (bob_pub, _) = generate_keypair();
        let sealed = seal(&bob_pub, &alice_sec, b"1234").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 4 + SEAL_OVERHEAD);
    }

    #[test]
    fn nonces_are_fresh_per_seal() {
        let (_, alice_sec) = generate_keypair();
        let (bob_pub, _) = generate_keypair();
        let a = seal(&bob_pub, &alice_sec, b"same message").unwrap();
        let b = seal(&bob_pub, &alice_sec, b"same message").unwrap();
        assert_ne!(&a[..NONCE_LEN], &b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let (alice_pub, alice_sec) = generate_keypair();
        let (bob_pub, _) = generate_keypair();
        let (_, eve_sec) = generate_keypair();

        let sealed = seal(&bob_pub, &alice_sec, b"secret").unwrap();
        assert_eq!(
            open(&alice_pub, &eve_sec, &sealed),
            Err(CryptoError::OpenFailed)
        );
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let (alice_pub, alice_sec) = generate_keypair();
        let (bob_pub, bob_sec) = generate_keypair();

        let mut sealed = seal(&bob_pub, &alice_sec, b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert_eq!(
            open(&alice_pub, &bob_sec, &sealed),
            Err(CryptoError::OpenFailed)
        );
    }

    #[test]
    fn short_input_fails_to_open() {
        let (alice_pub, _) = generate_keypair();
        let (_, bob_sec) = generate_keypair();
        assert_eq!(
            open(&alice_pub, &bob_sec, &[0u8; 10]),
            Err(CryptoError::SealedTooShort(10))
        );
    }

    #[test]
    fn public_key_of_matches_generate() {
        let (public, secret) = generate_keypair();
        assert_eq!(public_key_of(&secret), public);
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let key = generate_signing_keypair();
        let sig = sign(&key, b"identity claim");
        let public = key.verifying_key().to_bytes();
        assert!(verify(&public, b"identity claim", &sig).unwrap());
        assert!(!verify(&public, b"different claim", &sig).unwrap());
    }

    #[test]
    fn verify_rejects_garbage_public_key() {
        let key = generate_signing_keypair();
        let sig = sign(&key, b"msg");
        // Not all 32-byte strings decode as Ed25519 points.
        let result = verify(&[0xFF; 32], b"msg", &sig);
        if let Ok(valid) = result {
            assert!(!valid);
        }
    }
}
