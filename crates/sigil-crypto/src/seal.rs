//! Sealing: sign, then encrypt.
//!
//! Wire layout of a sealed message:
//!
//! ```text
//! ┌──────────┬────────────────────────────────────────────┐
//! │ nonce 12 │ ChaCha20-Poly1305( signature 64 ‖ body )   │
//! └──────────┴────────────────────────────────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SIGNATURE_LENGTH};
use rand::RngCore;
use sigil_core::{CryptoError, DecryptionError};

/// Nonce length in bytes.
pub const NONCE_LENGTH: usize = 12;

/// A 256-bit symmetric key.
pub type SealKey = [u8; 32];

fn cipher(key: &SealKey) -> Result<ChaCha20Poly1305, CryptoError> {
    ChaCha20Poly1305::new_from_slice(key).map_err(|e| CryptoError::Key(e.to_string()))
}

/// Generate a random symmetric key.
pub fn generate_key() -> SealKey {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Sign `plaintext` and encrypt signature and plaintext under `key`.
pub fn seal(signing: &SigningKey, key: &SealKey, plaintext: &[u8]) -> Result<Bytes, CryptoError> {
    let signature = signing.sign(plaintext);

    let mut signed = Vec::with_capacity(SIGNATURE_LENGTH + plaintext.len());
    signed.extend_from_slice(&signature.to_bytes());
    signed.extend_from_slice(plaintext);

    let mut nonce = [0u8; NONCE_LENGTH];
    rand::thread_rng().fill_bytes(&mut nonce);

    let encrypted = cipher(key)?
        .encrypt(Nonce::from_slice(&nonce), signed.as_slice())
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

    let mut out = BytesMut::with_capacity(NONCE_LENGTH + encrypted.len());
    out.put_slice(&nonce);
    out.put_slice(&encrypted);
    Ok(out.freeze())
}

/// Outcome of [`open`].
#[derive(Debug, PartialEq, Eq)]
pub enum Opened {
    /// Authentic plaintext.
    Plaintext(Vec<u8>),
    /// The message was refused.
    Refused(DecryptionError),
}

/// Decrypt `sealed` under `key` and check the signature against `verifying`.
pub fn open(verifying: &VerifyingKey, key: &SealKey, sealed: &[u8]) -> Result<Opened, CryptoError> {
    if sealed.len() < NONCE_LENGTH {
        return Ok(Opened::Refused(DecryptionError::InvalidEncryption));
    }
    let (nonce, encrypted) = sealed.split_at(NONCE_LENGTH);

    let Ok(signed) = cipher(key)?.decrypt(Nonce::from_slice(nonce), encrypted) else {
        return Ok(Opened::Refused(DecryptionError::InvalidEncryption));
    };
    if signed.len() < SIGNATURE_LENGTH {
        return Ok(Opened::Refused(DecryptionError::InvalidEncryption));
    }

    let (signature, plaintext) = signed.split_at(SIGNATURE_LENGTH);
    let Ok(signature) = Signature::from_slice(signature) else {
        return Ok(Opened::Refused(DecryptionError::InvalidSignature));
    };
    if verifying.verify(plaintext, &signature).is_err() {
        return Ok(Opened::Refused(DecryptionError::InvalidSignature));
    }

    Ok(Opened::Plaintext(plaintext.to_vec()))
}
