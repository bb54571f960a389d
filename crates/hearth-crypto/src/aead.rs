//! Symmetric sealing shared by the ratchets and the DH fallback.
//!
//! Every ciphertext carries its nonce as a prefix:
//! - AES-256-GCM: `[12-byte nonce || ciphertext || 16-byte tag]`
//! - XChaCha20-Poly1305: `[24-byte nonce || ciphertext || 16-byte tag]`

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::CryptoError;

const AES_NONCE_LEN: usize = 12;
const XCHACHA_NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// Encrypt with AES-256-GCM under a fresh random nonce, authenticating `associated_data`.
pub fn aes_gcm_seal(
    key: &[u8; 32],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

    let mut nonce_bytes = [0u8; AES_NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

    let mut output = Vec::with_capacity(AES_NONCE_LEN + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn aes_gcm_open(
    key: &[u8; 32],
    data: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if data.len() < AES_NONCE_LEN + TAG_LEN {
        return Err(CryptoError::DecryptionError("data too short".into()));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;

    let (nonce_bytes, ciphertext) = data.split_at(AES_NONCE_LEN);
    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))
}

/// Encrypt with XChaCha20-Poly1305. Used for single-shot DH payloads.
pub fn xchacha_seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

    let mut nonce_bytes = [0u8; XCHACHA_NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

    let mut output = Vec::with_capacity(XCHACHA_NONCE_LEN + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn xchacha_open(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < XCHACHA_NONCE_LEN + TAG_LEN {
        return Err(CryptoError::DecryptionError("data too short".into()));
    }

    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;

    let (nonce_bytes, ciphertext) = data.split_at(XCHACHA_NONCE_LEN);
    cipher
        .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))
}

/// HKDF-SHA256 to a single 32-byte key.
pub(crate) fn hkdf_32(
    salt: Option<&[u8]>,
    ikm: &[u8],
    info: &[u8],
) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyGeneration(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// HKDF-SHA256 to a pair of 32-byte keys.
pub(crate) fn hkdf_64(
    salt: Option<&[u8]>,
    ikm: &[u8],
    info: &[u8],
) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; 64];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyGeneration(format!("HKDF expand failed: {e}")))?;

    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    Ok((first, second))
}
