use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aead;
use crate::error::CryptoError;

const ROOT_INFO: &[u8] = b"hearth-ratchet-root";
const MESSAGE_KEY_INFO: &[u8] = b"hearth-ratchet-message-key";
const CHAIN_KEY_INFO: &[u8] = b"hearth-ratchet-chain-key";

/// An X25519 ratchet key pair.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct DhKeyPair {
    secret: [u8; 32],
    #[zeroize(skip)]
    public: [u8; 32],
}

impl DhKeyPair {
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let public = PublicKey::from(&StaticSecret::from(secret)).to_bytes();
        Self { secret, public }
    }

    pub fn public(&self) -> &[u8; 32] {
        &self.public
    }

    pub(crate) fn secret(&self) -> &[u8; 32] {
        &self.secret
    }
}

/// Key agreement, key derivation and AEAD used by a ratchet session.
pub trait RatchetCrypto: Send + Sync {
    fn generate_dh(&self) -> DhKeyPair;

    fn dh(&self, pair: &DhKeyPair, their_public: &[u8; 32]) -> [u8; 32];

    /// Root KDF step: returns `(new root key, new chain key)`.
    fn kdf_rk(
        &self,
        root_key: &[u8; 32],
        dh_output: &[u8; 32],
    ) -> Result<([u8; 32], [u8; 32]), CryptoError>;

    /// Chain KDF step: returns `(next chain key, message key)`.
    fn kdf_ck(&self, chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError>;

    /// Chain key both parties start from before the first DH ratchet.
    fn initial_chain_key(&self, shared_key: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
        Ok(self.kdf_rk(shared_key, &[0u8; 32])?.1)
    }

    fn encrypt(
        &self,
        message_key: &[u8; 32],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(
        &self,
        message_key: &[u8; 32],
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// X25519, HKDF-SHA256 and AES-256-GCM.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRatchetCrypto;

impl RatchetCrypto for DefaultRatchetCrypto {
    fn generate_dh(&self) -> DhKeyPair {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        DhKeyPair::from_secret(secret.to_bytes())
    }

    fn dh(&self, pair: &DhKeyPair, their_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(*pair.secret());
        secret
            .diffie_hellman(&PublicKey::from(*their_public))
            .to_bytes()
    }

    fn kdf_rk(
        &self,
        root_key: &[u8; 32],
        dh_output: &[u8; 32],
    ) -> Result<([u8; 32], [u8; 32]), CryptoError> {
        aead::hkdf_64(Some(root_key), dh_output, ROOT_INFO)
    }

    fn kdf_ck(&self, chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
        let message_key = aead::hkdf_32(None, chain_key, MESSAGE_KEY_INFO)?;
        let next_chain_key = aead::hkdf_32(None, chain_key, CHAIN_KEY_INFO)?;
        Ok((next_chain_key, message_key))
    }

    fn encrypt(
        &self,
        message_key: &[u8; 32],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        aead::aes_gcm_seal(message_key, plaintext, associated_data)
    }

    fn decrypt(
        &self,
        message_key: &[u8; 32],
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        aead::aes_gcm_open(message_key, ciphertext, associated_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_is_symmetric() {
        let crypto = DefaultRatchetCrypto;
        let a = crypto.generate_dh();
        let b = crypto.generate_dh();
        assert_eq!(crypto.dh(&a, b.public()), crypto.dh(&b, a.public()));
    }

    #[test]
    fn chain_step_separates_message_and_chain_keys() {
        let crypto = DefaultRatchetCrypto;
        let (next, message_key) = crypto.kdf_ck(&[5u8; 32]).unwrap();
        assert_ne!(next, message_key);

        let (after, _) = crypto.kdf_ck(&next).unwrap();
        assert_ne!(after, next);
    }

    #[test]
    fn from_secret_matches_generated_public() {
        let crypto = DefaultRatchetCrypto;
        let pair = crypto.generate_dh();
        let restored = DhKeyPair::from_secret(*pair.secret());
        assert_eq!(restored.public(), pair.public());
    }
}
