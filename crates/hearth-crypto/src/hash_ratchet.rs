use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::ZeroizeOnDrop;

use crate::aead;
use crate::error::CryptoError;

/// Sequence number reserved for key-exchange payloads. Real messages start at 1.
pub const KEY_EXCHANGE_SEQ_NO: u32 = 0;

/// One generation of a community's symmetric hash chain.
///
/// Position 0 is the random seed, position `n` is SHA-256 applied `n` times.
/// Derivation only moves forward, so holding the key at position `n` reveals
/// nothing about earlier positions.
#[derive(Clone, ZeroizeOnDrop)]
pub struct HashChainKey {
    key: [u8; 32],
}

impl HashChainKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Advance `steps` positions along the chain.
    pub fn advance(&self, steps: u32) -> Self {
        let mut key = self.key;
        for _ in 0..steps {
            key = Sha256::digest(key).into();
        }
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        aead::aes_gcm_seal(&self.key, plaintext, &[])
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        aead::aes_gcm_open(&self.key, ciphertext, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_composes() {
        let seed = HashChainKey::generate();
        let direct = seed.advance(5);
        let stepped = seed.advance(2).advance(3);
        assert_eq!(direct.as_bytes(), stepped.as_bytes());
    }

    #[test]
    fn advance_zero_is_identity() {
        let seed = HashChainKey::from_bytes([9u8; 32]);
        assert_eq!(seed.advance(0).as_bytes(), &[9u8; 32]);
    }

    #[test]
    fn positions_do_not_share_keys() {
        let seed = HashChainKey::generate();
        let first = seed.advance(1);
        let ciphertext = first.encrypt(b"hi").unwrap();
        assert!(seed.advance(2).decrypt(&ciphertext).is_err());
        assert_eq!(first.decrypt(&ciphertext).unwrap(), b"hi");
    }
}
