//! Community hash ratchet.
//!
//! A group holds a list of key generations identified by millisecond key ids.
//! Messages are encrypted under the newest generation at an increasing
//! sequence number; receivers derive forward from the closest cached
//! position.

use std::sync::Arc;

use hearth_crypto::hash_ratchet::{HashChainKey, KEY_EXCHANGE_SEQ_NO};

use crate::bundle::to_key;
use crate::error::ProtocolError;
use crate::message::{HrKey, HrKeys};
use crate::store::{HashRatchetKey, HashRatchetStore};

/// Output of [`HashRatchet::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRatchetCiphertext {
    pub ciphertext: Vec<u8>,
    pub key_id: u64,
    pub seq_no: u32,
}

/// Key generations a received message made available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRatchetInfo {
    pub group_id: Vec<u8>,
    pub key_ids: Vec<u64>,
}

pub struct HashRatchet<S: ?Sized> {
    store: Arc<S>,
    max_skip: u32,
    key_id_bump: u64,
}

fn unavailable(group_id: &[u8], key_id: u64) -> ProtocolError {
    ProtocolError::KeyGenerationUnavailable {
        group_id: hex::encode(group_id),
        key_id,
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

impl<S: HashRatchetStore + ?Sized> HashRatchet<S> {
    pub fn new(store: Arc<S>, max_skip: u32, key_id_bump: u64) -> Self {
        Self {
            store,
            max_skip,
            key_id_bump,
        }
    }

    /// Create a new key generation for `group_id` and make it current.
    pub fn generate_key(&self, group_id: &[u8]) -> Result<u64, ProtocolError> {
        let now = now_millis();
        let key_id = match self.store.current_hash_ratchet_key(group_id)? {
            Some(current) if now <= current.key_id => {
                current.key_id.saturating_add(self.key_id_bump)
            }
            _ => now,
        };

        let key = HashChainKey::generate();
        if !self
            .store
            .add_hash_ratchet_key(group_id, key_id, key.as_bytes())?
        {
            return Err(ProtocolError::Crypto(format!(
                "hash ratchet key id {key_id} already in use"
            )));
        }
        tracing::info!(group_id = %hex::encode(group_id), key_id, "generated hash ratchet key");
        Ok(key_id)
    }

    pub fn encrypt(
        &self,
        group_id: &[u8],
        plaintext: &[u8],
    ) -> Result<HashRatchetCiphertext, ProtocolError> {
        let current = self
            .store
            .current_hash_ratchet_key(group_id)?
            .ok_or_else(|| unavailable(group_id, 0))?;
        let seq_no = current
            .seq_no
            .checked_add(1)
            .ok_or_else(|| ProtocolError::Crypto("hash ratchet sequence exhausted".into()))?;

        let key = self.derive(group_id, &current, seq_no)?;
        let ciphertext = key.encrypt(plaintext)?;
        self.store
            .set_hash_ratchet_seq_no(group_id, current.key_id, seq_no)?;

        Ok(HashRatchetCiphertext {
            ciphertext,
            key_id: current.key_id,
            seq_no,
        })
    }

    pub fn decrypt(
        &self,
        group_id: &[u8],
        key_id: u64,
        seq_no: u32,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        if seq_no == KEY_EXCHANGE_SEQ_NO {
            return Err(ProtocolError::MalformedMessage(
                "sequence number 0 is reserved for key exchange".into(),
            ));
        }
        let generation = self
            .store
            .hash_ratchet_key(group_id, key_id)?
            .ok_or_else(|| unavailable(group_id, key_id))?;

        let key = self.derive(group_id, &generation, seq_no)?;
        Ok(key.decrypt(ciphertext)?)
    }

    /// Chain position `seq_no` of `generation`, caching every position derived on the way.
    fn derive(
        &self,
        group_id: &[u8],
        generation: &HashRatchetKey,
        seq_no: u32,
    ) -> Result<HashChainKey, ProtocolError> {
        let (mut position, mut key) = match self
            .store
            .nearest_cached_hash(group_id, generation.key_id, seq_no)?
        {
            Some((cached_seq, hash)) => (cached_seq, HashChainKey::from_bytes(hash)),
            None => (0, HashChainKey::from_bytes(generation.key)),
        };

        let steps = seq_no - position;
        if steps > self.max_skip {
            tracing::warn!(
                group_id = %hex::encode(group_id),
                key_id = generation.key_id,
                seq_no,
                steps,
                "hash ratchet derivation exceeds skip limit"
            );
            return Err(ProtocolError::SkipLimitExceeded);
        }

        while position < seq_no {
            key = key.advance(1);
            position += 1;
            self.store
                .cache_hash(group_id, generation.key_id, position, key.as_bytes())?;
        }
        Ok(key)
    }

    pub fn drop_key(&self, group_id: &[u8], key_id: u64) -> Result<(), ProtocolError> {
        self.store.delete_hash_ratchet_key(group_id, key_id)
    }

    pub fn key_ids(&self, group_id: &[u8]) -> Result<Vec<u64>, ProtocolError> {
        self.store.hash_ratchet_key_ids(group_id)
    }

    /// Encode the requested generations for a key-exchange payload.
    /// Generations we do not hold are left out.
    pub fn encoded_keys(&self, group_id: &[u8], key_ids: &[u64]) -> Result<Vec<u8>, ProtocolError> {
        let mut keys = Vec::with_capacity(key_ids.len());
        for &key_id in key_ids {
            if let Some(generation) = self.store.hash_ratchet_key(group_id, key_id)? {
                keys.push(HrKey {
                    key_id,
                    key: generation.key.to_vec(),
                });
            }
        }
        Ok(serde_json::to_vec(&HrKeys { keys })?)
    }

    /// Store the generations of a key-exchange payload. Returns the key ids
    /// that were new to us.
    pub fn handle_keys(&self, group_id: &[u8], encoded: &[u8]) -> Result<Vec<u64>, ProtocolError> {
        let HrKeys { keys } = serde_json::from_slice(encoded)
            .map_err(|e| ProtocolError::MalformedMessage(format!("hash ratchet keys: {e}")))?;

        let mut added = Vec::new();
        for HrKey { key_id, key } in keys {
            let key = to_key(&key, "hash ratchet key")?;
            if self.store.add_hash_ratchet_key(group_id, key_id, &key)? {
                added.push(key_id);
            }
        }
        if !added.is_empty() {
            tracing::debug!(group_id = %hex::encode(group_id), keys = added.len(), "received hash ratchet keys");
        }
        Ok(added)
    }
}
