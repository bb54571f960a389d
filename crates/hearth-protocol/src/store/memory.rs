//! In-memory `KeyStore`.
//!
//! Suitable for tests and for clients that keep no history across restarts.
//! Data is lost on process exit.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use hearth_crypto::ratchet::{Retention, StoredMessageKey};
use hearth_crypto::{CryptoError, MemoryRatchetStore, RatchetState, RatchetStore};
use parking_lot::Mutex;

use super::{
    BundleStore, HashRatchetKey, HashRatchetStore, InstallationStore, RatchetInfo,
    RatchetInfoStore, SharedSecretStore, StoredPreKey, StoredSecret,
};
use crate::error::ProtocolError;
use crate::multidevice::{Installation, InstallationMetadata};

#[derive(Default)]
struct Inner {
    /// Signed pre-keys with their expired flag, in insertion order.
    pre_keys: Vec<(StoredPreKey, bool)>,
    /// Ratchet infos in insertion order.
    ratchet_infos: Vec<RatchetInfo>,
    installations: HashMap<Vec<u8>, BTreeMap<String, Installation>>,
    metadata: HashMap<(Vec<u8>, String), InstallationMetadata>,
    secrets: BTreeMap<Vec<u8>, StoredSecret>,
    hash_ratchet_keys: BTreeMap<(Vec<u8>, u64), HashRatchetKey>,
    hash_cache: BTreeMap<(Vec<u8>, u64, u32), [u8; 32]>,
}

#[derive(Default)]
pub struct MemoryKeyStore {
    inner: Mutex<Inner>,
    ratchets: MemoryRatchetStore,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BundleStore for MemoryKeyStore {
    fn add_signed_pre_key(&self, entry: &StoredPreKey) -> Result<bool, ProtocolError> {
        let mut inner = self.inner.lock();
        let same_installation = |e: &StoredPreKey| {
            e.identity == entry.identity && e.installation_id == entry.installation_id
        };

        let superseded = inner.pre_keys.iter().any(|(e, _)| {
            e.signed_pre_key == entry.signed_pre_key
                || (same_installation(e) && e.version >= entry.version)
        });
        if superseded {
            return Ok(false);
        }

        for (existing, expired) in &mut inner.pre_keys {
            if same_installation(&*existing) {
                *expired = true;
            }
        }
        inner.pre_keys.push((entry.clone(), false));
        Ok(true)
    }

    fn latest_signed_pre_key(
        &self,
        identity: &[u8],
        installation_id: &str,
    ) -> Result<Option<StoredPreKey>, ProtocolError> {
        let inner = self.inner.lock();
        Ok(inner
            .pre_keys
            .iter()
            .filter(|(e, expired)| {
                !expired && e.identity == identity && e.installation_id == installation_id
            })
            .max_by_key(|(e, _)| e.version)
            .map(|(e, _)| e.clone()))
    }

    fn private_key_for_signed_pre_key(
        &self,
        signed_pre_key: &[u8],
    ) -> Result<Option<[u8; 32]>, ProtocolError> {
        let inner = self.inner.lock();
        Ok(inner
            .pre_keys
            .iter()
            .find(|(e, _)| e.signed_pre_key == signed_pre_key)
            .and_then(|(e, _)| e.private_key))
    }
}

impl RatchetInfoStore for MemoryKeyStore {
    fn add_ratchet_info(&self, info: &RatchetInfo) -> Result<(), ProtocolError> {
        let mut inner = self.inner.lock();
        if !inner.ratchet_infos.iter().any(|i| i.id == info.id) {
            inner.ratchet_infos.push(info.clone());
        }
        Ok(())
    }

    fn replace_ratchet_info(&self, info: &RatchetInfo) -> Result<(), ProtocolError> {
        let mut inner = self.inner.lock();
        inner.ratchet_infos.retain(|i| i.id != info.id);
        inner.ratchet_infos.push(info.clone());
        Ok(())
    }

    fn ratchet_info(
        &self,
        bundle_id: &[u8],
        identity: &[u8],
        installation_id: &str,
    ) -> Result<Option<RatchetInfo>, ProtocolError> {
        let id = RatchetInfo::session_id(bundle_id, identity, installation_id);
        let inner = self.inner.lock();
        Ok(inner.ratchet_infos.iter().find(|i| i.id == id).cloned())
    }

    fn latest_ratchet_info(
        &self,
        identity: &[u8],
        installation_id: &str,
    ) -> Result<Option<RatchetInfo>, ProtocolError> {
        let inner = self.inner.lock();
        Ok(inner
            .ratchet_infos
            .iter()
            .rev()
            .find(|i| i.identity == identity && i.installation_id == installation_id)
            .cloned())
    }

    fn confirm_ratchet_info(
        &self,
        bundle_id: &[u8],
        identity: &[u8],
        installation_id: &str,
    ) -> Result<(), ProtocolError> {
        let id = RatchetInfo::session_id(bundle_id, identity, installation_id);
        let mut inner = self.inner.lock();
        if let Some(info) = inner.ratchet_infos.iter_mut().find(|i| i.id == id) {
            info.ephemeral_key = None;
        }
        Ok(())
    }
}

impl InstallationStore for MemoryKeyStore {
    fn installations(&self, identity: &[u8]) -> Result<Vec<Installation>, ProtocolError> {
        let inner = self.inner.lock();
        Ok(inner
            .installations
            .get(identity)
            .map(|all| all.values().cloned().collect())
            .unwrap_or_default())
    }

    fn upsert_installation(
        &self,
        identity: &[u8],
        installation: &Installation,
    ) -> Result<(), ProtocolError> {
        self.inner
            .lock()
            .installations
            .entry(identity.to_vec())
            .or_default()
            .insert(installation.id.clone(), installation.clone());
        Ok(())
    }

    fn set_installation_enabled(
        &self,
        identity: &[u8],
        installation_id: &str,
        enabled: bool,
    ) -> Result<(), ProtocolError> {
        let mut inner = self.inner.lock();
        if let Some(installation) = inner
            .installations
            .get_mut(identity)
            .and_then(|all| all.get_mut(installation_id))
        {
            installation.enabled = enabled;
        }
        Ok(())
    }

    fn set_installation_metadata(
        &self,
        identity: &[u8],
        installation_id: &str,
        metadata: &InstallationMetadata,
    ) -> Result<(), ProtocolError> {
        self.inner.lock().metadata.insert(
            (identity.to_vec(), installation_id.to_string()),
            metadata.clone(),
        );
        Ok(())
    }

    fn installation_metadata(
        &self,
        identity: &[u8],
        installation_id: &str,
    ) -> Result<Option<InstallationMetadata>, ProtocolError> {
        Ok(self
            .inner
            .lock()
            .metadata
            .get(&(identity.to_vec(), installation_id.to_string()))
            .cloned())
    }
}

impl SharedSecretStore for MemoryKeyStore {
    fn add_shared_secret(
        &self,
        identity: &[u8],
        secret: &[u8; 32],
        installation_id: &str,
    ) -> Result<(), ProtocolError> {
        let mut inner = self.inner.lock();
        let stored = inner
            .secrets
            .entry(identity.to_vec())
            .or_insert_with(|| StoredSecret {
                identity: identity.to_vec(),
                secret: *secret,
                installation_ids: BTreeSet::new(),
            });
        stored.installation_ids.insert(installation_id.to_string());
        Ok(())
    }

    fn shared_secret(&self, identity: &[u8]) -> Result<Option<StoredSecret>, ProtocolError> {
        Ok(self.inner.lock().secrets.get(identity).cloned())
    }

    fn all_shared_secrets(&self) -> Result<Vec<StoredSecret>, ProtocolError> {
        Ok(self.inner.lock().secrets.values().cloned().collect())
    }
}

impl HashRatchetStore for MemoryKeyStore {
    fn add_hash_ratchet_key(
        &self,
        group_id: &[u8],
        key_id: u64,
        key: &[u8; 32],
    ) -> Result<bool, ProtocolError> {
        let mut inner = self.inner.lock();
        let slot = (group_id.to_vec(), key_id);
        if inner.hash_ratchet_keys.contains_key(&slot) {
            return Ok(false);
        }
        inner.hash_ratchet_keys.insert(
            slot,
            HashRatchetKey {
                group_id: group_id.to_vec(),
                key_id,
                key: *key,
                seq_no: 0,
            },
        );
        Ok(true)
    }

    fn hash_ratchet_key(
        &self,
        group_id: &[u8],
        key_id: u64,
    ) -> Result<Option<HashRatchetKey>, ProtocolError> {
        Ok(self
            .inner
            .lock()
            .hash_ratchet_keys
            .get(&(group_id.to_vec(), key_id))
            .cloned())
    }

    fn current_hash_ratchet_key(
        &self,
        group_id: &[u8],
    ) -> Result<Option<HashRatchetKey>, ProtocolError> {
        let inner = self.inner.lock();
        Ok(inner
            .hash_ratchet_keys
            .range((group_id.to_vec(), 0)..=(group_id.to_vec(), u64::MAX))
            .next_back()
            .map(|(_, key)| key.clone()))
    }

    fn hash_ratchet_key_ids(&self, group_id: &[u8]) -> Result<Vec<u64>, ProtocolError> {
        let inner = self.inner.lock();
        Ok(inner
            .hash_ratchet_keys
            .range((group_id.to_vec(), 0)..=(group_id.to_vec(), u64::MAX))
            .map(|((_, key_id), _)| *key_id)
            .collect())
    }

    fn set_hash_ratchet_seq_no(
        &self,
        group_id: &[u8],
        key_id: u64,
        seq_no: u32,
    ) -> Result<(), ProtocolError> {
        if let Some(key) = self
            .inner
            .lock()
            .hash_ratchet_keys
            .get_mut(&(group_id.to_vec(), key_id))
        {
            key.seq_no = seq_no;
        }
        Ok(())
    }

    fn delete_hash_ratchet_key(&self, group_id: &[u8], key_id: u64) -> Result<(), ProtocolError> {
        let mut inner = self.inner.lock();
        inner.hash_ratchet_keys.remove(&(group_id.to_vec(), key_id));
        inner
            .hash_cache
            .retain(|(group, id, _), _| !(group.as_slice() == group_id && *id == key_id));
        Ok(())
    }

    fn nearest_cached_hash(
        &self,
        group_id: &[u8],
        key_id: u64,
        seq_no: u32,
    ) -> Result<Option<(u32, [u8; 32])>, ProtocolError> {
        let inner = self.inner.lock();
        Ok(inner
            .hash_cache
            .range((group_id.to_vec(), key_id, 0)..=(group_id.to_vec(), key_id, seq_no))
            .next_back()
            .map(|((_, _, seq), hash)| (*seq, *hash)))
    }

    fn cache_hash(
        &self,
        group_id: &[u8],
        key_id: u64,
        seq_no: u32,
        hash: &[u8; 32],
    ) -> Result<(), ProtocolError> {
        self.inner
            .lock()
            .hash_cache
            .insert((group_id.to_vec(), key_id, seq_no), *hash);
        Ok(())
    }
}

impl RatchetStore for MemoryKeyStore {
    fn load_state(&self, session_id: &[u8]) -> Result<Option<RatchetState>, CryptoError> {
        self.ratchets.load_state(session_id)
    }

    fn save_state(&self, session_id: &[u8], state: &RatchetState) -> Result<(), CryptoError> {
        self.ratchets.save_state(session_id, state)
    }

    fn get_message_key(
        &self,
        session_id: &[u8],
        ratchet_key: &[u8; 32],
        index: u32,
    ) -> Result<Option<[u8; 32]>, CryptoError> {
        self.ratchets.get_message_key(session_id, ratchet_key, index)
    }

    fn delete_message_key(
        &self,
        session_id: &[u8],
        ratchet_key: &[u8; 32],
        index: u32,
    ) -> Result<(), CryptoError> {
        self.ratchets
            .delete_message_key(session_id, ratchet_key, index)
    }

    fn count_message_keys(&self, session_id: &[u8]) -> Result<usize, CryptoError> {
        self.ratchets.count_message_keys(session_id)
    }

    fn commit(
        &self,
        session_id: &[u8],
        state: &RatchetState,
        new_keys: &[StoredMessageKey],
        retention: Retention,
    ) -> Result<(), CryptoError> {
        self.ratchets.commit(session_id, state, new_keys, retention)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[test]
    fn signed_pre_key_versions() {
        contract::signed_pre_key_versions(&MemoryKeyStore::new());
    }

    #[test]
    fn private_keys_survive_expiry() {
        contract::private_keys_survive_expiry(&MemoryKeyStore::new());
    }

    #[test]
    fn ratchet_info_lifecycle() {
        contract::ratchet_info_lifecycle(&MemoryKeyStore::new());
    }

    #[test]
    fn installations_and_metadata() {
        contract::installations_and_metadata(&MemoryKeyStore::new());
    }

    #[test]
    fn shared_secrets() {
        contract::shared_secrets(&MemoryKeyStore::new());
    }

    #[test]
    fn hash_ratchet_keys() {
        contract::hash_ratchet_keys(&MemoryKeyStore::new());
    }
}
