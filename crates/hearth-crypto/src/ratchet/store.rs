use std::collections::HashMap;

use parking_lot::Mutex;

use super::state::RatchetState;
use crate::error::CryptoError;

/// A message key kept for a `(ratchet key, index)` the session has not consumed yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessageKey {
    pub ratchet_key: [u8; 32],
    pub index: u32,
    pub key: [u8; 32],
    /// Insertion order within the session; older keys have lower values.
    pub seq: u64,
}

/// Retention applied to a session's stored keys when a receive commits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Retention {
    /// Keep at most this many keys, dropping the lowest `seq` first.
    pub max_keys: usize,
    /// Drop every key whose `seq` is below this value.
    pub purge_below_seq: u64,
}

/// Storage behind a [`DoubleRatchetSession`](super::DoubleRatchetSession).
///
/// `commit` must apply the state, the new keys and the retention pass as one
/// atomic unit; a session never observes half of a receive.
pub trait RatchetStore: Send + Sync {
    fn load_state(&self, session_id: &[u8]) -> Result<Option<RatchetState>, CryptoError>;

    fn save_state(&self, session_id: &[u8], state: &RatchetState) -> Result<(), CryptoError>;

    fn get_message_key(
        &self,
        session_id: &[u8],
        ratchet_key: &[u8; 32],
        index: u32,
    ) -> Result<Option<[u8; 32]>, CryptoError>;

    /// Deleting a key that is already gone is not an error.
    fn delete_message_key(
        &self,
        session_id: &[u8],
        ratchet_key: &[u8; 32],
        index: u32,
    ) -> Result<(), CryptoError>;

    fn count_message_keys(&self, session_id: &[u8]) -> Result<usize, CryptoError>;

    fn commit(
        &self,
        session_id: &[u8],
        state: &RatchetState,
        new_keys: &[StoredMessageKey],
        retention: Retention,
    ) -> Result<(), CryptoError>;
}

#[derive(Default)]
struct MemoryRatchetInner {
    states: HashMap<Vec<u8>, RatchetState>,
    keys: HashMap<Vec<u8>, Vec<StoredMessageKey>>,
}

/// In-memory ratchet store. Data is lost on process exit.
#[derive(Default)]
pub struct MemoryRatchetStore {
    inner: Mutex<MemoryRatchetInner>,
}

impl MemoryRatchetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RatchetStore for MemoryRatchetStore {
    fn load_state(&self, session_id: &[u8]) -> Result<Option<RatchetState>, CryptoError> {
        Ok(self.inner.lock().states.get(session_id).cloned())
    }

    fn save_state(&self, session_id: &[u8], state: &RatchetState) -> Result<(), CryptoError> {
        self.inner
            .lock()
            .states
            .insert(session_id.to_vec(), state.clone());
        Ok(())
    }

    fn get_message_key(
        &self,
        session_id: &[u8],
        ratchet_key: &[u8; 32],
        index: u32,
    ) -> Result<Option<[u8; 32]>, CryptoError> {
        let inner = self.inner.lock();
        Ok(inner.keys.get(session_id).and_then(|keys| {
            keys.iter()
                .find(|k| &k.ratchet_key == ratchet_key && k.index == index)
                .map(|k| k.key)
        }))
    }

    fn delete_message_key(
        &self,
        session_id: &[u8],
        ratchet_key: &[u8; 32],
        index: u32,
    ) -> Result<(), CryptoError> {
        if let Some(keys) = self.inner.lock().keys.get_mut(session_id) {
            keys.retain(|k| !(&k.ratchet_key == ratchet_key && k.index == index));
        }
        Ok(())
    }

    fn count_message_keys(&self, session_id: &[u8]) -> Result<usize, CryptoError> {
        Ok(self.inner.lock().keys.get(session_id).map_or(0, Vec::len))
    }

    fn commit(
        &self,
        session_id: &[u8],
        state: &RatchetState,
        new_keys: &[StoredMessageKey],
        retention: Retention,
    ) -> Result<(), CryptoError> {
        let mut inner = self.inner.lock();
        inner.states.insert(session_id.to_vec(), state.clone());

        let keys = inner.keys.entry(session_id.to_vec()).or_default();
        for key in new_keys {
            keys.retain(|k| !(k.ratchet_key == key.ratchet_key && k.index == key.index));
            keys.push(key.clone());
        }

        keys.sort_by_key(|k| k.seq);
        if keys.len() > retention.max_keys {
            let excess = keys.len() - retention.max_keys;
            keys.drain(..excess);
        }
        keys.retain(|k| k.seq >= retention.purge_below_seq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratchet::crypto::{DefaultRatchetCrypto, RatchetCrypto};

    fn key(ratchet: u8, index: u32, seq: u64) -> StoredMessageKey {
        StoredMessageKey {
            ratchet_key: [ratchet; 32],
            index,
            key: [u8::try_from(index).unwrap(); 32],
            seq,
        }
    }

    fn state() -> RatchetState {
        RatchetState::responder(&DefaultRatchetCrypto, &[1u8; 32], DefaultRatchetCrypto.generate_dh())
            .unwrap()
    }

    #[test]
    fn commit_truncates_oldest_first() {
        let store = MemoryRatchetStore::new();
        let keys: Vec<_> = (0..5).map(|i| key(1, i, u64::from(i))).collect();
        let retention = Retention {
            max_keys: 3,
            purge_below_seq: 0,
        };
        store.commit(b"s", &state(), &keys, retention).unwrap();

        assert_eq!(store.count_message_keys(b"s").unwrap(), 3);
        assert!(store.get_message_key(b"s", &[1; 32], 1).unwrap().is_none());
        assert!(store.get_message_key(b"s", &[1; 32], 2).unwrap().is_some());
    }

    #[test]
    fn commit_purges_below_seq() {
        let store = MemoryRatchetStore::new();
        let keys: Vec<_> = (0..4).map(|i| key(2, i, u64::from(i))).collect();
        let retention = Retention {
            max_keys: 100,
            purge_below_seq: 2,
        };
        store.commit(b"s", &state(), &keys, retention).unwrap();

        assert_eq!(store.count_message_keys(b"s").unwrap(), 2);
        assert!(store.get_message_key(b"s", &[2; 32], 3).unwrap().is_some());
    }

    #[test]
    fn delete_is_idempotent() {
        let store = MemoryRatchetStore::new();
        let retention = Retention {
            max_keys: 10,
            purge_below_seq: 0,
        };
        store.commit(b"s", &state(), &[key(3, 0, 0)], retention).unwrap();

        store.delete_message_key(b"s", &[3; 32], 0).unwrap();
        store.delete_message_key(b"s", &[3; 32], 0).unwrap();
        store.delete_message_key(b"missing", &[3; 32], 0).unwrap();
        assert_eq!(store.count_message_keys(b"s").unwrap(), 0);
    }
}
