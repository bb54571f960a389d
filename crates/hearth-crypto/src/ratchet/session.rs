use super::crypto::{DefaultRatchetCrypto, DhKeyPair, RatchetCrypto};
use super::state::{Chain, MessageHeader, RatchetMessage, RatchetState};
use super::store::{RatchetStore, Retention, StoredMessageKey};
use crate::error::CryptoError;

/// Bounds on the skipped-key bookkeeping of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetLimits {
    /// Most message keys a single receive may derive ahead of the chain position.
    pub max_skip: u32,
    /// Stored keys more than this many insertions old are purged.
    pub max_keep: u64,
    /// Most stored keys per session, oldest dropped first.
    pub max_message_keys_per_session: usize,
}

impl Default for RatchetLimits {
    fn default() -> Self {
        Self {
            max_skip: 1000,
            max_keep: 3000,
            max_message_keys_per_session: 2000,
        }
    }
}

/// One Double Ratchet session bound to a store.
///
/// Every receive works on a scratch copy of the state. Nothing reaches the
/// store until the message has authenticated, and then the new state, the
/// stored keys and the retention pass are committed together.
pub struct DoubleRatchetSession<'s, S: ?Sized, C = DefaultRatchetCrypto> {
    id: Vec<u8>,
    state: RatchetState,
    store: &'s S,
    crypto: C,
    limits: RatchetLimits,
}

impl<'s, S, C> DoubleRatchetSession<'s, S, C>
where
    S: RatchetStore + ?Sized,
    C: RatchetCrypto,
{
    /// Start a session as the X3DH initiator, ratcheting against `remote_public`.
    pub fn new_initiator(
        id: Vec<u8>,
        crypto: C,
        shared_key: &[u8; 32],
        remote_public: [u8; 32],
        store: &'s S,
        limits: RatchetLimits,
    ) -> Result<Self, CryptoError> {
        let state = RatchetState::initiator(&crypto, shared_key, remote_public)?;
        store.save_state(&id, &state)?;
        Ok(Self {
            id,
            state,
            store,
            crypto,
            limits,
        })
    }

    /// Start a session as the responder whose signed pre-key is `key_pair`.
    pub fn new_responder(
        id: Vec<u8>,
        crypto: C,
        shared_key: &[u8; 32],
        key_pair: DhKeyPair,
        store: &'s S,
        limits: RatchetLimits,
    ) -> Result<Self, CryptoError> {
        let state = RatchetState::responder(&crypto, shared_key, key_pair)?;
        store.save_state(&id, &state)?;
        Ok(Self {
            id,
            state,
            store,
            crypto,
            limits,
        })
    }

    /// Resume a persisted session. `None` if the store has no state for `id`.
    pub fn load(
        id: Vec<u8>,
        crypto: C,
        store: &'s S,
        limits: RatchetLimits,
    ) -> Result<Option<Self>, CryptoError> {
        Ok(store.load_state(&id)?.map(|state| Self {
            id,
            state,
            store,
            crypto,
            limits,
        }))
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, CryptoError> {
        let mut next = self.state.clone();
        let (chain_key, message_key) = self.crypto.kdf_ck(&next.send.key)?;
        let header = MessageHeader {
            dh: *next.dh_self.public(),
            n: next.send.n,
            pn: next.prev_send_len,
        };
        next.send = Chain {
            key: chain_key,
            n: next
                .send
                .n
                .checked_add(1)
                .ok_or_else(|| CryptoError::SessionError("sending chain exhausted".into()))?,
        };

        let ciphertext = self
            .crypto
            .encrypt(&message_key, plaintext, &header.encode())?;

        self.store.save_state(&self.id, &next)?;
        self.state = next;
        Ok(RatchetMessage { header, ciphertext })
    }

    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>, CryptoError> {
        let header = &message.header;
        let associated_data = header.encode();

        // A stored key stays usable until it is confirmed or pruned.
        if let Some(key) = self
            .store
            .get_message_key(&self.id, &header.dh, header.n)?
        {
            return self
                .crypto
                .decrypt(&key, &message.ciphertext, &associated_data);
        }

        let mut scratch = self.state.clone();
        let mut derived: Vec<([u8; 32], u32, [u8; 32])> = Vec::new();

        if scratch.dh_remote != Some(header.dh) {
            if scratch.is_retired(&header.dh) {
                return Err(CryptoError::KeyAlreadyConsumedOrPruned);
            }
            self.skip_message_keys(&mut scratch, header.pn, &mut derived)?;
            scratch.dh_ratchet(&self.crypto, header.dh)?;
        }
        self.skip_message_keys(&mut scratch, header.n, &mut derived)?;

        let (chain_key, message_key) = self.crypto.kdf_ck(&scratch.recv.key)?;
        scratch.recv = Chain {
            key: chain_key,
            n: scratch.recv.n.saturating_add(1),
        };

        let plaintext = self
            .crypto
            .decrypt(&message_key, &message.ciphertext, &associated_data)?;
        derived.push((header.dh, header.n, message_key));

        let new_keys: Vec<StoredMessageKey> = derived
            .into_iter()
            .map(|(ratchet_key, index, key)| {
                let seq = scratch.keys_count;
                scratch.keys_count += 1;
                StoredMessageKey {
                    ratchet_key,
                    index,
                    key,
                    seq,
                }
            })
            .collect();

        let retention = Retention {
            max_keys: self.limits.max_message_keys_per_session,
            purge_below_seq: scratch.keys_count.saturating_sub(self.limits.max_keep),
        };
        self.store
            .commit(&self.id, &scratch, &new_keys, retention)?;

        tracing::debug!(
            session = %hex::encode(&self.id),
            index = header.n,
            stored = new_keys.len(),
            "ratchet message decrypted"
        );
        self.state = scratch;
        Ok(plaintext)
    }

    /// Forget the key for `(ratchet_key, index)` once the message is processed.
    pub fn delete_message_key(&self, ratchet_key: &[u8; 32], index: u32) -> Result<(), CryptoError> {
        self.store.delete_message_key(&self.id, ratchet_key, index)
    }

    fn skip_message_keys(
        &self,
        state: &mut RatchetState,
        until: u32,
        derived: &mut Vec<([u8; 32], u32, [u8; 32])>,
    ) -> Result<(), CryptoError> {
        if until < state.recv.n {
            return Err(CryptoError::KeyAlreadyConsumedOrPruned);
        }
        if until - state.recv.n > self.limits.max_skip {
            tracing::warn!(
                session = %hex::encode(&self.id),
                position = state.recv.n,
                requested = until,
                max_skip = self.limits.max_skip,
                "refusing to skip message keys"
            );
            return Err(CryptoError::SkipLimitExceeded);
        }
        let Some(remote) = state.dh_remote else {
            return Ok(());
        };

        while state.recv.n < until {
            let (chain_key, message_key) = self.crypto.kdf_ck(&state.recv.key)?;
            derived.push((remote, state.recv.n, message_key));
            state.recv = Chain {
                key: chain_key,
                n: state.recv.n + 1,
            };
        }
        Ok(())
    }
}
