use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::crypto::{DhKeyPair, RatchetCrypto};
use crate::error::CryptoError;

/// How many superseded remote ratchet keys a session remembers.
const RETIRED_REMOTE_KEYS: usize = 32;

/// A symmetric KDF chain and the index of the next message key it yields.
#[derive(Clone, Serialize, Deserialize)]
pub struct Chain {
    pub key: [u8; 32],
    pub n: u32,
}

impl Chain {
    fn new(key: [u8; 32]) -> Self {
        Self { key, n: 0 }
    }
}

/// Persisted state of one Double Ratchet session.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    pub root_key: [u8; 32],
    pub dh_self: DhKeyPair,
    pub dh_remote: Option<[u8; 32]>,
    pub send: Chain,
    pub recv: Chain,
    /// Length of the previous sending chain, advertised as `pn`.
    pub prev_send_len: u32,
    /// Sequence counter handed out to stored message keys.
    pub keys_count: u64,
    /// Remote ratchet keys this session has moved past, newest last.
    pub retired_remote_keys: VecDeque<[u8; 32]>,
}

impl RatchetState {
    /// State of the party that bootstrapped the session with X3DH.
    pub(crate) fn initiator<C: RatchetCrypto + ?Sized>(
        crypto: &C,
        shared_key: &[u8; 32],
        remote_public: [u8; 32],
    ) -> Result<Self, CryptoError> {
        let dh_self = crypto.generate_dh();
        let (root_key, send_key) = crypto.kdf_rk(shared_key, &crypto.dh(&dh_self, &remote_public))?;
        let recv_key = crypto.initial_chain_key(shared_key)?;
        Ok(Self {
            root_key,
            dh_self,
            dh_remote: Some(remote_public),
            send: Chain::new(send_key),
            recv: Chain::new(recv_key),
            prev_send_len: 0,
            keys_count: 0,
            retired_remote_keys: VecDeque::new(),
        })
    }

    /// State of the party whose signed pre-key was used. It may send before
    /// receiving anything; those messages ride the initial chain.
    pub(crate) fn responder<C: RatchetCrypto + ?Sized>(
        crypto: &C,
        shared_key: &[u8; 32],
        key_pair: DhKeyPair,
    ) -> Result<Self, CryptoError> {
        let initial = crypto.initial_chain_key(shared_key)?;
        Ok(Self {
            root_key: *shared_key,
            dh_self: key_pair,
            dh_remote: None,
            send: Chain::new(initial),
            recv: Chain::new(initial),
            prev_send_len: 0,
            keys_count: 0,
            retired_remote_keys: VecDeque::new(),
        })
    }

    pub(crate) fn is_retired(&self, remote_public: &[u8; 32]) -> bool {
        self.retired_remote_keys.contains(remote_public)
    }

    /// DH ratchet step on receipt of a new remote ratchet key.
    pub(crate) fn dh_ratchet<C: RatchetCrypto + ?Sized>(
        &mut self,
        crypto: &C,
        remote_public: [u8; 32],
    ) -> Result<(), CryptoError> {
        if let Some(previous) = self.dh_remote.replace(remote_public) {
            self.retired_remote_keys.push_back(previous);
            while self.retired_remote_keys.len() > RETIRED_REMOTE_KEYS {
                self.retired_remote_keys.pop_front();
            }
        }
        self.prev_send_len = self.send.n;

        let (root_key, recv_key) =
            crypto.kdf_rk(&self.root_key, &crypto.dh(&self.dh_self, &remote_public))?;
        self.recv = Chain::new(recv_key);

        self.dh_self = crypto.generate_dh();
        let (root_key, send_key) =
            crypto.kdf_rk(&root_key, &crypto.dh(&self.dh_self, &remote_public))?;
        self.root_key = root_key;
        self.send = Chain::new(send_key);
        Ok(())
    }
}

/// Header sent alongside every ratchet ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current ratchet public key.
    pub dh: [u8; 32],
    /// Index of the message in the sending chain.
    pub n: u32,
    /// Length of the sender's previous sending chain.
    pub pn: u32,
}

impl MessageHeader {
    /// Bytes authenticated as associated data: `dh || n (BE) || pn (BE)`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(40);
        out.extend_from_slice(&self.dh);
        out.extend_from_slice(&self.n.to_be_bytes());
        out.extend_from_slice(&self.pn.to_be_bytes());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMessage {
    pub header: MessageHeader,
    pub ciphertext: Vec<u8>,
}
