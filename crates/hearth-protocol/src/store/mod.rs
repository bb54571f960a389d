//! Persistence contract for everything the protocol keeps between calls.
//!
//! Each concern has its own trait; [`KeyStore`] bundles them together with
//! the ratchet store the Double Ratchet sessions write through.

mod memory;
mod sqlite;

use std::collections::{BTreeMap, BTreeSet};

use hearth_crypto::RatchetStore;

use crate::error::ProtocolError;
use crate::message::SignedPreKey;
use crate::multidevice::{Installation, InstallationMetadata};

pub use memory::MemoryKeyStore;
pub use sqlite::SqliteKeyStore;

/// A signed pre-key as stored, ours or a peer's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPreKey {
    pub identity: Vec<u8>,
    pub installation_id: String,
    pub signed_pre_key: Vec<u8>,
    /// Present only for our own installation.
    pub private_key: Option<[u8; 32]>,
    pub version: u32,
    pub protocol_version: u32,
    /// When the key was created (own) or last advertised (peer), in nanoseconds.
    pub timestamp: i64,
}

impl StoredPreKey {
    pub fn to_signed_pre_key(&self) -> SignedPreKey {
        SignedPreKey {
            signed_pre_key: self.signed_pre_key.clone(),
            version: self.version,
            protocol_version: self.protocol_version,
        }
    }
}

pub trait BundleStore: Send + Sync {
    /// Store a signed pre-key.
    ///
    /// A key that is already stored, or whose version is not above the
    /// stored version for the same identity and installation, is ignored and
    /// `false` is returned. Otherwise the key becomes the current one for
    /// that installation and every older version is marked expired.
    fn add_signed_pre_key(&self, entry: &StoredPreKey) -> Result<bool, ProtocolError>;

    /// The current (non-expired) signed pre-key of one installation.
    fn latest_signed_pre_key(
        &self,
        identity: &[u8],
        installation_id: &str,
    ) -> Result<Option<StoredPreKey>, ProtocolError>;

    /// Private half of one of our signed pre-keys, expired or not.
    fn private_key_for_signed_pre_key(
        &self,
        signed_pre_key: &[u8],
    ) -> Result<Option<[u8; 32]>, ProtocolError>;

    /// Current signed pre-keys of the given installations; unknown ones are skipped.
    fn signed_pre_keys(
        &self,
        identity: &[u8],
        installation_ids: &[String],
    ) -> Result<BTreeMap<String, SignedPreKey>, ProtocolError> {
        let mut keys = BTreeMap::new();
        for installation_id in installation_ids {
            if let Some(entry) = self.latest_signed_pre_key(identity, installation_id)? {
                keys.insert(installation_id.clone(), entry.to_signed_pre_key());
            }
        }
        Ok(keys)
    }
}

/// Bootstrap data of one ratchet session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetInfo {
    pub id: Vec<u8>,
    pub sk: [u8; 32],
    /// Private half of `public_key`, only when the signed pre-key is ours.
    pub private_key: Option<[u8; 32]>,
    pub public_key: [u8; 32],
    pub identity: Vec<u8>,
    pub bundle_id: Vec<u8>,
    /// Our X3DH ephemeral key, kept until the peer answers on the session.
    pub ephemeral_key: Option<[u8; 32]>,
    pub installation_id: String,
}

impl RatchetInfo {
    pub fn session_id(bundle_id: &[u8], identity: &[u8], installation_id: &str) -> Vec<u8> {
        let mut id = Vec::with_capacity(bundle_id.len() + identity.len() + installation_id.len());
        id.extend_from_slice(bundle_id);
        id.extend_from_slice(identity);
        id.extend_from_slice(installation_id.as_bytes());
        id
    }
}

pub trait RatchetInfoStore: Send + Sync {
    /// Insert, keeping any existing entry with the same id.
    fn add_ratchet_info(&self, info: &RatchetInfo) -> Result<(), ProtocolError>;

    /// Insert or overwrite. The entry becomes the latest for its peer
    /// installation.
    fn replace_ratchet_info(&self, info: &RatchetInfo) -> Result<(), ProtocolError>;

    fn ratchet_info(
        &self,
        bundle_id: &[u8],
        identity: &[u8],
        installation_id: &str,
    ) -> Result<Option<RatchetInfo>, ProtocolError>;

    /// The most recently added session for a peer installation.
    fn latest_ratchet_info(
        &self,
        identity: &[u8],
        installation_id: &str,
    ) -> Result<Option<RatchetInfo>, ProtocolError>;

    /// The peer answered on this session; stop sending the X3DH header.
    fn confirm_ratchet_info(
        &self,
        bundle_id: &[u8],
        identity: &[u8],
        installation_id: &str,
    ) -> Result<(), ProtocolError>;
}

pub trait InstallationStore: Send + Sync {
    fn installations(&self, identity: &[u8]) -> Result<Vec<Installation>, ProtocolError>;

    fn upsert_installation(
        &self,
        identity: &[u8],
        installation: &Installation,
    ) -> Result<(), ProtocolError>;

    /// Unknown installations are left alone.
    fn set_installation_enabled(
        &self,
        identity: &[u8],
        installation_id: &str,
        enabled: bool,
    ) -> Result<(), ProtocolError>;

    fn set_installation_metadata(
        &self,
        identity: &[u8],
        installation_id: &str,
        metadata: &InstallationMetadata,
    ) -> Result<(), ProtocolError>;

    fn installation_metadata(
        &self,
        identity: &[u8],
        installation_id: &str,
    ) -> Result<Option<InstallationMetadata>, ProtocolError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSecret {
    pub identity: Vec<u8>,
    pub secret: [u8; 32],
    /// Peer installations the secret was derived with.
    pub installation_ids: BTreeSet<String>,
}

pub trait SharedSecretStore: Send + Sync {
    /// Record that `secret` was derived with `installation_id` of `identity`.
    fn add_shared_secret(
        &self,
        identity: &[u8],
        secret: &[u8; 32],
        installation_id: &str,
    ) -> Result<(), ProtocolError>;

    fn shared_secret(&self, identity: &[u8]) -> Result<Option<StoredSecret>, ProtocolError>;

    fn all_shared_secrets(&self) -> Result<Vec<StoredSecret>, ProtocolError>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct HashRatchetKey {
    pub group_id: Vec<u8>,
    pub key_id: u64,
    pub key: [u8; 32],
    /// Last sequence number we sent under this key.
    pub seq_no: u32,
}

impl std::fmt::Debug for HashRatchetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRatchetKey")
            .field("group_id", &hex::encode(&self.group_id))
            .field("key_id", &self.key_id)
            .field("seq_no", &self.seq_no)
            .finish_non_exhaustive()
    }
}

pub trait HashRatchetStore: Send + Sync {
    /// Insert a key generation. Returns `false` if it was already known.
    fn add_hash_ratchet_key(
        &self,
        group_id: &[u8],
        key_id: u64,
        key: &[u8; 32],
    ) -> Result<bool, ProtocolError>;

    fn hash_ratchet_key(
        &self,
        group_id: &[u8],
        key_id: u64,
    ) -> Result<Option<HashRatchetKey>, ProtocolError>;

    /// The generation with the highest key id.
    fn current_hash_ratchet_key(
        &self,
        group_id: &[u8],
    ) -> Result<Option<HashRatchetKey>, ProtocolError>;

    /// Key ids of every retained generation, ascending.
    fn hash_ratchet_key_ids(&self, group_id: &[u8]) -> Result<Vec<u64>, ProtocolError>;

    fn set_hash_ratchet_seq_no(
        &self,
        group_id: &[u8],
        key_id: u64,
        seq_no: u32,
    ) -> Result<(), ProtocolError>;

    /// Remove a generation and its cached hashes.
    fn delete_hash_ratchet_key(&self, group_id: &[u8], key_id: u64) -> Result<(), ProtocolError>;

    /// The cached hash with the highest sequence number not above `seq_no`.
    fn nearest_cached_hash(
        &self,
        group_id: &[u8],
        key_id: u64,
        seq_no: u32,
    ) -> Result<Option<(u32, [u8; 32])>, ProtocolError>;

    fn cache_hash(
        &self,
        group_id: &[u8],
        key_id: u64,
        seq_no: u32,
        hash: &[u8; 32],
    ) -> Result<(), ProtocolError>;
}

/// Everything the protocol persists.
pub trait KeyStore:
    BundleStore + RatchetInfoStore + InstallationStore + SharedSecretStore + HashRatchetStore + RatchetStore
{
}

impl<T> KeyStore for T where
    T: BundleStore
        + RatchetInfoStore
        + InstallationStore
        + SharedSecretStore
        + HashRatchetStore
        + RatchetStore
{
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every `KeyStore` must share. Run against each implementation.

    use super::*;

    fn pre_key(installation: &str, key: u8, version: u32) -> StoredPreKey {
        StoredPreKey {
            identity: vec![7; 32],
            installation_id: installation.to_string(),
            signed_pre_key: vec![key; 32],
            private_key: None,
            version,
            protocol_version: 1,
            timestamp: i64::from(version),
        }
    }

    pub(crate) fn signed_pre_key_versions<S: KeyStore>(store: &S) {
        assert!(store.add_signed_pre_key(&pre_key("d1", 1, 1)).unwrap());
        assert!(!store.add_signed_pre_key(&pre_key("d1", 1, 1)).unwrap());
        assert!(store.add_signed_pre_key(&pre_key("d1", 2, 2)).unwrap());

        // A stale version arriving late does not replace the newer one.
        assert!(!store.add_signed_pre_key(&pre_key("d1", 3, 1)).unwrap());

        let latest = store.latest_signed_pre_key(&[7; 32], "d1").unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.signed_pre_key, vec![2; 32]);

        let keys = store
            .signed_pre_keys(&[7; 32], &["d1".to_string(), "d9".to_string()])
            .unwrap();
        assert_eq!(keys.len(), 1);
    }

    pub(crate) fn private_keys_survive_expiry<S: KeyStore>(store: &S) {
        let mut own = pre_key("me", 4, 1);
        own.private_key = Some([44; 32]);
        store.add_signed_pre_key(&own).unwrap();
        store.add_signed_pre_key(&pre_key("me", 5, 2)).unwrap();

        assert_eq!(
            store.private_key_for_signed_pre_key(&[4; 32]).unwrap(),
            Some([44; 32])
        );
        assert!(store.private_key_for_signed_pre_key(&[9; 32]).unwrap().is_none());
    }

    pub(crate) fn ratchet_info_lifecycle<S: KeyStore>(store: &S) {
        let info = |bundle: u8, sk: u8| RatchetInfo {
            id: RatchetInfo::session_id(&[bundle; 32], &[1; 32], "peer-1"),
            sk: [sk; 32],
            private_key: None,
            public_key: [bundle; 32],
            identity: vec![1; 32],
            bundle_id: vec![bundle; 32],
            ephemeral_key: Some([3; 32]),
            installation_id: "peer-1".into(),
        };

        store.add_ratchet_info(&info(10, 1)).unwrap();
        store.add_ratchet_info(&info(10, 2)).unwrap();
        store.add_ratchet_info(&info(11, 3)).unwrap();

        let first = store.ratchet_info(&[10; 32], &[1; 32], "peer-1").unwrap().unwrap();
        assert_eq!(first.sk, [1; 32]);

        let latest = store.latest_ratchet_info(&[1; 32], "peer-1").unwrap().unwrap();
        assert_eq!(latest.bundle_id, vec![11; 32]);

        store.confirm_ratchet_info(&[11; 32], &[1; 32], "peer-1").unwrap();
        let confirmed = store.ratchet_info(&[11; 32], &[1; 32], "peer-1").unwrap().unwrap();
        assert!(confirmed.ephemeral_key.is_none());
        assert!(store.latest_ratchet_info(&[1; 32], "peer-2").unwrap().is_none());

        store.replace_ratchet_info(&info(10, 4)).unwrap();
        let replaced = store.ratchet_info(&[10; 32], &[1; 32], "peer-1").unwrap().unwrap();
        assert_eq!(replaced.sk, [4; 32]);
        let latest = store.latest_ratchet_info(&[1; 32], "peer-1").unwrap().unwrap();
        assert_eq!(latest.bundle_id, vec![10; 32]);
    }

    pub(crate) fn installations_and_metadata<S: KeyStore>(store: &S) {
        let installation = Installation {
            id: "d1".into(),
            identity: vec![5; 32],
            version: 1,
            enabled: true,
            timestamp: 10,
        };
        store.upsert_installation(&[5; 32], &installation).unwrap();
        store.set_installation_enabled(&[5; 32], "d1", false).unwrap();
        store.set_installation_enabled(&[5; 32], "unknown", true).unwrap();

        let all = store.installations(&[5; 32]).unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].enabled);

        let metadata = InstallationMetadata {
            name: "laptop".into(),
            device_type: "desktop".into(),
            fcm_token: String::new(),
        };
        store.set_installation_metadata(&[5; 32], "d1", &metadata).unwrap();
        assert_eq!(
            store.installation_metadata(&[5; 32], "d1").unwrap(),
            Some(metadata)
        );
    }

    pub(crate) fn shared_secrets<S: KeyStore>(store: &S) {
        store.add_shared_secret(&[1; 32], &[9; 32], "a").unwrap();
        store.add_shared_secret(&[1; 32], &[9; 32], "b").unwrap();
        store.add_shared_secret(&[2; 32], &[8; 32], "c").unwrap();

        let secret = store.shared_secret(&[1; 32]).unwrap().unwrap();
        assert_eq!(secret.secret, [9; 32]);
        assert_eq!(secret.installation_ids.len(), 2);
        assert_eq!(store.all_shared_secrets().unwrap().len(), 2);
    }

    pub(crate) fn hash_ratchet_keys<S: KeyStore>(store: &S) {
        assert!(store.add_hash_ratchet_key(b"g", 100, &[1; 32]).unwrap());
        assert!(!store.add_hash_ratchet_key(b"g", 100, &[2; 32]).unwrap());
        assert!(store.add_hash_ratchet_key(b"g", 200, &[3; 32]).unwrap());

        let current = store.current_hash_ratchet_key(b"g").unwrap().unwrap();
        assert_eq!(current.key_id, 200);
        assert_eq!(store.hash_ratchet_key_ids(b"g").unwrap(), vec![100, 200]);

        store.set_hash_ratchet_seq_no(b"g", 200, 4).unwrap();
        assert_eq!(store.hash_ratchet_key(b"g", 200).unwrap().unwrap().seq_no, 4);

        store.cache_hash(b"g", 100, 2, &[22; 32]).unwrap();
        store.cache_hash(b"g", 100, 5, &[55; 32]).unwrap();
        assert_eq!(
            store.nearest_cached_hash(b"g", 100, 4).unwrap(),
            Some((2, [22; 32]))
        );
        assert!(store.nearest_cached_hash(b"g", 100, 1).unwrap().is_none());

        store.delete_hash_ratchet_key(b"g", 100).unwrap();
        assert!(store.hash_ratchet_key(b"g", 100).unwrap().is_none());
        assert!(store.nearest_cached_hash(b"g", 100, 9).unwrap().is_none());
    }
}
