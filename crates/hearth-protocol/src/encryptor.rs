//! Per-installation encryption.
//!
//! Bootstraps Double Ratchet sessions with X3DH, fans a payload out to a set
//! of installations, routes incoming entries to the right session and keeps
//! the message keys of decrypted messages until they are confirmed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use hearth_crypto::ratchet::DhKeyPair;
use hearth_crypto::{
    aead, x3dh, DefaultRatchetCrypto, DoubleRatchetSession, Identity, MessageHeader,
    RatchetMessage,
};
use parking_lot::Mutex;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::bundle::{build_bundle, new_bundle_container, timestamp_now_nanos, to_key, x3dh_with_pre_key};
use crate::config::ProtocolConfig;
use crate::error::ProtocolError;
use crate::message::{Bundle, DhHeader, DirectMessageProtocol, DrHeader, X3dhHeader};
use crate::multidevice::Installation;
use crate::store::{KeyStore, RatchetInfo, StoredPreKey};
use crate::PROTOCOL_VERSION;

/// Message key kept for a decrypted message until it is confirmed.
struct PendingConfirmation {
    session_id: Vec<u8>,
    ratchet_key: [u8; 32],
    index: u32,
}

pub struct Encryptor<S: ?Sized> {
    store: Arc<S>,
    config: ProtocolConfig,
    /// One encrypt or decrypt at a time, including its skipped-key writes.
    session_lock: Mutex<()>,
    confirmations: Mutex<HashMap<Vec<u8>, PendingConfirmation>>,
    last_bundle_timestamp: Mutex<i64>,
}

impl<S: KeyStore + ?Sized> Encryptor<S> {
    pub fn new(store: Arc<S>, config: ProtocolConfig) -> Self {
        Self {
            store,
            config,
            session_lock: Mutex::new(()),
            confirmations: Mutex::new(HashMap::new()),
            last_bundle_timestamp: Mutex::new(0),
        }
    }

    fn session(&self, id: Vec<u8>) -> Result<DoubleRatchetSession<'_, S>, ProtocolError> {
        DoubleRatchetSession::load(
            id,
            DefaultRatchetCrypto,
            &*self.store,
            self.config.ratchet_limits(),
        )?
        .ok_or(ProtocolError::SessionNotFound)
    }

    /// Sign a bundle with the current signed pre-keys of `installations`.
    ///
    /// Our own signed pre-key is rotated first if it is missing or older
    /// than the refresh interval.
    pub fn create_bundle(
        &self,
        identity: &Identity,
        installations: &[Installation],
    ) -> Result<Bundle, ProtocolError> {
        let my_id = identity.public_key_bytes();
        let installation_id = self.config.installation_id.as_str();
        let now = timestamp_now_nanos();

        let current = self.store.latest_signed_pre_key(&my_id, installation_id)?;
        let refresh = i64::try_from(self.config.bundle_refresh_interval.as_nanos()).unwrap_or(i64::MAX);
        let expired = match &current {
            Some(k) => k.private_key.is_none() || now.saturating_sub(k.timestamp) >= refresh,
            None => true,
        };

        if expired {
            let version = current.map_or(1, |k| k.version.saturating_add(1));
            let container = new_bundle_container(identity, installation_id, version, now);
            let signed_pre_key = container
                .bundle
                .signed_pre_keys
                .get(installation_id)
                .map(|k| k.signed_pre_key.clone())
                .ok_or_else(|| ProtocolError::Crypto("fresh bundle lacks our pre-key".into()))?;
            self.store.add_signed_pre_key(&StoredPreKey {
                identity: my_id.to_vec(),
                installation_id: installation_id.to_string(),
                signed_pre_key,
                private_key: Some(container.private_signed_pre_key),
                version,
                protocol_version: PROTOCOL_VERSION,
                timestamp: now,
            })?;
            tracing::info!(installation_id, version, "rotated signed pre-key");
        }

        let ids: Vec<String> = installations.iter().map(|i| i.id.clone()).collect();
        let signed_pre_keys = self.store.signed_pre_keys(&my_id, &ids)?;

        let timestamp = {
            let mut last = self.last_bundle_timestamp.lock();
            *last = now.max(last.saturating_add(1));
            *last
        };
        Ok(build_bundle(identity, signed_pre_keys, timestamp))
    }

    /// Persist the signed pre-keys of an already verified bundle.
    ///
    /// A bundle carrying a pre-key that is not an X25519 public key is
    /// rejected whole, before anything is stored.
    pub fn process_public_bundle(&self, bundle: &Bundle) -> Result<(), ProtocolError> {
        for (installation_id, pre_key) in &bundle.signed_pre_keys {
            if pre_key.signed_pre_key.len() != 32 {
                return Err(ProtocolError::MalformedMessage(format!(
                    "signed pre-key for installation {installation_id} is {} bytes",
                    pre_key.signed_pre_key.len()
                )));
            }
        }

        for (installation_id, pre_key) in &bundle.signed_pre_keys {
            let added = self.store.add_signed_pre_key(&StoredPreKey {
                identity: bundle.identity.clone(),
                installation_id: installation_id.clone(),
                signed_pre_key: pre_key.signed_pre_key.clone(),
                private_key: None,
                version: pre_key.version,
                protocol_version: pre_key.protocol_version,
                timestamp: bundle.timestamp,
            })?;
            if added {
                tracing::debug!(
                    identity = %hex::encode(&bundle.identity),
                    installation_id = %installation_id,
                    version = pre_key.version,
                    "stored signed pre-key"
                );
            }
        }
        Ok(())
    }

    /// Encrypt `payload` once per installation.
    ///
    /// Installations we hold no signed pre-key for are skipped. Returns the
    /// entries keyed by installation id and the installations they target.
    pub fn encrypt_payload(
        &self,
        my_identity: &Identity,
        their_identity: &[u8],
        installations: &[Installation],
        payload: &[u8],
    ) -> Result<(BTreeMap<String, DirectMessageProtocol>, Vec<Installation>), ProtocolError> {
        let _guard = self.session_lock.lock();
        let mut entries = BTreeMap::new();
        let mut targeted = Vec::new();
        let to_self = their_identity == my_identity.public_key_bytes().as_slice();

        for installation in installations {
            if to_self && installation.id == self.config.installation_id {
                continue;
            }
            match self.encrypt_for_installation(my_identity, their_identity, &installation.id, payload)? {
                Some(entry) => {
                    entries.insert(installation.id.clone(), entry);
                    targeted.push(installation.clone());
                }
                None => tracing::warn!(
                    identity = %hex::encode(their_identity),
                    installation_id = %installation.id,
                    "no signed pre-key for installation, skipping"
                ),
            }
        }
        Ok((entries, targeted))
    }

    fn encrypt_for_installation(
        &self,
        my_identity: &Identity,
        their_identity: &[u8],
        installation_id: &str,
        payload: &[u8],
    ) -> Result<Option<DirectMessageProtocol>, ProtocolError> {
        let info = match self.store.latest_ratchet_info(their_identity, installation_id)? {
            Some(info) => info,
            None => {
                let Some(pre_key) = self
                    .store
                    .latest_signed_pre_key(their_identity, installation_id)?
                else {
                    return Ok(None);
                };
                self.start_session(my_identity, their_identity, installation_id, &pre_key)?
            }
        };

        let message = self.session(info.id.clone())?.encrypt(payload)?;
        Ok(Some(DirectMessageProtocol {
            x3dh_header: info.ephemeral_key.map(|key| X3dhHeader {
                key: key.to_vec(),
                id: info.bundle_id.clone(),
            }),
            dr_header: Some(DrHeader {
                key: message.header.dh.to_vec(),
                n: message.header.n,
                pn: message.header.pn,
                id: info.bundle_id,
            }),
            payload: message.ciphertext,
            ..Default::default()
        }))
    }

    /// X3DH against a stored signed pre-key, then an initiator session.
    fn start_session(
        &self,
        my_identity: &Identity,
        their_identity: &[u8],
        installation_id: &str,
        pre_key: &StoredPreKey,
    ) -> Result<RatchetInfo, ProtocolError> {
        let handshake = x3dh_with_pre_key(their_identity, &pre_key.signed_pre_key, my_identity)?;
        let info = RatchetInfo {
            id: RatchetInfo::session_id(&pre_key.signed_pre_key, their_identity, installation_id),
            sk: handshake.shared_secret,
            private_key: None,
            public_key: handshake.signed_pre_key,
            identity: their_identity.to_vec(),
            bundle_id: pre_key.signed_pre_key.clone(),
            ephemeral_key: Some(handshake.ephemeral_public),
            installation_id: installation_id.to_string(),
        };

        DoubleRatchetSession::new_initiator(
            info.id.clone(),
            DefaultRatchetCrypto,
            &info.sk,
            info.public_key,
            &*self.store,
            self.config.ratchet_limits(),
        )?;
        self.store.add_ratchet_info(&info)?;
        tracing::info!(
            identity = %hex::encode(their_identity),
            installation_id,
            "started ratchet session"
        );
        Ok(info)
    }

    /// Single-DH entry for an identity we have no session with.
    pub fn encrypt_with_dh(
        &self,
        their_identity: &[u8],
        payload: &[u8],
    ) -> Result<DirectMessageProtocol, ProtocolError> {
        let their_public = Identity::peer_ed25519_to_x25519(their_identity)?;
        let (key, ephemeral) = x3dh::perform_active_dh(&their_public)?;
        Ok(DirectMessageProtocol {
            dh_header: Some(DhHeader {
                key: ephemeral.as_bytes().to_vec(),
            }),
            payload: aead::xchacha_seal(&key, payload)?,
            ..Default::default()
        })
    }

    /// Decrypt one entry sent by `their_installation_id` of `their_identity`.
    pub fn decrypt_payload(
        &self,
        my_identity: &Identity,
        their_identity: &[u8],
        their_installation_id: &str,
        entry: &DirectMessageProtocol,
        message_id: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let _guard = self.session_lock.lock();

        if let Some(header) = &entry.x3dh_header {
            self.accept_session(my_identity, their_identity, their_installation_id, header)?;
        }

        if let Some(header) = &entry.dr_header {
            let info = self
                .store
                .ratchet_info(&header.id, their_identity, their_installation_id)?
                .ok_or(ProtocolError::SessionNotFound)?;
            let message = RatchetMessage {
                header: MessageHeader {
                    dh: to_key(&header.key, "ratchet key")?,
                    n: header.n,
                    pn: header.pn,
                },
                ciphertext: entry.payload.clone(),
            };

            let plaintext = self.session(info.id.clone())?.decrypt(&message)?;
            if info.ephemeral_key.is_some() {
                self.store
                    .confirm_ratchet_info(&header.id, their_identity, their_installation_id)?;
            }
            self.confirmations.lock().insert(
                message_id.to_vec(),
                PendingConfirmation {
                    session_id: info.id,
                    ratchet_key: message.header.dh,
                    index: message.header.n,
                },
            );
            tracing::debug!(
                identity = %hex::encode(their_identity),
                installation_id = their_installation_id,
                message_id = %hex::encode(message_id),
                "decrypted ratchet message"
            );
            return Ok(plaintext);
        }

        if let Some(header) = &entry.dh_header {
            let their_ephemeral = PublicKey::from(to_key(&header.key, "ephemeral key")?);
            let key = x3dh::perform_dh(&my_identity.to_x25519_secret(), &their_ephemeral)?;
            return Ok(aead::xchacha_open(&key, &entry.payload)?);
        }

        Err(ProtocolError::NoPayload)
    }

    /// Responder side of X3DH: create the session the header asks for.
    ///
    /// A header repeating the handshake we already hold is a no-op. A new
    /// ephemeral key against the same signed pre-key means the peer started
    /// over, and the session is replaced.
    fn accept_session(
        &self,
        my_identity: &Identity,
        their_identity: &[u8],
        their_installation_id: &str,
        header: &X3dhHeader,
    ) -> Result<(), ProtocolError> {
        let private_key = self
            .store
            .private_key_for_signed_pre_key(&header.id)?
            .ok_or(ProtocolError::SessionNotFound)?;

        let their_ephemeral = PublicKey::from(to_key(&header.key, "ephemeral key")?);
        let their_public = Identity::peer_ed25519_to_x25519(their_identity)?;
        let signed_pre_key = StaticSecret::from(private_key);
        let sk = x3dh::passive_x3dh(
            &their_public,
            &signed_pre_key,
            &their_ephemeral,
            &my_identity.to_x25519_secret(),
        )?;

        let existing = self
            .store
            .ratchet_info(&header.id, their_identity, their_installation_id)?;
        if existing.as_ref().is_some_and(|info| info.sk == sk) {
            return Ok(());
        }

        let info = RatchetInfo {
            id: RatchetInfo::session_id(&header.id, their_identity, their_installation_id),
            sk,
            private_key: Some(private_key),
            public_key: PublicKey::from(&signed_pre_key).to_bytes(),
            identity: their_identity.to_vec(),
            bundle_id: header.id.clone(),
            ephemeral_key: None,
            installation_id: their_installation_id.to_string(),
        };
        DoubleRatchetSession::new_responder(
            info.id.clone(),
            DefaultRatchetCrypto,
            &sk,
            DhKeyPair::from_secret(private_key),
            &*self.store,
            self.config.ratchet_limits(),
        )?;
        self.store.replace_ratchet_info(&info)?;
        tracing::info!(
            identity = %hex::encode(their_identity),
            installation_id = their_installation_id,
            replaced = existing.is_some(),
            "accepted ratchet session"
        );
        Ok(())
    }

    /// Drop the message key kept for `message_id`. Unknown ids are ignored.
    pub fn confirm_message_processed(&self, message_id: &[u8]) -> Result<(), ProtocolError> {
        let Some(pending) = self.confirmations.lock().remove(message_id) else {
            tracing::debug!(message_id = %hex::encode(message_id), "nothing to confirm");
            return Ok(());
        };

        let _guard = self.session_lock.lock();
        if let Some(session) = DoubleRatchetSession::<S>::load(
            pending.session_id,
            DefaultRatchetCrypto,
            &*self.store,
            self.config.ratchet_limits(),
        )? {
            session.delete_message_key(&pending.ratchet_key, pending.index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::recover_identity;
    use crate::message::SignedPreKey;
    use crate::store::{BundleStore, MemoryKeyStore};
    use crate::ErrorKind;

    struct Side {
        identity: Identity,
        encryptor: Encryptor<MemoryKeyStore>,
    }

    fn side(installation_id: &str) -> Side {
        Side {
            identity: Identity::generate(),
            encryptor: Encryptor::new(
                Arc::new(MemoryKeyStore::new()),
                ProtocolConfig::new(installation_id),
            ),
        }
    }

    fn me(side: &Side, id: &str) -> Installation {
        Installation {
            id: id.into(),
            identity: side.identity.public_key_bytes().to_vec(),
            version: PROTOCOL_VERSION,
            enabled: true,
            timestamp: 0,
        }
    }

    /// Alice learns Bob's bundle and encrypts to his installation.
    fn handshake(alice: &Side, bob: &Side) -> DirectMessageProtocol {
        let bundle = bob.encryptor.create_bundle(&bob.identity, &[me(bob, "bob-1")]).unwrap();
        recover_identity(&bundle).unwrap();
        alice.encryptor.process_public_bundle(&bundle).unwrap();

        let bob_id = bob.identity.public_key_bytes();
        let (mut entries, targeted) = alice
            .encryptor
            .encrypt_payload(&alice.identity, &bob_id, &[me(bob, "bob-1")], b"hello")
            .unwrap();
        assert_eq!(targeted.len(), 1);
        entries.remove("bob-1").unwrap()
    }

    #[test]
    fn x3dh_bootstrap_and_reply() {
        let alice = side("alice-1");
        let bob = side("bob-1");
        let alice_id = alice.identity.public_key_bytes();
        let bob_id = bob.identity.public_key_bytes();

        let entry = handshake(&alice, &bob);
        assert!(entry.x3dh_header.is_some());

        let plaintext = bob
            .encryptor
            .decrypt_payload(&bob.identity, &alice_id, "alice-1", &entry, b"m1")
            .unwrap();
        assert_eq!(plaintext, b"hello");

        let (mut replies, _) = bob
            .encryptor
            .encrypt_payload(&bob.identity, &alice_id, &[me(&alice, "alice-1")], b"hi back")
            .unwrap();
        let reply = replies.remove("alice-1").unwrap();
        assert!(reply.x3dh_header.is_none());
        assert_eq!(
            alice
                .encryptor
                .decrypt_payload(&alice.identity, &bob_id, "bob-1", &reply, b"m2")
                .unwrap(),
            b"hi back"
        );

        // Bob answered, so Alice stops sending the handshake header.
        let (mut next, _) = alice
            .encryptor
            .encrypt_payload(&alice.identity, &bob_id, &[me(&bob, "bob-1")], b"again")
            .unwrap();
        assert!(next.remove("bob-1").unwrap().x3dh_header.is_none());
    }

    #[test]
    fn repeated_handshake_header_reuses_session() {
        let alice = side("alice-1");
        let bob = side("bob-1");
        let alice_id = alice.identity.public_key_bytes();
        let bob_id = bob.identity.public_key_bytes();

        let first = handshake(&alice, &bob);
        let (mut entries, _) = alice
            .encryptor
            .encrypt_payload(&alice.identity, &bob_id, &[me(&bob, "bob-1")], b"second")
            .unwrap();
        let second = entries.remove("bob-1").unwrap();
        assert!(second.x3dh_header.is_some());

        for (entry, id, expected) in [(&first, b"m1", &b"hello"[..]), (&second, b"m2", &b"second"[..])] {
            let plaintext = bob
                .encryptor
                .decrypt_payload(&bob.identity, &alice_id, "alice-1", entry, id)
                .unwrap();
            assert_eq!(plaintext, expected);
        }
    }

    #[test]
    fn unknown_session_and_missing_pre_key() {
        let alice = side("alice-1");
        let bob = side("bob-1");
        let alice_id = alice.identity.public_key_bytes();

        let mut entry = handshake(&alice, &bob);
        entry.x3dh_header = None;
        let err = bob
            .encryptor
            .decrypt_payload(&bob.identity, &alice_id, "alice-1", &entry, b"m1")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);

        let mut entry = handshake(&alice, &bob);
        if let Some(header) = entry.x3dh_header.as_mut() {
            header.id = vec![0; 32];
        }
        let err = bob
            .encryptor
            .decrypt_payload(&bob.identity, &alice_id, "alice-1", &entry, b"m1")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
    }

    #[test]
    fn installations_without_pre_keys_are_skipped() {
        let alice = side("alice-1");
        let bob = side("bob-1");
        let (entries, targeted) = alice
            .encryptor
            .encrypt_payload(
                &alice.identity,
                &bob.identity.public_key_bytes(),
                &[me(&bob, "bob-1")],
                b"hello",
            )
            .unwrap();
        assert!(entries.is_empty());
        assert!(targeted.is_empty());
    }

    #[test]
    fn dh_fallback() {
        let alice = side("alice-1");
        let bob = side("bob-1");
        let entry = alice
            .encryptor
            .encrypt_with_dh(&bob.identity.public_key_bytes(), b"secret")
            .unwrap();
        let plaintext = bob
            .encryptor
            .decrypt_payload(
                &bob.identity,
                &alice.identity.public_key_bytes(),
                "alice-1",
                &entry,
                b"m1",
            )
            .unwrap();
        assert_eq!(plaintext, b"secret");
    }

    #[test]
    fn confirmation_releases_message_key() {
        let alice = side("alice-1");
        let bob = side("bob-1");
        let alice_id = alice.identity.public_key_bytes();

        let entry = handshake(&alice, &bob);
        bob.encryptor
            .decrypt_payload(&bob.identity, &alice_id, "alice-1", &entry, b"m1")
            .unwrap();

        // Until confirmed the same message decrypts again.
        bob.encryptor
            .decrypt_payload(&bob.identity, &alice_id, "alice-1", &entry, b"m1")
            .unwrap();

        bob.encryptor.confirm_message_processed(b"m1").unwrap();
        bob.encryptor.confirm_message_processed(b"m1").unwrap();
        bob.encryptor.confirm_message_processed(b"never-seen").unwrap();

        let err = bob
            .encryptor
            .decrypt_payload(&bob.identity, &alice_id, "alice-1", &entry, b"m1")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyAlreadyConsumedOrPruned);
    }

    #[test]
    fn bundle_rotation_and_timestamps() {
        let mut config = ProtocolConfig::new("bob-1");
        config.bundle_refresh_interval = std::time::Duration::from_nanos(1);
        let store = Arc::new(MemoryKeyStore::new());
        let encryptor = Encryptor::new(store.clone(), config);
        let bob = Identity::generate();
        let bob_id = bob.public_key_bytes();
        let installation = Installation {
            id: "bob-1".into(),
            identity: bob_id.to_vec(),
            version: PROTOCOL_VERSION,
            enabled: true,
            timestamp: 0,
        };

        let first = encryptor.create_bundle(&bob, &[installation.clone()]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let second = encryptor.create_bundle(&bob, &[installation]).unwrap();

        assert!(second.timestamp > first.timestamp);
        assert_eq!(first.signed_pre_keys["bob-1"].version, 1);
        assert_eq!(second.signed_pre_keys["bob-1"].version, 2);

        // The rotated-out private key still opens late handshakes.
        assert!(store
            .private_key_for_signed_pre_key(&first.signed_pre_keys["bob-1"].signed_pre_key)
            .unwrap()
            .is_some());
    }

    #[test]
    fn short_pre_key_rejects_bundle() {
        let alice = side("alice-1");
        let bob = Identity::generate();
        let bob_id = bob.public_key_bytes();

        let mut signed_pre_keys = BTreeMap::new();
        signed_pre_keys.insert(
            "bob-1".to_string(),
            SignedPreKey {
                signed_pre_key: vec![7; 31],
                version: 1,
                protocol_version: PROTOCOL_VERSION,
            },
        );
        let bundle = build_bundle(&bob, signed_pre_keys, 1);
        recover_identity(&bundle).unwrap();

        let err = alice.encryptor.process_public_bundle(&bundle).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
        assert!(alice
            .encryptor
            .store
            .latest_signed_pre_key(&bob_id, "bob-1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn restarted_handshake_replaces_session() {
        let alice = side("alice-1");
        let bob = side("bob-1");
        let alice_id = alice.identity.public_key_bytes();
        let bob_id = bob.identity.public_key_bytes();

        let first = handshake(&alice, &bob);
        bob.encryptor
            .decrypt_payload(&bob.identity, &alice_id, "alice-1", &first, b"m1")
            .unwrap();

        // Same installation after losing its sessions, same signed pre-key on Bob's side.
        let restarted = Side {
            identity: Identity::from_secret_bytes(alice.identity.secret_key_bytes()),
            encryptor: Encryptor::new(
                Arc::new(MemoryKeyStore::new()),
                ProtocolConfig::new("alice-1"),
            ),
        };
        let second = handshake(&restarted, &bob);
        assert_eq!(
            second.x3dh_header.as_ref().unwrap().id,
            first.x3dh_header.as_ref().unwrap().id
        );
        assert_ne!(
            second.x3dh_header.as_ref().unwrap().key,
            first.x3dh_header.as_ref().unwrap().key
        );

        let plaintext = bob
            .encryptor
            .decrypt_payload(&bob.identity, &alice_id, "alice-1", &second, b"m2")
            .unwrap();
        assert_eq!(plaintext, b"hello");

        let (mut replies, _) = bob
            .encryptor
            .encrypt_payload(&bob.identity, &alice_id, &[me(&alice, "alice-1")], b"welcome back")
            .unwrap();
        let reply = replies.remove("alice-1").unwrap();
        assert_eq!(
            restarted
                .encryptor
                .decrypt_payload(&restarted.identity, &bob_id, "bob-1", &reply, b"m3")
                .unwrap(),
            b"welcome back"
        );
    }
}
