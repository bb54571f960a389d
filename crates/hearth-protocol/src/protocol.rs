//! The protocol façade an application talks to.
//!
//! Builds outgoing messages for every relevant installation and turns
//! incoming [`ProtocolMessage`]s back into plaintext.

use std::sync::Arc;
use std::time::SystemTime;

use hearth_crypto::hash_ratchet::KEY_EXCHANGE_SEQ_NO;
use hearth_crypto::Identity;
use parking_lot::Mutex;

use crate::bundle::recover_identity;
use crate::config::ProtocolConfig;
use crate::encryptor::Encryptor;
use crate::error::ProtocolError;
use crate::hash_ratchet::{HashRatchet, HashRatchetInfo};
use crate::message::{Bundle, DirectMessageProtocol, HrHeader, ProtocolMessage};
use crate::multidevice::{Installation, InstallationMetadata, Multidevice};
use crate::shared_secret::{Secret, SharedSecretAgreement};
use crate::store::KeyStore;
use crate::{NO_INSTALLATION_ID, SHARED_SECRET_NEGOTIATION_VERSION};

/// An outgoing message and what it was built for.
#[derive(Debug, Clone)]
pub struct ProtocolMessageSpec {
    pub message: ProtocolMessage,
    /// Installations that received a ratchet entry.
    pub installations: Vec<Installation>,
    pub shared_secret: Option<Secret>,
    /// Every targeted peer installation has confirmed `shared_secret`.
    pub agreed_secret: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DecryptMessageResponse {
    pub decrypted_message: Option<Vec<u8>>,
    /// Installations first seen in this message's bundles.
    pub installations: Vec<Installation>,
    pub shared_secrets: Vec<Secret>,
    pub hash_ratchet_info: Option<HashRatchetInfo>,
}

pub struct Protocol<S: ?Sized> {
    config: ProtocolConfig,
    store: Arc<S>,
    encryptor: Encryptor<S>,
    multidevice: Multidevice<S>,
    secrets: SharedSecretAgreement<S>,
    hash_ratchet: HashRatchet<S>,
    last_advertised: Mutex<Option<SystemTime>>,
}

impl<S: KeyStore + ?Sized> Protocol<S> {
    pub fn new(store: Arc<S>, config: ProtocolConfig) -> Result<Self, ProtocolError> {
        config.validate()?;
        Ok(Self {
            encryptor: Encryptor::new(store.clone(), config.clone()),
            multidevice: Multidevice::new(
                store.clone(),
                config.installation_id.clone(),
                config.max_installations,
            ),
            secrets: SharedSecretAgreement::new(store.clone()),
            hash_ratchet: HashRatchet::new(
                store.clone(),
                config.max_hash_ratchet_skip,
                config.key_id_bump,
            ),
            store,
            config,
            last_advertised: Mutex::new(None),
        })
    }

    pub fn installation_id(&self) -> &str {
        &self.config.installation_id
    }

    /// Our current bundle, rotating the signed pre-key when it is due.
    pub fn get_bundle(&self, my_identity: &Identity) -> Result<Bundle, ProtocolError> {
        let installations = self
            .multidevice
            .our_active_installations(&my_identity.public_key_bytes())?;
        self.encryptor.create_bundle(my_identity, &installations)
    }

    /// Verify and store a bundle. Returns the installations it introduced.
    ///
    /// Installations of our own identity start disabled until paired.
    pub fn process_public_bundle(
        &self,
        my_identity: &Identity,
        bundle: &Bundle,
    ) -> Result<Vec<Installation>, ProtocolError> {
        let identity = recover_identity(bundle).inspect_err(|e| {
            tracing::warn!(
                identity = %hex::encode(&bundle.identity),
                error = %e,
                "rejected bundle"
            );
        })?;
        self.encryptor.process_public_bundle(bundle)?;

        let mine = identity == my_identity.public_key_bytes();
        let discovered: Vec<Installation> = bundle
            .signed_pre_keys
            .iter()
            .filter(|(id, _)| !(mine && id.as_str() == self.config.installation_id))
            .map(|(id, pre_key)| Installation {
                id: id.clone(),
                identity: identity.to_vec(),
                version: pre_key.protocol_version,
                enabled: true,
                timestamp: bundle.timestamp,
            })
            .collect();

        self.multidevice
            .add_installations(&identity, bundle.timestamp, &discovered, !mine)
    }

    /// Encrypt `payload` for every active installation of `their_identity`
    /// and for our own other paired installations.
    pub fn build_direct_message(
        &self,
        my_identity: &Identity,
        their_identity: &[u8],
        payload: &[u8],
    ) -> Result<ProtocolMessageSpec, ProtocolError> {
        let my_id = my_identity.public_key_bytes();
        let to_self = their_identity == my_id.as_slice();

        let their_installations = self.multidevice.active_installations(their_identity)?;
        let (mut entries, mut targeted) = self.encryptor.encrypt_payload(
            my_identity,
            their_identity,
            &their_installations,
            payload,
        )?;
        let peer_ids: Vec<String> = targeted.iter().map(|i| i.id.clone()).collect();

        if peer_ids.is_empty() {
            entries.insert(
                NO_INSTALLATION_ID.to_string(),
                self.encryptor.encrypt_with_dh(their_identity, payload)?,
            );
        }

        if !to_self {
            let ours = self.multidevice.our_active_installations(&my_id)?;
            let (own_entries, own_targeted) =
                self.encryptor
                    .encrypt_payload(my_identity, &my_id, &ours, payload)?;
            entries.extend(own_entries);
            targeted.extend(own_targeted);
        }

        let (shared_secret, agreed_secret) = if to_self {
            (None, false)
        } else {
            let (secret, agreed) = self.secrets.agreed(my_identity, their_identity, &peer_ids)?;
            (Some(secret), agreed)
        };

        tracing::info!(
            identity = %hex::encode(their_identity),
            installations = targeted.len(),
            agreed_secret,
            "built direct message"
        );
        Ok(ProtocolMessageSpec {
            message: ProtocolMessage {
                installation_id: self.config.installation_id.clone(),
                bundles: vec![self.get_bundle(my_identity)?],
                direct_message: entries,
                public_message: None,
            },
            installations: targeted,
            shared_secret,
            agreed_secret,
        })
    }

    /// A cleartext message carrying our bundle.
    pub fn build_public_message(
        &self,
        my_identity: &Identity,
        payload: &[u8],
    ) -> Result<ProtocolMessage, ProtocolError> {
        Ok(ProtocolMessage {
            installation_id: self.config.installation_id.clone(),
            bundles: vec![self.get_bundle(my_identity)?],
            direct_message: Default::default(),
            public_message: Some(payload.to_vec()),
        })
    }

    /// A message readable by any installation of `their_identity`, without
    /// a ratchet session.
    pub fn build_dh_message(
        &self,
        my_identity: &Identity,
        their_identity: &[u8],
        payload: &[u8],
    ) -> Result<ProtocolMessageSpec, ProtocolError> {
        let entry = self.encryptor.encrypt_with_dh(their_identity, payload)?;
        Ok(ProtocolMessageSpec {
            message: ProtocolMessage {
                installation_id: self.config.installation_id.clone(),
                bundles: vec![self.get_bundle(my_identity)?],
                direct_message: [(NO_INSTALLATION_ID.to_string(), entry)].into(),
                public_message: None,
            },
            installations: Vec::new(),
            shared_secret: None,
            agreed_secret: false,
        })
    }

    /// Process a message from `their_identity`.
    ///
    /// Bundles are ingested first. Public messages are returned as they are;
    /// otherwise the entry addressed to this installation (or the `"none"`
    /// entry) is decrypted.
    pub fn handle_message(
        &self,
        my_identity: &Identity,
        their_identity: &[u8],
        message: &ProtocolMessage,
        message_id: &[u8],
    ) -> Result<DecryptMessageResponse, ProtocolError> {
        let my_id = my_identity.public_key_bytes();
        let mut response = DecryptMessageResponse::default();

        for bundle in &message.bundles {
            response
                .installations
                .extend(self.process_public_bundle(my_identity, bundle)?);
        }

        if let Some(public) = &message.public_message {
            response.decrypted_message = Some(public.clone());
            return Ok(response);
        }

        if message.direct_message.is_empty() {
            return Err(ProtocolError::NoPayload);
        }
        let entry = message
            .direct_message
            .get(&self.config.installation_id)
            .or_else(|| message.direct_message.get(NO_INSTALLATION_ID))
            .ok_or(ProtocolError::DeviceNotFound)?;

        if their_identity == my_id.as_slice() && !self.is_paired(&my_id, &message.installation_id)? {
            tracing::warn!(
                installation_id = %message.installation_id,
                "message from an installation of ours that is not paired"
            );
            return Err(ProtocolError::NotPairedDevice);
        }

        if let Some(header) = &entry.hr_header {
            if header.seq_no != KEY_EXCHANGE_SEQ_NO {
                let plaintext = self.hash_ratchet.decrypt(
                    &header.group_id,
                    header.key_id,
                    header.seq_no,
                    &entry.payload,
                )?;
                response.decrypted_message = Some(plaintext);
                response.hash_ratchet_info = Some(HashRatchetInfo {
                    group_id: header.group_id.clone(),
                    key_ids: vec![header.key_id],
                });
                return Ok(response);
            }
        }

        let plaintext = self.encryptor.decrypt_payload(
            my_identity,
            their_identity,
            &message.installation_id,
            entry,
            message_id,
        )?;

        if let Some(header) = &entry.hr_header {
            let key_ids = self.hash_ratchet.handle_keys(&header.group_id, &plaintext)?;
            response.hash_ratchet_info = Some(HashRatchetInfo {
                group_id: header.group_id.clone(),
                key_ids,
            });
            return Ok(response);
        }

        if their_identity != my_id.as_slice()
            && self.sender_version(their_identity, &message.installation_id)?
                >= SHARED_SECRET_NEGOTIATION_VERSION
        {
            response.shared_secrets.push(self.secrets.generate(
                my_identity,
                their_identity,
                &message.installation_id,
            )?);
        }

        tracing::debug!(
            identity = %hex::encode(their_identity),
            installation_id = %message.installation_id,
            message_id = %hex::encode(message_id),
            "handled direct message"
        );
        response.decrypted_message = Some(plaintext);
        Ok(response)
    }

    fn is_paired(&self, my_id: &[u8], installation_id: &str) -> Result<bool, ProtocolError> {
        Ok(self
            .multidevice
            .our_installations(my_id)?
            .iter()
            .any(|i| i.id == installation_id && i.enabled))
    }

    /// Protocol version the sender advertised with its current signed pre-key.
    fn sender_version(&self, identity: &[u8], installation_id: &str) -> Result<u32, ProtocolError> {
        Ok(self
            .store
            .latest_signed_pre_key(identity, installation_id)?
            .map_or(0, |k| k.protocol_version))
    }

    /// The application has processed `message_id`; its key may go.
    pub fn confirm_message_processed(&self, message_id: &[u8]) -> Result<(), ProtocolError> {
        self.encryptor.confirm_message_processed(message_id)
    }

    pub fn enable_installation(
        &self,
        my_identity: &Identity,
        installation_id: &str,
    ) -> Result<(), ProtocolError> {
        self.multidevice
            .enable_installation(&my_identity.public_key_bytes(), installation_id)
    }

    pub fn disable_installation(
        &self,
        my_identity: &Identity,
        installation_id: &str,
    ) -> Result<(), ProtocolError> {
        self.multidevice
            .disable_installation(&my_identity.public_key_bytes(), installation_id)
    }

    /// Enable or disable an installation of another identity.
    pub fn set_peer_installation_enabled(
        &self,
        their_identity: &[u8],
        installation_id: &str,
        enabled: bool,
    ) -> Result<(), ProtocolError> {
        if enabled {
            self.multidevice.enable_installation(their_identity, installation_id)
        } else {
            self.multidevice.disable_installation(their_identity, installation_id)
        }
    }

    pub fn our_installations(&self, my_identity: &Identity) -> Result<Vec<Installation>, ProtocolError> {
        self.multidevice
            .our_installations(&my_identity.public_key_bytes())
    }

    pub fn set_installation_metadata(
        &self,
        my_identity: &Identity,
        installation_id: &str,
        metadata: &InstallationMetadata,
    ) -> Result<(), ProtocolError> {
        self.multidevice.set_installation_metadata(
            &my_identity.public_key_bytes(),
            installation_id,
            metadata,
        )
    }

    pub fn set_installation_name(
        &self,
        my_identity: &Identity,
        installation_id: &str,
        name: &str,
    ) -> Result<(), ProtocolError> {
        self.multidevice
            .set_installation_name(&my_identity.public_key_bytes(), installation_id, name)
    }

    /// Every shared secret we hold, for propagation on start-up.
    pub fn shared_secrets(&self) -> Result<Vec<Secret>, ProtocolError> {
        self.secrets.all()
    }

    pub fn generate_hash_ratchet_key(&self, group_id: &[u8]) -> Result<u64, ProtocolError> {
        self.hash_ratchet.generate_key(group_id)
    }

    pub fn hash_ratchet_key_ids(&self, group_id: &[u8]) -> Result<Vec<u64>, ProtocolError> {
        self.hash_ratchet.key_ids(group_id)
    }

    pub fn drop_hash_ratchet_key(&self, group_id: &[u8], key_id: u64) -> Result<(), ProtocolError> {
        self.hash_ratchet.drop_key(group_id, key_id)
    }

    /// Send hash-ratchet key generations to `their_identity` over the
    /// direct channel.
    pub fn build_hash_ratchet_key_exchange_message(
        &self,
        my_identity: &Identity,
        their_identity: &[u8],
        group_id: &[u8],
        key_ids: &[u64],
    ) -> Result<ProtocolMessageSpec, ProtocolError> {
        let encoded = self.hash_ratchet.encoded_keys(group_id, key_ids)?;
        let mut spec = self.build_direct_message(my_identity, their_identity, &encoded)?;

        let header = HrHeader {
            key_id: key_ids.iter().copied().max().unwrap_or_default(),
            seq_no: KEY_EXCHANGE_SEQ_NO,
            group_id: group_id.to_vec(),
        };
        for entry in spec.message.direct_message.values_mut() {
            entry.hr_header = Some(header.clone());
        }
        Ok(spec)
    }

    /// Encrypt a community message under the group's current key generation.
    pub fn build_hash_ratchet_message(
        &self,
        my_identity: &Identity,
        group_id: &[u8],
        payload: &[u8],
    ) -> Result<ProtocolMessage, ProtocolError> {
        let encrypted = self.hash_ratchet.encrypt(group_id, payload)?;
        let entry = DirectMessageProtocol {
            hr_header: Some(HrHeader {
                key_id: encrypted.key_id,
                seq_no: encrypted.seq_no,
                group_id: group_id.to_vec(),
            }),
            payload: encrypted.ciphertext,
            ..Default::default()
        };
        Ok(ProtocolMessage {
            installation_id: self.config.installation_id.clone(),
            bundles: vec![self.get_bundle(my_identity)?],
            direct_message: [(NO_INSTALLATION_ID.to_string(), entry)].into(),
            public_message: None,
        })
    }

    /// Whether our bundle is due to be advertised again at `now`.
    pub fn should_advertise_bundle(&self, now: SystemTime) -> bool {
        match *self.last_advertised.lock() {
            Some(last) => now
                .duration_since(last)
                .is_ok_and(|elapsed| elapsed >= self.config.bundle_advertise_interval),
            None => true,
        }
    }

    pub fn confirm_bundle_advertisement(&self, now: SystemTime) {
        *self.last_advertised.lock() = Some(now);
    }
}
