//! Cross-device shared secret agreement.
//!
//! Both sides derive the same secret from their static identity keys. A
//! secret counts as agreed once it has been confirmed against every one of
//! the peer's installations we are sending to.

use std::sync::Arc;

use hearth_crypto::{x3dh, Identity};

use crate::error::ProtocolError;
use crate::store::SharedSecretStore;

#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    pub identity: Vec<u8>,
    pub key: [u8; 32],
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("identity", &hex::encode(&self.identity))
            .finish_non_exhaustive()
    }
}

pub struct SharedSecretAgreement<S: ?Sized> {
    store: Arc<S>,
}

impl<S: SharedSecretStore + ?Sized> SharedSecretAgreement<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    fn derive(my_identity: &Identity, their_identity: &[u8]) -> Result<[u8; 32], ProtocolError> {
        let their_public = Identity::peer_ed25519_to_x25519(their_identity)?;
        Ok(x3dh::perform_dh(&my_identity.to_x25519_secret(), &their_public)?)
    }

    /// Derive the secret with `their_identity` and record that
    /// `installation_id` has been seen using it.
    pub fn generate(
        &self,
        my_identity: &Identity,
        their_identity: &[u8],
        installation_id: &str,
    ) -> Result<Secret, ProtocolError> {
        let key = Self::derive(my_identity, their_identity)?;
        self.store
            .add_shared_secret(their_identity, &key, installation_id)?;
        Ok(Secret {
            identity: their_identity.to_vec(),
            key,
        })
    }

    /// The secret with `their_identity`, and whether every installation in
    /// `installation_ids` has confirmed it.
    pub fn agreed(
        &self,
        my_identity: &Identity,
        their_identity: &[u8],
        installation_ids: &[String],
    ) -> Result<(Secret, bool), ProtocolError> {
        let key = Self::derive(my_identity, their_identity)?;
        let agreed = match self.store.shared_secret(their_identity)? {
            Some(stored) => {
                !installation_ids.is_empty()
                    && stored.secret == key
                    && installation_ids
                        .iter()
                        .all(|id| stored.installation_ids.contains(id))
            }
            None => false,
        };
        Ok((
            Secret {
                identity: their_identity.to_vec(),
                key,
            },
            agreed,
        ))
    }

    pub fn all(&self) -> Result<Vec<Secret>, ProtocolError> {
        Ok(self
            .store
            .all_shared_secrets()?
            .into_iter()
            .map(|stored| Secret {
                identity: stored.identity,
                key: stored.secret,
            })
            .collect())
    }
}
