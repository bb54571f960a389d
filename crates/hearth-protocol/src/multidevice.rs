//! Installation registry.
//!
//! Every installation ever seen for an identity is kept. Fan-out selects the
//! newest enabled ones, so disabling a device lets an older enabled one take
//! its place.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::store::InstallationStore;
use crate::PROTOCOL_VERSION;

/// One device of an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installation {
    pub id: String,
    pub identity: Vec<u8>,
    pub version: u32,
    pub enabled: bool,
    /// Last time the installation was advertised, in bundle nanoseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationMetadata {
    pub name: String,
    pub device_type: String,
    pub fcm_token: String,
}

pub struct Multidevice<S: ?Sized> {
    store: Arc<S>,
    installation_id: String,
    max_installations: usize,
}

impl<S: InstallationStore + ?Sized> Multidevice<S> {
    pub fn new(store: Arc<S>, installation_id: impl Into<String>, max_installations: usize) -> Self {
        Self {
            store,
            installation_id: installation_id.into(),
            max_installations,
        }
    }

    pub fn installation_id(&self) -> &str {
        &self.installation_id
    }

    fn own_installation(&self, identity: &[u8]) -> Installation {
        Installation {
            id: self.installation_id.clone(),
            identity: identity.to_vec(),
            version: PROTOCOL_VERSION,
            enabled: true,
            timestamp: 0,
        }
    }

    /// Enabled installations, newest first.
    fn newest_enabled(
        &self,
        identity: &[u8],
        limit: usize,
        exclude: Option<&str>,
    ) -> Result<Vec<Installation>, ProtocolError> {
        let mut enabled: Vec<Installation> = self
            .store
            .installations(identity)?
            .into_iter()
            .filter(|i| i.enabled && Some(i.id.as_str()) != exclude)
            .collect();
        enabled.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        enabled.truncate(limit);
        Ok(enabled)
    }

    /// The installations of `identity` messages fan out to.
    pub fn active_installations(&self, identity: &[u8]) -> Result<Vec<Installation>, ProtocolError> {
        self.newest_enabled(identity, self.max_installations, None)
    }

    /// Our other enabled installations plus this one, which is always last.
    pub fn our_active_installations(
        &self,
        identity: &[u8],
    ) -> Result<Vec<Installation>, ProtocolError> {
        let mut installations = self.newest_enabled(
            identity,
            self.max_installations.saturating_sub(1),
            Some(self.installation_id.as_str()),
        )?;
        installations.push(self.own_installation(identity));
        Ok(installations)
    }

    /// Every installation of ours we know about, enabled or not.
    pub fn our_installations(&self, identity: &[u8]) -> Result<Vec<Installation>, ProtocolError> {
        let mut installations: Vec<Installation> = self
            .store
            .installations(identity)?
            .into_iter()
            .filter(|i| i.id != self.installation_id)
            .collect();
        installations.sort_by(|a, b| a.id.cmp(&b.id));
        installations.push(self.own_installation(identity));
        Ok(installations)
    }

    /// Merge advertised installations into the registry.
    ///
    /// Returns the installations that were not known before. Known ones keep
    /// their enabled flag; their timestamp and version only move forward.
    pub fn add_installations(
        &self,
        identity: &[u8],
        timestamp: i64,
        discovered: &[Installation],
        enabled_by_default: bool,
    ) -> Result<Vec<Installation>, ProtocolError> {
        let known: HashMap<String, Installation> = self
            .store
            .installations(identity)?
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect();

        let mut added = Vec::new();
        for installation in discovered {
            if let Some(current) = known.get(&installation.id) {
                let updated = Installation {
                    version: current.version.max(installation.version),
                    timestamp: current.timestamp.max(timestamp),
                    ..current.clone()
                };
                if updated != *current {
                    self.store.upsert_installation(identity, &updated)?;
                }
                continue;
            }

            let new = Installation {
                id: installation.id.clone(),
                identity: identity.to_vec(),
                version: installation.version,
                enabled: enabled_by_default,
                timestamp,
            };
            self.store.upsert_installation(identity, &new)?;
            tracing::info!(
                identity = %hex::encode(identity),
                installation_id = %new.id,
                enabled = new.enabled,
                "discovered installation"
            );
            added.push(new);
        }
        Ok(added)
    }

    pub fn enable_installation(&self, identity: &[u8], installation_id: &str) -> Result<(), ProtocolError> {
        self.store.set_installation_enabled(identity, installation_id, true)
    }

    pub fn disable_installation(&self, identity: &[u8], installation_id: &str) -> Result<(), ProtocolError> {
        self.store.set_installation_enabled(identity, installation_id, false)
    }

    pub fn set_installation_metadata(
        &self,
        identity: &[u8],
        installation_id: &str,
        metadata: &InstallationMetadata,
    ) -> Result<(), ProtocolError> {
        self.store
            .set_installation_metadata(identity, installation_id, metadata)
    }

    /// Rename an installation, keeping the rest of its metadata.
    pub fn set_installation_name(
        &self,
        identity: &[u8],
        installation_id: &str,
        name: &str,
    ) -> Result<(), ProtocolError> {
        let mut metadata = self
            .store
            .installation_metadata(identity, installation_id)?
            .unwrap_or_default();
        metadata.name = name.to_string();
        self.store
            .set_installation_metadata(identity, installation_id, &metadata)
    }

    pub fn installation_metadata(
        &self,
        identity: &[u8],
        installation_id: &str,
    ) -> Result<Option<InstallationMetadata>, ProtocolError> {
        self.store.installation_metadata(identity, installation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyStore;

    const ALICE: [u8; 32] = [1; 32];

    fn registry() -> Multidevice<MemoryKeyStore> {
        Multidevice::new(Arc::new(MemoryKeyStore::new()), "me", 3)
    }

    fn advertised(id: &str, version: u32) -> Installation {
        Installation {
            id: id.into(),
            identity: ALICE.to_vec(),
            version,
            enabled: true,
            timestamp: 0,
        }
    }

    fn ids(installations: &[Installation]) -> Vec<&str> {
        installations.iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn fan_out_is_capped_to_newest() {
        let registry = registry();
        for (n, id) in ["d1", "d2", "d3", "d4"].iter().enumerate() {
            let ts = i64::try_from(n).unwrap() + 1;
            registry
                .add_installations(&ALICE, ts, &[advertised(id, 1)], true)
                .unwrap();
        }

        let active = registry.active_installations(&ALICE).unwrap();
        assert_eq!(ids(&active), vec!["d4", "d3", "d2"]);
    }

    #[test]
    fn disabling_slides_the_window() {
        let registry = registry();
        for (n, id) in ["d1", "d2", "d3", "d4"].iter().enumerate() {
            let ts = i64::try_from(n).unwrap() + 1;
            registry
                .add_installations(&ALICE, ts, &[advertised(id, 1)], true)
                .unwrap();
        }

        registry.disable_installation(&ALICE, "d4").unwrap();
        assert_eq!(
            ids(&registry.active_installations(&ALICE).unwrap()),
            vec!["d3", "d2", "d1"]
        );

        registry.enable_installation(&ALICE, "d4").unwrap();
        assert_eq!(
            ids(&registry.active_installations(&ALICE).unwrap()),
            vec!["d4", "d3", "d2"]
        );
    }

    #[test]
    fn known_installations_only_move_forward() {
        let registry = registry();
        let added = registry
            .add_installations(&ALICE, 10, &[advertised("d1", 2)], true)
            .unwrap();
        assert_eq!(added.len(), 1);

        registry.disable_installation(&ALICE, "d1").unwrap();
        let added = registry
            .add_installations(&ALICE, 5, &[advertised("d1", 1)], true)
            .unwrap();
        assert!(added.is_empty());

        let stored = registry.our_installations(&ALICE).unwrap();
        let d1 = stored.iter().find(|i| i.id == "d1").unwrap();
        assert_eq!(d1.timestamp, 10);
        assert_eq!(d1.version, 2);
        assert!(!d1.enabled);
    }

    #[test]
    fn own_installation_is_always_active() {
        let registry = registry();
        registry
            .add_installations(&ALICE, 1, &[advertised("other", 1)], false)
            .unwrap();

        assert_eq!(
            ids(&registry.our_active_installations(&ALICE).unwrap()),
            vec!["me"]
        );

        registry.enable_installation(&ALICE, "other").unwrap();
        assert_eq!(
            ids(&registry.our_active_installations(&ALICE).unwrap()),
            vec!["other", "me"]
        );
        assert_eq!(registry.our_installations(&ALICE).unwrap().len(), 2);
    }

    #[test]
    fn rename_keeps_other_metadata() {
        let registry = registry();
        registry
            .set_installation_metadata(
                &ALICE,
                "d1",
                &InstallationMetadata {
                    name: "old".into(),
                    device_type: "phone".into(),
                    fcm_token: "token".into(),
                },
            )
            .unwrap();
        registry.set_installation_name(&ALICE, "d1", "new").unwrap();

        let metadata = registry.installation_metadata(&ALICE, "d1").unwrap().unwrap();
        assert_eq!(metadata.name, "new");
        assert_eq!(metadata.device_type, "phone");
    }
}
