use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::NO_INSTALLATION_ID;

/// Settings for one installation's protocol instance.
///
/// Everything a [`Protocol`](crate::Protocol) needs is passed in here; there
/// is no ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// This device's installation id. Must be unique per identity.
    pub installation_id: String,

    /// Most installations per identity that messages and bundles fan out to.
    pub max_installations: usize,

    /// Most message keys one receive may skip ahead.
    pub max_skip: u32,

    /// Stored message keys older than this many insertions are purged.
    pub max_keep: u32,

    /// Most stored message keys per session.
    pub max_message_keys_per_session: usize,

    /// How long our signed pre-key is used before it is rotated.
    pub bundle_refresh_interval: Duration,

    /// Most hash-chain positions a single community message may derive.
    pub max_hash_ratchet_skip: u32,

    /// Milliseconds a new hash-ratchet key id is bumped past the previous one
    /// when the clock alone would not make it larger.
    pub key_id_bump: u64,

    /// How often our bundle should be re-advertised to peers.
    pub bundle_advertise_interval: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            installation_id: String::new(),
            max_installations: 3,
            max_skip: 1000,
            max_keep: 3000,
            max_message_keys_per_session: 2000,
            bundle_refresh_interval: Duration::from_secs(24 * 60 * 60),
            max_hash_ratchet_skip: 100_000,
            key_id_bump: 1000,
            bundle_advertise_interval: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl ProtocolConfig {
    pub fn new(installation_id: impl Into<String>) -> Self {
        Self {
            installation_id: installation_id.into(),
            ..Self::default()
        }
    }

    /// Validates all configuration values.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.installation_id.is_empty() {
            return Err(ProtocolError::InvalidConfig(
                "installation_id must not be empty".into(),
            ));
        }
        if self.installation_id == NO_INSTALLATION_ID {
            return Err(ProtocolError::InvalidConfig(format!(
                "installation_id must not be the reserved id {NO_INSTALLATION_ID:?}"
            )));
        }
        if self.max_installations == 0 {
            return Err(ProtocolError::InvalidConfig(
                "max_installations must be greater than 0".into(),
            ));
        }
        if self.max_skip == 0 {
            return Err(ProtocolError::InvalidConfig(
                "max_skip must be greater than 0".into(),
            ));
        }
        if self.max_keep == 0 || self.max_message_keys_per_session == 0 {
            return Err(ProtocolError::InvalidConfig(
                "message key retention bounds must be greater than 0".into(),
            ));
        }
        if self.bundle_refresh_interval.is_zero() {
            return Err(ProtocolError::InvalidConfig(
                "bundle_refresh_interval must be greater than 0".into(),
            ));
        }
        if self.key_id_bump == 0 {
            return Err(ProtocolError::InvalidConfig(
                "key_id_bump must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn ratchet_limits(&self) -> hearth_crypto::RatchetLimits {
        hearth_crypto::RatchetLimits {
            max_skip: self.max_skip,
            max_keep: u64::from(self.max_keep),
            max_message_keys_per_session: self.max_message_keys_per_session,
        }
    }
}
