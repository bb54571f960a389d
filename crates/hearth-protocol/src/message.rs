//! Wire shapes produced and consumed by the protocol.
//!
//! The transport carries a [`ProtocolMessage`] inside its own envelope;
//! `to_bytes`/`from_bytes` give the JSON encoding used between installations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKey {
    pub signed_pre_key: Vec<u8>,
    pub version: u32,
    pub protocol_version: u32,
}

/// A signed set of per-installation pre-keys for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub identity: Vec<u8>,
    /// Keyed by installation id. The map's order is the signature order.
    pub signed_pre_keys: BTreeMap<String, SignedPreKey>,
    pub signature: Vec<u8>,
    /// Unix time in nanoseconds.
    pub timestamp: i64,
}

/// Our own bundle together with the private half of our signed pre-key.
/// Never transmitted.
#[derive(Clone)]
pub struct BundleContainer {
    pub bundle: Bundle,
    pub private_signed_pre_key: [u8; 32],
}

impl std::fmt::Debug for BundleContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleContainer")
            .field("bundle", &self.bundle)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct X3dhHeader {
    /// Initiator's ephemeral public key.
    pub key: Vec<u8>,
    /// Signed pre-key the handshake was run against.
    pub id: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrHeader {
    /// Sender's current ratchet public key.
    pub key: Vec<u8>,
    pub n: u32,
    pub pn: u32,
    /// Signed pre-key that identifies the session.
    pub id: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhHeader {
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HrHeader {
    pub key_id: u64,
    /// Zero marks a key-exchange payload.
    pub seq_no: u32,
    pub group_id: Vec<u8>,
}

/// One per-installation entry of a direct message.
///
/// The populated headers select the mode: `x3dh_header` + `dr_header` for a
/// handshake, `dr_header` alone once the session is running, `dh_header` for
/// the single-DH fallback, `hr_header` for community traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessageProtocol {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x3dh_header: Option<X3dhHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dr_header: Option<DrHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dh_header: Option<DhHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hr_header: Option<HrHeader>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub installation_id: String,
    #[serde(default)]
    pub bundles: Vec<Bundle>,
    #[serde(default)]
    pub direct_message: BTreeMap<String, DirectMessageProtocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_message: Option<Vec<u8>>,
}

impl ProtocolMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
    }
}

/// A hash-ratchet key as carried in a key-exchange payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HrKey {
    pub key_id: u64,
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HrKeys {
    pub keys: Vec<HrKey>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_headers_are_omitted() {
        let entry = DirectMessageProtocol {
            dh_header: Some(DhHeader { key: vec![1, 2] }),
            payload: vec![9],
            ..Default::default()
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("dhHeader"));
        assert!(!json.contains("drHeader"));
        assert!(!json.contains("x3dhHeader"));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = ProtocolMessage::from_bytes(b"not json").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::MalformedMessage);
    }

    #[test]
    fn public_message_survives_encoding() {
        let message = ProtocolMessage {
            installation_id: "device-1".into(),
            public_message: Some(b"hello all".to_vec()),
            ..Default::default()
        };
        let decoded = ProtocolMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }
}
