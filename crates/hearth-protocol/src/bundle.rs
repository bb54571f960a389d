use std::collections::BTreeMap;

use hearth_crypto::{x3dh, Identity};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::ProtocolError;
use crate::message::{Bundle, BundleContainer, SignedPreKey};
use crate::PROTOCOL_VERSION;

/// Bytes covered by a bundle signature.
///
/// For each installation in ascending id order: the id, the signed pre-key
/// bytes and the decimal version. Then the decimal timestamp. Verifiers
/// rebuild the same bytes, so the layout must never change.
pub fn signature_material(signed_pre_keys: &BTreeMap<String, SignedPreKey>, timestamp: i64) -> Vec<u8> {
    let mut material = Vec::new();
    for (installation_id, pre_key) in signed_pre_keys {
        material.extend_from_slice(installation_id.as_bytes());
        material.extend_from_slice(&pre_key.signed_pre_key);
        material.extend_from_slice(pre_key.version.to_string().as_bytes());
    }
    material.extend_from_slice(timestamp.to_string().as_bytes());
    material
}

/// Assemble and sign a bundle.
pub fn build_bundle(
    identity: &Identity,
    signed_pre_keys: BTreeMap<String, SignedPreKey>,
    timestamp: i64,
) -> Bundle {
    let signature = identity
        .sign(&signature_material(&signed_pre_keys, timestamp))
        .to_bytes()
        .to_vec();
    Bundle {
        identity: identity.public_key_bytes().to_vec(),
        signed_pre_keys,
        signature,
        timestamp,
    }
}

/// Generate a fresh signed pre-key for `installation_id` and wrap it in a
/// single-installation bundle.
pub fn new_bundle_container(
    identity: &Identity,
    installation_id: &str,
    version: u32,
    timestamp: i64,
) -> BundleContainer {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&secret);

    let mut signed_pre_keys = BTreeMap::new();
    signed_pre_keys.insert(
        installation_id.to_string(),
        SignedPreKey {
            signed_pre_key: public.as_bytes().to_vec(),
            version,
            protocol_version: PROTOCOL_VERSION,
        },
    );

    BundleContainer {
        bundle: build_bundle(identity, signed_pre_keys, timestamp),
        private_signed_pre_key: secret.to_bytes(),
    }
}

/// Check the bundle's signature against its declared identity.
pub fn verify_bundle(bundle: &Bundle) -> Result<(), ProtocolError> {
    let material = signature_material(&bundle.signed_pre_keys, bundle.timestamp);
    Identity::verify(&bundle.identity, &material, &bundle.signature)
        .map_err(|e| ProtocolError::SignatureInvalid(e.to_string()))
}

/// Resolve the identity that signed `bundle`.
///
/// The declared key is decoded and re-encoded; an encoding that does not
/// survive the round trip names a different identity than it claims and is
/// reported as [`ProtocolError::IdentityMismatch`]. The signature is then
/// checked against the recovered key.
pub fn recover_identity(bundle: &Bundle) -> Result<[u8; 32], ProtocolError> {
    let recovered = Identity::canonical_public_key(&bundle.identity)
        .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;
    if recovered.as_slice() != bundle.identity.as_slice() {
        return Err(ProtocolError::IdentityMismatch);
    }
    verify_bundle(bundle)?;
    Ok(recovered)
}

/// Result of starting a handshake against one installation of a bundle.
pub struct ActiveX3dh {
    pub shared_secret: [u8; 32],
    pub ephemeral_public: [u8; 32],
    pub signed_pre_key: [u8; 32],
}

/// Verify `bundle` and run X3DH against the signed pre-key of `installation_id`.
pub fn perform_active_x3dh(
    bundle: &Bundle,
    installation_id: &str,
    my_identity: &Identity,
) -> Result<ActiveX3dh, ProtocolError> {
    verify_bundle(bundle)?;
    let pre_key = bundle
        .signed_pre_keys
        .get(installation_id)
        .ok_or(ProtocolError::DeviceNotFound)?;
    x3dh_with_pre_key(&bundle.identity, &pre_key.signed_pre_key, my_identity)
}

/// Run X3DH against a signed pre-key that was verified when it was stored.
pub(crate) fn x3dh_with_pre_key(
    their_identity: &[u8],
    signed_pre_key: &[u8],
    my_identity: &Identity,
) -> Result<ActiveX3dh, ProtocolError> {
    let signed_pre_key = to_key(signed_pre_key, "signed pre-key")?;
    let their_identity = Identity::peer_ed25519_to_x25519(their_identity)?;
    let (shared_secret, ephemeral) = x3dh::perform_active_x3dh(
        &their_identity,
        &PublicKey::from(signed_pre_key),
        &my_identity.to_x25519_secret(),
    )?;
    Ok(ActiveX3dh {
        shared_secret,
        ephemeral_public: ephemeral.to_bytes(),
        signed_pre_key,
    })
}

pub(crate) fn to_key(bytes: &[u8], what: &str) -> Result<[u8; 32], ProtocolError> {
    bytes
        .try_into()
        .map_err(|_| ProtocolError::MalformedMessage(format!("{what} must be 32 bytes")))
}

/// Current unix time in nanoseconds.
pub(crate) fn timestamp_now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .try_into()
        .unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn fresh_bundle_verifies() {
        let identity = Identity::generate();
        let container = new_bundle_container(&identity, "device-1", 1, 1_000);

        assert_eq!(
            recover_identity(&container.bundle).unwrap(),
            identity.public_key_bytes()
        );
        let pre_key = &container.bundle.signed_pre_keys["device-1"];
        assert_eq!(pre_key.version, 1);
        assert_eq!(pre_key.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn tampered_pre_key_is_detected() {
        let identity = Identity::generate();
        let mut bundle = new_bundle_container(&identity, "device-1", 1, 1_000).bundle;
        if let Some(pre_key) = bundle.signed_pre_keys.get_mut("device-1") {
            pre_key.signed_pre_key[0] ^= 0x01;
        }
        assert_eq!(
            recover_identity(&bundle).unwrap_err().kind(),
            ErrorKind::SignatureInvalid
        );
    }

    #[test]
    fn tampered_timestamp_is_detected() {
        let identity = Identity::generate();
        let mut bundle = new_bundle_container(&identity, "device-1", 1, 1_000).bundle;
        bundle.timestamp += 1;
        assert!(verify_bundle(&bundle).is_err());
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let alice = Identity::generate();
        let mallory = Identity::generate();
        let mut bundle = new_bundle_container(&mallory, "device-1", 1, 1_000).bundle;
        bundle.identity = alice.public_key_bytes().to_vec();
        assert_eq!(
            recover_identity(&bundle).unwrap_err().kind(),
            ErrorKind::SignatureInvalid
        );
    }

    #[test]
    fn non_canonical_identity_is_a_mismatch() {
        let identity = Identity::generate();
        let mut bundle = new_bundle_container(&identity, "device-1", 1, 1_000).bundle;

        // y = p + 1, a second encoding of the point y = 1.
        let mut declared = vec![0xffu8; 32];
        declared[0] = 0xee;
        declared[31] = 0x7f;
        bundle.identity = declared;

        let err = recover_identity(&bundle).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IdentityMismatch);
        assert!(err.is_fatal());
    }

    #[test]
    fn signature_material_layout() {
        let mut keys = BTreeMap::new();
        keys.insert(
            "b".to_string(),
            SignedPreKey {
                signed_pre_key: vec![2],
                version: 12,
                protocol_version: 1,
            },
        );
        keys.insert(
            "a".to_string(),
            SignedPreKey {
                signed_pre_key: vec![1],
                version: 3,
                protocol_version: 1,
            },
        );
        assert_eq!(signature_material(&keys, 77), b"a\x013b\x021277".to_vec());
    }

    #[test]
    fn active_x3dh_requires_known_installation() {
        let bob = Identity::generate();
        let alice = Identity::generate();
        let bundle = new_bundle_container(&bob, "bob-1", 1, 5).bundle;

        let outcome = perform_active_x3dh(&bundle, "bob-1", &alice).unwrap();
        assert_eq!(
            outcome.signed_pre_key.as_slice(),
            bundle.signed_pre_keys["bob-1"].signed_pre_key.as_slice()
        );
        assert_eq!(
            perform_active_x3dh(&bundle, "bob-2", &alice)
                .err()
                .map(|e| e.kind()),
            Some(ErrorKind::DeviceNotFound)
        );
    }

    #[test]
    fn active_x3dh_rejects_bad_signature() {
        let bob = Identity::generate();
        let alice = Identity::generate();
        let mut bundle = new_bundle_container(&bob, "bob-1", 1, 5).bundle;
        bundle.signature[0] ^= 0xff;
        assert_eq!(
            perform_active_x3dh(&bundle, "bob-1", &alice)
                .err()
                .map(|e| e.kind()),
            Some(ErrorKind::SignatureInvalid)
        );
    }
}
