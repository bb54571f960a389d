use x25519_dalek::{PublicKey, StaticSecret};

use crate::aead::hkdf_32;
use crate::error::CryptoError;

const X3DH_INFO: &[u8] = b"hearth-x3dh-v1";
const DH_INFO: &[u8] = b"hearth-dh-v1";

/// Initiator side of X3DH.
///
/// The three DH outputs are concatenated in a fixed order before the KDF:
/// 1. DH(my identity, their signed pre-key)
/// 2. DH(my ephemeral, their identity)
/// 3. DH(my ephemeral, their signed pre-key)
///
/// The order is part of the wire contract with already-deployed responders.
pub fn active_x3dh(
    my_identity: &StaticSecret,
    their_signed_pre_key: &PublicKey,
    my_ephemeral: &StaticSecret,
    their_identity: &PublicKey,
) -> Result<[u8; 32], CryptoError> {
    let dh1 = my_identity.diffie_hellman(their_signed_pre_key);
    let dh2 = my_ephemeral.diffie_hellman(their_identity);
    let dh3 = my_ephemeral.diffie_hellman(their_signed_pre_key);

    let mut ikm = Vec::with_capacity(96);
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    hkdf_32(None, &ikm, X3DH_INFO)
}

/// Responder side of X3DH. Produces the same secret as [`active_x3dh`].
pub fn passive_x3dh(
    their_identity: &PublicKey,
    my_signed_pre_key: &StaticSecret,
    their_ephemeral: &PublicKey,
    my_identity: &StaticSecret,
) -> Result<[u8; 32], CryptoError> {
    let dh1 = my_signed_pre_key.diffie_hellman(their_identity);
    let dh2 = my_identity.diffie_hellman(their_ephemeral);
    let dh3 = my_signed_pre_key.diffie_hellman(their_ephemeral);

    let mut ikm = Vec::with_capacity(96);
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    hkdf_32(None, &ikm, X3DH_INFO)
}

/// Run [`active_x3dh`] with a freshly generated ephemeral key.
///
/// Returns the shared secret and the ephemeral public key the responder needs.
pub fn perform_active_x3dh(
    their_identity: &PublicKey,
    their_signed_pre_key: &PublicKey,
    my_identity: &StaticSecret,
) -> Result<([u8; 32], PublicKey), CryptoError> {
    let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let secret = active_x3dh(my_identity, their_signed_pre_key, &ephemeral, their_identity)?;
    Ok((secret, PublicKey::from(&ephemeral)))
}

/// Single-DH key agreement against `their_public` with a fresh ephemeral key.
pub fn perform_active_dh(their_public: &PublicKey) -> Result<([u8; 32], PublicKey), CryptoError> {
    let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let key = perform_dh(&ephemeral, their_public)?;
    Ok((key, PublicKey::from(&ephemeral)))
}

pub fn perform_dh(my_secret: &StaticSecret, their_public: &PublicKey) -> Result<[u8; 32], CryptoError> {
    let shared = my_secret.diffie_hellman(their_public);
    hkdf_32(None, shared.as_bytes(), DH_INFO)
}
