use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// A user's long-lived identity key pair.
///
/// The Ed25519 key signs bundles. Diffie-Hellman uses the X25519 form of the
/// same key, so a peer only ever needs the 32-byte compressed Edwards point.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore an identity from a 32-byte secret key.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// The compressed public key. This is what bundles carry as `identity`.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the secret key bytes.
    ///
    /// # Security
    /// Raw private key material. Do not log or persist unencrypted.
    pub fn secret_key_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Verify a detached signature made by the identity whose public key is `public_key`.
    pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let public_key: [u8; 32] = public_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity key must be 32 bytes".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&public_key)
            .map_err(|e| CryptoError::VerificationError(format!("invalid Ed25519 public key: {e}")))?;
        let signature = Signature::from_slice(signature)
            .map_err(|e| CryptoError::VerificationError(format!("malformed signature: {e}")))?;
        verifying_key
            .verify(message, &signature)
            .map_err(|e| CryptoError::VerificationError(e.to_string()))
    }

    /// Derive an X25519 static secret from this Ed25519 key for Diffie-Hellman.
    ///
    /// Uses the SHA-512-expanded scalar (same scalar that Ed25519 uses internally)
    /// so that `to_x25519_public()` matches `peer_ed25519_to_x25519()` via the
    /// standard Edwards→Montgomery birational map.
    pub fn to_x25519_secret(&self) -> x25519_dalek::StaticSecret {
        let scalar_bytes = self.signing_key.to_scalar_bytes();
        x25519_dalek::StaticSecret::from(scalar_bytes)
    }

    pub fn to_x25519_public(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(&self.to_x25519_secret())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Convert a peer's Ed25519 public key bytes to an X25519 public key.
    pub fn peer_ed25519_to_x25519(
        ed25519_public_bytes: &[u8],
    ) -> Result<x25519_dalek::PublicKey, CryptoError> {
        let bytes: [u8; 32] = ed25519_public_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity key must be 32 bytes".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&bytes).map_err(|e| {
            CryptoError::VerificationError(format!("invalid Ed25519 public key: {e}"))
        })?;
        let montgomery = verifying_key.to_montgomery();
        Ok(x25519_dalek::PublicKey::from(montgomery.to_bytes()))
    }

    /// Decode a compressed identity key and re-encode it in canonical form.
    ///
    /// Distinct byte strings can decode to the same curve point; only the
    /// canonical encoding names an identity.
    pub fn canonical_public_key(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
        let compressed = CompressedEdwardsY::from_slice(bytes)
            .map_err(|_| CryptoError::InvalidKey("identity key must be 32 bytes".into()))?;
        let point = compressed
            .decompress()
            .ok_or_else(|| CryptoError::InvalidKey("identity key is not a curve point".into()))?;
        Ok(point.compress().to_bytes())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_sign() {
        let identity = Identity::generate();
        let message = b"hello hearth";

        let signature = identity.sign(message);
        assert!(
            Identity::verify(&identity.public_key_bytes(), message, &signature.to_bytes()).is_ok()
        );
        assert!(
            Identity::verify(&identity.public_key_bytes(), b"tampered", &signature.to_bytes())
                .is_err()
        );
    }

    #[test]
    fn roundtrip_secret_bytes() {
        let identity = Identity::generate();
        let bytes = *identity.secret_key_bytes();
        let restored = Identity::from_secret_bytes(&bytes);
        assert_eq!(identity.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn peer_ed25519_to_x25519_matches_own_derivation() {
        let identity = Identity::generate();
        let from_secret = identity.to_x25519_public();
        let from_public = Identity::peer_ed25519_to_x25519(&identity.public_key_bytes()).unwrap();
        assert_eq!(from_secret.as_bytes(), from_public.as_bytes());
    }

    #[test]
    fn peer_x25519_dh_agreement() {
        let alice = Identity::generate();
        let bob = Identity::generate();

        let bob_x25519_pub = Identity::peer_ed25519_to_x25519(&bob.public_key_bytes()).unwrap();
        let alice_x25519_pub = Identity::peer_ed25519_to_x25519(&alice.public_key_bytes()).unwrap();

        let shared_a = alice.to_x25519_secret().diffie_hellman(&bob_x25519_pub);
        let shared_b = bob.to_x25519_secret().diffie_hellman(&alice_x25519_pub);

        assert_eq!(shared_a.as_bytes(), shared_b.as_bytes());
    }

    #[test]
    fn canonical_key_is_stable() {
        let identity = Identity::generate();
        let canonical = Identity::canonical_public_key(&identity.public_key_bytes()).unwrap();
        assert_eq!(canonical, identity.public_key_bytes());
    }

    #[test]
    fn non_canonical_encoding_is_rewritten() {
        // y = p + 1 decodes to the same point as y = 1.
        let mut non_canonical = [0xffu8; 32];
        non_canonical[0] = 0xee;
        non_canonical[31] = 0x7f;

        let canonical = Identity::canonical_public_key(&non_canonical).unwrap();
        assert_ne!(canonical, non_canonical);

        let mut one = [0u8; 32];
        one[0] = 1;
        assert_eq!(canonical, one);
    }

    #[test]
    fn wrong_length_key_rejected() {
        assert!(Identity::canonical_public_key(&[1u8; 31]).is_err());
        assert!(Identity::peer_ed25519_to_x25519(&[1u8; 33]).is_err());
    }
}
