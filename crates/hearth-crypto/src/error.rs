use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("verification failed: {0}")]
    VerificationError(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("decryption failed: {0}")]
    DecryptionError(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("ratchet session error: {0}")]
    SessionError(String),

    #[error("key storage error: {0}")]
    StorageError(String),

    /// The header asks for more skipped message keys than a single receive may derive.
    #[error("too many messages")]
    SkipLimitExceeded,

    /// The message key was used and confirmed, or evicted by a retention bound.
    #[error("bad until: probably an out-of-order message that was deleted")]
    KeyAlreadyConsumedOrPruned,
}
