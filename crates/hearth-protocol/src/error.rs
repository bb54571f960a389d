use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bundle signature is invalid: {0}")]
    SignatureInvalid(String),

    #[error("recovered identity does not match the bundle's declared identity")]
    IdentityMismatch,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("session not found")]
    SessionNotFound,

    #[error("device not found")]
    DeviceNotFound,

    #[error("message from an installation of ours that is not paired")]
    NotPairedDevice,

    #[error("message has no payload")]
    NoPayload,

    #[error("too many messages")]
    SkipLimitExceeded,

    #[error("bad until: probably an out-of-order message that was deleted")]
    KeyAlreadyConsumedOrPruned,

    #[error("hash ratchet key unavailable: group {group_id}, key {key_id}")]
    KeyGenerationUnavailable { group_id: String, key_id: u64 },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("key storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SignatureInvalid,
    IdentityMismatch,
    MalformedMessage,
    SessionNotFound,
    DeviceNotFound,
    NotPairedDevice,
    NoPayload,
    SkipLimitExceeded,
    KeyAlreadyConsumedOrPruned,
    KeyGenerationUnavailable,
    Crypto,
    Storage,
    Serialization,
    InvalidConfig,
}

impl ErrorKind {
    /// The bundle carrying this error must never be accepted.
    ///
    /// The library reports the condition; whether it ends the process is the
    /// caller's decision.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::IdentityMismatch)
    }

    /// The message that produced this error can never be decrypted; do not retry it.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            Self::SignatureInvalid
                | Self::IdentityMismatch
                | Self::MalformedMessage
                | Self::SkipLimitExceeded
                | Self::KeyAlreadyConsumedOrPruned
        )
    }
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            Self::IdentityMismatch => ErrorKind::IdentityMismatch,
            Self::MalformedMessage(_) => ErrorKind::MalformedMessage,
            Self::SessionNotFound => ErrorKind::SessionNotFound,
            Self::DeviceNotFound => ErrorKind::DeviceNotFound,
            Self::NotPairedDevice => ErrorKind::NotPairedDevice,
            Self::NoPayload => ErrorKind::NoPayload,
            Self::SkipLimitExceeded => ErrorKind::SkipLimitExceeded,
            Self::KeyAlreadyConsumedOrPruned => ErrorKind::KeyAlreadyConsumedOrPruned,
            Self::KeyGenerationUnavailable { .. } => ErrorKind::KeyGenerationUnavailable,
            Self::Crypto(_) => ErrorKind::Crypto,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }
}

impl From<hearth_crypto::CryptoError> for ProtocolError {
    fn from(e: hearth_crypto::CryptoError) -> Self {
        use hearth_crypto::CryptoError;
        match e {
            CryptoError::SkipLimitExceeded => Self::SkipLimitExceeded,
            CryptoError::KeyAlreadyConsumedOrPruned => Self::KeyAlreadyConsumedOrPruned,
            CryptoError::StorageError(msg) => Self::Storage(msg),
            other => Self::Crypto(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for ProtocolError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_crypto::CryptoError;

    #[test]
    fn ratchet_bounds_keep_their_kind() {
        let skip: ProtocolError = CryptoError::SkipLimitExceeded.into();
        assert_eq!(skip.kind(), ErrorKind::SkipLimitExceeded);
        assert_eq!(skip.to_string(), "too many messages");

        let pruned: ProtocolError = CryptoError::KeyAlreadyConsumedOrPruned.into();
        assert_eq!(pruned.kind(), ErrorKind::KeyAlreadyConsumedOrPruned);
        assert!(pruned.kind().is_permanent());
    }

    #[test]
    fn only_identity_mismatch_is_fatal() {
        assert!(ProtocolError::IdentityMismatch.is_fatal());
        assert!(!ProtocolError::SessionNotFound.is_fatal());
        assert!(!ProtocolError::SignatureInvalid("bad".into()).is_fatal());
    }

    #[test]
    fn other_crypto_errors_are_wrapped() {
        let err: ProtocolError = CryptoError::DecryptionError("tag mismatch".into()).into();
        assert_eq!(err.kind(), ErrorKind::Crypto);
        assert!(!err.kind().is_permanent());
    }
}
