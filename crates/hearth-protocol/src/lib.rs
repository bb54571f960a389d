pub mod bundle;
pub mod config;
pub mod encryptor;
pub mod error;
pub mod hash_ratchet;
pub mod message;
pub mod multidevice;
pub mod protocol;
pub mod shared_secret;
pub mod store;

pub use config::ProtocolConfig;
pub use error::{ErrorKind, ProtocolError};
pub use hash_ratchet::HashRatchetInfo;
pub use message::{Bundle, DirectMessageProtocol, ProtocolMessage, SignedPreKey};
pub use multidevice::{Installation, InstallationMetadata};
pub use protocol::{DecryptMessageResponse, Protocol, ProtocolMessageSpec};
pub use shared_secret::Secret;
pub use store::{KeyStore, MemoryKeyStore, SqliteKeyStore};

/// Protocol version advertised in our signed pre-keys.
pub const PROTOCOL_VERSION: u32 = 1;

/// Senders at or above this version take part in shared-secret negotiation.
pub const SHARED_SECRET_NEGOTIATION_VERSION: u32 = 1;

/// Direct-message key used for entries that target no particular installation.
pub const NO_INSTALLATION_ID: &str = "none";
