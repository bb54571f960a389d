//! Double Ratchet sessions.
//!
//! The engine is split along two seams so either side can be swapped:
//! [`RatchetCrypto`] supplies DH, the KDF chains and the AEAD, and
//! [`RatchetStore`] persists session state and skipped message keys.

mod crypto;
mod session;
mod state;
mod store;

pub use crypto::{DefaultRatchetCrypto, DhKeyPair, RatchetCrypto};
pub use session::{DoubleRatchetSession, RatchetLimits};
pub use state::{Chain, MessageHeader, RatchetMessage, RatchetState};
pub use store::{MemoryRatchetStore, RatchetStore, Retention, StoredMessageKey};
