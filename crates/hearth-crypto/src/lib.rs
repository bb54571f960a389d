pub mod aead;
pub mod error;
pub mod hash_ratchet;
pub mod identity;
pub mod ratchet;
pub mod x3dh;

pub use error::CryptoError;
pub use identity::Identity;
pub use ratchet::{
    DefaultRatchetCrypto, DoubleRatchetSession, MemoryRatchetStore, MessageHeader,
    RatchetCrypto, RatchetLimits, RatchetMessage, RatchetState, RatchetStore,
};
