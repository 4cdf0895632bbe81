pub mod aead;
pub mod dh;
pub mod error;
pub mod identity;
pub mod kdf;

pub use aead::AeadAlgorithm;
pub use dh::DhKeyPair;
pub use error::CryptoError;
pub use identity::Identity;
pub use kdf::{MessageContext, MessageKey};
