//! End-to-end encryption for Ember direct messages.
//!
//! A [`SessionEngine`] owns one device's keys and runs a fresh prekey
//! handshake per message. It talks to two collaborators: a
//! [`PrekeyDirectory`] on the backend and a [`StateStore`] for durable
//! device state.

pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod file_store;
pub mod memory_stores;
pub mod prekeys;
pub mod session;
pub mod state;
pub mod store;
pub mod trust;

pub use config::EngineConfig;
pub use engine::{Decrypted, EncryptOutcome, KeySource, SessionEngine};
pub use envelope::{AadHeader, DecryptContext, Envelope, KeyRef};
pub use error::E2eeError;
pub use file_store::FileStateStore;
pub use memory_stores::{MemoryDirectory, MemoryDirectoryClient, MemoryStateStore};
pub use prekeys::{DeviceBundle, DeviceKeys};
pub use session::SessionCache;
pub use state::DeviceState;
pub use store::{PrekeyDirectory, StateStore};
pub use trust::{PeerFingerprint, TrustCache, TrustChange};

pub use ember_crypto::AeadAlgorithm;
