use thiserror::Error;

/// Failure of a single engine call.
///
/// Every variant is terminal for the call that produced it. Callers retry
/// `KeyMaterialUnavailable` and `DecryptionFailed` later by re-submitting the
/// same envelope; nothing here falls back to an unauthenticated path.
#[derive(Debug, Error)]
pub enum E2eeError {
    #[error("peer bundle signature did not verify")]
    InvalidSignature,

    #[error("peer has no one-time prekeys left; cannot send securely")]
    PrekeyExhausted,

    #[error("no sent-message key recorded for this message")]
    SessionNotFound,

    #[error("local key material referenced by the envelope is unavailable")]
    KeyMaterialUnavailable,

    #[error("envelope failed authentication")]
    DecryptionFailed,

    #[error("peer {0} has no registered device")]
    NoDeviceBundle(String),

    #[error("device is not provisioned")]
    NotProvisioned,

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("prekey directory error: {0}")]
    Directory(String),

    #[error("secure storage error: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Crypto(#[from] ember_crypto::CryptoError),
}
