use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("verification failed: {0}")]
    VerificationError(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("decryption failed: {0}")]
    DecryptionError(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid nonce: expected {expected} bytes, got {actual}")]
    InvalidNonce { expected: usize, actual: usize },
}
