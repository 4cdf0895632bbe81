//! Authenticated encryption for message bodies and sealed state snapshots.
//!
//! XChaCha20-Poly1305 is the default; AES-256-GCM is accepted for peers that
//! advertise it in the envelope's `algo` field. Both append a 16-byte tag.

use std::fmt;
use std::str::FromStr;

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::XChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AeadAlgorithm {
    #[default]
    XChaCha20Poly1305,
    Aes256Gcm,
}

impl AeadAlgorithm {
    /// Name written into the envelope's `algo` field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::XChaCha20Poly1305 => "xchacha20poly1305",
            Self::Aes256Gcm => "aes256gcm",
        }
    }

    pub fn nonce_len(self) -> usize {
        match self {
            Self::XChaCha20Poly1305 => 24,
            Self::Aes256Gcm => 12,
        }
    }
}

impl fmt::Display for AeadAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AeadAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xchacha20poly1305" => Ok(Self::XChaCha20Poly1305),
            "aes256gcm" => Ok(Self::Aes256Gcm),
            other => Err(CryptoError::InvalidKey(format!(
                "unsupported AEAD algorithm: {other}"
            ))),
        }
    }
}

/// A fresh random nonce of the algorithm's length.
pub fn random_nonce(algorithm: AeadAlgorithm) -> Vec<u8> {
    let mut nonce = vec![0u8; algorithm.nonce_len()];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

fn check_nonce(algorithm: AeadAlgorithm, nonce: &[u8]) -> Result<(), CryptoError> {
    if nonce.len() == algorithm.nonce_len() {
        Ok(())
    } else {
        Err(CryptoError::InvalidNonce {
            expected: algorithm.nonce_len(),
            actual: nonce.len(),
        })
    }
}

/// Encrypt `plaintext`, authenticating `aad` alongside it.
///
/// Returns `ciphertext || 16-byte tag`.
pub fn seal(
    algorithm: AeadAlgorithm,
    key: &[u8; 32],
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    check_nonce(algorithm, nonce)?;
    let payload = Payload { msg: plaintext, aad };
    let sealed = match algorithm {
        AeadAlgorithm::XChaCha20Poly1305 => {
            XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key))
                .encrypt(chacha20poly1305::XNonce::from_slice(nonce), payload)
        }
        AeadAlgorithm::Aes256Gcm => Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key))
            .encrypt(aes_gcm::Nonce::from_slice(nonce), payload),
    };
    sealed.map_err(|e| CryptoError::EncryptionError(e.to_string()))
}

/// Decrypt and authenticate output of [`seal`].
///
/// Any tag mismatch (wrong key, nonce or aad, or a modified ciphertext)
/// surfaces as [`CryptoError::DecryptionError`].
pub fn open(
    algorithm: AeadAlgorithm,
    key: &[u8; 32],
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    check_nonce(algorithm, nonce)?;
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::DecryptionError("ciphertext too short".into()));
    }
    let payload = Payload { msg: ciphertext, aad };
    let opened = match algorithm {
        AeadAlgorithm::XChaCha20Poly1305 => {
            XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key))
                .decrypt(chacha20poly1305::XNonce::from_slice(nonce), payload)
        }
        AeadAlgorithm::Aes256Gcm => Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key))
            .decrypt(aes_gcm::Nonce::from_slice(nonce), payload),
    };
    opened.map_err(|e| CryptoError::DecryptionError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALGORITHMS: [AeadAlgorithm; 2] =
        [AeadAlgorithm::XChaCha20Poly1305, AeadAlgorithm::Aes256Gcm];

    #[test]
    fn seal_open_across_block_boundaries() {
        let key = [7u8; 32];
        for algorithm in ALGORITHMS {
            for len in [0usize, 1, 55, 56, 57, 63, 64, 65, 120, 128, 184, 1000] {
                let plaintext: Vec<u8> = (0..len).map(|i| u8::try_from(i % 251).unwrap()).collect();
                let nonce = random_nonce(algorithm);
                let sealed = seal(algorithm, &key, &nonce, b"aad", &plaintext).unwrap();
                assert_eq!(sealed.len(), len + TAG_LEN);
                let opened = open(algorithm, &key, &nonce, b"aad", &sealed).unwrap();
                assert_eq!(opened, plaintext, "{algorithm} len {len}");
            }
        }
    }

    #[test]
    fn modified_aad_rejected() {
        for algorithm in ALGORITHMS {
            let nonce = random_nonce(algorithm);
            let sealed = seal(algorithm, &[1u8; 32], &nonce, b"header", b"body").unwrap();
            assert!(open(algorithm, &[1u8; 32], &nonce, b"headex", &sealed).is_err());
        }
    }

    #[test]
    fn modified_ciphertext_rejected() {
        let algorithm = AeadAlgorithm::XChaCha20Poly1305;
        let nonce = random_nonce(algorithm);
        let mut sealed = seal(algorithm, &[1u8; 32], &nonce, b"", b"don't tamper with me").unwrap();
        sealed[3] ^= 0x01;
        assert!(matches!(
            open(algorithm, &[1u8; 32], &nonce, b"", &sealed),
            Err(CryptoError::DecryptionError(_))
        ));
    }

    #[test]
    fn wrong_key_rejected() {
        let algorithm = AeadAlgorithm::Aes256Gcm;
        let nonce = random_nonce(algorithm);
        let sealed = seal(algorithm, &[1u8; 32], &nonce, b"", b"secret").unwrap();
        assert!(open(algorithm, &[2u8; 32], &nonce, b"", &sealed).is_err());
    }

    #[test]
    fn nonce_length_enforced() {
        let result = seal(AeadAlgorithm::Aes256Gcm, &[0u8; 32], &[0u8; 24], b"", b"x");
        assert!(matches!(
            result,
            Err(CryptoError::InvalidNonce { expected: 12, actual: 24 })
        ));
    }

    #[test]
    fn short_ciphertext_rejected() {
        let nonce = random_nonce(AeadAlgorithm::XChaCha20Poly1305);
        let result = open(AeadAlgorithm::XChaCha20Poly1305, &[0u8; 32], &nonce, b"", &[0u8; 10]);
        assert!(result.is_err());
    }

    #[test]
    fn algorithm_names_parse_back() {
        for algorithm in ALGORITHMS {
            assert_eq!(algorithm.as_str().parse::<AeadAlgorithm>().unwrap(), algorithm);
        }
        assert!("rot13".parse::<AeadAlgorithm>().is_err());
    }
}
