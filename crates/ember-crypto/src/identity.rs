use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// A device's long-term Ed25519 identity.
///
/// Created once when the device is provisioned and never rotated. The public
/// half is what peers pin in their trust cache; the private half signs the
/// device's signed prekey.
#[derive(Clone, ZeroizeOnDrop)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore an identity from a 32-byte secret key.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the secret key bytes (for the secure storage collaborator).
    ///
    /// # Security
    /// Private key material; handle with care.
    pub fn secret_key_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Sign a message with this identity's private key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Verify a signature against a public key.
    pub fn verify(
        public_key: &VerifyingKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), CryptoError> {
        public_key
            .verify(message, signature)
            .map_err(|e| CryptoError::VerificationError(e.to_string()))
    }

    /// Verify a signature given as raw bytes, as carried in a prekey bundle.
    ///
    /// Wrong-length keys or signatures are verification failures, not
    /// malformed-input errors: a bundle that cannot be checked is untrusted.
    pub fn verify_signature_bytes(
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let key_bytes: [u8; 32] = public_key.try_into().map_err(|_| {
            CryptoError::VerificationError(format!(
                "identity key must be 32 bytes, got {}",
                public_key.len()
            ))
        })?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| CryptoError::VerificationError(format!("invalid identity key: {e}")))?;
        let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| {
            CryptoError::VerificationError(format!(
                "signature must be 64 bytes, got {}",
                signature.len()
            ))
        })?;
        Self::verify(&verifying_key, message, &Signature::from_bytes(&sig_bytes))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(hex::encode(self.secret_key_bytes()));
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        let mut bytes = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(encoded.as_str(), bytes.as_mut_slice())
            .map_err(serde::de::Error::custom)?;
        Ok(Self::from_secret_bytes(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_sign() {
        let identity = Identity::generate();
        let message = b"hello ember";

        let signature = identity.sign(message);
        assert!(Identity::verify(&identity.public_key(), message, &signature).is_ok());
    }

    #[test]
    fn roundtrip_secret_bytes() {
        let identity = Identity::generate();
        let bytes = *identity.secret_key_bytes();
        let restored = Identity::from_secret_bytes(&bytes);
        assert_eq!(identity.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn verify_signature_bytes_accepts_valid_signature() {
        let identity = Identity::generate();
        let signature = identity.sign(b"prekey");
        Identity::verify_signature_bytes(
            &identity.public_key_bytes(),
            b"prekey",
            &signature.to_bytes(),
        )
        .unwrap();
    }

    #[test]
    fn verify_signature_bytes_rejects_other_signer() {
        let signer = Identity::generate();
        let impostor = Identity::generate();
        let signature = impostor.sign(b"prekey");
        let result = Identity::verify_signature_bytes(
            &signer.public_key_bytes(),
            b"prekey",
            &signature.to_bytes(),
        );
        assert!(matches!(result, Err(CryptoError::VerificationError(_))));
    }

    #[test]
    fn verify_signature_bytes_rejects_truncated_signature() {
        let identity = Identity::generate();
        let signature = identity.sign(b"prekey").to_bytes();
        let result = Identity::verify_signature_bytes(
            &identity.public_key_bytes(),
            b"prekey",
            &signature[..63],
        );
        assert!(result.is_err());
    }

    #[test]
    fn serde_preserves_identity() {
        let identity = Identity::generate();
        let json = serde_json::to_string(&identity).unwrap();
        let restored: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(identity.public_key_bytes(), restored.public_key_bytes());
    }
}
