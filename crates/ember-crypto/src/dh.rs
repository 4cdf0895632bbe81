use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// An X25519 keypair used for prekeys and ephemeral handshake keys.
#[derive(Clone, ZeroizeOnDrop)]
pub struct DhKeyPair {
    secret: StaticSecret,
    #[zeroize(skip)]
    public: PublicKey,
}

impl DhKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    /// X25519 with a peer public key.
    ///
    /// Rejects non-contributory results (low-order peer points), which would
    /// otherwise yield an all-zero shared secret any observer can compute.
    pub fn diffie_hellman(
        &self,
        their_public: &[u8; 32],
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*their_public));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey(
                "peer public key is a low-order point".into(),
            ));
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

/// Interpret a byte slice as an X25519 public key.
pub fn public_key_from_slice(bytes: &[u8], what: &str) -> Result<[u8; 32], CryptoError> {
    bytes.try_into().map_err(|_| {
        CryptoError::InvalidKey(format!("{what} must be 32 bytes, got {}", bytes.len()))
    })
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public", &self.public_hex())
            .finish()
    }
}

impl Serialize for DhKeyPair {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(hex::encode(self.secret.as_bytes()));
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for DhKeyPair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        let mut bytes = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(encoded.as_str(), bytes.as_mut_slice())
            .map_err(serde::de::Error::custom)?;
        Ok(Self::from_secret_bytes(*bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_agreement_is_symmetric() {
        let alice = DhKeyPair::generate();
        let bob = DhKeyPair::generate();

        let shared_a = alice.diffie_hellman(&bob.public_bytes()).unwrap();
        let shared_b = bob.diffie_hellman(&alice.public_bytes()).unwrap();
        assert_eq!(*shared_a, *shared_b);
    }

    #[test]
    fn low_order_point_rejected() {
        let alice = DhKeyPair::generate();
        assert!(alice.diffie_hellman(&[0u8; 32]).is_err());
    }

    #[test]
    fn secret_bytes_restore_same_public() {
        let pair = DhKeyPair::generate();
        let json = serde_json::to_string(&pair).unwrap();
        let restored: DhKeyPair = serde_json::from_str(&json).unwrap();
        assert_eq!(pair.public_bytes(), restored.public_bytes());
    }

    #[test]
    fn public_key_from_slice_checks_length() {
        assert!(public_key_from_slice(&[1u8; 31], "prekey").is_err());
        assert_eq!(public_key_from_slice(&[1u8; 32], "prekey").unwrap(), [1u8; 32]);
    }
}
