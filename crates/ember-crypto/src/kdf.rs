//! Per-message key derivation for the prekey handshake.
//!
//! `HKDF-SHA256(salt = 0^32, ikm = 0xFF^32 || DH1 || DH2 || ..., info)`, where
//! `info` is the configured label followed by the length-prefixed message
//! context. Binding the context means a secret derived for one
//! (sender, recipient, message) can never open another.

use hkdf::Hkdf;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// Fewer terms than this would let the handshake skip the one-time prekey.
pub const MIN_DH_TERMS: usize = 2;

/// Who, to whom, and which message a derived key belongs to.
#[derive(Debug, Clone, Copy)]
pub struct MessageContext<'a> {
    pub sender: &'a str,
    pub recipient: &'a str,
    pub message_id: &'a str,
    pub sender_identity: &'a [u8],
    pub recipient_identity: &'a [u8],
    pub ephemeral_public: &'a [u8; 32],
}

impl MessageContext<'_> {
    fn encode_info(&self, label: &str) -> Vec<u8> {
        let mut info = Vec::with_capacity(label.len() + 200);
        info.extend_from_slice(label.as_bytes());
        for field in [
            self.sender.as_bytes(),
            self.recipient.as_bytes(),
            self.message_id.as_bytes(),
            self.sender_identity,
            self.recipient_identity,
            self.ephemeral_public.as_slice(),
        ] {
            // Field lengths are bounded by the transport; u32 prefixes keep
            // adjacent fields from sliding into each other.
            let len = u32::try_from(field.len()).unwrap_or(u32::MAX);
            info.extend_from_slice(&len.to_be_bytes());
            info.extend_from_slice(field);
        }
        info
    }
}

/// A 32-byte symmetric key derived for exactly one message.
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct MessageKey([u8; 32]);

impl MessageKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageKey(..)")
    }
}

impl Serialize for MessageKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(hex::encode(self.0));
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for MessageKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(encoded.as_str(), &mut bytes).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

/// Derive the message key from the handshake's DH outputs.
pub fn derive_message_key(
    label: &str,
    dh_terms: &[&[u8; 32]],
    context: &MessageContext<'_>,
) -> Result<MessageKey, CryptoError> {
    if dh_terms.len() < MIN_DH_TERMS {
        return Err(CryptoError::KeyDerivation(format!(
            "handshake needs at least {MIN_DH_TERMS} DH terms, got {}",
            dh_terms.len()
        )));
    }

    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * (dh_terms.len() + 1)));
    ikm.extend_from_slice(&[0xFF; 32]);
    for term in dh_terms {
        ikm.extend_from_slice(term.as_slice());
    }

    let salt = [0u8; 32];
    let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    let mut okm = [0u8; 32];
    hk.expand(&context.encode_info(label), &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(format!("HKDF expand failed: {e}")))?;
    Ok(MessageKey(okm))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context<'a>(message_id: &'a str, ephemeral: &'a [u8; 32]) -> MessageContext<'a> {
        MessageContext {
            sender: "alice",
            recipient: "bob",
            message_id,
            sender_identity: &[8u8; 32],
            recipient_identity: &[9u8; 32],
            ephemeral_public: ephemeral,
        }
    }

    #[test]
    fn deterministic_for_same_inputs() {
        let eph = [3u8; 32];
        let terms: [&[u8; 32]; 2] = [&[1u8; 32], &[2u8; 32]];
        let a = derive_message_key("ember-e2ee-v1", &terms, &context("m1", &eph)).unwrap();
        let b = derive_message_key("ember-e2ee-v1", &terms, &context("m1", &eph)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn context_is_bound() {
        let eph = [3u8; 32];
        let terms: [&[u8; 32]; 2] = [&[1u8; 32], &[2u8; 32]];
        let m1 = derive_message_key("ember-e2ee-v1", &terms, &context("m1", &eph)).unwrap();
        let m2 = derive_message_key("ember-e2ee-v1", &terms, &context("m2", &eph)).unwrap();
        assert_ne!(m1, m2);

        let relabeled = derive_message_key("other-app", &terms, &context("m1", &eph)).unwrap();
        assert_ne!(m1, relabeled);

        let other_sender = MessageContext {
            sender_identity: &[7u8; 32],
            ..context("m1", &eph)
        };
        let reissued = derive_message_key("ember-e2ee-v1", &terms, &other_sender).unwrap();
        assert_ne!(m1, reissued);
    }

    #[test]
    fn field_boundaries_do_not_collide() {
        let eph = [3u8; 32];
        let terms: [&[u8; 32]; 2] = [&[1u8; 32], &[2u8; 32]];
        let a = MessageContext {
            sender: "ab",
            recipient: "c",
            ..context("m", &eph)
        };
        let b = MessageContext {
            sender: "a",
            recipient: "bc",
            ..context("m", &eph)
        };
        assert_ne!(
            derive_message_key("l", &terms, &a).unwrap(),
            derive_message_key("l", &terms, &b).unwrap()
        );
    }

    #[test]
    fn single_term_rejected() {
        let eph = [3u8; 32];
        let result = derive_message_key("l", &[&[1u8; 32]], &context("m", &eph));
        assert!(matches!(result, Err(CryptoError::KeyDerivation(_))));
    }
}
