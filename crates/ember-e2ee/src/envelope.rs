//! Wire format of one encrypted message.
//!
//! The sender's identity and ephemeral public keys and the signed prekey it
//! targeted travel inside `aad` as an [`AadHeader`], so they are covered by
//! the AEAD tag. The
//! recipient recovers everything it needs for re-derivation from `keyRef` plus
//! that header.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::E2eeError;

/// Encrypted message as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: String,
    #[serde(with = "base64_bytes")]
    pub aad: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    pub key_ref: String,
    pub e2ee_ver: u32,
    pub algo: String,
    pub sender_device_id: String,
}

impl Envelope {
    pub fn to_json(&self) -> Result<String, E2eeError> {
        serde_json::to_string(self).map_err(|e| E2eeError::MalformedEnvelope(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, E2eeError> {
        serde_json::from_str(json).map_err(|e| E2eeError::MalformedEnvelope(e.to_string()))
    }
}

/// Which local prekey an envelope was addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRef {
    /// A single-use prekey, consumed by the first successful decrypt.
    OneTime([u8; 32]),
    /// The current or previous signed prekey.
    Signed([u8; 32]),
}

impl KeyRef {
    const ONE_TIME_PREFIX: &'static str = "otk:";
    const SIGNED_PREFIX: &'static str = "spk:";
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OneTime(key) => write!(f, "{}{}", Self::ONE_TIME_PREFIX, hex::encode(key)),
            Self::Signed(key) => write!(f, "{}{}", Self::SIGNED_PREFIX, hex::encode(key)),
        }
    }
}

impl FromStr for KeyRef {
    type Err = E2eeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (encoded, one_time) = if let Some(rest) = s.strip_prefix(Self::ONE_TIME_PREFIX) {
            (rest, true)
        } else if let Some(rest) = s.strip_prefix(Self::SIGNED_PREFIX) {
            (rest, false)
        } else {
            return Err(E2eeError::MalformedEnvelope(format!("unknown key reference: {s}")));
        };

        let mut key = [0u8; 32];
        hex::decode_to_slice(encoded, &mut key)
            .map_err(|e| E2eeError::MalformedEnvelope(format!("key reference {s}: {e}")))?;
        Ok(if one_time {
            Self::OneTime(key)
        } else {
            Self::Signed(key)
        })
    }
}

/// Authenticated header carried as the envelope's `aad`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AadHeader {
    pub v: u32,
    pub sender: String,
    pub recipient: String,
    pub message_id: String,
    pub sender_device: String,
    /// Hex of the sender's Ed25519 identity public key.
    pub sender_identity: String,
    /// Hex of the sender's ephemeral X25519 public key.
    pub ephemeral: String,
    /// Hex of the recipient signed prekey the sender used.
    pub signed_prekey: String,
    pub key_ref: String,
}

impl AadHeader {
    pub fn encode(&self) -> Result<Vec<u8>, E2eeError> {
        serde_json::to_vec(self).map_err(|e| E2eeError::MalformedEnvelope(e.to_string()))
    }

    /// Parse the header out of an envelope's aad.
    ///
    /// A header that does not parse has been altered in transit, so this is a
    /// [`E2eeError::DecryptionFailed`] rather than a malformed-envelope error.
    pub fn decode(aad: &[u8]) -> Result<Self, E2eeError> {
        serde_json::from_slice(aad).map_err(|e| {
            tracing::debug!(error = %e, "aad header did not parse");
            E2eeError::DecryptionFailed
        })
    }

    /// The header must describe the envelope it arrived in, addressed to us.
    pub fn check_against(&self, envelope: &Envelope, local_user: &str) -> Result<(), E2eeError> {
        let consistent = self.v == envelope.e2ee_ver
            && self.message_id == envelope.message_id
            && self.key_ref == envelope.key_ref
            && self.sender_device == envelope.sender_device_id
            && self.recipient == local_user;
        if consistent {
            Ok(())
        } else {
            tracing::debug!(
                message_id = %envelope.message_id,
                "aad header disagrees with envelope fields"
            );
            Err(E2eeError::DecryptionFailed)
        }
    }

    pub fn sender_identity_key(&self) -> Result<[u8; 32], E2eeError> {
        decode_header_key(&self.sender_identity)
    }

    pub fn ephemeral_key(&self) -> Result<[u8; 32], E2eeError> {
        decode_header_key(&self.ephemeral)
    }

    pub fn signed_prekey_key(&self) -> Result<[u8; 32], E2eeError> {
        decode_header_key(&self.signed_prekey)
    }
}

fn decode_header_key(encoded: &str) -> Result<[u8; 32], E2eeError> {
    let mut key = [0u8; 32];
    hex::decode_to_slice(encoded, &mut key).map_err(|_| E2eeError::DecryptionFailed)?;
    Ok(key)
}

/// Transport-supplied hints accompanying an inbound envelope.
///
/// None of these are trusted. `sender_id` must agree with the authenticated
/// header; `session_id` is advisory and only logged when it disagrees with
/// the envelope's key reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecryptContext {
    pub sender_id: Option<String>,
    pub sender_device_id: Option<String>,
    pub session_id: Option<String>,
}

impl DecryptContext {
    pub fn from_sender(sender_id: impl Into<String>, sender_device_id: impl Into<String>) -> Self {
        Self {
            sender_id: Some(sender_id.into()),
            sender_device_id: Some(sender_device_id.into()),
            session_id: None,
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
