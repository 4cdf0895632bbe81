//! This device's key material: identity, signed prekey and the one-time
//! prekey pool, plus the public bundle published to the prekey directory.

use ember_crypto::{DhKeyPair, Identity};
use serde::{Deserialize, Serialize};

use crate::envelope::KeyRef;
use crate::error::E2eeError;
use crate::state::now_millis;

/// A device's public keys as published to the prekey directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceBundle {
    pub device_id: String,
    /// Ed25519 identity public key.
    pub identity_key: Vec<u8>,
    /// X25519 signed prekey (public).
    pub signed_prekey: Vec<u8>,
    /// Signature over the signed prekey by the identity key.
    pub signed_prekey_signature: Vec<u8>,
    /// Present when the bundle came from a claim (or a non-consuming listing).
    pub one_time_prekey: Option<Vec<u8>>,
}

impl DeviceBundle {
    /// Check the signed prekey against the bundle's own identity key.
    pub fn verify(&self) -> Result<(), E2eeError> {
        Identity::verify_signature_bytes(
            &self.identity_key,
            &self.signed_prekey,
            &self.signed_prekey_signature,
        )
        .map_err(|e| {
            tracing::warn!(
                device = %self.device_id,
                identity = hex::encode(&self.identity_key),
                error = %e,
                "signed prekey signature rejected"
            );
            E2eeError::InvalidSignature
        })
    }

    /// Same device and same long-term keys, ignoring the one-time prekey.
    pub fn same_device_keys(&self, other: &Self) -> bool {
        self.device_id == other.device_id
            && self.identity_key == other.identity_key
            && self.signed_prekey == other.signed_prekey
            && self.signed_prekey_signature == other.signed_prekey_signature
    }
}

/// X25519 prekey signed by the device identity.
///
/// Until `signature` is set the device cannot publish a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPrekey {
    pub key: DhKeyPair,
    pub signature: Option<Vec<u8>>,
    pub created_at: u64,
}

impl SignedPrekey {
    pub fn unsigned() -> Self {
        Self {
            key: DhKeyPair::generate(),
            signature: None,
            created_at: now_millis(),
        }
    }

    pub fn generate(identity: &Identity) -> Self {
        let mut prekey = Self::unsigned();
        prekey.sign(identity);
        prekey
    }

    pub fn sign(&mut self, identity: &Identity) {
        let signature = identity.sign(&self.key.public_bytes());
        self.signature = Some(signature.to_bytes().to_vec());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePrekey {
    pub key: DhKeyPair,
    /// Whether the public half has reached the directory.
    pub uploaded: bool,
    pub created_at: u64,
}

/// Device Key Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceKeys {
    device_id: String,
    identity: Identity,
    signed_prekey: SignedPrekey,
    /// Kept after rotation so envelopes already in flight still open.
    previous_signed_prekey: Option<SignedPrekey>,
    one_time_prekeys: Vec<OneTimePrekey>,
}

impl DeviceKeys {
    /// Fresh identity, signed prekey and `one_time_prekeys` unuploaded OTKs.
    pub fn generate(device_id: impl Into<String>, one_time_prekeys: usize) -> Self {
        let identity = Identity::generate();
        let signed_prekey = SignedPrekey::generate(&identity);
        let mut keys = Self {
            device_id: device_id.into(),
            identity,
            signed_prekey,
            previous_signed_prekey: None,
            one_time_prekeys: Vec::new(),
        };
        keys.generate_one_time_prekeys(one_time_prekeys);
        keys
    }

    /// Assemble a key store from existing material.
    pub fn from_parts(
        device_id: impl Into<String>,
        identity: Identity,
        signed_prekey: SignedPrekey,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            identity,
            signed_prekey,
            previous_signed_prekey: None,
            one_time_prekeys: Vec::new(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn signed_prekey(&self) -> &SignedPrekey {
        &self.signed_prekey
    }

    pub fn one_time_prekey_count(&self) -> usize {
        self.one_time_prekeys.len()
    }

    /// The bundle to register with the directory.
    pub fn bundle(&self) -> Result<DeviceBundle, E2eeError> {
        let signature = self
            .signed_prekey
            .signature
            .clone()
            .ok_or(E2eeError::NotProvisioned)?;
        Ok(DeviceBundle {
            device_id: self.device_id.clone(),
            identity_key: self.identity.public_key_bytes().to_vec(),
            signed_prekey: self.signed_prekey.key.public_bytes().to_vec(),
            signed_prekey_signature: signature,
            one_time_prekey: None,
        })
    }

    /// Resolve a key reference to the private key it names.
    ///
    /// Consumed one-time prekeys are gone from the pool and never resolve.
    pub fn find_private_key_for_reference(&self, key_ref: &KeyRef) -> Option<&DhKeyPair> {
        match key_ref {
            KeyRef::OneTime(public) => self
                .one_time_prekeys
                .iter()
                .find(|otk| otk.key.public_bytes() == *public)
                .map(|otk| &otk.key),
            KeyRef::Signed(public) => std::iter::once(&self.signed_prekey)
                .chain(self.previous_signed_prekey.as_ref())
                .find(|spk| spk.key.public_bytes() == *public)
                .map(|spk| &spk.key),
        }
    }

    /// Remove a one-time prekey from the pool, returning it if it was present.
    pub fn consume_one_time_prekey(&mut self, public: &[u8; 32]) -> Option<OneTimePrekey> {
        let index = self
            .one_time_prekeys
            .iter()
            .position(|otk| otk.key.public_bytes() == *public)?;
        Some(self.one_time_prekeys.swap_remove(index))
    }

    /// Add `count` fresh OTKs to the pool; returns their public keys.
    pub fn generate_one_time_prekeys(&mut self, count: usize) -> Vec<[u8; 32]> {
        let created_at = now_millis();
        (0..count)
            .map(|_| {
                let key = DhKeyPair::generate();
                let public = key.public_bytes();
                self.one_time_prekeys.push(OneTimePrekey {
                    key,
                    uploaded: false,
                    created_at,
                });
                public
            })
            .collect()
    }

    /// Public keys of OTKs the directory has not acknowledged yet.
    pub fn pending_upload(&self) -> Vec<[u8; 32]> {
        self.one_time_prekeys
            .iter()
            .filter(|otk| !otk.uploaded)
            .map(|otk| otk.key.public_bytes())
            .collect()
    }

    pub fn mark_uploaded(&mut self, published: &[[u8; 32]]) {
        for otk in &mut self.one_time_prekeys {
            if published.contains(&otk.key.public_bytes()) {
                otk.uploaded = true;
            }
        }
    }

    /// Replace the signed prekey, keeping the old one as `previous`.
    pub fn rotate_signed_prekey(&mut self) {
        let next = SignedPrekey::generate(&self.identity);
        let previous = std::mem::replace(&mut self.signed_prekey, next);
        self.previous_signed_prekey = Some(previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_bundle_verifies() {
        let keys = DeviceKeys::generate("phone", 3);
        let bundle = keys.bundle().unwrap();
        assert_eq!(bundle.identity_key.len(), 32);
        assert_eq!(bundle.signed_prekey.len(), 32);
        assert_eq!(bundle.signed_prekey_signature.len(), 64);
        assert!(bundle.one_time_prekey.is_none());
        bundle.verify().unwrap();
    }

    #[test]
    fn tampered_bundle_rejected() {
        let keys = DeviceKeys::generate("phone", 0);
        let mut bundle = keys.bundle().unwrap();
        bundle.signed_prekey = DhKeyPair::generate().public_bytes().to_vec();
        assert!(matches!(bundle.verify(), Err(E2eeError::InvalidSignature)));

        let mut swapped = keys.bundle().unwrap();
        swapped.identity_key = Identity::generate().public_key_bytes().to_vec();
        assert!(matches!(swapped.verify(), Err(E2eeError::InvalidSignature)));
    }

    #[test]
    fn unsigned_prekey_cannot_publish() {
        let keys = DeviceKeys::from_parts("phone", Identity::generate(), SignedPrekey::unsigned());
        assert!(matches!(keys.bundle(), Err(E2eeError::NotProvisioned)));
    }

    #[test]
    fn consumed_prekey_no_longer_resolves() {
        let mut keys = DeviceKeys::generate("phone", 0);
        let publics = keys.generate_one_time_prekeys(3);
        let target = KeyRef::OneTime(publics[1]);

        assert!(keys.find_private_key_for_reference(&target).is_some());
        let consumed = keys.consume_one_time_prekey(&publics[1]).unwrap();
        assert_eq!(consumed.key.public_bytes(), publics[1]);

        assert!(keys.find_private_key_for_reference(&target).is_none());
        assert!(keys.consume_one_time_prekey(&publics[1]).is_none());
        assert_eq!(keys.one_time_prekey_count(), 2);
    }

    #[test]
    fn upload_tracking() {
        let mut keys = DeviceKeys::generate("phone", 2);
        let pending = keys.pending_upload();
        assert_eq!(pending.len(), 2);

        keys.mark_uploaded(&pending[..1]);
        assert_eq!(keys.pending_upload(), vec![pending[1]]);

        keys.mark_uploaded(&pending);
        assert!(keys.pending_upload().is_empty());
    }

    #[test]
    fn rotation_keeps_previous_signed_prekey() {
        let mut keys = DeviceKeys::generate("phone", 0);
        let old = keys.signed_prekey().key.public_bytes();
        keys.rotate_signed_prekey();
        let new = keys.signed_prekey().key.public_bytes();
        assert_ne!(old, new);

        assert!(keys.find_private_key_for_reference(&KeyRef::Signed(old)).is_some());
        assert!(keys.find_private_key_for_reference(&KeyRef::Signed(new)).is_some());

        keys.rotate_signed_prekey();
        assert!(keys.find_private_key_for_reference(&KeyRef::Signed(old)).is_none());
        keys.bundle().unwrap().verify().unwrap();
    }
}
