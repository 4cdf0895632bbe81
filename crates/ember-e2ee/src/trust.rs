use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::prekeys::DeviceBundle;

/// Last cryptographic identity validated for a peer user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerFingerprint {
    pub device_id: String,
    pub identity_key: Vec<u8>,
    pub signed_prekey: Vec<u8>,
    pub updated_at: u64,
}

impl PeerFingerprint {
    pub fn from_bundle(bundle: &DeviceBundle, updated_at: u64) -> Self {
        Self {
            device_id: bundle.device_id.clone(),
            identity_key: bundle.identity_key.clone(),
            signed_prekey: bundle.signed_prekey.clone(),
            updated_at,
        }
    }

    pub fn identity_hex(&self) -> String {
        hex::encode(&self.identity_key)
    }
}

/// Outcome of recording a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustChange {
    /// First fingerprint ever seen for this peer.
    NewPeer,
    Unchanged,
    /// Same device and identity, new signed prekey.
    SignedPrekeyRotated,
    /// Same identity key under a different device id.
    DeviceChanged,
    /// The identity key differs from the one on record. Callers surface this
    /// to the user as a safety-number change.
    IdentityChanged,
    /// Older than the entry on record; nothing was written.
    Stale,
}

impl TrustChange {
    /// Whether the change must be surfaced as a trust-change signal.
    pub fn is_trust_change(self) -> bool {
        matches!(self, Self::DeviceChanged | Self::IdentityChanged)
    }
}

/// Trust-on-first-use cache keyed by peer user id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustCache {
    peers: HashMap<String, PeerFingerprint>,
}

impl TrustCache {
    pub fn get(&self, peer_id: &str) -> Option<&PeerFingerprint> {
        self.peers.get(peer_id)
    }

    /// Record `fingerprint` for `peer_id`, last-write-wins on `updated_at`.
    ///
    /// Re-applying the same fingerprint is a no-op reported as `Unchanged`.
    pub fn upsert(&mut self, peer_id: &str, fingerprint: PeerFingerprint) -> TrustChange {
        let change = match self.peers.get(peer_id) {
            None => TrustChange::NewPeer,
            Some(current) if current.updated_at > fingerprint.updated_at => {
                return TrustChange::Stale;
            }
            Some(current) if current.identity_key != fingerprint.identity_key => {
                TrustChange::IdentityChanged
            }
            Some(current) if current.device_id != fingerprint.device_id => {
                TrustChange::DeviceChanged
            }
            Some(current) if current.signed_prekey != fingerprint.signed_prekey => {
                TrustChange::SignedPrekeyRotated
            }
            Some(_) => TrustChange::Unchanged,
        };
        self.peers.insert(peer_id.to_string(), fingerprint);
        change
    }

    /// Fold in entries from another copy (e.g. reloaded from storage).
    pub fn merge(&mut self, other: TrustCache) {
        for (peer_id, fingerprint) in other.peers {
            self.upsert(&peer_id, fingerprint);
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(device: &str, identity: u8, spk: u8, at: u64) -> PeerFingerprint {
        PeerFingerprint {
            device_id: device.into(),
            identity_key: vec![identity; 32],
            signed_prekey: vec![spk; 32],
            updated_at: at,
        }
    }

    #[test]
    fn first_sighting_is_new_peer() {
        let mut cache = TrustCache::default();
        assert_eq!(cache.upsert("bob", fingerprint("phone", 1, 1, 10)), TrustChange::NewPeer);
        assert_eq!(cache.get("bob").unwrap().device_id, "phone");
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut cache = TrustCache::default();
        cache.upsert("bob", fingerprint("phone", 1, 1, 10));
        assert_eq!(cache.upsert("bob", fingerprint("phone", 1, 1, 10)), TrustChange::Unchanged);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn identity_change_distinguished_from_new_peer() {
        let mut cache = TrustCache::default();
        cache.upsert("bob", fingerprint("phone", 1, 1, 10));

        let change = cache.upsert("bob", fingerprint("phone", 2, 2, 20));
        assert_eq!(change, TrustChange::IdentityChanged);
        assert!(change.is_trust_change());
        assert_eq!(cache.get("bob").unwrap().identity_key, vec![2u8; 32]);
    }

    #[test]
    fn device_and_prekey_changes() {
        let mut cache = TrustCache::default();
        cache.upsert("bob", fingerprint("phone", 1, 1, 10));
        assert_eq!(
            cache.upsert("bob", fingerprint("tablet", 1, 1, 11)),
            TrustChange::DeviceChanged
        );

        let rotated = cache.upsert("bob", fingerprint("tablet", 1, 9, 12));
        assert_eq!(rotated, TrustChange::SignedPrekeyRotated);
        assert!(!rotated.is_trust_change());
    }

    #[test]
    fn older_write_loses() {
        let mut cache = TrustCache::default();
        cache.upsert("bob", fingerprint("phone", 2, 2, 50));
        assert_eq!(cache.upsert("bob", fingerprint("phone", 1, 1, 40)), TrustChange::Stale);
        assert_eq!(cache.get("bob").unwrap().identity_key, vec![2u8; 32]);
    }

    #[test]
    fn merge_keeps_newest() {
        let mut local = TrustCache::default();
        local.upsert("bob", fingerprint("phone", 1, 1, 10));
        local.upsert("carol", fingerprint("laptop", 3, 3, 90));

        let mut stored = TrustCache::default();
        stored.upsert("bob", fingerprint("phone", 2, 2, 20));
        stored.upsert("carol", fingerprint("laptop", 4, 4, 80));
        stored.upsert("dave", fingerprint("watch", 5, 5, 5));

        local.merge(stored);
        assert_eq!(local.get("bob").unwrap().identity_key, vec![2u8; 32]);
        assert_eq!(local.get("carol").unwrap().identity_key, vec![3u8; 32]);
        assert!(local.get("dave").is_some());
    }
}
