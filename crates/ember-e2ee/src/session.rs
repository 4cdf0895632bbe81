//! Memoized message keys.
//!
//! Outbound keys are kept per message id so the sender can reopen its own
//! messages; inbound keys are kept per (sender, key reference) so duplicate
//! deliveries decrypt after the one-time prekey has been consumed. Both maps
//! are bounded and evict their oldest entry first.

use std::collections::HashMap;

use ember_crypto::MessageKey;
use serde::{Deserialize, Serialize};

/// Key and parameters recorded for one outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentMessageKey {
    pub key: MessageKey,
    pub nonce: Vec<u8>,
    pub aad: Vec<u8>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedMessageKey {
    pub key: MessageKey,
    pub created_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionCache {
    sent: HashMap<String, SentMessageKey>,
    /// sender id -> key reference -> key
    received: HashMap<String, HashMap<String, ReceivedMessageKey>>,
}

impl SessionCache {
    pub fn sent(&self, message_id: &str) -> Option<&SentMessageKey> {
        self.sent.get(message_id)
    }

    pub fn record_sent(&mut self, message_id: &str, entry: SentMessageKey, cap: usize) {
        self.sent.insert(message_id.to_string(), entry);
        while self.sent.len() > cap {
            let Some(oldest) = self
                .sent
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            self.sent.remove(&oldest);
        }
    }

    pub fn received(&self, sender_id: &str, key_ref: &str) -> Option<&MessageKey> {
        self.received
            .get(sender_id)
            .and_then(|by_ref| by_ref.get(key_ref))
            .map(|entry| &entry.key)
    }

    pub fn record_received(
        &mut self,
        sender_id: &str,
        key_ref: &str,
        entry: ReceivedMessageKey,
        cap: usize,
    ) {
        self.received
            .entry(sender_id.to_string())
            .or_default()
            .insert(key_ref.to_string(), entry);
        while self.received_len() > cap {
            if !self.evict_oldest_received() {
                break;
            }
        }
    }

    pub fn sent_len(&self) -> usize {
        self.sent.len()
    }

    pub fn received_len(&self) -> usize {
        self.received.values().map(HashMap::len).sum()
    }

    /// Union with entries from another copy; entries already present win.
    pub fn merge(&mut self, other: SessionCache) {
        for (message_id, entry) in other.sent {
            self.sent.entry(message_id).or_insert(entry);
        }
        for (sender_id, by_ref) in other.received {
            let mine = self.received.entry(sender_id).or_default();
            for (key_ref, entry) in by_ref {
                mine.entry(key_ref).or_insert(entry);
            }
        }
    }

    fn evict_oldest_received(&mut self) -> bool {
        let oldest = self
            .received
            .iter()
            .flat_map(|(sender, by_ref)| {
                by_ref
                    .iter()
                    .map(move |(key_ref, entry)| (entry.created_at, sender, key_ref))
            })
            .min_by_key(|(created_at, _, _)| *created_at)
            .map(|(_, sender, key_ref)| (sender.clone(), key_ref.clone()));

        let Some((sender, key_ref)) = oldest else {
            return false;
        };
        if let Some(by_ref) = self.received.get_mut(&sender) {
            by_ref.remove(&key_ref);
            if by_ref.is_empty() {
                self.received.remove(&sender);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent_entry(byte: u8, at: u64) -> SentMessageKey {
        SentMessageKey {
            key: MessageKey::from_bytes([byte; 32]),
            nonce: vec![byte; 24],
            aad: vec![byte],
            created_at: at,
        }
    }

    fn received_entry(byte: u8, at: u64) -> ReceivedMessageKey {
        ReceivedMessageKey {
            key: MessageKey::from_bytes([byte; 32]),
            created_at: at,
        }
    }

    #[test]
    fn sent_keys_by_message_id() {
        let mut cache = SessionCache::default();
        cache.record_sent("m1", sent_entry(1, 1), 10);
        assert_eq!(cache.sent("m1").unwrap().key.as_bytes(), &[1u8; 32]);
        assert!(cache.sent("m2").is_none());
    }

    #[test]
    fn received_keys_scoped_by_sender() {
        let mut cache = SessionCache::default();
        cache.record_received("alice", "otk:aa", received_entry(1, 1), 10);
        assert!(cache.received("alice", "otk:aa").is_some());
        assert!(cache.received("mallory", "otk:aa").is_none());
        assert!(cache.received("alice", "otk:bb").is_none());
    }

    #[test]
    fn sent_cap_evicts_oldest() {
        let mut cache = SessionCache::default();
        cache.record_sent("m1", sent_entry(1, 10), 2);
        cache.record_sent("m2", sent_entry(2, 20), 2);
        cache.record_sent("m3", sent_entry(3, 30), 2);
        assert_eq!(cache.sent_len(), 2);
        assert!(cache.sent("m1").is_none());
        assert!(cache.sent("m3").is_some());
    }

    #[test]
    fn received_cap_evicts_oldest_across_senders() {
        let mut cache = SessionCache::default();
        cache.record_received("alice", "otk:01", received_entry(1, 5), 2);
        cache.record_received("bob", "otk:02", received_entry(2, 6), 2);
        cache.record_received("alice", "otk:03", received_entry(3, 7), 2);
        assert_eq!(cache.received_len(), 2);
        assert!(cache.received("alice", "otk:01").is_none());
        assert!(cache.received("bob", "otk:02").is_some());
        assert!(cache.received("alice", "otk:03").is_some());
    }

    #[test]
    fn merge_unions_without_overwriting() {
        let mut local = SessionCache::default();
        local.record_sent("m1", sent_entry(1, 1), 10);

        let mut stored = SessionCache::default();
        stored.record_sent("m1", sent_entry(9, 1), 10);
        stored.record_sent("m2", sent_entry(2, 2), 10);
        stored.record_received("alice", "otk:aa", received_entry(3, 3), 10);

        local.merge(stored);
        assert_eq!(local.sent("m1").unwrap().key.as_bytes(), &[1u8; 32]);
        assert!(local.sent("m2").is_some());
        assert!(local.received("alice", "otk:aa").is_some());
    }
}
