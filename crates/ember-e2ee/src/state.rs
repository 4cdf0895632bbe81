use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::prekeys::DeviceKeys;
use crate::session::SessionCache;
use crate::trust::TrustCache;

/// Everything a device needs to keep decrypting across restarts.
///
/// Persisted whole by the [`StateStore`](crate::StateStore) after every
/// mutation that affects future decryptability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    pub user_id: String,
    pub keys: DeviceKeys,
    pub trust: TrustCache,
    pub sessions: SessionCache,
}

impl DeviceState {
    pub fn new(user_id: impl Into<String>, keys: DeviceKeys) -> Self {
        Self {
            user_id: user_id.into(),
            keys,
            trust: TrustCache::default(),
            sessions: SessionCache::default(),
        }
    }

    /// Adopt a copy reloaded from storage.
    ///
    /// Stored key material replaces the resident key store; fingerprints merge
    /// last-write-wins and memoized keys are unioned.
    pub fn absorb_reloaded(&mut self, stored: DeviceState) {
        self.keys = stored.keys;
        self.trust.merge(stored.trust);
        self.sessions.merge(stored.sessions);
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
