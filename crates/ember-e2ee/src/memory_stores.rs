//! In-memory implementations of the collaborator traits.
//!
//! These are suitable for:
//! - Testing and development
//! - Driving the engine from the simulator binary
//!
//! **WARNING**: Data is lost on process exit. Production deployments back
//! [`StateStore`] with platform secure storage and [`PrekeyDirectory`] with
//! the registration service.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::E2eeError;
use crate::prekeys::DeviceBundle;
use crate::state::DeviceState;
use crate::store::{PrekeyDirectory, StateStore};

#[derive(Debug)]
struct DeviceRecord {
    bundle: DeviceBundle,
    one_time_prekeys: VecDeque<Vec<u8>>,
}

impl DeviceRecord {
    fn fresh(bundle: &DeviceBundle) -> Self {
        Self {
            bundle: bundle.clone(),
            one_time_prekeys: VecDeque::new(),
        }
    }
}

/// Server-side state of a prekey directory shared by every simulated device.
///
/// Each user's devices are kept most-recently-registered first; that first
/// device is the user's primary device for listing and claiming.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    users: Mutex<HashMap<String, Vec<DeviceRecord>>>,
}

impl MemoryDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A directory client authenticated as `(user_id, device_id)`.
    pub fn client(
        self: &Arc<Self>,
        user_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> MemoryDirectoryClient {
        MemoryDirectoryClient {
            directory: Arc::clone(self),
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }

    /// Overwrite a device's published bundle without any checks.
    ///
    /// Models a compromised or buggy server; the device's prekey pool is kept.
    pub fn replace_bundle(&self, user_id: &str, bundle: DeviceBundle) {
        let mut users = self.users.lock();
        let devices = users.entry(user_id.to_string()).or_default();
        if let Some(record) = devices.iter_mut().find(|r| r.bundle.device_id == bundle.device_id) {
            record.bundle = bundle;
        } else {
            devices.insert(
                0,
                DeviceRecord {
                    bundle,
                    one_time_prekeys: VecDeque::new(),
                },
            );
        }
    }

    pub fn deregister_device(&self, user_id: &str, device_id: &str) {
        let mut users = self.users.lock();
        if let Some(devices) = users.get_mut(user_id) {
            devices.retain(|r| r.bundle.device_id != device_id);
        }
    }

    /// Unclaimed prekeys across all of a user's devices.
    pub fn available_prekeys(&self, user_id: &str) -> usize {
        self.users
            .lock()
            .get(user_id)
            .map_or(0, |devices| devices.iter().map(|r| r.one_time_prekeys.len()).sum())
    }

    fn register(&self, user_id: &str, bundle: &DeviceBundle) {
        let mut users = self.users.lock();
        let devices = users.entry(user_id.to_string()).or_default();
        match devices.iter().position(|r| r.bundle.device_id == bundle.device_id) {
            // Same device re-registering after a signed-prekey rotation keeps its pool.
            Some(index) if devices[index].bundle.identity_key == bundle.identity_key => {
                devices[index].bundle = bundle.clone();
            }
            // Reinstall under the same device id: old prekeys belong to a dead identity.
            Some(index) => {
                devices.remove(index);
                devices.insert(0, DeviceRecord::fresh(bundle));
            }
            None => {
                devices.insert(0, DeviceRecord::fresh(bundle));
            }
        }
    }

    fn upload(
        &self,
        user_id: &str,
        device_id: &str,
        prekeys: &[[u8; 32]],
    ) -> Result<(), E2eeError> {
        let mut users = self.users.lock();
        let record = users
            .get_mut(user_id)
            .and_then(|devices| devices.iter_mut().find(|r| r.bundle.device_id == device_id))
            .ok_or_else(|| E2eeError::Directory(format!("device {device_id} is not registered")))?;
        record
            .one_time_prekeys
            .extend(prekeys.iter().map(|key| key.to_vec()));
        Ok(())
    }

    fn stock(&self, user_id: &str, device_id: &str) -> u32 {
        self.users
            .lock()
            .get(user_id)
            .and_then(|devices| devices.iter().find(|r| r.bundle.device_id == device_id))
            .map_or(0, |r| u32::try_from(r.one_time_prekeys.len()).unwrap_or(u32::MAX))
    }

    fn list(&self, user_id: &str) -> Vec<DeviceBundle> {
        self.users.lock().get(user_id).map_or_else(Vec::new, |devices| {
            devices
                .iter()
                .map(|r| DeviceBundle {
                    one_time_prekey: r.one_time_prekeys.front().cloned(),
                    ..r.bundle.clone()
                })
                .collect()
        })
    }

    fn claim(&self, user_id: &str) -> Option<DeviceBundle> {
        let mut users = self.users.lock();
        let primary = users.get_mut(user_id)?.first_mut()?;
        let one_time_prekey = primary.one_time_prekeys.pop_front()?;
        Some(DeviceBundle {
            one_time_prekey: Some(one_time_prekey),
            ..primary.bundle.clone()
        })
    }
}

/// One device's authenticated view of a [`MemoryDirectory`].
#[derive(Debug, Clone)]
pub struct MemoryDirectoryClient {
    directory: Arc<MemoryDirectory>,
    user_id: String,
    device_id: String,
}

impl PrekeyDirectory for MemoryDirectoryClient {
    fn register_device(&self, bundle: &DeviceBundle) -> Result<(), E2eeError> {
        if bundle.device_id != self.device_id {
            return Err(E2eeError::Directory(format!(
                "client for device {} cannot register {}",
                self.device_id, bundle.device_id
            )));
        }
        self.directory.register(&self.user_id, bundle);
        Ok(())
    }

    fn upload_prekeys(&self, one_time_prekeys: &[[u8; 32]]) -> Result<(), E2eeError> {
        self.directory
            .upload(&self.user_id, &self.device_id, one_time_prekeys)
    }

    fn prekey_stock(&self) -> Result<u32, E2eeError> {
        Ok(self.directory.stock(&self.user_id, &self.device_id))
    }

    fn list_device_bundles(&self, user_id: &str) -> Result<Vec<DeviceBundle>, E2eeError> {
        Ok(self.directory.list(user_id))
    }

    fn claim_prekey(&self, user_id: &str) -> Result<Option<DeviceBundle>, E2eeError> {
        Ok(self.directory.claim(user_id))
    }
}

/// In-memory state store.
///
/// Holds the state serialized, as real secure storage would, and counts
/// loads and saves so tests can assert on recovery behaviour.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshot: Mutex<Option<Vec<u8>>>,
    loads: AtomicUsize,
    saves: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Drop whatever is stored, as if secure storage were wiped.
    pub fn clear(&self) {
        *self.snapshot.lock() = None;
    }
}

impl StateStore for MemoryStateStore {
    fn load_device_state(&self) -> Result<Option<DeviceState>, E2eeError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.snapshot
            .lock()
            .as_deref()
            .map(|bytes| {
                serde_json::from_slice(bytes).map_err(|e| E2eeError::Storage(e.to_string()))
            })
            .transpose()
    }

    fn save_device_state(&self, state: &DeviceState) -> Result<(), E2eeError> {
        let bytes = serde_json::to_vec(state).map_err(|e| E2eeError::Storage(e.to_string()))?;
        *self.snapshot.lock() = Some(bytes);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prekeys::DeviceKeys;

    fn registered(
        directory: &Arc<MemoryDirectory>,
        user: &str,
        device: &str,
        prekeys: usize,
    ) -> (MemoryDirectoryClient, DeviceKeys) {
        let client = directory.client(user, device);
        let keys = DeviceKeys::generate(device, prekeys);
        client.register_device(&keys.bundle().unwrap()).unwrap();
        client.upload_prekeys(&keys.pending_upload()).unwrap();
        (client, keys)
    }

    #[test]
    fn claim_consumes_in_order() {
        let directory = MemoryDirectory::new();
        let (bob, keys) = registered(&directory, "bob", "phone", 2);
        let publics = keys.pending_upload();

        let listed = bob.list_device_bundles("bob").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].one_time_prekey.as_deref(), Some(publics[0].as_slice()));
        assert_eq!(bob.prekey_stock().unwrap(), 2, "listing must not consume");

        let first = bob.claim_prekey("bob").unwrap().unwrap();
        let second = bob.claim_prekey("bob").unwrap().unwrap();
        assert_eq!(first.one_time_prekey.as_deref(), Some(publics[0].as_slice()));
        assert_eq!(second.one_time_prekey.as_deref(), Some(publics[1].as_slice()));
        assert!(bob.claim_prekey("bob").unwrap().is_none());
        assert_eq!(bob.prekey_stock().unwrap(), 0);
    }

    #[test]
    fn newest_device_is_primary() {
        let directory = MemoryDirectory::new();
        registered(&directory, "bob", "phone", 1);
        let (tablet, _) = registered(&directory, "bob", "tablet", 1);

        let listed = tablet.list_device_bundles("bob").unwrap();
        assert_eq!(listed[0].device_id, "tablet");
        assert_eq!(tablet.claim_prekey("bob").unwrap().unwrap().device_id, "tablet");
        assert_eq!(directory.available_prekeys("bob"), 1);

        directory.deregister_device("bob", "tablet");
        let listed = tablet.list_device_bundles("bob").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].device_id, "phone");
        assert_eq!(tablet.claim_prekey("bob").unwrap().unwrap().device_id, "phone");
    }

    #[test]
    fn reinstall_under_same_device_id_drops_old_prekeys() {
        let directory = MemoryDirectory::new();
        registered(&directory, "bob", "phone", 3);
        let (_, reinstalled) = registered(&directory, "bob", "phone", 1);

        assert_eq!(directory.available_prekeys("bob"), 1);
        let claimed = directory.client("alice", "laptop").claim_prekey("bob").unwrap().unwrap();
        assert_eq!(claimed.identity_key, reinstalled.bundle().unwrap().identity_key);
    }

    #[test]
    fn client_cannot_register_other_device() {
        let directory = MemoryDirectory::new();
        let client = directory.client("bob", "phone");
        let keys = DeviceKeys::generate("tablet", 0);
        assert!(client.register_device(&keys.bundle().unwrap()).is_err());
        assert!(client.upload_prekeys(&[[1u8; 32]]).is_err());
    }

    #[test]
    fn unknown_user_lists_nothing() {
        let directory = MemoryDirectory::new();
        let client = directory.client("alice", "laptop");
        assert!(client.list_device_bundles("nobody").unwrap().is_empty());
        assert!(client.claim_prekey("nobody").unwrap().is_none());
    }

    #[test]
    fn state_store_counts_and_round_trips() {
        let store = MemoryStateStore::new();
        assert!(store.load_device_state().unwrap().is_none());

        let state = DeviceState::new("bob", DeviceKeys::generate("phone", 1));
        store.save_device_state(&state).unwrap();
        let loaded = store.load_device_state().unwrap().unwrap();
        assert_eq!(loaded.keys.device_id(), "phone");
        assert_eq!(store.load_count(), 2);
        assert_eq!(store.save_count(), 1);

        store.clear();
        assert!(store.load_device_state().unwrap().is_none());
    }
}
