use std::sync::Arc;

use crate::error::E2eeError;
use crate::prekeys::DeviceBundle;
use crate::state::DeviceState;

/// Client of the backend prekey directory, authenticated as this device.
///
/// Calls may block on the network; timeout and retry policy belong to the
/// implementation.
pub trait PrekeyDirectory: Send + Sync {
    /// Upload this device's identity key, signed prekey and signature.
    fn register_device(&self, bundle: &DeviceBundle) -> Result<(), E2eeError>;

    /// Add one-time prekeys to this device's server-side pool.
    fn upload_prekeys(&self, one_time_prekeys: &[[u8; 32]]) -> Result<(), E2eeError>;

    /// Unclaimed one-time prekeys left for this device.
    fn prekey_stock(&self) -> Result<u32, E2eeError>;

    /// Read-only lookup of a user's devices, primary device first.
    fn list_device_bundles(&self, user_id: &str) -> Result<Vec<DeviceBundle>, E2eeError>;

    /// Atomically take one one-time prekey from the user's primary device.
    ///
    /// `Ok(None)` means the pool is empty.
    fn claim_prekey(&self, user_id: &str) -> Result<Option<DeviceBundle>, E2eeError>;
}

/// Durable home of a device's [`DeviceState`].
pub trait StateStore: Send + Sync {
    fn load_device_state(&self) -> Result<Option<DeviceState>, E2eeError>;

    fn save_device_state(&self, state: &DeviceState) -> Result<(), E2eeError>;
}

impl<T: PrekeyDirectory + ?Sized> PrekeyDirectory for Arc<T> {
    fn register_device(&self, bundle: &DeviceBundle) -> Result<(), E2eeError> {
        (**self).register_device(bundle)
    }

    fn upload_prekeys(&self, one_time_prekeys: &[[u8; 32]]) -> Result<(), E2eeError> {
        (**self).upload_prekeys(one_time_prekeys)
    }

    fn prekey_stock(&self) -> Result<u32, E2eeError> {
        (**self).prekey_stock()
    }

    fn list_device_bundles(&self, user_id: &str) -> Result<Vec<DeviceBundle>, E2eeError> {
        (**self).list_device_bundles(user_id)
    }

    fn claim_prekey(&self, user_id: &str) -> Result<Option<DeviceBundle>, E2eeError> {
        (**self).claim_prekey(user_id)
    }
}

impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    fn load_device_state(&self) -> Result<Option<DeviceState>, E2eeError> {
        (**self).load_device_state()
    }

    fn save_device_state(&self, state: &DeviceState) -> Result<(), E2eeError> {
        (**self).save_device_state(state)
    }
}
