//! Encrypted on-disk [`StateStore`].
//!
//! The snapshot is a single file holding `nonce || XChaCha20-Poly1305(json)`
//! under a 32-byte storage key supplied by the platform keychain. Writes go
//! to a sibling temp file that is then renamed over the snapshot, so a crash
//! mid-write leaves the previous state intact.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use ember_crypto::aead::{self, AeadAlgorithm};
use zeroize::Zeroizing;

use crate::error::E2eeError;
use crate::state::DeviceState;
use crate::store::StateStore;

const SNAPSHOT_AAD: &[u8] = b"ember-device-state-v1";
const ALGORITHM: AeadAlgorithm = AeadAlgorithm::XChaCha20Poly1305;

pub struct FileStateStore {
    path: PathBuf,
    key: Zeroizing<[u8; 32]>,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>, storage_key: [u8; 32]) -> Self {
        Self {
            path: path.into(),
            key: Zeroizing::new(storage_key),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl std::fmt::Debug for FileStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStateStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl StateStore for FileStateStore {
    fn load_device_state(&self) -> Result<Option<DeviceState>, E2eeError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(E2eeError::Storage(format!(
                    "read {}: {e}",
                    self.path.display()
                )))
            }
        };

        let nonce_len = ALGORITHM.nonce_len();
        if bytes.len() < nonce_len {
            return Err(E2eeError::Storage("state snapshot truncated".into()));
        }
        let (nonce, sealed) = bytes.split_at(nonce_len);
        let json = Zeroizing::new(
            aead::open(ALGORITHM, &self.key, nonce, SNAPSHOT_AAD, sealed)
                .map_err(|e| E2eeError::Storage(format!("unseal state snapshot: {e}")))?,
        );
        let state = serde_json::from_slice(&json)
            .map_err(|e| E2eeError::Storage(format!("decode state snapshot: {e}")))?;
        tracing::debug!(path = %self.path.display(), "device state loaded");
        Ok(Some(state))
    }

    fn save_device_state(&self, state: &DeviceState) -> Result<(), E2eeError> {
        let json = Zeroizing::new(
            serde_json::to_vec(state).map_err(|e| E2eeError::Storage(e.to_string()))?,
        );
        let nonce = aead::random_nonce(ALGORITHM);
        let sealed = aead::seal(ALGORITHM, &self.key, &nonce, SNAPSHOT_AAD, &json)
            .map_err(|e| E2eeError::Storage(format!("seal state snapshot: {e}")))?;

        let temp = self.temp_path();
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&nonce)?;
            file.write_all(&sealed)?;
            file.sync_all()?;
            fs::rename(&temp, &self.path)
        };
        write().map_err(|e| E2eeError::Storage(format!("write {}: {e}", self.path.display())))?;
        tracing::trace!(path = %self.path.display(), bytes = sealed.len(), "device state saved");
        Ok(())
    }
}
