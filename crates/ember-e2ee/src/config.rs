use std::path::Path;

use ember_crypto::AeadAlgorithm;
use serde::{Deserialize, Serialize};

use crate::error::E2eeError;

/// Highest envelope version this build understands.
pub const CURRENT_E2EE_VERSION: u32 = 1;

/// Tunables for a [`SessionEngine`](crate::SessionEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Version stamped into outgoing envelopes.
    pub e2ee_version: u32,
    /// AEAD used to seal outgoing messages. Inbound envelopes name their own.
    pub algorithm: AeadAlgorithm,
    /// HKDF info label; both sides must agree on it.
    pub kdf_info: String,
    /// One-time prekeys generated when a device is provisioned.
    pub initial_prekeys: usize,
    /// Replenish when the directory reports fewer unclaimed prekeys than this.
    pub prekey_low_water: u32,
    pub prekey_batch_size: usize,
    pub max_sent_keys: usize,
    pub max_received_keys: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            e2ee_version: CURRENT_E2EE_VERSION,
            algorithm: AeadAlgorithm::default(),
            kdf_info: "ember-e2ee-v1".to_string(),
            initial_prekeys: 50,
            prekey_low_water: 10,
            prekey_batch_size: 50,
            max_sent_keys: 4096,
            max_received_keys: 4096,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, E2eeError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| E2eeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, E2eeError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| E2eeError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), E2eeError> {
        if self.e2ee_version == 0 || self.e2ee_version > CURRENT_E2EE_VERSION {
            return Err(E2eeError::Config(format!(
                "unsupported e2ee_version {}",
                self.e2ee_version
            )));
        }
        if self.kdf_info.is_empty() {
            return Err(E2eeError::Config("kdf_info must not be empty".into()));
        }
        if self.prekey_batch_size == 0 {
            return Err(E2eeError::Config("prekey_batch_size must be positive".into()));
        }
        if self.max_sent_keys == 0 || self.max_received_keys == 0 {
            return Err(E2eeError::Config("session cache caps must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"algorithm":"aes256gcm","prekey_low_water":3}"#;
        let config = EngineConfig::from_json_str(json).unwrap();
        assert_eq!(config.algorithm, AeadAlgorithm::Aes256Gcm);
        assert_eq!(config.prekey_low_water, 3);
        assert_eq!(config.kdf_info, "ember-e2ee-v1");
    }

    #[test]
    fn rejects_zero_batch() {
        let result = EngineConfig::from_json_str(r#"{"prekey_batch_size":0}"#);
        assert!(matches!(result, Err(E2eeError::Config(_))));
    }

    #[test]
    fn rejects_future_version() {
        let config = EngineConfig {
            e2ee_version: CURRENT_E2EE_VERSION + 1,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"kdf_info":"test-label"}"#).unwrap();
        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.kdf_info, "test-label");
    }
}
