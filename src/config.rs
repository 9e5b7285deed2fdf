//! Persistent registration store.
//!
//! The only state that survives a daemon restart is the registration
//! record per device: its UUID and protocol family, keyed by Bluetooth
//! address. The store is a JSON file under the per-user config directory,
//! replaced atomically on every update.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use data_encoding::HEXLOWER;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::protocol::ProtocolFamily;
use crate::error::{Result, WacomError};

const STORE_FILE: &str = "devices.json";

/// One persisted registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRecord {
    /// 32 hex characters, the 16 opaque bytes assigned at registration.
    pub uuid: String,
    pub family: ProtocolFamily,
}

impl RegistrationRecord {
    pub fn uuid_bytes(&self) -> Result<[u8; 16]> {
        let decoded = HEXLOWER
            .decode(self.uuid.to_lowercase().as_bytes())
            .map_err(|_| WacomError::protocol("corrupt uuid in registration store"))?;
        decoded
            .try_into()
            .map_err(|_| WacomError::protocol("registration uuid is not 16 bytes"))
    }
}

#[derive(Debug, Default)]
pub struct RegistrationStore {
    path: PathBuf,
    devices: HashMap<String, RegistrationRecord>,
}

/// `$XDG_CONFIG_HOME/tuhi`, falling back to `~/.config/tuhi`.
pub fn default_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = std::env::var_os("HOME").unwrap_or_default();
            Path::new(&home).join(".config")
        })
        .join("tuhi")
}

impl RegistrationStore {
    /// Load the store from `dir`, starting empty when no file exists.
    pub async fn open(dir: &Path) -> Result<RegistrationStore> {
        let path = dir.join(STORE_FILE);
        let devices = match fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str(&json).map_err(|e| {
                WacomError::protocol(format!("corrupt registration store: {e}"))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!("cannot read {}: {e}", path.display());
                HashMap::new()
            }
        };
        info!(
            "registration store at {} with {} device(s)",
            path.display(),
            devices.len()
        );
        Ok(RegistrationStore { path, devices })
    }

    pub fn get(&self, address: &str) -> Option<&RegistrationRecord> {
        self.devices.get(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RegistrationRecord)> {
        self.devices.iter()
    }

    /// Persist a registration, replacing the file atomically.
    pub async fn insert(
        &mut self,
        address: &str,
        uuid: [u8; 16],
        family: ProtocolFamily,
    ) -> Result<()> {
        self.devices.insert(
            address.to_string(),
            RegistrationRecord {
                uuid: HEXLOWER.encode(&uuid),
                family,
            },
        );
        self.save().await
    }

    async fn save(&self) -> Result<()> {
        let io_err = |e: std::io::Error| {
            warn!("cannot write registration store: {e}");
            WacomError::protocol(format!("registration store write failed: {e}"))
        };
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await.map_err(io_err)?;
        }
        let json =
            serde_json::to_string_pretty(&self.devices).expect("store serialization");
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await.map_err(io_err)?;
        fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tuhi-test-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let dir = temp_dir("roundtrip");
        let mut store = RegistrationStore::open(&dir).await.unwrap();
        assert!(store.get("E2:AA:12:34:56:78").is_none());

        let uuid = [0xab; 16];
        store
            .insert("E2:AA:12:34:56:78", uuid, ProtocolFamily::Slate)
            .await
            .unwrap();

        let reopened = RegistrationStore::open(&dir).await.unwrap();
        let record = reopened.get("E2:AA:12:34:56:78").unwrap();
        assert_eq!(record.family, ProtocolFamily::Slate);
        assert_eq!(record.uuid_bytes().unwrap(), uuid);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_stored_shape() {
        let dir = temp_dir("shape");
        let mut store = RegistrationStore::open(&dir).await.unwrap();
        store
            .insert("AA:BB:CC:DD:EE:FF", [0x01; 16], ProtocolFamily::IntuosPro)
            .await
            .unwrap();

        let json = std::fs::read_to_string(dir.join(STORE_FILE)).unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            v["AA:BB:CC:DD:EE:FF"]["uuid"],
            serde_json::json!("01010101010101010101010101010101")
        );
        assert_eq!(
            v["AA:BB:CC:DD:EE:FF"]["family"],
            serde_json::json!("intuos_pro")
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_corrupt_uuid_rejected() {
        let record = RegistrationRecord {
            uuid: "zz".into(),
            family: ProtocolFamily::Spark,
        };
        assert!(record.uuid_bytes().is_err());
        let record = RegistrationRecord {
            uuid: "abcd".into(),
            family: ProtocolFamily::Spark,
        };
        assert!(record.uuid_bytes().is_err());
    }
}
