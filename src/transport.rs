//! BLE transport contract and credentials store.
//!
//! `Transport` is an `async_trait` object so the core never depends on a
//! specific BLE stack; callers supply a concrete implementation backed by
//! whatever GATT library fits their platform.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// GATT notify characteristic: device -> controller.
pub const NOTIFY_CHARACTERISTIC_UUID: &str = "00002b10-0000-1000-8000-00805f9b34fb";
/// GATT write characteristic: controller -> device.
pub const WRITE_CHARACTERISTIC_UUID: &str = "00002b11-0000-1000-8000-00805f9b34fb";
/// Tuya BLE GATT service.
pub const SERVICE_UUID: &str = "0000a201-0000-1000-8000-00805f9b34fb";
/// Manufacturer-data company id used in Tuya BLE advertisements.
pub const MANUFACTURER_DATA_ID: u16 = 0x07D0;

/// The BLE GATT operations the protocol core needs; everything else about
/// discovery, pairing at the OS level, or connection retries is the
/// caller's concern.
///
/// `subscribe` takes a channel rather than a callback: the transport
/// forwards each raw notification payload onto `notifications` as it
/// arrives.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_connection(&self) -> Result<(), TransportError>;
    async fn subscribe(&self, notifications: tokio::sync::mpsc::Sender<Vec<u8>>) -> Result<(), TransportError>;
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;
    async fn unsubscribe(&self) -> Result<(), TransportError>;
    async fn close_connection(&self) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
    fn address(&self) -> &str;
    fn rssi(&self) -> Option<i16>;
}

#[derive(Debug)]
pub struct TransportError(pub Box<dyn std::error::Error + Send + Sync>);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error: {}", self.0)
    }
}

impl std::error::Error for TransportError {}

/// Pre-provisioned per-device secrets and descriptive metadata. `local_key`
/// is masked in `Debug` to avoid leaking it into logs.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub uuid: String,
    pub local_key: String,
    pub device_id: String,
    pub category: String,
    pub product_id: String,
    pub device_name: Option<String>,
    pub product_model: Option<String>,
    pub product_name: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("uuid", &self.uuid)
            .field("local_key", &"<redacted>")
            .field("device_id", &self.device_id)
            .field("category", &self.category)
            .field("product_id", &self.product_id)
            .field("device_name", &self.device_name)
            .field("product_model", &self.product_model)
            .field("product_name", &self.product_name)
            .finish()
    }
}

/// Maps device address to `Credentials`. Persistence format is
/// implementation-defined; `JsonFileStore` below is the default.
#[async_trait]
pub trait CredentialsStore: Send + Sync {
    async fn get(&self, address: &str) -> Result<Option<Credentials>, TransportError>;
    async fn put(&self, address: &str, credentials: Credentials) -> Result<(), TransportError>;
    async fn remove(&self, address: &str) -> Result<(), TransportError>;
    async fn list(&self) -> Result<Vec<String>, TransportError>;
}

/// A `CredentialsStore` backed by a single JSON file, read/written whole
/// under a lock.
pub struct JsonFileStore {
    path: PathBuf,
    state: tokio::sync::Mutex<HashMap<String, Credentials>>,
}

impl JsonFileStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| TransportError(Box::new(e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(TransportError(Box::new(e))),
        };
        Ok(JsonFileStore {
            path,
            state: tokio::sync::Mutex::new(state),
        })
    }

    async fn flush(&self, state: &HashMap<String, Credentials>) -> Result<(), TransportError> {
        let bytes = serde_json::to_vec_pretty(state).map_err(|e| TransportError(Box::new(e)))?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| TransportError(Box::new(e)))
    }
}

#[async_trait]
impl CredentialsStore for JsonFileStore {
    async fn get(&self, address: &str) -> Result<Option<Credentials>, TransportError> {
        Ok(self.state.lock().await.get(address).cloned())
    }

    async fn put(&self, address: &str, credentials: Credentials) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.insert(address.to_string(), credentials);
        self.flush(&state).await
    }

    async fn remove(&self, address: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.remove(address);
        self.flush(&state).await
    }

    async fn list(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.state.lock().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_credentials() -> Credentials {
        Credentials {
            uuid: "uuid-0001".to_string(),
            local_key: "abcdefGHIJ".to_string(),
            device_id: "dev-0001".to_string(),
            category: "switch".to_string(),
            product_id: "prod-0001".to_string(),
            device_name: Some("Living Room Switch".to_string()),
            product_model: None,
            product_name: None,
        }
    }

    #[test]
    fn debug_redacts_local_key() {
        let creds = sample_credentials();
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("abcdefGHIJ"));
    }

    #[tokio::test]
    async fn json_file_store_roundtrips_and_lists() {
        let dir = std::env::temp_dir().join(format!("tuya-ble-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("credentials.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        store.put("AA:BB:CC:DD:EE:FF", sample_credentials()).await.unwrap();

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let fetched = reopened.get("AA:BB:CC:DD:EE:FF").await.unwrap().unwrap();
        assert_eq!(fetched.device_id, "dev-0001");

        let addresses = reopened.list().await.unwrap();
        assert_eq!(addresses, vec!["AA:BB:CC:DD:EE:FF".to_string()]);

        reopened.remove("AA:BB:CC:DD:EE:FF").await.unwrap();
        assert!(reopened.get("AA:BB:CC:DD:EE:FF").await.unwrap().is_none());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
