//! The session-bus RPC surface: a thin, typed mapping of the registry
//! onto the Manager/Device object tree.
//!
//! The bus binding (object registration, marshalling, client tracking on
//! the wire) is an external collaborator; it calls into [`ManagerApi`]
//! and [`DeviceApi`] and forwards the signals its [`SignalEmitter`]
//! receives. Methods that the interface defines with an integer result
//! return `0` or a negative errno; the rest report failures through
//! their `*Stopped` signals.

pub mod emitter;

use std::os::fd::RawFd;

use crate::core::drawing::JSON_FILE_FORMAT_VERSION;
use crate::error::Result;
use crate::registry::{DeviceRegistry, DeviceSnapshot, SharedRegistry};

fn status_of(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.rpc_status(),
    }
}

/// The `Manager` singleton.
#[derive(Clone)]
pub struct ManagerApi {
    registry: SharedRegistry,
}

impl ManagerApi {
    pub fn new(registry: SharedRegistry) -> Self {
        ManagerApi { registry }
    }

    /// The `Devices` property: registered devices only.
    pub async fn devices(&self) -> Vec<String> {
        self.registry.lock().await.devices()
    }

    /// The `Searching` property.
    pub async fn searching(&self) -> bool {
        self.registry.lock().await.searching()
    }

    /// The `JSONDataVersions` property.
    pub fn json_data_versions(&self) -> Vec<u32> {
        vec![JSON_FILE_FORMAT_VERSION]
    }

    /// `StartSearch()`. Failures surface through `SearchStopped`.
    pub async fn start_search(&self, client: &str) -> i32 {
        status_of(DeviceRegistry::start_search(&self.registry, client).await)
    }

    /// `StopSearch()`.
    pub async fn stop_search(&self, client: &str) -> i32 {
        status_of(DeviceRegistry::stop_search(&self.registry, client).await)
    }

    /// A per-device object, or `None` for an unknown address.
    pub async fn device(&self, address: &str) -> Option<DeviceApi> {
        self.registry
            .lock()
            .await
            .snapshot(address)
            .is_some()
            .then(|| DeviceApi {
                registry: self.registry.clone(),
                address: address.to_string(),
            })
    }

    /// The bus binding saw `client` drop off the bus: implicit Stop for
    /// everything it owns.
    pub async fn client_disconnected(&self, client: &str) {
        DeviceRegistry::client_disconnected(&self.registry, client).await;
    }
}

/// One `Device` object.
#[derive(Clone)]
pub struct DeviceApi {
    registry: SharedRegistry,
    address: String,
}

impl DeviceApi {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The property bundle of this device.
    pub async fn properties(&self) -> Option<DeviceSnapshot> {
        self.registry.lock().await.snapshot(&self.address)
    }

    /// `Register() → i32`.
    pub async fn register(&self) -> i32 {
        status_of(DeviceRegistry::register(&self.registry, &self.address).await)
    }

    /// `StartListening()`. Failures surface through `ListeningStopped`.
    pub async fn start_listening(&self, client: &str) -> i32 {
        status_of(DeviceRegistry::start_listening(&self.registry, &self.address, client).await)
    }

    /// `StopListening()`.
    pub async fn stop_listening(&self, client: &str) -> i32 {
        status_of(DeviceRegistry::stop_listening(&self.registry, &self.address, client).await)
    }

    /// `StartLive(fd) → i32`.
    pub async fn start_live(&self, fd: RawFd, client: &str) -> i32 {
        status_of(DeviceRegistry::start_live(&self.registry, &self.address, fd, client).await)
    }

    /// `StopLive()`.
    pub async fn stop_live(&self, client: &str) -> i32 {
        status_of(DeviceRegistry::stop_live(&self.registry, &self.address, client).await)
    }

    /// `GetJSONData(file_version, timestamp) → string`.
    pub async fn json_data(&self, file_version: u32, timestamp: u64) -> Result<String> {
        self.registry
            .lock()
            .await
            .drawing_json(&self.address, file_version, timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::RegistrationStore;
    use crate::core::bluetooth::mock::{MockConnection, MockTransport};
    use crate::core::protocol::ProtocolFamily;
    use crate::rpc::emitter::RecordingEmitter;

    const ADDR: &str = "E2:AA:12:34:56:78";

    async fn manager(registered: bool) -> ManagerApi {
        static SEQ: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        let n = SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "tuhi-rpc-{registered}-{}-{n}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let mut store = RegistrationStore::open(&dir).await.unwrap();
        if registered {
            store
                .insert(ADDR, [0x42; 16], ProtocolFamily::Slate)
                .await
                .unwrap();
        }
        let conn = MockConnection::new(MockConnection::smartpad_services(ProtocolFamily::Slate));
        let transport = MockTransport::new(conn);
        let emitter = Arc::new(RecordingEmitter::default());
        let registry = crate::registry::DeviceRegistry::new(transport, store, emitter);
        let _ = std::fs::remove_dir_all(&dir);
        ManagerApi::new(registry)
    }

    #[tokio::test]
    async fn test_manager_properties() {
        let api = manager(true).await;
        assert_eq!(api.devices().await, vec![ADDR.to_string()]);
        assert!(!api.searching().await);
        assert_eq!(api.json_data_versions(), vec![1]);
    }

    #[tokio::test]
    async fn test_unknown_device_is_none() {
        let api = manager(false).await;
        assert!(api.device("00:00:00:00:00:00").await.is_none());
    }

    #[tokio::test]
    async fn test_device_properties_and_errno_returns() {
        let api = manager(true).await;
        let device = api.device(ADDR).await.unwrap();
        let props = device.properties().await.unwrap();
        assert!(!props.listening);
        assert!(!props.live);
        assert_eq!(props.drawings_available.len(), 0);

        // live is family-gated before any transport work happens
        assert_eq!(device.start_live(-1, ":1.x").await, -52);
        // no drawing with this timestamp
        assert_eq!(
            device.json_data(1, 1234).await.unwrap_err().rpc_status(),
            -2
        );
    }
}
