//! GATT transport abstraction and its bluest-backed implementation.
//!
//! The session protocol talks to [`Transport`]/[`Connection`] only; the
//! traits are the seam that lets the protocol tests run against a scripted
//! transport instead of a radio.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::{debug, info, warn};
use regex::Regex;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    PAIRING_MANUFACTURER_DATA_LEN, WACOM_COMPANY_ID,
};
use crate::core::bluetooth::types::{
    Advertisement, CharacteristicInfo, ServiceInfo, WriteMode,
};
use crate::error::{Result, WacomError};

/// Enumerates adjacent LE peripherals and opens connections to them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Scan for `duration`; the stream completes when the window closes.
    async fn scan(&self, duration: Duration) -> Result<BoxStream<'static, Advertisement>>;

    /// Connect to a peripheral by canonical address.
    async fn connect(&self, address: &str) -> Result<Box<dyn Connection>>;
}

/// An open GATT connection.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn discover_services(&self) -> Result<Vec<ServiceInfo>>;

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    async fn write(&self, characteristic: Uuid, data: &[u8], mode: WriteMode) -> Result<()>;

    /// Subscribe to notifications. Buffers arrive in notification order;
    /// the stream ends when the peer disconnects.
    async fn subscribe(&self, characteristic: Uuid) -> Result<BoxStream<'static, Vec<u8>>>;

    async fn disconnect(&self) -> Result<()>;

    /// Cancelled when the transport is lost.
    fn disconnected(&self) -> CancellationToken;
}

fn ble_error(context: &str, e: bluest::Error) -> WacomError {
    warn!("BLE error while {context}: {e}");
    WacomError::TransportLost
}

/// Extract a MAC address from a platform device-id string. On macOS the
/// id carries no MAC at all, in which case the raw id is used as the key.
fn extract_mac_address(device_id: &str) -> Option<String> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:_-]){5}([0-9A-Fa-f]{2})").unwrap();
    re.find_iter(device_id)
        .last()
        .map(|m| m.as_str().replace(['-', '_'], ":").to_uppercase())
}

fn device_address(device: &Device) -> String {
    let id = device.id().to_string();
    extract_mac_address(&id).unwrap_or(id)
}

/// The production transport backed by the system Bluetooth stack.
pub struct BluestTransport {
    adapter: Adapter,
    /// Device handles by canonical address, filled during scans. bluest
    /// connects by handle, not by address, so handles must be retained.
    devices: Arc<Mutex<HashMap<String, Device>>>,
}

impl BluestTransport {
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or(WacomError::TransportLost)?;
        adapter
            .wait_available()
            .await
            .map_err(|e| ble_error("waiting for adapter", e))?;
        info!("Bluetooth adapter is available");
        Ok(BluestTransport {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

#[async_trait]
impl Transport for BluestTransport {
    async fn scan(&self, duration: Duration) -> Result<BoxStream<'static, Advertisement>> {
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        // the scan stream borrows the adapter, so both live in the task
        tokio::spawn(async move {
            let scan_stream = match adapter.scan(&[]).await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(ble_error("starting scan", e)));
                    return;
                }
            };
            tokio::pin!(scan_stream);
            let deadline = tokio::time::sleep(duration);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    found = scan_stream.next() => {
                        let Some(found) = found else { break };
                        let address = device_address(&found.device);
                        let pairing = found
                            .adv_data
                            .manufacturer_data
                            .as_ref()
                            .map(|m| {
                                m.company_id == WACOM_COMPANY_ID
                                    && m.data.len() == PAIRING_MANUFACTURER_DATA_LEN
                            })
                            .unwrap_or(false);
                        let ad = Advertisement {
                            address: address.clone(),
                            name: found.adv_data.local_name.clone(),
                            rssi: found.rssi,
                            pairing,
                        };
                        devices.lock().await.insert(address, found.device);
                        if tx.send(ad).is_err() {
                            break;
                        }
                    }
                    _ = &mut deadline => {
                        debug!("scan window of {duration:?} closed");
                        break;
                    }
                }
            }
        });

        ready_rx
            .await
            .map_err(|_| WacomError::TransportLost)??;
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|ad| (ad, rx))
        });
        Ok(stream.boxed())
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn Connection>> {
        let device = {
            let devices = self.devices.lock().await;
            devices.get(address).cloned()
        };
        let device = match device {
            Some(d) => d,
            None => {
                // the peer may already be connected at the system level
                let connected = self
                    .adapter
                    .connected_devices()
                    .await
                    .map_err(|e| ble_error("listing connected devices", e))?;
                let found = connected
                    .into_iter()
                    .find(|d| device_address(d) == address)
                    .ok_or(WacomError::NotFound("no such device"))?;
                self.devices
                    .lock()
                    .await
                    .insert(address.to_string(), found.clone());
                found
            }
        };

        if !device.is_connected().await {
            debug!("{address}: initiating connection");
            self.adapter
                .connect_device(&device)
                .await
                .map_err(|e| ble_error("connecting", e))?;
        }
        info!("{address}: connected");

        Ok(Box::new(BluestConnection {
            adapter: self.adapter.clone(),
            device,
            characteristics: Mutex::new(HashMap::new()),
            disconnected: CancellationToken::new(),
        }))
    }
}

struct BluestConnection {
    adapter: Adapter,
    device: Device,
    characteristics: Mutex<HashMap<Uuid, Characteristic>>,
    disconnected: CancellationToken,
}

impl BluestConnection {
    async fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.characteristics
            .lock()
            .await
            .get(&uuid)
            .cloned()
            .ok_or(WacomError::NotFound("characteristic not discovered"))
    }
}

#[async_trait]
impl Connection for BluestConnection {
    async fn discover_services(&self) -> Result<Vec<ServiceInfo>> {
        let services = self
            .device
            .services()
            .await
            .map_err(|e| ble_error("discovering services", e))?;

        let mut out = Vec::with_capacity(services.len());
        let mut cache = self.characteristics.lock().await;
        for service in services {
            let mut characteristics = Vec::new();
            let chars = service
                .characteristics()
                .await
                .map_err(|e| ble_error("discovering characteristics", e))?;
            for c in chars {
                let props = c
                    .properties()
                    .await
                    .map_err(|e| ble_error("reading characteristic properties", e))?;
                characteristics.push(CharacteristicInfo {
                    uuid: c.uuid(),
                    can_notify: props.notify || props.indicate,
                    can_write: props.write || props.write_without_response,
                });
                cache.insert(c.uuid(), c);
            }
            out.push(ServiceInfo {
                uuid: service.uuid(),
                characteristics,
            });
        }
        Ok(out)
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let c = self.characteristic(characteristic).await?;
        c.read().await.map_err(|e| ble_error("reading", e))
    }

    async fn write(&self, characteristic: Uuid, data: &[u8], mode: WriteMode) -> Result<()> {
        let c = self.characteristic(characteristic).await?;
        match mode {
            WriteMode::WithResponse => c.write(data).await,
            WriteMode::WithoutResponse => c.write_without_response(data).await,
        }
        .map_err(|e| ble_error("writing", e))
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<BoxStream<'static, Vec<u8>>> {
        let c = self.characteristic(characteristic).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let lost = self.disconnected.clone();

        // the notification stream borrows the characteristic, so both
        // live in the task
        tokio::spawn(async move {
            let notifications = match c.notify().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(ble_error("subscribing", e)));
                    return;
                }
            };
            tokio::pin!(notifications);
            while let Some(item) = notifications.next().await {
                match item {
                    Ok(value) => {
                        if tx.send(value).is_err() {
                            return; // subscriber went away
                        }
                    }
                    Err(e) => {
                        warn!("notification stream error: {e}");
                        break;
                    }
                }
            }
            // stream end means the peer is gone
            lost.cancel();
        });

        ready_rx
            .await
            .map_err(|_| WacomError::TransportLost)??;
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|v| (v, rx))
        });
        Ok(stream.boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.device.is_connected().await {
            debug!("{}: disconnecting", device_address(&self.device));
            self.adapter
                .disconnect_device(&self.device)
                .await
                .map_err(|e| ble_error("disconnecting", e))?;
        }
        self.disconnected.cancel();
        Ok(())
    }

    fn disconnected(&self) -> CancellationToken {
        self.disconnected.clone()
    }
}
