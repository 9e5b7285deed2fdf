//! Shared data structures for the Bluetooth layer.

use serde::Serialize;
use uuid::Uuid;

/// One LE advertisement seen during a scan.
#[derive(Debug, Clone, Serialize)]
pub struct Advertisement {
    /// Canonical MAC address string, `AA:BB:CC:DD:EE:FF`.
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    /// True when the advertisement carries the Wacom pairing-mode marker.
    pub pairing: bool,
}

/// A characteristic discovered on a connected peer.
#[derive(Debug, Clone)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub can_notify: bool,
    pub can_write: bool,
}

/// A primary service and its characteristics.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicInfo> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Write semantics for a characteristic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Battery charging state as reported over the RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum BatteryState {
    #[default]
    Unknown = 0,
    Charging = 1,
    Discharging = 2,
}
