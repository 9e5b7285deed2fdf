//! Tuhi talks to Wacom SmartPad tablets (Bamboo Spark, Slate, Folio,
//! Intuos Pro Paper) over Bluetooth LE, downloads their stored drawings,
//! and publishes them as JSON through a session-bus RPC surface. Some
//! families additionally stream pen events into a virtual input device.

// Module declarations
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod registry;
pub mod rpc;
pub mod uhid;

use std::sync::Arc;

use anyhow::Result;
use log::info;

use crate::config::{default_config_dir, RegistrationStore};
use crate::core::bluetooth::transport::BluestTransport;
use crate::registry::{DeviceRegistry, SharedRegistry};
use crate::rpc::emitter::SignalEmitter;
use crate::rpc::ManagerApi;

/// Bring up the daemon: transport, persisted registrations, registry.
///
/// Returns the Manager object the bus binding exposes, plus the registry
/// handle for embedders.
pub async fn start(emitter: Arc<dyn SignalEmitter>) -> Result<(ManagerApi, SharedRegistry)> {
    let transport = Arc::new(BluestTransport::new().await?);
    let store = RegistrationStore::open(&default_config_dir()).await?;
    let registry = DeviceRegistry::new(transport, store, emitter);
    info!("daemon state initialized");
    Ok((ManagerApi::new(registry.clone()), registry))
}
