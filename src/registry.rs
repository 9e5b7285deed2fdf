//! The device registry: the single owner of all device records and the
//! supervisor of every per-device task.
//!
//! All mutations go through the registry mutex on the daemon's one task
//! loop; the RPC surface reads value snapshots and the registry emits
//! property-change notifications whenever state it published changes.
//! Arbitration rules: at most one search across the registry, at most one
//! listen and one live session per device.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::RegistrationStore;
use crate::core::assembler::unique_timestamp;
use crate::core::bluetooth::constants::LISTEN_SCAN_WINDOW;
use crate::core::bluetooth::scanner;
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::{Advertisement, BatteryState};
use crate::core::drawing::Drawing;
use crate::core::protocol::session::{
    DeviceSession, SessionConfig, SessionEvent,
};
use crate::core::protocol::ProtocolFamily;
use crate::error::{Result, WacomError};
use crate::rpc::emitter::{SignalEmitter, TuhiSignal};
use crate::uhid::{pen_report_descriptor, UhidPenSink};

pub type SharedRegistry = Arc<Mutex<DeviceRegistry>>;

/// Everything the daemon knows about one device.
#[derive(Debug)]
pub struct DeviceRecord {
    pub address: String,
    pub name: String,
    pub registered: bool,
    pub family: Option<ProtocolFamily>,
    uuid: Option<[u8; 16]>,
    pub dimensions: (u32, u32),
    pub firmware: Option<String>,
    pub battery_percent: u8,
    pub battery_state: BatteryState,
    pub drawings: Vec<Drawing>,
    pub listening: bool,
    pub live: bool,
    listen_client: Option<String>,
    listen_cancel: Option<CancellationToken>,
    live_client: Option<String>,
    live_cancel: Option<CancellationToken>,
    /// One BLE session per device at a time, across all operations.
    session_active: bool,
}

impl DeviceRecord {
    fn new(address: String) -> Self {
        DeviceRecord {
            name: address.clone(),
            address,
            registered: false,
            family: None,
            uuid: None,
            dimensions: (0, 0),
            firmware: None,
            battery_percent: 0,
            battery_state: BatteryState::Unknown,
            drawings: Vec::new(),
            listening: false,
            live: false,
            listen_client: None,
            listen_cancel: None,
            live_client: None,
            live_cancel: None,
            session_active: false,
        }
    }
}

/// Read-only device view published to the RPC surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceSnapshot {
    pub address: String,
    /// Opaque handle into the transport adapter, for clients that want to
    /// talk to the underlying Bluetooth stack themselves.
    pub blue_z_device: String,
    pub name: String,
    pub dimensions: (u32, u32),
    pub battery_percent: u32,
    pub battery_state: u32,
    pub drawings_available: Vec<u64>,
    pub listening: bool,
    pub live: bool,
}

struct ActiveSearch {
    client: String,
    cancel: CancellationToken,
}

pub struct DeviceRegistry {
    transport: Arc<dyn Transport>,
    store: RegistrationStore,
    emitter: Arc<dyn SignalEmitter>,
    devices: HashMap<String, DeviceRecord>,
    search: Option<ActiveSearch>,
}

impl DeviceRegistry {
    /// Build the registry, re-creating records for every persisted
    /// registration.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: RegistrationStore,
        emitter: Arc<dyn SignalEmitter>,
    ) -> SharedRegistry {
        let mut devices = HashMap::new();
        for (address, registration) in store.iter() {
            let mut record = DeviceRecord::new(address.clone());
            match registration.uuid_bytes() {
                Ok(uuid) => {
                    record.registered = true;
                    record.uuid = Some(uuid);
                    record.family = Some(registration.family);
                    record.dimensions = registration.family.default_dimensions();
                    info!("known device {address} ({})", registration.family);
                }
                Err(e) => {
                    warn!("{address}: dropping corrupt registration: {e}");
                    continue;
                }
            }
            devices.insert(address.clone(), record);
        }
        Arc::new(Mutex::new(DeviceRegistry {
            transport,
            store,
            emitter,
            devices,
            search: None,
        }))
    }

    // -- read-only views used by the RPC surface --------------------------

    /// Addresses of registered devices (the Manager's `Devices`).
    pub fn devices(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .devices
            .values()
            .filter(|d| d.registered)
            .map(|d| d.address.clone())
            .collect();
        out.sort();
        out
    }

    pub fn searching(&self) -> bool {
        self.search.is_some()
    }

    pub fn snapshot(&self, address: &str) -> Option<DeviceSnapshot> {
        self.devices.get(address).map(|d| DeviceSnapshot {
            address: d.address.clone(),
            blue_z_device: d.address.clone(),
            name: d.name.clone(),
            dimensions: d.dimensions,
            battery_percent: d.battery_percent as u32,
            battery_state: d.battery_state as u32,
            drawings_available: d.drawings.iter().map(|dr| dr.timestamp).collect(),
            listening: d.listening,
            live: d.live,
        })
    }

    /// The JSON form of one drawing, selected by timestamp.
    pub fn drawing_json(&self, address: &str, file_version: u32, timestamp: u64) -> Result<String> {
        if file_version != crate::core::drawing::JSON_FILE_FORMAT_VERSION {
            return Err(WacomError::InvalidArgument("unsupported JSON data version"));
        }
        let record = self
            .devices
            .get(address)
            .ok_or(WacomError::NotFound("unknown device"))?;
        let drawing = record
            .drawings
            .iter()
            .find(|d| d.timestamp == timestamp)
            .ok_or(WacomError::NotFound("no drawing with this timestamp"))?;
        Ok(drawing.to_json())
    }

    // -- advertisement intake ---------------------------------------------

    pub async fn on_advertisement(registry: &SharedRegistry, ad: Advertisement) {
        let mut reg = registry.lock().await;
        let record = reg
            .devices
            .entry(ad.address.clone())
            .or_insert_with(|| DeviceRecord::new(ad.address.clone()));
        if let Some(name) = ad.name {
            record.name = name;
        }
        if ad.pairing && !record.registered {
            info!("{}: unregistered device in pairing mode", ad.address);
            reg.emitter.signal(TuhiSignal::UnregisteredDevice {
                address: ad.address,
            });
        }
    }

    // -- search -----------------------------------------------------------

    pub async fn start_search(registry: &SharedRegistry, client: &str) -> Result<()> {
        let cancel = {
            let mut reg = registry.lock().await;
            if let Some(search) = &reg.search {
                if search.client == client {
                    return Ok(()); // same client, silent no-op
                }
                return Err(WacomError::Busy);
            }
            let cancel = CancellationToken::new();
            reg.search = Some(ActiveSearch {
                client: client.to_string(),
                cancel: cancel.clone(),
            });
            reg.emitter
                .property_changed("manager", "Searching", json!(true));
            cancel
        };

        let registry = registry.clone();
        tokio::spawn(async move {
            let transport = registry.lock().await.transport.clone();
            let status = scanner::search_loop(registry.clone(), transport, cancel).await;
            let mut reg = registry.lock().await;
            reg.search = None;
            reg.emitter.signal(TuhiSignal::SearchStopped { status });
            reg.emitter
                .property_changed("manager", "Searching", json!(false));
        });
        Ok(())
    }

    pub async fn stop_search(registry: &SharedRegistry, client: &str) -> Result<()> {
        let reg = registry.lock().await;
        match &reg.search {
            Some(search) if search.client == client => {
                search.cancel.cancel();
                Ok(())
            }
            Some(_) => Err(WacomError::Busy),
            None => Ok(()),
        }
    }

    // -- registration -----------------------------------------------------

    /// Run the registration flow against a device in pairing mode.
    pub async fn register(registry: &SharedRegistry, address: &str) -> Result<()> {
        {
            let mut reg = registry.lock().await;
            let record = reg
                .devices
                .get_mut(address)
                .ok_or(WacomError::NotFound("unknown device"))?;
            if record.session_active {
                return Err(WacomError::Busy);
            }
            record.session_active = true;
        }

        let outcome = async {
            let mut session =
                Self::establish_session(registry, address, false).await?;
            let outcome = session.register().await;
            session.teardown().await;
            outcome
        }
        .await;

        let mut reg = registry.lock().await;
        if let Some(record) = reg.devices.get_mut(address) {
            record.session_active = false;
        }
        let outcome = outcome?;

        reg.store
            .insert(address, outcome.uuid, outcome.family)
            .await?;
        if let Some(record) = reg.devices.get_mut(address) {
            record.registered = true;
            record.uuid = Some(outcome.uuid);
            record.family = Some(outcome.family);
            record.name = outcome.name;
            record.firmware = Some(outcome.firmware);
            record.dimensions = outcome.dimensions;
        }
        let devices = reg.devices();
        reg.emitter
            .property_changed("manager", "Devices", json!(devices));
        Ok(())
    }

    // -- listen -----------------------------------------------------------

    pub async fn start_listening(
        registry: &SharedRegistry,
        address: &str,
        client: &str,
    ) -> Result<()> {
        let cancel = {
            let mut reg = registry.lock().await;
            let record = reg
                .devices
                .get_mut(address)
                .ok_or(WacomError::NotFound("unknown device"))?;
            if !record.registered {
                return Err(WacomError::NotReady);
            }
            if record.listening {
                if record.listen_client.as_deref() == Some(client) {
                    return Ok(()); // same client, silent no-op
                }
                let status = WacomError::Busy.rpc_status();
                let address = address.to_string();
                reg.emitter
                    .signal(TuhiSignal::ListeningStopped { address, status });
                return Err(WacomError::Busy);
            }
            if record.session_active {
                return Err(WacomError::Busy);
            }
            let cancel = CancellationToken::new();
            record.listening = true;
            record.listen_client = Some(client.to_string());
            record.listen_cancel = Some(cancel.clone());
            record.session_active = true;
            reg.emitter
                .property_changed(address, "Listening", json!(true));
            cancel
        };

        let registry = registry.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            let status = Self::listen_loop(&registry, &address, cancel).await;
            let mut reg = registry.lock().await;
            if let Some(record) = reg.devices.get_mut(&address) {
                record.listening = false;
                record.listen_client = None;
                record.listen_cancel = None;
                record.session_active = false;
            }
            reg.emitter.signal(TuhiSignal::ListeningStopped {
                address: address.clone(),
                status,
            });
            reg.emitter
                .property_changed(&address, "Listening", json!(false));
        });
        Ok(())
    }

    pub async fn stop_listening(
        registry: &SharedRegistry,
        address: &str,
        client: &str,
    ) -> Result<()> {
        let reg = registry.lock().await;
        let record = reg
            .devices
            .get(address)
            .ok_or(WacomError::NotFound("unknown device"))?;
        if !record.listening {
            return Ok(());
        }
        if record.listen_client.as_deref() != Some(client) {
            return Err(WacomError::Busy);
        }
        if let Some(cancel) = &record.listen_cancel {
            cancel.cancel();
        }
        Ok(())
    }

    async fn listen_loop(
        registry: &SharedRegistry,
        address: &str,
        cancel: CancellationToken,
    ) -> i32 {
        let transport = registry.lock().await.transport.clone();
        loop {
            if cancel.is_cancelled() {
                return 0;
            }
            let mut session = match Self::establish_session(registry, address, true).await {
                Ok(session) => session,
                Err(
                    WacomError::TransportLost
                    | WacomError::NotFound(_)
                    | WacomError::Timeout(_),
                ) => {
                    // out of range or asleep; wait for it to advertise
                    if !wait_for_advertisement(&*transport, address, &cancel).await {
                        return 0;
                    }
                    continue;
                }
                Err(e) => {
                    warn!("{address}: listen failed: {e}");
                    return e.rpc_status();
                }
            };

            let outcome = Self::listen_connected(registry, address, &mut session, &cancel).await;
            session.teardown().await;
            match outcome {
                Ok(true) => continue, // link dropped, reconnect on next press
                Ok(false) => return 0,
                Err(e) => {
                    warn!("{address}: listen failed: {e}");
                    return e.rpc_status();
                }
            }
        }
    }

    /// Fetch, then idle until the next button press, for as long as the
    /// device keeps the link up. `Ok(true)` asks for a reconnect cycle.
    async fn listen_connected(
        registry: &SharedRegistry,
        address: &str,
        session: &mut DeviceSession,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        loop {
            Self::emit(registry, TuhiSignal::SyncState {
                address: address.to_string(),
                state: 1,
            })
            .await;
            let fetched = session.fetch_drawings().await;
            Self::emit(registry, TuhiSignal::SyncState {
                address: address.to_string(),
                state: 0,
            })
            .await;
            fetched?;

            match session.listen_idle(cancel).await {
                Ok(true) => continue,
                Ok(false) => return Ok(false),
                Err(WacomError::TransportLost) => return Ok(true),
                Err(e) => return Err(e),
            }
        }
    }

    // -- live mode --------------------------------------------------------

    pub async fn start_live(
        registry: &SharedRegistry,
        address: &str,
        fd: RawFd,
        client: &str,
    ) -> Result<()> {
        let (cancel, name, dimensions, pressure_max) = {
            let mut reg = registry.lock().await;
            let record = reg
                .devices
                .get_mut(address)
                .ok_or(WacomError::NotFound("unknown device"))?;
            if !record.registered {
                return Err(WacomError::NotReady);
            }
            let family = record.family.ok_or(WacomError::NotReady)?;
            if !family.live_supported() {
                return Err(WacomError::NotReady);
            }
            if record.live {
                if record.live_client.as_deref() == Some(client) {
                    return Ok(());
                }
                let status = WacomError::Busy.rpc_status();
                let address = address.to_string();
                reg.emitter
                    .signal(TuhiSignal::LiveStopped { address, status });
                return Err(WacomError::Busy);
            }
            if record.session_active {
                return Err(WacomError::Busy);
            }
            let cancel = CancellationToken::new();
            record.live = true;
            record.live_client = Some(client.to_string());
            record.live_cancel = Some(cancel.clone());
            record.session_active = true;
            let name = record.name.clone();
            let dimensions = record.dimensions;
            reg.emitter.property_changed(address, "Live", json!(true));
            (cancel, name, dimensions, family.pressure_max())
        };

        let registry = registry.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            let status =
                Self::live_loop(&registry, &address, fd, &name, dimensions, pressure_max, cancel)
                    .await;
            let mut reg = registry.lock().await;
            if let Some(record) = reg.devices.get_mut(&address) {
                record.live = false;
                record.live_client = None;
                record.live_cancel = None;
                record.session_active = false;
            }
            reg.emitter.signal(TuhiSignal::LiveStopped {
                address: address.clone(),
                status,
            });
            reg.emitter.property_changed(&address, "Live", json!(false));
        });
        Ok(())
    }

    pub async fn stop_live(
        registry: &SharedRegistry,
        address: &str,
        client: &str,
    ) -> Result<()> {
        let reg = registry.lock().await;
        let record = reg
            .devices
            .get(address)
            .ok_or(WacomError::NotFound("unknown device"))?;
        if !record.live {
            return Ok(());
        }
        if record.live_client.as_deref() != Some(client) {
            return Err(WacomError::Busy);
        }
        if let Some(cancel) = &record.live_cancel {
            cancel.cancel();
        }
        Ok(())
    }

    async fn live_loop(
        registry: &SharedRegistry,
        address: &str,
        fd: RawFd,
        name: &str,
        dimensions: (u32, u32),
        pressure_max: u16,
        cancel: CancellationToken,
    ) -> i32 {
        let mut session = match Self::establish_session(registry, address, true).await {
            Ok(session) => session,
            Err(e) => {
                warn!("{address}: live failed: {e}");
                return e.rpc_status();
            }
        };

        let rdesc = pen_report_descriptor(dimensions.0, dimensions.1, pressure_max);
        let mut sink = match UhidPenSink::create(fd, name, &rdesc) {
            Ok(sink) => sink,
            Err(e) => {
                warn!("{address}: cannot create uhid device: {e}");
                session.teardown().await;
                return WacomError::protocol(e.to_string()).rpc_status();
            }
        };

        let result = session.live(&mut sink, cancel).await;
        session.teardown().await;
        match result {
            Ok(()) => 0,
            Err(e) => {
                warn!("{address}: live failed: {e}");
                e.rpc_status()
            }
        }
    }

    // -- shared plumbing --------------------------------------------------

    /// Open a session to `address`. `authenticated` requires a persisted
    /// registration; `false` comes up registration-only.
    async fn establish_session(
        registry: &SharedRegistry,
        address: &str,
        authenticated: bool,
    ) -> Result<DeviceSession> {
        let (transport, config) = {
            let reg = registry.lock().await;
            let record = reg
                .devices
                .get(address)
                .ok_or(WacomError::NotFound("unknown device"))?;
            let registration = if authenticated {
                let uuid = record.uuid.ok_or(WacomError::NotAuthorized)?;
                let family = record.family.ok_or(WacomError::NotAuthorized)?;
                Some((uuid, family))
            } else {
                None
            };
            (
                reg.transport.clone(),
                SessionConfig {
                    address: address.to_string(),
                    device_name: record.name.clone(),
                    registration,
                },
            )
        };

        let (events, rx) = mpsc::unbounded_channel();
        Self::spawn_event_pump(registry.clone(), address.to_string(), rx);
        DeviceSession::establish(&*transport, config, events).await
    }

    fn spawn_event_pump(
        registry: SharedRegistry,
        address: String,
        mut rx: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut reg = registry.lock().await;
                match event {
                    SessionEvent::Battery { percent, state } => {
                        if let Some(record) = reg.devices.get_mut(&address) {
                            record.battery_percent = percent;
                            record.battery_state = state;
                        }
                        reg.emitter.property_changed(
                            &address,
                            "BatteryPercent",
                            json!(percent),
                        );
                        reg.emitter.property_changed(
                            &address,
                            "BatteryState",
                            json!(state as u32),
                        );
                    }
                    SessionEvent::Dimensions(dimensions) => {
                        if let Some(record) = reg.devices.get_mut(&address) {
                            record.dimensions = dimensions;
                        }
                        reg.emitter.property_changed(
                            &address,
                            "Dimensions",
                            json!([dimensions.0, dimensions.1]),
                        );
                    }
                    SessionEvent::Drawing(drawing) => {
                        reg.add_drawing(&address, drawing);
                    }
                    SessionEvent::ButtonPressRequired => {
                        reg.emitter.signal(TuhiSignal::ButtonPressRequired {
                            address: address.clone(),
                        });
                    }
                }
            }
        });
    }

    fn add_drawing(&mut self, address: &str, mut drawing: Drawing) {
        let Some(record) = self.devices.get_mut(address) else {
            return;
        };
        let used: Vec<u64> = record.drawings.iter().map(|d| d.timestamp).collect();
        drawing.timestamp = unique_timestamp(drawing.timestamp, &used);
        debug!(
            "{address}: drawing stored with timestamp {}",
            drawing.timestamp
        );
        record.drawings.push(drawing);
        let available: Vec<u64> = record.drawings.iter().map(|d| d.timestamp).collect();
        self.emitter
            .property_changed(address, "DrawingsAvailable", json!(available));
    }

    async fn emit(registry: &SharedRegistry, signal: TuhiSignal) {
        registry.lock().await.emitter.signal(signal);
    }

    // -- client lifecycle -------------------------------------------------

    /// An RPC client went away: treat as Stop for everything it owns.
    pub async fn client_disconnected(registry: &SharedRegistry, client: &str) {
        let reg = registry.lock().await;
        if let Some(search) = &reg.search {
            if search.client == client {
                search.cancel.cancel();
            }
        }
        for record in reg.devices.values() {
            if record.listen_client.as_deref() == Some(client) {
                if let Some(cancel) = &record.listen_cancel {
                    cancel.cancel();
                }
            }
            if record.live_client.as_deref() == Some(client) {
                if let Some(cancel) = &record.live_cancel {
                    cancel.cancel();
                }
            }
        }
    }
}

/// Scan until `address` advertises. False when cancelled first.
async fn wait_for_advertisement(
    transport: &dyn Transport,
    address: &str,
    cancel: &CancellationToken,
) -> bool {
    loop {
        let stream = match transport.scan(LISTEN_SCAN_WINDOW).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("scan for {address} failed: {e}");
                return false;
            }
        };
        tokio::pin!(stream);
        loop {
            tokio::select! {
                ad = stream.next() => match ad {
                    Some(ad) if ad.address == address => return true,
                    Some(_) => continue,
                    None => break, // window closed, open the next one
                },
                _ = cancel.cancelled() => return false,
            }
        }
    }
}
