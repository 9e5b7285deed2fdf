//! The per-device session state machine.
//!
//! A session owns one GATT connection and drives it through the protocol:
//! service resolution, authentication, registration, drawing fetches, and
//! live mode. Commands are answered FIFO per device; every suspension
//! point carries an explicit deadline and reacts to transport loss.
//!
//! State diagram:
//!
//! ```text
//! Disconnected → Connecting → ServicesResolved → AuthPending → Ready
//!       ↑                                                        ↓
//!       └────────────── Draining ←──────────── Busy{Registering, ┘
//!                                  FetchingDrawing, BatteryRead, Live}
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use rand::RngCore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::assembler::DrawingAssembler;
use crate::core::bluetooth::constants::{
    AUTH_TIMEOUT, BATTERY_POLL_INTERVAL, BUTTON_PRESS_TIMEOUT, CLOCK_DRIFT_WARNING,
    COMMAND_TIMEOUT, PEN_DATA_TIMEOUT, UUID_BUTTON_CHAR, UUID_LIVE_PEN_CHAR,
    UUID_UART_NOTIFY_CHAR, UUID_UART_SERVICE, UUID_UART_WRITE_CHAR,
};
use crate::core::bluetooth::transport::{Connection, Transport};
use crate::core::bluetooth::types::{BatteryState, ServiceInfo, WriteMode};
use crate::core::drawing::Drawing;
use crate::core::protocol::pen::{PenEvent, PointDecoder};
use crate::core::protocol::wire::{
    dimension_axis, opcode, Command, FrameReassembler, Response,
};
use crate::core::protocol::ProtocolFamily;
use crate::error::{Result, WacomError};
use crate::uhid::PenEventSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    ServicesResolved,
    AuthPending,
    Ready,
    Busy(BusyKind),
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyKind {
    Registering,
    FetchingDrawing,
    BatteryRead,
    Live,
}

/// Facts a session reports to its owner while an operation runs.
#[derive(Debug)]
pub enum SessionEvent {
    Battery { percent: u8, state: BatteryState },
    Dimensions((u32, u32)),
    Drawing(Drawing),
    ButtonPressRequired,
}

/// What a successful registration established.
#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    pub uuid: [u8; 16],
    pub family: ProtocolFamily,
    pub name: String,
    pub firmware: String,
    pub dimensions: (u32, u32),
}

/// Connection parameters for [`DeviceSession::establish`].
pub struct SessionConfig {
    pub address: String,
    pub device_name: String,
    /// `(uuid, family)` for a registered device; `None` enters the
    /// registration-only state.
    pub registration: Option<([u8; 16], ProtocolFamily)>,
}

pub struct DeviceSession {
    address: String,
    device_name: String,
    family: ProtocolFamily,
    auth_uuid: Option<[u8; 16]>,
    connection: Box<dyn Connection>,
    lost: CancellationToken,
    uart: BoxStream<'static, Vec<u8>>,
    button: Option<BoxStream<'static, Vec<u8>>>,
    reassembler: FrameReassembler,
    /// Opcodes of in-flight commands, answered FIFO.
    pending: VecDeque<u8>,
    dimensions: (u32, u32),
    state: SessionState,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("address", &self.address)
            .field("device_name", &self.device_name)
            .field("family", &self.family)
            .field("auth_uuid", &self.auth_uuid)
            .field("dimensions", &self.dimensions)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Connect, resolve services, and authenticate.
    ///
    /// For an unregistered device the session comes up in `Ready` with
    /// only [`register`](Self::register) permitted. An authentication
    /// rejection surfaces as [`WacomError::NotAuthorized`] with the
    /// connection already closed.
    pub async fn establish(
        transport: &dyn Transport,
        config: SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<DeviceSession> {
        debug!("{}: connecting", config.address);
        let connection = transport.connect(&config.address).await?;
        let lost = connection.disconnected();

        let services = connection.discover_services().await?;
        let detected = match detect_family(&services) {
            Ok(f) => f,
            Err(e) => {
                let _ = connection.disconnect().await;
                return Err(e);
            }
        };
        let family = match config.registration {
            Some((_, family)) => family,
            None => detected,
        };
        debug!("{}: services resolved, family {family}", config.address);

        let uart = connection.subscribe(UUID_UART_NOTIFY_CHAR).await?;
        let button = if services
            .iter()
            .any(|s| s.characteristic(UUID_BUTTON_CHAR).is_some())
        {
            Some(connection.subscribe(UUID_BUTTON_CHAR).await?)
        } else {
            None
        };

        let mut session = DeviceSession {
            address: config.address,
            device_name: config.device_name,
            family,
            auth_uuid: config.registration.map(|(uuid, _)| uuid),
            connection,
            lost,
            uart,
            button,
            reassembler: FrameReassembler::new(),
            pending: VecDeque::new(),
            dimensions: family.default_dimensions(),
            state: SessionState::Connecting,
            events,
        };
        session.transition(SessionState::ServicesResolved);

        if let Some(uuid) = session.auth_uuid {
            session.transition(SessionState::AuthPending);
            if let Err(e) = session
                .request(opcode::AUTH, uuid.to_vec(), AUTH_TIMEOUT)
                .await
            {
                warn!("{}: authentication failed: {e}", session.address);
                session.teardown().await;
                return Err(e);
            }
        }
        session.transition(SessionState::Ready);
        info!("{}: session ready", session.address);
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    /// Disconnect and drop to `Disconnected`.
    pub async fn teardown(&mut self) {
        self.transition(SessionState::Draining);
        self.reassembler.clear();
        self.pending.clear();
        if let Err(e) = self.connection.disconnect().await {
            debug!("{}: disconnect: {e}", self.address);
        }
        self.transition(SessionState::Disconnected);
    }

    /// Register this device: assign a fresh UUID, have the user confirm
    /// with the physical button, then read the device's identity.
    pub async fn register(&mut self) -> Result<RegistrationOutcome> {
        self.expect_ready()?;
        self.transition(SessionState::Busy(BusyKind::Registering));
        let outcome = self.register_inner().await;
        if outcome.is_ok() {
            self.transition(SessionState::Ready);
        }
        outcome
    }

    async fn register_inner(&mut self) -> Result<RegistrationOutcome> {
        let mut uuid = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut uuid);
        info!("{}: registering", self.address);

        // NotReady here means the device is not in pairing mode
        self.request(opcode::REGISTER, uuid.to_vec(), AUTH_TIMEOUT)
            .await?;

        self.emit(SessionEvent::ButtonPressRequired);
        info!("{}: press the button now to confirm", self.address);
        self.wait_button_confirmation().await?;
        self.auth_uuid = Some(uuid);

        self.set_time().await?;
        self.read_time().await?;
        let name = self.get_name().await?;
        let firmware = self.get_firmware().await?;
        let dimensions = self.get_dimensions().await?;
        self.read_battery_inner().await?;
        self.device_name = name.clone();
        info!(
            "{}: registered '{name}', firmware {firmware}, {}x{} µm",
            self.address, dimensions.0, dimensions.1
        );

        Ok(RegistrationOutcome {
            uuid,
            family: self.family,
            name,
            firmware,
            dimensions,
        })
    }

    /// The Spark has no button characteristic and instead sends an
    /// unsolicited register ack once the button is pressed.
    async fn wait_button_confirmation(&mut self) -> Result<()> {
        match self.button.as_mut() {
            Some(stream) => {
                tokio::select! {
                    press = stream.next() => match press {
                        Some(_) => Ok(()),
                        None => Err(WacomError::TransportLost),
                    },
                    _ = self.lost.cancelled() => Err(WacomError::TransportLost),
                    _ = tokio::time::sleep(BUTTON_PRESS_TIMEOUT) => {
                        Err(WacomError::Timeout("button press"))
                    }
                }
            }
            None => {
                self.pending.push_back(opcode::REGISTER);
                let resp = self.next_response(BUTTON_PRESS_TIMEOUT).await?;
                self.match_pending(&resp)?;
                resp.check_status()
            }
        }
    }

    /// Fetch all stored drawings. Each completed drawing is emitted as a
    /// [`SessionEvent::Drawing`] and acknowledged (deleted on the device)
    /// before the next transfer starts. Returns the number fetched.
    pub async fn fetch_drawings(&mut self) -> Result<usize> {
        self.expect_ready()?;
        self.transition(SessionState::Busy(BusyKind::FetchingDrawing));
        let fetched = self.fetch_inner().await;
        match &fetched {
            Ok(_) => self.transition(SessionState::Ready),
            Err(_) => {
                // leave transfer mode so the device keeps the drawing for
                // a retry; no AckData was sent
                self.reassembler.clear();
                self.pending.clear();
                if let Err(e) = self
                    .request(opcode::RESET, vec![], COMMAND_TIMEOUT)
                    .await
                {
                    debug!("{}: reset after failed fetch: {e}", self.address);
                }
                self.transition(SessionState::Ready);
            }
        }
        fetched
    }

    async fn fetch_inner(&mut self) -> Result<usize> {
        self.check_connection().await?;
        self.set_time().await?;
        self.read_battery_inner().await?;
        let dimensions = self.get_dimensions().await?;
        self.dimensions = dimensions;

        // base timestamp for every drawing in this fetch: the device
        // clock at session start
        let base_timestamp = self.read_time().await?;

        let mut count = 0;
        loop {
            match self
                .request(opcode::MODE_SELECT, vec![0x00], COMMAND_TIMEOUT)
                .await
            {
                Ok(_) => {}
                // nothing (left) in device storage
                Err(WacomError::NotReady) => break,
                Err(e) => return Err(e),
            }

            let drawing = self.stream_drawing(base_timestamp).await?;
            info!(
                "{}: received drawing with {} strokes",
                self.address,
                drawing.strokes.len()
            );
            self.emit(SessionEvent::Drawing(drawing));

            // delete from device storage, exactly once per drawing
            self.request(opcode::ACK_DATA, vec![], COMMAND_TIMEOUT)
                .await?;
            count += 1;
        }
        if count == 0 {
            info!("{}: no data to retrieve", self.address);
        }
        Ok(count)
    }

    async fn stream_drawing(&mut self, base_timestamp: u64) -> Result<Drawing> {
        let mut assembler = DrawingAssembler::new(
            self.family,
            self.device_name.clone(),
            self.dimensions,
            base_timestamp,
        );
        let mut decoder = PointDecoder::new();
        loop {
            let record = self.next_record(PEN_DATA_TIMEOUT).await?;
            let event = decoder.decode(&record)?;
            if let Some(drawing) = assembler.push(event)? {
                return Ok(drawing);
            }
        }
    }

    /// Refresh the battery reading, emitting it as an event.
    pub async fn read_battery(&mut self) -> Result<(u8, BatteryState)> {
        self.expect_ready()?;
        self.transition(SessionState::Busy(BusyKind::BatteryRead));
        let result = self.read_battery_inner().await;
        self.transition(SessionState::Ready);
        result
    }

    /// Stream pen events into `sink` until `cancel` fires.
    ///
    /// The device is reconfigured to forward pen data instead of storing
    /// it; fetch and live are mutually exclusive by construction since
    /// both run on this session's single state.
    pub async fn live(
        &mut self,
        sink: &mut dyn PenEventSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        if !self.family.live_supported() {
            return Err(WacomError::NotReady);
        }
        self.expect_ready()?;
        self.transition(SessionState::Busy(BusyKind::Live));

        let result = self.live_inner(sink, cancel).await;

        // take the device out of live mode even after an error
        let stop = self
            .request(opcode::MODE_SELECT, vec![0x02], COMMAND_TIMEOUT)
            .await;
        if let Err(e) = stop {
            debug!("{}: stopping live mode: {e}", self.address);
        }
        self.transition(SessionState::Ready);
        result
    }

    async fn live_inner(
        &mut self,
        sink: &mut dyn PenEventSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.check_connection().await?;
        let mut pen_stream = self.connection.subscribe(UUID_LIVE_PEN_CHAR).await?;
        self.request(opcode::MODE_SELECT, vec![0x01], COMMAND_TIMEOUT)
            .await?;
        info!("{}: live mode started", self.address);

        let mut reassembler = FrameReassembler::new();
        let mut decoder = PointDecoder::new();
        loop {
            while let Some(record) = reassembler.next_record() {
                match decoder.decode(&record)? {
                    PenEvent::Point(point) => sink
                        .point(&point)
                        .map_err(|e| WacomError::protocol(format!("pen sink: {e}")))?,
                    PenEvent::StrokeStart => sink
                        .pen_up()
                        .map_err(|e| WacomError::protocol(format!("pen sink: {e}")))?,
                    PenEvent::EndOfDrawing => {
                        return Err(WacomError::protocol(
                            "end-of-drawing record in live stream",
                        ))
                    }
                }
            }
            tokio::select! {
                chunk = pen_stream.next() => match chunk {
                    Some(chunk) => reassembler.push(&chunk),
                    None => return Err(WacomError::TransportLost),
                },
                _ = self.lost.cancelled() => return Err(WacomError::TransportLost),
                _ = cancel.cancelled() => {
                    info!("{}: live mode stopped", self.address);
                    return Ok(());
                }
            }
        }
    }

    /// Idle in listen mode until the user presses the device button,
    /// refreshing the battery reading on a fixed interval. Returns
    /// `Ok(true)` on a press and `Ok(false)` when cancelled; listening has
    /// no intrinsic timeout.
    ///
    /// The Spark has no button characteristic; there the wait only ends
    /// with cancellation or the device dropping the link after its
    /// inactivity timeout.
    pub async fn listen_idle(&mut self, cancel: &CancellationToken) -> Result<bool> {
        let start = tokio::time::Instant::now() + BATTERY_POLL_INTERVAL;
        let mut poll = tokio::time::interval_at(start, BATTERY_POLL_INTERVAL);
        loop {
            let mut battery_due = false;
            {
                match self.button.as_mut() {
                    Some(stream) => tokio::select! {
                        press = stream.next() => match press {
                            Some(_) => return Ok(true),
                            None => return Err(WacomError::TransportLost),
                        },
                        _ = self.lost.cancelled() => return Err(WacomError::TransportLost),
                        _ = cancel.cancelled() => return Ok(false),
                        _ = poll.tick() => battery_due = true,
                    },
                    None => tokio::select! {
                        _ = self.lost.cancelled() => return Err(WacomError::TransportLost),
                        _ = cancel.cancelled() => return Ok(false),
                        _ = poll.tick() => battery_due = true,
                    },
                }
            }
            if battery_due {
                self.read_battery().await?;
            }
        }
    }

    // -- typed commands ---------------------------------------------------

    async fn check_connection(&mut self) -> Result<()> {
        let uuid = self.auth_uuid.ok_or(WacomError::NotAuthorized)?;
        self.request(opcode::AUTH, uuid.to_vec(), COMMAND_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn set_time(&mut self) -> Result<()> {
        let payload = self.family.encode_time(Utc::now());
        self.request(opcode::TIME, payload, COMMAND_TIMEOUT).await?;
        Ok(())
    }

    async fn read_time(&mut self) -> Result<u64> {
        let resp = self.request(opcode::TIME, vec![], COMMAND_TIMEOUT).await?;
        let device_time = self.family.decode_time(&resp.payload)?;
        let host_time = Utc::now().timestamp() as u64;
        let drift = device_time.abs_diff(host_time);
        if drift > CLOCK_DRIFT_WARNING.as_secs() {
            error!(
                "{}: device clock is out by {drift} seconds",
                self.address
            );
        }
        Ok(device_time)
    }

    async fn read_battery_inner(&mut self) -> Result<(u8, BatteryState)> {
        let resp = self
            .request(opcode::BATTERY, vec![], COMMAND_TIMEOUT)
            .await?;
        if resp.payload.len() < 2 {
            return Err(WacomError::protocol("short battery response"));
        }
        let percent = resp.payload[0].min(100);
        let state = if resp.payload[1] == 1 {
            BatteryState::Charging
        } else {
            BatteryState::Discharging
        };
        debug!("{}: battery {percent}%, {state:?}", self.address);
        self.emit(SessionEvent::Battery { percent, state });
        Ok((percent, state))
    }

    async fn get_name(&mut self) -> Result<String> {
        let resp = self.request(opcode::NAME, vec![], COMMAND_TIMEOUT).await?;
        Ok(String::from_utf8_lossy(&resp.payload)
            .trim_end_matches(['\0', '\n'])
            .to_string())
    }

    /// Rename the device (Spark and Slate only).
    pub async fn set_name(&mut self, name: &str) -> Result<()> {
        if !self.family.supports_set_name() {
            return Err(WacomError::NotReady);
        }
        let mut payload = name.as_bytes().to_vec();
        if let Some(terminator) = self.family.name_terminator() {
            payload.push(terminator);
        }
        self.request(opcode::NAME, payload, COMMAND_TIMEOUT).await?;
        self.device_name = name.to_string();
        Ok(())
    }

    async fn get_firmware(&mut self) -> Result<String> {
        let mut halves = Vec::with_capacity(2);
        for half in [0u8, 1u8] {
            let resp = self
                .request(opcode::FW_VERSION, vec![half], COMMAND_TIMEOUT)
                .await?;
            if resp.payload.is_empty() {
                return Err(WacomError::protocol("empty firmware response"));
            }
            // first payload byte echoes the requested half
            halves.push(self.family.decode_firmware(&resp.payload[1..]));
        }
        Ok(halves.join("-"))
    }

    async fn get_dimensions(&mut self) -> Result<(u32, u32)> {
        let mut out = [0u32; 2];
        for (i, axis) in [dimension_axis::WIDTH, dimension_axis::HEIGHT]
            .into_iter()
            .enumerate()
        {
            let resp = self
                .request(opcode::DIMENSIONS, vec![axis, 0x00], COMMAND_TIMEOUT)
                .await?;
            if resp.payload.len() != 6 {
                return Err(WacomError::protocol(format!(
                    "dimension response of {} bytes, expected 6",
                    resp.payload.len()
                )));
            }
            out[i] = u32::from_le_bytes([
                resp.payload[2],
                resp.payload[3],
                resp.payload[4],
                resp.payload[5],
            ]);
        }
        let dimensions = (out[0], out[1]);
        if dimensions != self.dimensions {
            self.emit(SessionEvent::Dimensions(dimensions));
        }
        Ok(dimensions)
    }

    // -- command plumbing -------------------------------------------------

    /// Write a command and await its response frame. Responses echo the
    /// command opcode and are matched FIFO.
    async fn request(
        &mut self,
        op: u8,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Response> {
        let frame = Command::new(op, payload).encode();
        self.connection
            .write(UUID_UART_WRITE_CHAR, &frame, WriteMode::WithResponse)
            .await?;
        self.pending.push_back(op);

        let resp = self.next_response(timeout).await?;
        self.match_pending(&resp)?;
        resp.check_status()?;
        Ok(resp)
    }

    fn match_pending(&mut self, resp: &Response) -> Result<()> {
        match self.pending.pop_front() {
            Some(expected) if expected == resp.opcode => Ok(()),
            Some(expected) => Err(WacomError::protocol(format!(
                "expected response for {expected:#04x}, got {:#04x}",
                resp.opcode
            ))),
            None => Err(WacomError::protocol(format!(
                "unsolicited response {:#04x}",
                resp.opcode
            ))),
        }
    }

    async fn next_response(&mut self, timeout: Duration) -> Result<Response> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(resp) = self.reassembler.next_response() {
                return Ok(resp);
            }
            tokio::select! {
                chunk = self.uart.next() => match chunk {
                    Some(chunk) => self.reassembler.push(&chunk),
                    None => return Err(WacomError::TransportLost),
                },
                _ = self.lost.cancelled() => return Err(WacomError::TransportLost),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(WacomError::Timeout("command response"));
                }
            }
        }
    }

    async fn next_record(
        &mut self,
        timeout: Duration,
    ) -> Result<crate::core::protocol::wire::RawRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.reassembler.next_record() {
                return Ok(record);
            }
            tokio::select! {
                chunk = self.uart.next() => match chunk {
                    Some(chunk) => self.reassembler.push(&chunk),
                    None => return Err(WacomError::TransportLost),
                },
                _ = self.lost.cancelled() => return Err(WacomError::TransportLost),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(WacomError::Timeout("pen data"));
                }
            }
        }
    }

    fn expect_ready(&self) -> Result<()> {
        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::Busy(_) => Err(WacomError::Busy),
            _ => Err(WacomError::NotReady),
        }
    }

    fn transition(&mut self, to: SessionState) {
        debug!("{}: {:?} → {to:?}", self.address, self.state);
        self.state = to;
    }

    fn emit(&self, event: SessionEvent) {
        // the receiving end outlives every session; a send failure only
        // happens during shutdown
        let _ = self.events.send(event);
    }
}

/// Which dialect a freshly discovered device speaks, judged from its
/// service topology: the Spark lacks the button characteristic, only the
/// Intuos Pro exposes the live-pen characteristic.
fn detect_family(services: &[ServiceInfo]) -> Result<ProtocolFamily> {
    let uart = services
        .iter()
        .find(|s| s.uuid == UUID_UART_SERVICE)
        .ok_or(WacomError::UnsupportedDevice)?;
    let has = |uuid| uart.characteristic(uuid).is_some();
    if !has(UUID_UART_NOTIFY_CHAR) || !has(UUID_UART_WRITE_CHAR) {
        return Err(WacomError::UnsupportedDevice);
    }

    let any_char = |uuid| {
        services
            .iter()
            .any(|s| s.characteristic(uuid).is_some())
    };
    if any_char(UUID_LIVE_PEN_CHAR) {
        Ok(ProtocolFamily::IntuosPro)
    } else if any_char(UUID_BUTTON_CHAR) {
        Ok(ProtocolFamily::Slate)
    } else {
        Ok(ProtocolFamily::Spark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::{UUID_BUTTON_CHAR, UUID_UART_NOTIFY_CHAR};
    use crate::core::bluetooth::mock::{record, response, MockConnection, MockTransport};
    use crate::core::protocol::wire::status;

    const ADDR: &str = "E2:AA:12:34:56:78";
    const UUID16: [u8; 16] = [0x42; 16];

    fn uart(frame: Vec<u8>) -> (uuid::Uuid, Vec<u8>) {
        (UUID_UART_NOTIFY_CHAR, frame)
    }

    fn config(registered: bool, family: ProtocolFamily) -> SessionConfig {
        SessionConfig {
            address: ADDR.to_string(),
            device_name: "Bamboo Slate".to_string(),
            registration: registered.then_some((UUID16, family)),
        }
    }

    fn events() -> (
        mpsc::UnboundedSender<SessionEvent>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    /// Script the preamble every fetch runs: auth, set time, battery,
    /// dimensions, read time.
    fn script_fetch_preamble(conn: &MockConnection, family: ProtocolFamily) {
        conn.expect(opcode::AUTH, vec![uart(response(opcode::AUTH, status::OK, &[]))]);
        conn.expect(opcode::TIME, vec![uart(response(opcode::TIME, status::OK, &[]))]);
        conn.expect(
            opcode::BATTERY,
            vec![uart(response(opcode::BATTERY, status::OK, &[80, 0]))],
        );
        let dim = |v: u32| {
            let b = v.to_le_bytes();
            response(opcode::DIMENSIONS, status::OK, &[0, 0, b[0], b[1], b[2], b[3]])
        };
        conn.expect(opcode::DIMENSIONS, vec![uart(dim(21600))]);
        conn.expect(opcode::DIMENSIONS, vec![uart(dim(14800))]);
        let now = family.encode_time(Utc::now());
        conn.expect(opcode::TIME, vec![uart(response(opcode::TIME, status::OK, &now))]);
    }

    async fn established(
        family: ProtocolFamily,
    ) -> (
        DeviceSession,
        std::sync::Arc<MockConnection>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let conn = MockConnection::new(MockConnection::smartpad_services(family));
        let transport = MockTransport::new(conn.clone());
        conn.expect(opcode::AUTH, vec![uart(response(opcode::AUTH, status::OK, &[]))]);
        let (tx, rx) = events();
        let session = DeviceSession::establish(&*transport, config(true, family), tx)
            .await
            .unwrap();
        (session, conn, rx)
    }

    #[tokio::test]
    async fn test_establish_authenticates() {
        let (session, conn, _rx) = established(ProtocolFamily::Slate).await;
        assert_eq!(session.state(), SessionState::Ready);
        let written = conn.written();
        let auth = &written[0].1;
        assert_eq!(auth[0], opcode::AUTH);
        assert_eq!(auth[1], 16);
        assert_eq!(&auth[2..], &UUID16);
    }

    #[tokio::test]
    async fn test_establish_rejects_unknown_services() {
        let conn = MockConnection::new(vec![]);
        let transport = MockTransport::new(conn.clone());
        let (tx, _rx) = events();
        let err = DeviceSession::establish(&*transport, config(true, ProtocolFamily::Slate), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, WacomError::UnsupportedDevice));
    }

    #[tokio::test]
    async fn test_establish_surfaces_auth_rejection() {
        let conn = MockConnection::new(MockConnection::smartpad_services(ProtocolFamily::Slate));
        let transport = MockTransport::new(conn.clone());
        conn.expect(
            opcode::AUTH,
            vec![uart(response(opcode::AUTH, status::NOT_AUTHORIZED, &[]))],
        );
        let (tx, _rx) = events();
        let err = DeviceSession::establish(&*transport, config(true, ProtocolFamily::Slate), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, WacomError::NotAuthorized));
    }

    #[tokio::test]
    async fn test_family_detection() {
        for (family, expected) in [
            (ProtocolFamily::Spark, ProtocolFamily::Spark),
            (ProtocolFamily::Slate, ProtocolFamily::Slate),
            (ProtocolFamily::IntuosPro, ProtocolFamily::IntuosPro),
        ] {
            let services = MockConnection::smartpad_services(family);
            assert_eq!(detect_family(&services).unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_fetch_one_drawing() {
        let (mut session, conn, mut rx) = established(ProtocolFamily::Slate).await;
        script_fetch_preamble(&conn, ProtocolFamily::Slate);

        // first read: stroke delimiter, absolute point, delta point, end
        let dp = (-200i16).to_le_bytes();
        let mut stream = Vec::new();
        stream.extend(record(0xff, &[]));
        stream.extend(record(0xfa, &[0, 0, 100, 0, 200, 0, 0xe8, 0x03]));
        stream.extend(record(0x07, &[2, dp[0], dp[1]]));
        stream.extend(record(opcode::END_OF_DRAWING, &[]));

        let mut replies = vec![uart(response(opcode::MODE_SELECT, status::OK, &[]))];
        replies.extend(stream.chunks(20).map(|c| uart(c.to_vec())));
        conn.expect(opcode::MODE_SELECT, replies);
        conn.expect(
            opcode::ACK_DATA,
            vec![uart(response(opcode::ACK_DATA, status::OK, &[]))],
        );
        // second read: nothing left
        conn.expect(
            opcode::MODE_SELECT,
            vec![uart(response(opcode::MODE_SELECT, status::NOT_READY, &[]))],
        );

        let fetched = session.fetch_drawings().await.unwrap();
        assert_eq!(fetched, 1);
        assert_eq!(session.state(), SessionState::Ready);

        let mut drawing = None;
        while let Ok(ev) = rx.try_recv() {
            if let SessionEvent::Drawing(d) = ev {
                drawing = Some(d);
            }
        }
        let drawing = drawing.expect("drawing event");
        assert_eq!(drawing.strokes.len(), 1);
        let points = &drawing.strokes[0].points;
        assert_eq!(points.len(), 2);
        // slate rotation: (100, 200) -> (200, 21500)
        assert_eq!(points[0].position, Some((200, 21500)));
        assert_eq!(points[0].pressure, Some(1000));
        assert_eq!(points[1].toffset, 2);
        assert_eq!(points[1].position, None);
        assert_eq!(points[1].pressure, Some(800));

        // exactly one ack for exactly one drawing
        let acks = conn
            .written_opcodes()
            .iter()
            .filter(|op| **op == opcode::ACK_DATA)
            .count();
        assert_eq!(acks, 1);
    }

    #[tokio::test]
    async fn test_corrupt_frame_aborts_without_ack() {
        let (mut session, conn, _rx) = established(ProtocolFamily::Slate).await;
        script_fetch_preamble(&conn, ProtocolFamily::Slate);

        // absolute point record with a short payload: length byte says 6,
        // but an absolute point must carry 8 bytes
        let mut stream = Vec::new();
        stream.extend(record(0xff, &[]));
        stream.extend(record(0xfa, &[0, 0, 100, 0, 200, 0]));

        let mut replies = vec![uart(response(opcode::MODE_SELECT, status::OK, &[]))];
        replies.extend(stream.chunks(20).map(|c| uart(c.to_vec())));
        conn.expect(opcode::MODE_SELECT, replies);
        // the session resets the device out of transfer mode
        conn.expect(
            opcode::RESET,
            vec![uart(response(opcode::RESET, status::OK, &[]))],
        );

        let err = session.fetch_drawings().await.unwrap_err();
        assert_eq!(err.rpc_status(), -71); // EPROTO
        assert!(!conn.written_opcodes().contains(&opcode::ACK_DATA));
    }

    #[tokio::test]
    async fn test_register_happy_path() {
        let conn = MockConnection::new(MockConnection::smartpad_services(ProtocolFamily::Slate));
        let transport = MockTransport::new(conn.clone());
        let (tx, mut rx) = events();
        let mut session =
            DeviceSession::establish(&*transport, config(false, ProtocolFamily::Slate), tx)
                .await
                .unwrap();

        conn.expect(
            opcode::REGISTER,
            vec![
                uart(response(opcode::REGISTER, status::OK, &[])),
                (UUID_BUTTON_CHAR, vec![0x01]), // user presses the button
            ],
        );
        conn.expect(opcode::TIME, vec![uart(response(opcode::TIME, status::OK, &[]))]);
        let now = ProtocolFamily::Slate.encode_time(Utc::now());
        conn.expect(opcode::TIME, vec![uart(response(opcode::TIME, status::OK, &now))]);
        conn.expect(
            opcode::NAME,
            vec![uart(response(opcode::NAME, status::OK, b"Bamboo Slate\n"))],
        );
        conn.expect(
            opcode::FW_VERSION,
            vec![uart(response(opcode::FW_VERSION, status::OK, &[0, 0x01, 0x04]))],
        );
        conn.expect(
            opcode::FW_VERSION,
            vec![uart(response(opcode::FW_VERSION, status::OK, &[1, 0x02, 0x0a]))],
        );
        let dim = |v: u32| {
            let b = v.to_le_bytes();
            response(opcode::DIMENSIONS, status::OK, &[0, 0, b[0], b[1], b[2], b[3]])
        };
        conn.expect(opcode::DIMENSIONS, vec![uart(dim(21600))]);
        conn.expect(opcode::DIMENSIONS, vec![uart(dim(14800))]);
        conn.expect(
            opcode::BATTERY,
            vec![uart(response(opcode::BATTERY, status::OK, &[55, 1]))],
        );

        let outcome = session.register().await.unwrap();
        assert_eq!(outcome.family, ProtocolFamily::Slate);
        assert_eq!(outcome.name, "Bamboo Slate");
        assert_eq!(outcome.dimensions, (21600, 14800));
        assert_eq!(outcome.firmware, "14-2A");

        // the register frame carried 16 random bytes
        let register_frame = conn
            .written()
            .iter()
            .find(|(_, f)| f[0] == opcode::REGISTER)
            .unwrap()
            .1
            .clone();
        assert_eq!(register_frame[1], 16);
        assert_eq!(&register_frame[2..], &outcome.uuid);

        let mut saw_prompt = false;
        let mut saw_battery = false;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                SessionEvent::ButtonPressRequired => saw_prompt = true,
                SessionEvent::Battery { percent, state } => {
                    assert_eq!(percent, 55);
                    assert_eq!(state, BatteryState::Charging);
                    saw_battery = true;
                }
                _ => {}
            }
        }
        assert!(saw_prompt);
        assert!(saw_battery);
    }

    #[tokio::test]
    async fn test_register_wrong_mode_is_not_ready() {
        let conn = MockConnection::new(MockConnection::smartpad_services(ProtocolFamily::Slate));
        let transport = MockTransport::new(conn.clone());
        let (tx, _rx) = events();
        let mut session =
            DeviceSession::establish(&*transport, config(false, ProtocolFamily::Slate), tx)
                .await
                .unwrap();

        conn.expect(
            opcode::REGISTER,
            vec![uart(response(opcode::REGISTER, status::NOT_READY, &[]))],
        );
        let err = session.register().await.unwrap_err();
        assert_eq!(err.rpc_status(), -52); // EBADE
    }

    #[tokio::test]
    async fn test_live_unsupported_on_slate() {
        let (mut session, _conn, _rx) = established(ProtocolFamily::Slate).await;
        let mut sink = crate::uhid::RecordingSink::default();
        let err = session
            .live(&mut sink, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WacomError::NotReady));
    }

    #[tokio::test]
    async fn test_live_forwards_points_to_sink() {
        let (mut session, conn, _rx) = established(ProtocolFamily::IntuosPro).await;

        conn.expect(opcode::AUTH, vec![uart(response(opcode::AUTH, status::OK, &[]))]);
        let mut stream = Vec::new();
        stream.extend(record(0xff, &[]));
        stream.extend(record(0xfa, &[0, 0, 10, 0, 20, 0, 0x64, 0x00]));
        stream.extend(record(0x08, &[5, 5]));
        conn.expect(
            opcode::MODE_SELECT,
            vec![
                uart(response(opcode::MODE_SELECT, status::OK, &[])),
                (UUID_LIVE_PEN_CHAR, stream),
            ],
        );
        conn.expect(
            opcode::MODE_SELECT,
            vec![uart(response(opcode::MODE_SELECT, status::OK, &[]))],
        );

        let cancel = CancellationToken::new();
        let mut sink = crate::uhid::RecordingSink::default();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.cancel();
        });
        session.live(&mut sink, cancel).await.unwrap();

        assert_eq!(sink.pen_ups, 1);
        assert_eq!(sink.points.len(), 2);
        assert_eq!(sink.points[0].position, Some((10, 20)));
        assert_eq!(sink.points[1].position, Some((15, 25)));
        assert_eq!(session.state(), SessionState::Ready);

        // live start then live stop on the mode-select opcode
        let modes: Vec<Vec<u8>> = conn
            .written()
            .into_iter()
            .filter(|(_, f)| f[0] == opcode::MODE_SELECT)
            .map(|(_, f)| f)
            .collect();
        assert_eq!(modes[0][2], 0x01);
        assert_eq!(modes[1][2], 0x02);
    }

    #[tokio::test]
    async fn test_set_name() {
        let (mut session, conn, _rx) = established(ProtocolFamily::Slate).await;
        conn.expect(opcode::NAME, vec![uart(response(opcode::NAME, status::OK, &[]))]);
        session.set_name("Kitchen Slate").await.unwrap();

        let frame = conn
            .written()
            .iter()
            .find(|(_, f)| f[0] == opcode::NAME)
            .unwrap()
            .1
            .clone();
        assert_eq!(&frame[2..], b"Kitchen Slate\n");

        let (mut session, _conn, _rx) = established(ProtocolFamily::IntuosPro).await;
        assert!(matches!(
            session.set_name("nope").await,
            Err(WacomError::NotReady)
        ));
    }

    #[tokio::test]
    async fn test_transport_loss_during_fetch() {
        let (mut session, conn, _rx) = established(ProtocolFamily::Slate).await;
        conn.expect(opcode::AUTH, vec![uart(response(opcode::AUTH, status::OK, &[]))]);
        conn.drop_connection();
        let err = session.fetch_drawings().await.unwrap_err();
        assert!(matches!(err, WacomError::TransportLost));
    }
}
