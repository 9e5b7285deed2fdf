//! Wire framing for the Nordic-UART command channel.
//!
//! Commands host→tablet are framed `[opcode][length][payload]`. Responses
//! tablet→host echo the opcode and carry a status byte:
//! `[opcode][status][length][payload]`. During a fetch the same channel
//! switches to pen-data records framed `[type][length][payload]`.
//!
//! The tablet notifies in chunks of at most 20 bytes, so frames may be
//! split arbitrarily; [`FrameReassembler`] accumulates chunks and cuts
//! frames against the embedded length field.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Result, WacomError};

/// Opcodes shared by all SmartPad families.
pub mod opcode {
    /// Reset the device out of whatever transfer mode it is in.
    pub const RESET: u8 = 0xb0;
    /// Mode select: `[0x00]` starts an offline read, `[0x01]` starts live
    /// mode, `[0x02]` stops live mode.
    pub const MODE_SELECT: u8 = 0xb1;
    /// Get (empty payload) or set (timestamp payload) the device clock.
    pub const TIME: u8 = 0xb6;
    /// Firmware version half, selected by the payload byte.
    pub const FW_VERSION: u8 = 0xb7;
    /// Battery percent and charging state.
    pub const BATTERY: u8 = 0xb9;
    /// Get (empty payload) or set (name payload) the device name.
    pub const NAME: u8 = 0xbb;
    /// End-of-drawing record on the bulk channel.
    pub const END_OF_DRAWING: u8 = 0xc8;
    /// Acknowledge a completed transfer, deleting it from device storage.
    pub const ACK_DATA: u8 = 0xca;
    /// Sensor dimension for the axis named in the payload.
    pub const DIMENSIONS: u8 = 0xea;
    /// Authenticate with the registered UUID.
    pub const AUTH: u8 = 0xe6;
    /// Register a new UUID with the device.
    pub const REGISTER: u8 = 0xe7;
}

/// Response status bytes.
pub mod status {
    pub const OK: u8 = 0x00;
    pub const BUSY: u8 = 0x01;
    pub const NOT_AUTHORIZED: u8 = 0x02;
    pub const NOT_READY: u8 = 0x03;
    pub const PROTOCOL_ERROR: u8 = 0x07;
}

/// Dimension-axis selectors for [`opcode::DIMENSIONS`].
pub mod dimension_axis {
    pub const WIDTH: u8 = 0x03;
    pub const HEIGHT: u8 = 0x04;
}

/// Maximum notification chunk size emitted by the tablets.
pub const CHUNK_SIZE: usize = 20;

const RESPONSE_HEADER: usize = 3;
const RECORD_HEADER: usize = 2;

/// A command to be written on the UART write characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Command {
    pub fn new(opcode: u8, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        debug_assert!(payload.len() <= u8::MAX as usize);
        Command { opcode, payload }
    }

    /// The on-wire form: `[opcode][length][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.payload.len());
        out.push(self.opcode);
        out.push(self.payload.len() as u8);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// A response frame from the UART notify characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: u8,
    pub status: u8,
    pub payload: Bytes,
}

impl Response {
    /// Map a non-zero status byte onto the error taxonomy.
    pub fn check_status(&self) -> Result<()> {
        match self.status {
            status::OK => Ok(()),
            status::BUSY => Err(WacomError::Busy),
            status::NOT_AUTHORIZED => Err(WacomError::NotAuthorized),
            status::NOT_READY => Err(WacomError::NotReady),
            status::PROTOCOL_ERROR => Err(WacomError::protocol(format!(
                "device reported protocol error for opcode {:#04x}",
                self.opcode
            ))),
            other => Err(WacomError::protocol(format!(
                "unknown status {other:#04x} for opcode {:#04x}",
                self.opcode
            ))),
        }
    }
}

/// A raw pen-data record cut from the bulk stream; interpreted by the
/// pen decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub kind: u8,
    pub payload: Bytes,
}

/// Accumulates notification chunks and cuts frames out of them.
///
/// The framing mode is chosen per call: command responses while a command
/// is in flight, pen records while a fetch stream is active. The session
/// state machine guarantees the two never interleave on the wire.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    buf: BytesMut,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// True when no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop any buffered bytes, e.g. when a session is torn down.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Cut the next `[opcode][status][length][payload]` response frame.
    ///
    /// Returns `None` until a complete frame is buffered.
    pub fn next_response(&mut self) -> Option<Response> {
        if self.buf.len() < RESPONSE_HEADER {
            return None;
        }
        let length = self.buf[2] as usize;
        if self.buf.len() < RESPONSE_HEADER + length {
            return None;
        }
        let opcode = self.buf.get_u8();
        let status = self.buf.get_u8();
        self.buf.advance(1); // length
        let payload = self.buf.split_to(length).freeze();
        Some(Response {
            opcode,
            status,
            payload,
        })
    }

    /// Cut the next `[type][length][payload]` pen-data record.
    ///
    /// Returns `None` until a complete record is buffered.
    pub fn next_record(&mut self) -> Option<RawRecord> {
        if self.buf.len() < RECORD_HEADER {
            return None;
        }
        let length = self.buf[1] as usize;
        if self.buf.len() < RECORD_HEADER + length {
            return None;
        }
        let kind = self.buf.get_u8();
        self.buf.advance(1); // length
        let payload = self.buf.split_to(length).freeze();
        Some(RawRecord { kind, payload })
    }
}
