//! Error taxonomy for the SmartPad protocol engine.
//!
//! Every error kind maps onto a POSIX errno; the RPC surface reports
//! failures as negative errnos, so the mapping here is part of the
//! external contract.

use thiserror::Error;

// Linux errno values used by the RPC contract.
const EAGAIN: i32 = 11;
const EACCES: i32 = 13;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;
const ENOSYS: i32 = 38;
const EBADE: i32 = 52;
const ETIME: i32 = 62;
const EPROTO: i32 = 71;
const ENOENT: i32 = 2;

/// Errors raised while talking to a SmartPad device or validating its data.
#[derive(Debug, Error)]
pub enum WacomError {
    /// The daemon is already performing this operation for another client.
    #[error("operation already in progress")]
    Busy,

    /// The device is in the wrong mode for the requested operation.
    #[error("device is in the wrong mode")]
    NotReady,

    /// The registration UUID was rejected by the device.
    #[error("registration rejected, please re-register the device")]
    NotAuthorized,

    /// Frame parse failure, unexpected opcode, or corrupt pen data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A suspension point exceeded its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The transport disconnected mid-operation.
    #[error("transport lost")]
    TransportLost,

    /// The peer does not expose the expected vendor services.
    #[error("device is not a supported SmartPad")]
    UnsupportedDevice,

    /// A request argument was invalid (e.g. unsupported JSON version).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The requested object does not exist (unknown address or timestamp).
    #[error("not found: {0}")]
    NotFound(&'static str),
}

impl WacomError {
    /// Shorthand for a [`WacomError::Protocol`] with a formatted message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        WacomError::Protocol(msg.into())
    }

    /// The POSIX errno this error maps to.
    pub fn errno(&self) -> i32 {
        match self {
            WacomError::Busy => EAGAIN,
            WacomError::NotReady => EBADE,
            WacomError::NotAuthorized => EACCES,
            WacomError::Protocol(_) => EPROTO,
            WacomError::Timeout(_) => ETIME,
            WacomError::TransportLost => ENODEV,
            WacomError::UnsupportedDevice => ENOSYS,
            WacomError::InvalidArgument(_) => EINVAL,
            WacomError::NotFound(_) => ENOENT,
        }
    }

    /// The negative errno reported over the RPC surface.
    pub fn rpc_status(&self) -> i32 {
        -self.errno()
    }
}

pub type Result<T> = std::result::Result<T, WacomError>;
