//! Core functionality of the daemon: the transport layer, the SmartPad
//! protocol engine, and the drawing model it produces.

pub mod assembler;
pub mod bluetooth;
pub mod drawing;
pub mod protocol;

// Re-export commonly used types
pub use drawing::Drawing;
pub use protocol::ProtocolFamily;
