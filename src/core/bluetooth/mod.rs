//! The GATT transport layer: the adapter abstraction, the search scanner,
//! and the constants describing the SmartPad services.

pub mod constants;
pub mod scanner;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod mock;
