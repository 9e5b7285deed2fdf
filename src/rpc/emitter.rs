//! Signal emission towards the session bus.
//!
//! The bus binding itself is an external collaborator; the daemon core
//! emits typed signals and property-change notifications through this
//! trait and stays ignorant of bus names and object paths.

use log::info;

/// Signals of the Manager and Device RPC objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TuhiSignal {
    UnregisteredDevice { address: String },
    SearchStopped { status: i32 },
    ButtonPressRequired { address: String },
    ListeningStopped { address: String, status: i32 },
    LiveStopped { address: String, status: i32 },
    SyncState { address: String, state: i32 },
}

pub trait SignalEmitter: Send + Sync {
    fn signal(&self, signal: TuhiSignal);

    /// A property of `object` (a device address, or "manager") changed.
    fn property_changed(&self, object: &str, property: &str, value: serde_json::Value);
}

/// Emitter used when no bus binding is attached; signals only reach the
/// log.
#[derive(Debug, Default)]
pub struct LogEmitter;

impl SignalEmitter for LogEmitter {
    fn signal(&self, signal: TuhiSignal) {
        info!("signal: {signal:?}");
    }

    fn property_changed(&self, object: &str, property: &str, value: serde_json::Value) {
        info!("property changed: {object}.{property} = {value}");
    }
}

/// Test emitter capturing everything emitted.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    pub signals: std::sync::Mutex<Vec<TuhiSignal>>,
    pub properties: std::sync::Mutex<Vec<(String, String)>>,
}

#[cfg(test)]
impl RecordingEmitter {
    pub fn signals(&self) -> Vec<TuhiSignal> {
        self.signals.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl SignalEmitter for RecordingEmitter {
    fn signal(&self, signal: TuhiSignal) {
        self.signals.lock().unwrap().push(signal);
    }

    fn property_changed(&self, object: &str, property: &str, _value: serde_json::Value) {
        self.properties
            .lock()
            .unwrap()
            .push((object.to_string(), property.to_string()));
    }
}
