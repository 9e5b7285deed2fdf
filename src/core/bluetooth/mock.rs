//! Scripted transport double for protocol and registry tests.
//!
//! A [`MockConnection`] is loaded with expected command frames and the
//! notification chunks to deliver in response; spontaneous notifications
//! (button presses) can be pushed at any time.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    UUID_BUTTON_CHAR, UUID_BUTTON_SERVICE, UUID_LIVE_PEN_CHAR, UUID_LIVE_SERVICE,
    UUID_UART_NOTIFY_CHAR, UUID_UART_SERVICE, UUID_UART_WRITE_CHAR,
};
use crate::core::bluetooth::transport::{Connection, Transport};
use crate::core::bluetooth::types::{
    Advertisement, CharacteristicInfo, ServiceInfo, WriteMode,
};
use crate::core::protocol::ProtocolFamily;
use crate::error::{Result, WacomError};

/// One scripted command/response exchange on the UART channel.
struct Exchange {
    expect_opcode: u8,
    replies: Vec<(Uuid, Vec<u8>)>,
}

#[derive(Default)]
pub struct MockConnection {
    services: Vec<ServiceInfo>,
    exchanges: Mutex<VecDeque<Exchange>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    channels: Mutex<HashMap<Uuid, mpsc::UnboundedSender<Vec<u8>>>>,
    pending: Mutex<HashMap<Uuid, Vec<Vec<u8>>>>,
    disconnected: CancellationToken,
}

impl MockConnection {
    pub fn new(services: Vec<ServiceInfo>) -> Arc<Self> {
        Arc::new(MockConnection {
            services,
            ..Default::default()
        })
    }

    /// The service topology of a given family, per the detection rules:
    /// Spark has no button characteristic, only the Intuos Pro has the
    /// live service.
    pub fn smartpad_services(family: ProtocolFamily) -> Vec<ServiceInfo> {
        let chrc = |uuid, can_notify, can_write| CharacteristicInfo {
            uuid,
            can_notify,
            can_write,
        };
        let mut services = vec![ServiceInfo {
            uuid: UUID_UART_SERVICE,
            characteristics: vec![
                chrc(UUID_UART_WRITE_CHAR, false, true),
                chrc(UUID_UART_NOTIFY_CHAR, true, false),
            ],
        }];
        if family != ProtocolFamily::Spark {
            services.push(ServiceInfo {
                uuid: UUID_BUTTON_SERVICE,
                characteristics: vec![chrc(UUID_BUTTON_CHAR, true, false)],
            });
        }
        if family == ProtocolFamily::IntuosPro {
            services.push(ServiceInfo {
                uuid: UUID_LIVE_SERVICE,
                characteristics: vec![chrc(UUID_LIVE_PEN_CHAR, true, false)],
            });
        }
        services
    }

    /// Script the reply to the next command with the given opcode. Replies
    /// are `(characteristic, chunk)` pairs delivered in order.
    pub fn expect(&self, expect_opcode: u8, replies: Vec<(Uuid, Vec<u8>)>) {
        self.exchanges.lock().unwrap().push_back(Exchange {
            expect_opcode,
            replies,
        });
    }

    /// Deliver a spontaneous notification, e.g. a button press.
    pub fn push_notification(&self, characteristic: Uuid, data: Vec<u8>) {
        let channels = self.channels.lock().unwrap();
        if let Some(tx) = channels.get(&characteristic) {
            let _ = tx.send(data);
        } else {
            self.pending
                .lock()
                .unwrap()
                .entry(characteristic)
                .or_default()
                .push(data);
        }
    }

    /// All frames written so far, for assertions.
    pub fn written(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    /// Opcodes of all frames written to the UART command characteristic.
    pub fn written_opcodes(&self) -> Vec<u8> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(uuid, _)| *uuid == UUID_UART_WRITE_CHAR)
            .map(|(_, frame)| frame[0])
            .collect()
    }

    pub fn drop_connection(&self) {
        self.disconnected.cancel();
    }
}

struct MockConnectionHandle(Arc<MockConnection>);

#[async_trait]
impl Connection for MockConnectionHandle {
    async fn discover_services(&self) -> Result<Vec<ServiceInfo>> {
        Ok(self.0.services.clone())
    }

    async fn read(&self, _characteristic: Uuid) -> Result<Vec<u8>> {
        Err(WacomError::NotFound("mock has no readable characteristics"))
    }

    async fn write(&self, characteristic: Uuid, data: &[u8], _mode: WriteMode) -> Result<()> {
        if self.0.disconnected.is_cancelled() {
            return Err(WacomError::TransportLost);
        }
        self.0
            .writes
            .lock()
            .unwrap()
            .push((characteristic, data.to_vec()));

        if characteristic == UUID_UART_WRITE_CHAR {
            let exchange = self.0.exchanges.lock().unwrap().pop_front();
            match exchange {
                Some(ex) => {
                    assert_eq!(
                        ex.expect_opcode, data[0],
                        "script expected opcode {:#04x}, device wrote {:#04x}",
                        ex.expect_opcode, data[0]
                    );
                    for (chrc, chunk) in ex.replies {
                        self.0.push_notification(chrc, chunk);
                    }
                }
                None => panic!("unscripted command {:#04x}", data[0]),
            }
        }
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<BoxStream<'static, Vec<u8>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(queued) = self.0.pending.lock().unwrap().remove(&characteristic) {
            for chunk in queued {
                let _ = tx.send(chunk);
            }
        }
        self.0.channels.lock().unwrap().insert(characteristic, tx);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|v| (v, rx))
        });
        Ok(stream.boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        self.0.disconnected.cancel();
        Ok(())
    }

    fn disconnected(&self) -> CancellationToken {
        self.0.disconnected.clone()
    }
}

/// Transport returning a fixed advertisement list and a shared scripted
/// connection.
pub struct MockTransport {
    pub advertisements: Mutex<Vec<Advertisement>>,
    pub connection: Arc<MockConnection>,
}

impl MockTransport {
    pub fn new(connection: Arc<MockConnection>) -> Arc<Self> {
        Arc::new(MockTransport {
            advertisements: Mutex::new(Vec::new()),
            connection,
        })
    }

    pub fn advertise(&self, ad: Advertisement) {
        self.advertisements.lock().unwrap().push(ad);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn scan(&self, _duration: Duration) -> Result<BoxStream<'static, Advertisement>> {
        let ads = self.advertisements.lock().unwrap().clone();
        Ok(futures_util::stream::iter(ads).boxed())
    }

    async fn connect(&self, _address: &str) -> Result<Box<dyn Connection>> {
        if self.connection.disconnected.is_cancelled() {
            return Err(WacomError::TransportLost);
        }
        Ok(Box::new(MockConnectionHandle(self.connection.clone())))
    }
}

/// Build a response frame `[opcode][status][length][payload]`.
pub fn response(opcode: u8, status: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![opcode, status, payload.len() as u8];
    out.extend_from_slice(payload);
    out
}

/// Build a pen-data record `[type][length][payload]`.
pub fn record(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![kind, payload.len() as u8];
    out.extend_from_slice(payload);
    out
}
