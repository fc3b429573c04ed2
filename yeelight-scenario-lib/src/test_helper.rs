use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::control_interface::ControlError;
use crate::util::message::DeviceRecord;
use crate::util::traits::{BulbConnector, BulbControl, RecordSink};

#[derive(Clone, Copy)]
enum Behaviour {
    Accept,
    NotifyFirst,
    Reject,
}

/// A bulb served on loopback that answers every command with `["ok"]` and
/// records what it received.
pub struct FakeBulb {
    address: SocketAddr,
    handle: JoinHandle<Vec<Value>>,
}

impl FakeBulb {
    pub async fn start() -> Self {
        Self::spawn(Behaviour::Accept).await
    }

    /// Pushes a `props` notification ahead of every response.
    pub async fn start_with_notification() -> Self {
        Self::spawn(Behaviour::NotifyFirst).await
    }

    /// Answers every command with an error object.
    pub async fn start_rejecting() -> Self {
        Self::spawn(Behaviour::Reject).await
    }

    async fn spawn(behaviour: Behaviour) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            let mut received = Vec::new();
            loop {
                let mut line = String::new();
                if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                if line.trim().is_empty() {
                    continue;
                }
                let command: Value = serde_json::from_str(line.trim()).unwrap();
                let id = command["id"].clone();
                received.push(command);

                let mut reply = String::new();
                if let Behaviour::NotifyFirst = behaviour {
                    reply.push_str(
                        &json!({"method": "props", "params": {"power": "on"}}).to_string(),
                    );
                    reply.push_str("\r\n");
                }
                let response = match behaviour {
                    Behaviour::Reject => {
                        json!({"id": id, "error": {"code": -1, "message": "unsupported method"}})
                    }
                    _ => json!({"id": id, "result": ["ok"]}),
                };
                reply.push_str(&response.to_string());
                reply.push_str("\r\n");
                if stream.get_mut().write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
            received
        });
        FakeBulb { address, handle }
    }

    pub fn address(&self) -> String {
        self.address.to_string()
    }

    /// Waits for the client to hang up and returns the commands received.
    pub async fn finish(self) -> Vec<Value> {
        self.handle.await.unwrap()
    }
}

/// One observable step performed through [`RecordingConnector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect(String),
    ColorTemperature(u32),
    Brightness(u8),
    Close,
}

/// A connector double that logs every call, with the values exactly as the
/// engine passed them, instead of touching the network.
#[derive(Clone, Default)]
pub struct RecordingConnector {
    calls: Arc<Mutex<Vec<Call>>>,
    refuse: Vec<String>,
    fail_brightness: bool,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connecting to `address` fails with a connection error.
    pub fn refusing(mut self, address: &str) -> Self {
        self.refuse.push(address.to_string());
        self
    }

    /// Every `set_brightness` fails with a timeout.
    pub fn failing_brightness(mut self) -> Self {
        self.fail_brightness = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Connect(_)))
            .count()
    }
}

struct RecordingSession {
    calls: Arc<Mutex<Vec<Call>>>,
    fail_brightness: bool,
}

#[async_trait]
impl BulbConnector for RecordingConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn BulbControl>, ControlError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Connect(address.to_string()));
        if self.refuse.iter().any(|refused| refused == address) {
            return Err(ControlError::Connection {
                address: address.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }
        Ok(Box::new(RecordingSession {
            calls: self.calls.clone(),
            fail_brightness: self.fail_brightness,
        }))
    }
}

#[async_trait]
impl BulbControl for RecordingSession {
    async fn set_color_temperature(&mut self, kelvin: u32) -> Result<(), ControlError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::ColorTemperature(kelvin));
        Ok(())
    }

    async fn set_brightness(&mut self, percent: u8) -> Result<(), ControlError> {
        if self.fail_brightness {
            return Err(ControlError::Timeout(std::time::Duration::from_secs(5)));
        }
        self.calls
            .lock()
            .unwrap()
            .push(Call::Brightness(percent));
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), ControlError> {
        self.calls.lock().unwrap().push(Call::Close);
        Ok(())
    }
}

/// Collects every record handed to it.
#[derive(Clone, Default)]
pub struct CollectingSink {
    records: Arc<Mutex<Vec<DeviceRecord>>>,
}

impl CollectingSink {
    pub fn records(&self) -> Vec<DeviceRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordSink for CollectingSink {
    async fn on_record(&self, record: DeviceRecord) {
        self.records.lock().unwrap().push(record);
    }
}

pub fn record(identity: &str, color_temperature: u32, brightness: u8) -> DeviceRecord {
    DeviceRecord {
        identity: identity.to_string(),
        color_temperature,
        color_mode: 2,
        brightness,
    }
}
