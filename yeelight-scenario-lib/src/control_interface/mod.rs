use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::join_host_port;
use crate::util::traits::{BulbConnector, BulbControl};

/// Port the bulb listens on for control connections.
pub const DEFAULT_CONTROL_PORT: u16 = 55443;

/// Upper bound for connecting and for a single command round trip.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

pub const MIN_COLOR_TEMPERATURE: u32 = 1700;
pub const MAX_COLOR_TEMPERATURE: u32 = 6500;
pub const MIN_BRIGHTNESS: u8 = 1;
pub const MAX_BRIGHTNESS: u8 = 100;

/// Failures while talking to a bulb over its control connection.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("could not connect to {address}: {source}")]
    Connection {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("device did not answer within {0:?}")]
    Timeout(Duration),
    #[error("device rejected the command with code {code}: {message}")]
    Device { code: i64, message: String },
}

/// The command/response exchange itself broke down.
///
/// The session is in an undefined state afterwards and must be closed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("cannot encode command: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("cannot write command: {0}")]
    Write(#[source] io::Error),
    #[error("cannot read response: {0}")]
    Read(#[source] io::Error),
    #[error("cannot decode response `{line}`: {source}")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("connection closed before a response arrived")]
    Closed,
    #[error("response id {received} does not match request id {expected}")]
    UnexpectedId { expected: u64, received: u64 },
    #[error("response carries neither an id nor a method")]
    MissingId,
    #[error("cannot close connection: {0}")]
    Shutdown(#[source] io::Error),
}

/// Methods of the bulb control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    SetCtAbx,
    SetRgb,
    SetHsv,
    SetBright,
    SetPower,
    Toggle,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::SetCtAbx => "set_ct_abx",
            Method::SetRgb => "set_rgb",
            Method::SetHsv => "set_hsv",
            Method::SetBright => "set_bright",
            Method::SetPower => "set_power",
            Method::Toggle => "toggle",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            PowerState::On => "on",
            PowerState::Off => "off",
        };
        write!(f, "{}", state)
    }
}

#[derive(Debug, Serialize)]
struct Command<'a> {
    id: u64,
    method: &'a str,
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Response {
    id: Option<u64>,
    #[serde(default)]
    result: Vec<Value>,
    error: Option<DeviceErrorBody>,
    // Only present on unsolicited notifications such as `props`.
    method: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceErrorBody {
    code: i64,
    message: String,
}

/// Clamps a color temperature into the range the bulb accepts.
pub fn clamp_color_temperature(kelvin: u32) -> u32 {
    kelvin.clamp(MIN_COLOR_TEMPERATURE, MAX_COLOR_TEMPERATURE)
}

/// Clamps a brightness percentage into the range the bulb accepts.
pub fn clamp_brightness(percent: u8) -> u8 {
    percent.clamp(MIN_BRIGHTNESS, MAX_BRIGHTNESS)
}

/// Packs RGB components into the single integer `set_rgb` expects.
pub fn pack_rgb(red: u8, green: u8, blue: u8) -> u32 {
    ((red as u32) << 16) | ((green as u32) << 8) | blue as u32
}

/// Appends the default control port when `address` carries none.
pub fn with_default_port(address: &str) -> String {
    join_host_port(address, DEFAULT_CONTROL_PORT)
}

/**
A live control connection to one bulb.

Commands are strictly sequential: [`ControlSession::send`] writes one command
and waits for its response before returning, so a session never has more than
one request in flight. The session must be closed with
[`ControlSession::close`]; dropping it also releases the socket but skips the
orderly shutdown.
*/
#[derive(Debug)]
pub struct ControlSession {
    address: String,
    sequence_counter: u64,
    limit: Duration,
    stream: BufReader<TcpStream>,
}

impl ControlSession {
    pub async fn open(address: &str) -> Result<Self, ControlError> {
        Self::open_within(address, CONTROL_TIMEOUT).await
    }

    /// Opens a session whose connect and command round trips are each
    /// bounded by `limit`.
    pub async fn open_within(address: &str, limit: Duration) -> Result<Self, ControlError> {
        let address = with_default_port(address);
        let stream = timeout(limit, TcpStream::connect(&address))
            .await
            .map_err(|_| ControlError::Timeout(limit))?
            .map_err(|source| ControlError::Connection {
                address: address.clone(),
                source,
            })?;
        debug!("Opened control session to {}", address);
        Ok(ControlSession {
            address,
            sequence_counter: 0,
            limit,
            stream: BufReader::new(stream),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// The id the next command will carry.
    pub fn sequence_counter(&self) -> u64 {
        self.sequence_counter
    }

    /// Sends one command and waits for the matching response.
    ///
    /// Returns the `result` array of the response.
    pub async fn send(&mut self, method: Method, params: Vec<Value>) -> Result<Vec<Value>, ControlError> {
        let id = self.sequence_counter;
        let command = Command {
            id,
            method: method.as_str(),
            params,
        };
        let mut payload = serde_json::to_vec(&command).map_err(ProtocolError::Encode)?;
        payload.extend_from_slice(b"\r\n");

        debug!("{} <- {}", self.address, String::from_utf8_lossy(&payload).trim_end());
        let limit = self.limit;
        let result = timeout(limit, self.exchange(id, &payload))
            .await
            .map_err(|_| ControlError::Timeout(limit))??;

        self.sequence_counter += 1;
        Ok(result)
    }

    async fn exchange(&mut self, id: u64, payload: &[u8]) -> Result<Vec<Value>, ControlError> {
        self.stream
            .get_mut()
            .write_all(payload)
            .await
            .map_err(ProtocolError::Write)?;
        self.read_response(id).await
    }

    async fn read_response(&mut self, id: u64) -> Result<Vec<Value>, ControlError> {
        loop {
            let mut line = String::new();
            let read = self
                .stream
                .read_line(&mut line)
                .await
                .map_err(ProtocolError::Read)?;
            if read == 0 {
                return Err(ProtocolError::Closed.into());
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            debug!("{} -> {}", self.address, line);

            let response: Response =
                serde_json::from_str(line).map_err(|source| ProtocolError::Decode {
                    line: line.to_string(),
                    source,
                })?;

            match response.id {
                Some(received) if received == id => {
                    if let Some(error) = response.error {
                        return Err(ControlError::Device {
                            code: error.code,
                            message: error.message,
                        });
                    }
                    return Ok(response.result);
                }
                Some(received) => {
                    return Err(ProtocolError::UnexpectedId {
                        expected: id,
                        received,
                    }
                    .into())
                }
                None if response.method.is_some() => {
                    debug!("Skipping notification from {}", self.address);
                }
                None => return Err(ProtocolError::MissingId.into()),
            }
        }
    }

    /// Sets the color temperature, clamped to 1700..=6500 Kelvin.
    pub async fn set_color_temperature(&mut self, kelvin: u32) -> Result<(), ControlError> {
        let kelvin = clamp_color_temperature(kelvin);
        self.send(Method::SetCtAbx, vec![json!(kelvin)]).await?;
        Ok(())
    }

    /// Sets the brightness, clamped to 1..=100 percent.
    pub async fn set_brightness(&mut self, percent: u8) -> Result<(), ControlError> {
        let percent = clamp_brightness(percent);
        self.send(Method::SetBright, vec![json!(percent)]).await?;
        Ok(())
    }

    pub async fn set_power(&mut self, state: PowerState) -> Result<(), ControlError> {
        self.send(Method::SetPower, vec![json!(state.to_string())])
            .await?;
        Ok(())
    }

    pub async fn turn_on(&mut self) -> Result<(), ControlError> {
        self.set_power(PowerState::On).await
    }

    pub async fn turn_off(&mut self) -> Result<(), ControlError> {
        self.set_power(PowerState::Off).await
    }

    pub async fn set_rgb(&mut self, red: u8, green: u8, blue: u8) -> Result<(), ControlError> {
        self.send(Method::SetRgb, vec![json!(pack_rgb(red, green, blue))])
            .await?;
        Ok(())
    }

    /// Sets hue (0..=359) and saturation (0..=100).
    pub async fn set_hsv(&mut self, hue: u16, saturation: u8) -> Result<(), ControlError> {
        self.send(Method::SetHsv, vec![json!(hue), json!(saturation)])
            .await?;
        Ok(())
    }

    pub async fn toggle(&mut self) -> Result<(), ControlError> {
        self.send(Method::Toggle, Vec::new()).await?;
        Ok(())
    }

    /// Shuts the connection down and releases it.
    pub async fn close(self) -> Result<(), ControlError> {
        let mut stream = self.stream.into_inner();
        stream.shutdown().await.map_err(ProtocolError::Shutdown)?;
        debug!("Closed control session to {}", self.address);
        Ok(())
    }
}

#[async_trait]
impl BulbControl for ControlSession {
    async fn set_color_temperature(&mut self, kelvin: u32) -> Result<(), ControlError> {
        ControlSession::set_color_temperature(self, kelvin).await
    }

    async fn set_brightness(&mut self, percent: u8) -> Result<(), ControlError> {
        ControlSession::set_brightness(self, percent).await
    }

    async fn close(self: Box<Self>) -> Result<(), ControlError> {
        ControlSession::close(*self).await
    }
}

/// Opens real TCP control sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl BulbConnector for TcpConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn BulbControl>, ControlError> {
        let session = ControlSession::open(address).await?;
        Ok(Box::new(session))
    }
}
