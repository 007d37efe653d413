//! Client and server configuration.
//!
//! The framing mode and the transport kind are separate axes, both currently
//! limited to `"tcp"`. Anything else fails [`Config::verify`] with
//! [`ModbusError::InvalidParameter`] at client init or server start, leaving
//! room for other framings and transports without changing the shape of the
//! struct.

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use std::sync::Arc;

use crate::connection::Connection;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{Framer, TcpFramer};

/// Configuration shared by [`Client`](crate::Client) and
/// [`Server`](crate::Server).
///
/// ```
/// use duplex_modbus::Config;
///
/// let config = Config {
///     endpoint: "127.0.0.1:502".to_string(),
///     unit_id: 0x11,
///     ..Default::default()
/// };
/// assert!(config.verify().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Communication framing; only `"tcp"` (MBAP) is supported.
    pub mode: String,
    /// Underlying transport; only `"tcp"` is supported.
    pub kind: String,
    /// Address to dial (client) or bind (server).
    pub endpoint: String,
    /// Default unit identifier for client operations that do not take one
    /// per call. 0 addresses all slaves (broadcast).
    pub unit_id: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: "tcp".to_string(),
            kind: "tcp".to_string(),
            endpoint: String::new(),
            unit_id: 1,
        }
    }
}

impl Config {
    /// Check mode and kind against the supported sets.
    pub fn verify(&self) -> ModbusResult<()> {
        match self.mode.as_str() {
            "tcp" => {}
            other => {
                return Err(ModbusError::invalid_parameter(format!(
                    "unsupported mode {other:?}"
                )))
            }
        }
        match self.kind.as_str() {
            "tcp" => {}
            other => {
                return Err(ModbusError::invalid_parameter(format!(
                    "unsupported kind {other:?}"
                )))
            }
        }
        Ok(())
    }

    /// Build the framer for the configured mode.
    pub fn framer(&self) -> ModbusResult<Arc<dyn Framer>> {
        match self.mode.as_str() {
            "tcp" => Ok(Arc::new(TcpFramer::new())),
            other => Err(ModbusError::invalid_parameter(format!(
                "unsupported mode {other:?}"
            ))),
        }
    }

    /// Dial the configured endpoint. The dial aborts with
    /// [`ModbusError::Cancelled`] when `cancel` fires first.
    pub async fn connect(&self, cancel: &CancellationToken) -> ModbusResult<Connection> {
        match self.kind.as_str() {
            "tcp" => {
                let stream = tokio::select! {
                    dialed = TcpStream::connect(&self.endpoint) => dialed?,
                    _ = cancel.cancelled() => return Err(ModbusError::Cancelled),
                };
                Ok(Connection::new(stream))
            }
            other => Err(ModbusError::invalid_parameter(format!(
                "unsupported kind {other:?}"
            ))),
        }
    }

    /// Bind a listener on the configured endpoint.
    pub async fn listen(&self) -> ModbusResult<TcpListener> {
        match self.kind.as_str() {
            "tcp" => Ok(TcpListener::bind(&self.endpoint).await?),
            other => Err(ModbusError::invalid_parameter(format!(
                "unsupported kind {other:?}"
            ))),
        }
    }
}
