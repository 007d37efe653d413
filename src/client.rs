//! Modbus master.
//!
//! A [`Client`] issues requests over one shared connection. Any number of
//! requests may be in flight at once: each registers its own receiver on the
//! connection, the reader fan-out offers every inbound frame to all of them,
//! and transaction-id pairing selects exactly one consumer per response.
//! Responses may therefore arrive in any order.
//!
//! The connection is established lazily on the first request and re-dialed
//! transparently once it is no longer ready, so constructing a client is
//! cheap and reconnection needs no dedicated API.
//!
//! ```no_run
//! use duplex_modbus::{Client, Config};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> duplex_modbus::ModbusResult<()> {
//! let client = Client::new(Config {
//!     endpoint: "127.0.0.1:502".to_string(),
//!     unit_id: 0x11,
//!     ..Default::default()
//! });
//! let cancel = CancellationToken::new();
//!
//! let values = client.read_holding_registers(&cancel, 107, 3).await?;
//! client.write_single_register(&cancel, 16, 0x0A0B).await?;
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex as StdMutex};

use log::debug;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Exception, ModbusError, ModbusResult};
use crate::frame::data_utils::{byte_count, bytes_to_words, pack_bits, unpack_bits, words_to_bytes};
use crate::frame::Framer;
use crate::{
    MAX_COILS_PER_READ, MAX_COILS_PER_WRITE, MAX_REGISTERS_PER_READ,
    MAX_REGISTERS_PER_READ_WRITE, MAX_REGISTERS_PER_WRITE,
};

#[derive(Default)]
struct State {
    connection: Option<Connection>,
    framer: Option<Arc<dyn Framer>>,
}

/// Modbus master speaking MBAP over a shared TCP connection.
pub struct Client {
    config: Config,
    state: Mutex<State>,
}

impl Client {
    /// Construction does not dial; the connection is established by the
    /// first request.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether an established connection is currently usable.
    pub async fn ready(&self) -> bool {
        self.state
            .lock()
            .await
            .connection
            .as_ref()
            .map_or(false, Connection::ready)
    }

    /// Shut the connection down, cancelling all requests in flight. The next
    /// request re-dials.
    pub async fn disconnect(&self) {
        if let Some(connection) = &self.state.lock().await.connection {
            connection.close();
        }
    }

    /// Establish (or reuse) the connection and framer under the client
    /// mutex, so concurrent first requests dial only once.
    async fn init(
        &self,
        cancel: &CancellationToken,
    ) -> ModbusResult<(Connection, Arc<dyn Framer>)> {
        let mut state = self.state.lock().await;
        let connection = match &state.connection {
            Some(connection) if connection.ready() => connection.clone(),
            _ => {
                self.config.verify()?;
                let connection = self.config.connect(cancel).await?;
                debug!("connected to {}", connection.peer());
                let runner = connection.clone();
                tokio::spawn(async move {
                    if let Err(err) = runner.run().await {
                        debug!("client connection terminated: {err}");
                    }
                });
                state.connection = Some(connection.clone());
                connection
            }
        };
        let framer = match &state.framer {
            Some(framer) => Arc::clone(framer),
            None => {
                let framer = self.config.framer()?;
                state.framer = Some(Arc::clone(&framer));
                framer
            }
        };
        Ok((connection, framer))
    }

    /// Send a raw request PDU and await the paired response body.
    ///
    /// Only request function codes are accepted (`0 < code < 0x80`). The
    /// response is matched by transaction id, so this call is safe to run
    /// concurrently with others on the same client. A server-reported
    /// exception comes back as [`ModbusError::Exception`]; if `cancel` fires
    /// before the pairing completes the result is [`ModbusError::Cancelled`]
    /// and the registered receiver is removed.
    pub async fn request(
        &self,
        cancel: &CancellationToken,
        uid: u8,
        code: u8,
        req: &[u8],
    ) -> ModbusResult<Vec<u8>> {
        if code == 0 || code >= 0x80 {
            return Err(Exception::IllegalFunction.into());
        }

        let (connection, framer) = self.init(cancel).await?;
        let adu = framer.encode(uid, code, req)?;

        // Private signal for this transaction, parented to the caller's.
        let sig = cancel.child_token();
        let slot: Arc<StdMutex<Option<ModbusResult<Vec<u8>>>>> = Arc::new(StdMutex::new(None));

        let callback = {
            let slot = Arc::clone(&slot);
            let framer = Arc::clone(&framer);
            let request_adu = adu.clone();
            move |frame: Result<&[u8], &ModbusError>| -> bool {
                let result = match frame {
                    Err(err) => Err(err.clone()),
                    Ok(response) => match framer.verify(&request_adu, response) {
                        // Not ours: another transaction on this connection
                        // will consume it. Keep waiting.
                        Err(ModbusError::MismatchedTransactionId) => return false,
                        Err(err) => Err(err),
                        Ok(()) => framer
                            .decode(response)
                            .map(|(_, _, data)| data.to_vec()),
                    },
                };
                *slot.lock().unwrap() = Some(result);
                true
            }
        };

        let wait = connection.rx(&sig, callback).await?;

        if let Err(err) = connection.tx(cancel, &adu).await {
            sig.cancel();
            wait.wait().await;
            return Err(err);
        }

        wait.wait().await;

        if cancel.is_cancelled() {
            return Err(ModbusError::Cancelled);
        }
        let taken = slot.lock().unwrap().take();
        match taken {
            Some(result) => result,
            None => Err(ModbusError::Closed),
        }
    }

    /// Read 1 to 2000 contiguous coil states starting at `address` (0x01).
    pub async fn read_coils(
        &self,
        cancel: &CancellationToken,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        bound_check(address, quantity, MAX_COILS_PER_READ)?;
        let res = self
            .request(cancel, self.config.unit_id, 0x01, &read_request(address, quantity))
            .await?;
        parse_bit_response(&res, quantity)
    }

    /// Read 1 to 2000 contiguous discrete inputs starting at `address`
    /// (0x02).
    pub async fn read_discrete_inputs(
        &self,
        cancel: &CancellationToken,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        bound_check(address, quantity, MAX_COILS_PER_READ)?;
        let res = self
            .request(cancel, self.config.unit_id, 0x02, &read_request(address, quantity))
            .await?;
        parse_bit_response(&res, quantity)
    }

    /// Read 1 to 125 contiguous holding registers starting at `address`
    /// (0x03).
    pub async fn read_holding_registers(
        &self,
        cancel: &CancellationToken,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        bound_check(address, quantity, MAX_REGISTERS_PER_READ)?;
        let res = self
            .request(cancel, self.config.unit_id, 0x03, &read_request(address, quantity))
            .await?;
        parse_word_response(&res, quantity)
    }

    /// Read 1 to 125 contiguous input registers starting at `address`
    /// (0x04).
    pub async fn read_input_registers(
        &self,
        cancel: &CancellationToken,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        bound_check(address, quantity, MAX_REGISTERS_PER_READ)?;
        let res = self
            .request(cancel, self.config.unit_id, 0x04, &read_request(address, quantity))
            .await?;
        parse_word_response(&res, quantity)
    }

    /// Set the coil at `address` to ON or OFF (0x05).
    pub async fn write_single_coil(
        &self,
        cancel: &CancellationToken,
        address: u16,
        status: bool,
    ) -> ModbusResult<()> {
        let mut req = Vec::with_capacity(4);
        req.extend_from_slice(&address.to_be_bytes());
        req.extend_from_slice(if status { &[0xFF, 0x00] } else { &[0x00, 0x00] });
        let res = self
            .request(cancel, self.config.unit_id, 0x05, &req)
            .await?;
        if res != req {
            return Err(Exception::SlaveDeviceFailure.into());
        }
        Ok(())
    }

    /// Write `value` to the holding register at `address` (0x06).
    pub async fn write_single_register(
        &self,
        cancel: &CancellationToken,
        address: u16,
        value: u16,
    ) -> ModbusResult<()> {
        let mut req = Vec::with_capacity(4);
        req.extend_from_slice(&address.to_be_bytes());
        req.extend_from_slice(&value.to_be_bytes());
        let res = self
            .request(cancel, self.config.unit_id, 0x06, &req)
            .await?;
        if res != req {
            return Err(Exception::SlaveDeviceFailure.into());
        }
        Ok(())
    }

    /// Set 1 to 1968 contiguous coils starting at `address` (0x0F).
    pub async fn write_multiple_coils(
        &self,
        cancel: &CancellationToken,
        address: u16,
        status: &[bool],
    ) -> ModbusResult<()> {
        let quantity = status.len() as u16;
        bound_check(address, quantity, MAX_COILS_PER_WRITE)?;
        let mut req = Vec::with_capacity(5 + byte_count(quantity));
        req.extend_from_slice(&address.to_be_bytes());
        req.extend_from_slice(&quantity.to_be_bytes());
        req.push(byte_count(quantity) as u8);
        req.extend_from_slice(&pack_bits(status));
        let res = self
            .request(cancel, self.config.unit_id, 0x0F, &req)
            .await?;
        if res != &req[..4] {
            return Err(Exception::SlaveDeviceFailure.into());
        }
        Ok(())
    }

    /// Write 1 to 123 contiguous holding registers starting at `address`
    /// (0x10).
    pub async fn write_multiple_registers(
        &self,
        cancel: &CancellationToken,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        let quantity = values.len() as u16;
        bound_check(address, quantity, MAX_REGISTERS_PER_WRITE)?;
        let mut req = Vec::with_capacity(5 + 2 * values.len());
        req.extend_from_slice(&address.to_be_bytes());
        req.extend_from_slice(&quantity.to_be_bytes());
        req.push(2 * quantity as u8);
        req.extend_from_slice(&words_to_bytes(values));
        let res = self
            .request(cancel, self.config.unit_id, 0x10, &req)
            .await?;
        if res != &req[..4] {
            return Err(Exception::SlaveDeviceFailure.into());
        }
        Ok(())
    }

    /// Write `values` at `write_address`, then read `read_quantity` holding
    /// registers from `read_address`, in one transaction (0x17).
    pub async fn read_write_multiple_registers(
        &self,
        cancel: &CancellationToken,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> ModbusResult<Vec<u16>> {
        let write_quantity = values.len() as u16;
        bound_check(read_address, read_quantity, MAX_REGISTERS_PER_READ)?;
        bound_check(write_address, write_quantity, MAX_REGISTERS_PER_READ_WRITE)?;
        let mut req = Vec::with_capacity(9 + 2 * values.len());
        req.extend_from_slice(&read_address.to_be_bytes());
        req.extend_from_slice(&read_quantity.to_be_bytes());
        req.extend_from_slice(&write_address.to_be_bytes());
        req.extend_from_slice(&write_quantity.to_be_bytes());
        req.push(2 * write_quantity as u8);
        req.extend_from_slice(&words_to_bytes(values));
        let res = self
            .request(cancel, self.config.unit_id, 0x17, &req)
            .await?;
        parse_word_response(&res, read_quantity)
    }
}

fn bound_check(address: u16, quantity: u16, max: u16) -> Result<(), Exception> {
    if quantity < 1 || quantity > max {
        return Err(Exception::IllegalDataValue);
    }
    if address as u32 + quantity as u32 > 0xFFFF {
        return Err(Exception::IllegalDataAddress);
    }
    Ok(())
}

fn read_request(address: u16, quantity: u16) -> Vec<u8> {
    let mut req = Vec::with_capacity(4);
    req.extend_from_slice(&address.to_be_bytes());
    req.extend_from_slice(&quantity.to_be_bytes());
    req
}

fn parse_bit_response(res: &[u8], quantity: u16) -> ModbusResult<Vec<bool>> {
    if res.len() != 1 + byte_count(quantity) || res[0] as usize != res.len() - 1 {
        return Err(Exception::SlaveDeviceFailure.into());
    }
    Ok(unpack_bits(&res[1..], quantity as usize))
}

fn parse_word_response(res: &[u8], quantity: u16) -> ModbusResult<Vec<u16>> {
    if res.len() != 1 + 2 * quantity as usize || res[0] as usize != res.len() - 1 {
        return Err(Exception::SlaveDeviceFailure.into());
    }
    Ok(bytes_to_words(&res[1..]))
}
