//! Server-side request dispatch.
//!
//! A [`Handler`] receives decoded PDUs from the dispatch engine and answers
//! with either a response payload or a protocol [`Exception`]. [`Mux`] is
//! the stock implementation: one optional callback per supported function
//! code plus a fallback, with the per-code request validation the protocol
//! mandates performed before the callback runs and the response body shaped
//! after it returns.
//!
//! All callbacks must be safe for concurrent invocation; the server calls
//! `handle` from one task per inbound frame.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Exception;
use crate::frame::data_utils::{byte_count, bytes_to_words, pack_bits, unpack_bits, words_to_bytes};
use crate::{
    MAX_COILS_PER_READ, MAX_COILS_PER_WRITE, MAX_REGISTERS_PER_READ,
    MAX_REGISTERS_PER_READ_WRITE, MAX_REGISTERS_PER_WRITE,
};

/// How a server answers inbound requests.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Answer the request PDU `req` for function `code` with a response
    /// payload, or report an exception for the dispatch engine to frame.
    async fn handle(
        &self,
        cancel: &CancellationToken,
        code: u8,
        req: &[u8],
    ) -> Result<Vec<u8>, Exception>;
}

pub type FallbackFn = dyn Fn(u8, &[u8]) -> Result<Vec<u8>, Exception> + Send + Sync;
pub type ReadBitsFn = dyn Fn(u16, u16) -> Result<Vec<bool>, Exception> + Send + Sync;
pub type ReadWordsFn = dyn Fn(u16, u16) -> Result<Vec<u16>, Exception> + Send + Sync;
pub type WriteBitFn = dyn Fn(u16, bool) -> Result<(), Exception> + Send + Sync;
pub type WriteWordFn = dyn Fn(u16, u16) -> Result<(), Exception> + Send + Sync;
pub type WriteBitsFn = dyn Fn(u16, &[bool]) -> Result<(), Exception> + Send + Sync;
pub type WriteWordsFn = dyn Fn(u16, &[u16]) -> Result<(), Exception> + Send + Sync;
pub type ReadWriteWordsFn =
    dyn Fn(u16, u16, u16, &[u16]) -> Result<Vec<u16>, Exception> + Send + Sync;

/// Request multiplexer routing by function code.
///
/// Unset callbacks answer `IllegalFunction`. Unknown function codes go to
/// `fallback` when bound, which receives the raw code and PDU body and must
/// shape its own response payload.
///
/// ```
/// use duplex_modbus::Mux;
///
/// let mux = Mux {
///     read_holding_registers: Some(Box::new(|address, quantity| {
///         Ok((address..address + quantity).collect())
///     })),
///     write_single_register: Some(Box::new(|_address, _value| Ok(()))),
///     ..Default::default()
/// };
/// # let _ = mux;
/// ```
#[derive(Default)]
pub struct Mux {
    pub fallback: Option<Box<FallbackFn>>,
    pub read_coils: Option<Box<ReadBitsFn>>,
    pub read_discrete_inputs: Option<Box<ReadBitsFn>>,
    pub read_holding_registers: Option<Box<ReadWordsFn>>,
    pub read_input_registers: Option<Box<ReadWordsFn>>,
    pub write_single_coil: Option<Box<WriteBitFn>>,
    pub write_single_register: Option<Box<WriteWordFn>>,
    pub write_multiple_coils: Option<Box<WriteBitsFn>>,
    pub write_multiple_registers: Option<Box<WriteWordsFn>>,
    pub read_write_multiple_registers: Option<Box<ReadWriteWordsFn>>,
}

#[async_trait]
impl Handler for Mux {
    async fn handle(
        &self,
        _cancel: &CancellationToken,
        code: u8,
        req: &[u8],
    ) -> Result<Vec<u8>, Exception> {
        match code {
            0x01 => read_bits(&self.read_coils, req),
            0x02 => read_bits(&self.read_discrete_inputs, req),
            0x03 => read_words(&self.read_holding_registers, req),
            0x04 => read_words(&self.read_input_registers, req),
            0x05 => write_single_coil(&self.write_single_coil, req),
            0x06 => write_single_register(&self.write_single_register, req),
            0x0F => write_multiple_coils(&self.write_multiple_coils, req),
            0x10 => write_multiple_registers(&self.write_multiple_registers, req),
            0x17 => read_write_multiple_registers(&self.read_write_multiple_registers, req),
            _ => match &self.fallback {
                Some(fallback) => fallback(code, req),
                None => Err(Exception::IllegalFunction),
            },
        }
    }
}

fn fixed_request(req: &[u8]) -> Result<(u16, u16), Exception> {
    if req.len() != 4 {
        return Err(Exception::IllegalDataAddress);
    }
    Ok((
        u16::from_be_bytes([req[0], req[1]]),
        u16::from_be_bytes([req[2], req[3]]),
    ))
}

fn range_check(address: u16, quantity: u16, max: u16) -> Result<(), Exception> {
    if quantity < 1 || quantity > max {
        return Err(Exception::IllegalDataValue);
    }
    if address as u32 + quantity as u32 > 0xFFFF {
        return Err(Exception::IllegalDataAddress);
    }
    Ok(())
}

fn read_bits(callback: &Option<Box<ReadBitsFn>>, req: &[u8]) -> Result<Vec<u8>, Exception> {
    let callback = callback.as_ref().ok_or(Exception::IllegalFunction)?;
    let (address, quantity) = fixed_request(req)?;
    range_check(address, quantity, MAX_COILS_PER_READ)?;
    let status = callback(address, quantity)?;
    if status.len() != quantity as usize {
        return Err(Exception::SlaveDeviceFailure);
    }
    let mut res = Vec::with_capacity(1 + byte_count(quantity));
    res.push(byte_count(quantity) as u8);
    res.extend_from_slice(&pack_bits(&status));
    Ok(res)
}

fn read_words(callback: &Option<Box<ReadWordsFn>>, req: &[u8]) -> Result<Vec<u8>, Exception> {
    let callback = callback.as_ref().ok_or(Exception::IllegalFunction)?;
    let (address, quantity) = fixed_request(req)?;
    range_check(address, quantity, MAX_REGISTERS_PER_READ)?;
    let values = callback(address, quantity)?;
    if values.len() != quantity as usize {
        return Err(Exception::SlaveDeviceFailure);
    }
    let mut res = Vec::with_capacity(1 + 2 * quantity as usize);
    res.push(2 * quantity as u8);
    res.extend_from_slice(&words_to_bytes(&values));
    Ok(res)
}

fn write_single_coil(callback: &Option<Box<WriteBitFn>>, req: &[u8]) -> Result<Vec<u8>, Exception> {
    let callback = callback.as_ref().ok_or(Exception::IllegalFunction)?;
    let (address, value) = fixed_request(req)?;
    let status = match value {
        0x0000 => false,
        0xFF00 => true,
        _ => return Err(Exception::IllegalDataValue),
    };
    callback(address, status)?;
    Ok(req.to_vec())
}

fn write_single_register(
    callback: &Option<Box<WriteWordFn>>,
    req: &[u8],
) -> Result<Vec<u8>, Exception> {
    let callback = callback.as_ref().ok_or(Exception::IllegalFunction)?;
    let (address, value) = fixed_request(req)?;
    callback(address, value)?;
    Ok(req.to_vec())
}

fn write_multiple_coils(
    callback: &Option<Box<WriteBitsFn>>,
    req: &[u8],
) -> Result<Vec<u8>, Exception> {
    let callback = callback.as_ref().ok_or(Exception::IllegalFunction)?;
    if req.len() < 6 {
        return Err(Exception::IllegalDataAddress);
    }
    let address = u16::from_be_bytes([req[0], req[1]]);
    let quantity = u16::from_be_bytes([req[2], req[3]]);
    if quantity < 1
        || quantity > MAX_COILS_PER_WRITE
        || req[4] as usize != byte_count(quantity)
        || req.len() != 5 + byte_count(quantity)
    {
        return Err(Exception::IllegalDataValue);
    }
    if address as u32 + quantity as u32 > 0xFFFF {
        return Err(Exception::IllegalDataAddress);
    }
    callback(address, &unpack_bits(&req[5..], quantity as usize))?;
    Ok(req[..4].to_vec())
}

fn write_multiple_registers(
    callback: &Option<Box<WriteWordsFn>>,
    req: &[u8],
) -> Result<Vec<u8>, Exception> {
    let callback = callback.as_ref().ok_or(Exception::IllegalFunction)?;
    if req.len() < 6 {
        return Err(Exception::IllegalDataAddress);
    }
    let address = u16::from_be_bytes([req[0], req[1]]);
    let quantity = u16::from_be_bytes([req[2], req[3]]);
    if quantity < 1
        || quantity > MAX_REGISTERS_PER_WRITE
        || req[4] as usize != 2 * quantity as usize
        || req.len() != 5 + req[4] as usize
    {
        return Err(Exception::IllegalDataValue);
    }
    if address as u32 + quantity as u32 > 0xFFFF {
        return Err(Exception::IllegalDataAddress);
    }
    callback(address, &bytes_to_words(&req[5..]))?;
    Ok(req[..4].to_vec())
}

fn read_write_multiple_registers(
    callback: &Option<Box<ReadWriteWordsFn>>,
    req: &[u8],
) -> Result<Vec<u8>, Exception> {
    let callback = callback.as_ref().ok_or(Exception::IllegalFunction)?;
    if req.len() < 11 {
        return Err(Exception::IllegalDataAddress);
    }
    let read_address = u16::from_be_bytes([req[0], req[1]]);
    let read_quantity = u16::from_be_bytes([req[2], req[3]]);
    let write_address = u16::from_be_bytes([req[4], req[5]]);
    let write_quantity = u16::from_be_bytes([req[6], req[7]]);
    if read_quantity < 1
        || read_quantity > MAX_REGISTERS_PER_READ
        || write_quantity < 1
        || write_quantity > MAX_REGISTERS_PER_READ_WRITE
        || req[8] as usize != 2 * write_quantity as usize
        || req.len() != 9 + req[8] as usize
    {
        return Err(Exception::IllegalDataValue);
    }
    if read_address as u32 + read_quantity as u32 > 0xFFFF
        || write_address as u32 + write_quantity as u32 > 0xFFFF
    {
        return Err(Exception::IllegalDataAddress);
    }
    let values = callback(
        read_address,
        read_quantity,
        write_address,
        &bytes_to_words(&req[9..]),
    )?;
    if values.len() != read_quantity as usize {
        return Err(Exception::SlaveDeviceFailure);
    }
    let mut res = Vec::with_capacity(1 + 2 * values.len());
    res.push(2 * read_quantity as u8);
    res.extend_from_slice(&words_to_bytes(&values));
    Ok(res)
}
