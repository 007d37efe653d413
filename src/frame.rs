//! MBAP framing for Modbus/TCP.
//!
//! An application data unit (ADU) on a TCP transport is a 7-byte MBAP header
//! followed by the protocol data unit:
//!
//! ```text
//! offset 0  1  | 2  3  | 4  5 | 6   | 7    | 8 ...
//!        TID   | PID=0 | LEN  | UID | FC   | data
//! ```
//!
//! The transaction id pairs responses with requests on a shared connection;
//! it is the only piece of state a framer owns. Everything else is pure
//! encoding.

use std::sync::atomic::{AtomicU16, Ordering};

use bytes::{BufMut, BytesMut};

use crate::error::{Exception, ModbusError, ModbusResult};

/// Maximum size of a Modbus/TCP ADU (MBAP header + PDU).
pub const MAX_ADU_SIZE: usize = 260;

/// Maximum size of the PDU data following unit id and function code.
pub const MAX_PDU_DATA_SIZE: usize = 252;

/// Size of the MBAP header (transaction id, protocol id, length, unit id).
pub const MBAP_HEADER_SIZE: usize = 7;

/// Protocol identifier; always 0 for Modbus.
const PROTOCOL_ID: u16 = 0;

/// Framing strategy shared by the client and server engines.
///
/// A framer turns `(unit id, function code, data)` triples into wire frames
/// and back, and knows how to pair a response with the request that caused
/// it. Implementations must be safe for concurrent use; the transaction
/// counter is the only mutable state and is updated atomically.
pub trait Framer: Send + Sync {
    /// Encode a request ADU, allocating a fresh transaction id.
    fn encode(&self, uid: u8, code: u8, data: &[u8]) -> ModbusResult<Vec<u8>>;

    /// Decode an ADU into `(unit id, function code, data)`.
    ///
    /// A response whose function code has the high bit set is a well-formed
    /// exception report: it decodes to `Err(ModbusError::Exception(..))`,
    /// distinct from the `Frame` errors raised for malformed input.
    fn decode<'a>(&self, adu: &'a [u8]) -> ModbusResult<(u8, u8, &'a [u8])>;

    /// Check that `res` answers `req`.
    ///
    /// `MismatchedTransactionId` is recoverable: the response belongs to
    /// another transaction in flight on the same connection and the caller
    /// should keep waiting. All other mismatches are terminal.
    fn verify(&self, req: &[u8], res: &[u8]) -> ModbusResult<()>;

    /// Encode a response ADU, carrying over the transaction id of `req`.
    fn reply(&self, uid: u8, code: u8, data: &[u8], req: &[u8]) -> ModbusResult<Vec<u8>>;
}

/// MBAP framer for Modbus/TCP.
///
/// Transaction ids increment per encoded request and wrap freely; uniqueness
/// over the window of outstanding requests is assumed, not enforced.
#[derive(Debug, Default)]
pub struct TcpFramer {
    transaction_id: AtomicU16,
}

impl TcpFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transaction id the next encoded request will carry.
    fn next_transaction_id(&self) -> u16 {
        self.transaction_id
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }
}

impl Framer for TcpFramer {
    fn encode(&self, uid: u8, code: u8, data: &[u8]) -> ModbusResult<Vec<u8>> {
        if data.len() > MAX_PDU_DATA_SIZE {
            return Err(ModbusError::DataSizeExceeded {
                size: data.len(),
                max: MAX_PDU_DATA_SIZE,
            });
        }

        let mut adu = BytesMut::with_capacity(MBAP_HEADER_SIZE + 1 + data.len());
        adu.put_u16(self.next_transaction_id());
        adu.put_u16(PROTOCOL_ID);
        adu.put_u16(2 + data.len() as u16);
        adu.put_u8(uid);
        adu.put_u8(code);
        adu.put_slice(data);
        Ok(adu.to_vec())
    }

    fn decode<'a>(&self, adu: &'a [u8]) -> ModbusResult<(u8, u8, &'a [u8])> {
        if adu.len() < MBAP_HEADER_SIZE + 1 {
            return Err(ModbusError::frame(format!(
                "ADU too short: {} bytes",
                adu.len()
            )));
        }
        let uid = adu[6];
        let code = adu[7];
        if code & 0x80 != 0 {
            let ex = adu
                .get(8)
                .ok_or_else(|| ModbusError::frame("truncated exception response"))?;
            return match Exception::from_code(*ex) {
                Some(exception) => Err(exception.into()),
                None => Err(ModbusError::frame(format!("unknown exception code {ex:#04x}"))),
            };
        }
        Ok((uid, code, &adu[8..]))
    }

    fn verify(&self, req: &[u8], res: &[u8]) -> ModbusResult<()> {
        // A fragment shorter than header + function code cannot be paired;
        // treat it like a foreign transaction and keep waiting.
        if res.len() < MBAP_HEADER_SIZE + 1 {
            return Err(ModbusError::MismatchedTransactionId);
        }
        if req[0] != res[0] || req[1] != res[1] {
            return Err(ModbusError::MismatchedTransactionId);
        }
        if req[2] != res[2] || req[3] != res[3] {
            return Err(ModbusError::MismatchedProtocolId);
        }
        if req[6] != 0 && req[6] != res[6] {
            return Err(ModbusError::MismatchedUnitId);
        }
        Ok(())
    }

    fn reply(&self, uid: u8, code: u8, data: &[u8], req: &[u8]) -> ModbusResult<Vec<u8>> {
        if req.len() < 2 {
            return Err(ModbusError::frame("request too short to pair a reply"));
        }
        let mut res = self.encode(uid, code, data)?;
        // Pairing: the response echoes the transaction id of the request.
        res[0] = req[0];
        res[1] = req[1];
        Ok(res)
    }
}

/// Conversions between wire payloads and typed values.
///
/// Coil payloads pack one status per bit, least significant bit first within
/// each byte. Register payloads are big-endian 16-bit words.
pub mod data_utils {
    /// Number of bytes needed to carry `bit_count` packed bits.
    pub fn byte_count(bit_count: u16) -> usize {
        (bit_count as usize + 7) / 8
    }

    /// Pack coil states into bytes, LSB first.
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let mut bytes = vec![0u8; (bits.len() + 7) / 8];
        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        bytes
    }

    /// Unpack `count` coil states from bytes, LSB first. Missing trailing
    /// bits read as false.
    pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
        (0..count)
            .map(|i| {
                bytes
                    .get(i / 8)
                    .map_or(false, |byte| byte & (1 << (i % 8)) != 0)
            })
            .collect()
    }

    /// Serialize register values as big-endian bytes.
    pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(words.len() * 2);
        for &word in words {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes
    }

    /// Parse big-endian register values. A trailing odd byte is ignored;
    /// callers validate payload lengths before conversion.
    pub fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect()
    }
}
