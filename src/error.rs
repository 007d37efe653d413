//! Error handling for the duplex-modbus library.
//!
//! Two layers of failure exist in Modbus communication and they are kept
//! distinct throughout the crate:
//!
//! - [`ModbusError`] covers everything that can go wrong on this side of the
//!   wire: malformed configuration, framing violations, transport failures,
//!   cancellation and connection teardown.
//! - [`Exception`] is the protocol-level error a responding server reports
//!   inside a response frame (function code with the high bit set). It is a
//!   first-class value because server handlers *return* exceptions and the
//!   client *receives* them; it converts into [`ModbusError::Exception`]
//!   whenever it crosses into the transport error channel.
//!
//! All errors are `Clone`: the client fan-out stores results behind shared
//! state and hands them to whichever task awaits the pairing.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Errors produced by the connection, framer, client and server layers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// Malformed configuration, surfaced at client init or server start.
    #[error("invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// PDU payload exceeds the protocol limit of 252 bytes at encode time.
    #[error("data size {size} exceeds protocol limit of {max} bytes")]
    DataSizeExceeded { size: usize, max: usize },

    /// A received response carries a different transaction id than the
    /// request. Multiple requests may be in flight on one connection, so
    /// this only means the response belongs to another transaction; the
    /// receiver keeps waiting. Handled internally, never surfaced to callers.
    #[error("transaction id mismatch")]
    MismatchedTransactionId,

    /// The protocol identifier field of a response is not 0.
    #[error("protocol id mismatch")]
    MismatchedProtocolId,

    /// The unit identifier of a response differs from the (non-broadcast)
    /// request.
    #[error("unit id mismatch")]
    MismatchedUnitId,

    /// The caller's cancel signal fired before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation attempted on a torn-down connection.
    #[error("connection closed")]
    Closed,

    /// Underlying transport read/write failure.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Frame structure violation: short ADU, bad length field, truncated
    /// exception response.
    #[error("frame error: {message}")]
    Frame { message: String },

    /// A well-formed Modbus exception reported by the remote server.
    #[error(transparent)]
    Exception(#[from] Exception),
}

impl ModbusError {
    pub fn invalid_parameter<S: Into<String>>(message: S) -> Self {
        Self::InvalidParameter { message: message.into() }
    }

    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Whether a retry of the failed operation could succeed.
    ///
    /// Transport failures and cancellation are transient; protocol and
    /// parameter violations are not. Among exceptions only Acknowledge and
    /// SlaveDeviceBusy invite a retry.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } | Self::Closed | Self::Cancelled => true,
            Self::Exception(ex) => {
                matches!(ex, Exception::Acknowledge | Exception::SlaveDeviceBusy)
            }
            _ => false,
        }
    }

    /// Whether the error originates from the transport rather than the
    /// protocol layer.
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Closed | Self::Cancelled)
    }

    /// Whether the error is a Modbus protocol violation or a reported
    /// exception.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Frame { .. }
                | Self::MismatchedTransactionId
                | Self::MismatchedProtocolId
                | Self::MismatchedUnitId
                | Self::Exception(_)
        )
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Modbus exception codes as defined by the application protocol
/// specification.
///
/// An exception travels on the wire as a response whose function code has the
/// high bit set, followed by a single code byte. The set is closed: a
/// response carrying any other code byte is treated as a framing error, not
/// an exception.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Exception {
    /// The function code is not an allowable action for the server.
    #[error("modbus exception: illegal function")]
    IllegalFunction = 0x01,
    /// The combination of address and transfer length is invalid.
    #[error("modbus exception: illegal data address")]
    IllegalDataAddress = 0x02,
    /// A value in the query data field is not allowable, typically an
    /// inconsistent implied length.
    #[error("modbus exception: illegal data value")]
    IllegalDataValue = 0x03,
    /// An unrecoverable error occurred while the server performed the action.
    #[error("modbus exception: slave device failure")]
    SlaveDeviceFailure = 0x04,
    /// Request accepted, processing will take a long time.
    #[error("modbus exception: acknowledge")]
    Acknowledge = 0x05,
    /// The server is busy with a long-duration command.
    #[error("modbus exception: slave device busy")]
    SlaveDeviceBusy = 0x06,
    /// Parity error detected in extended file area memory.
    #[error("modbus exception: memory parity error")]
    MemoryParityError = 0x08,
    /// The gateway could not allocate an internal communication path.
    #[error("modbus exception: gateway path unavailable")]
    GatewayPathUnavailable = 0x0A,
    /// No response was obtained from the gateway target device.
    #[error("modbus exception: gateway target device failed to respond")]
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl Exception {
    /// The wire representation of the exception.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a wire code byte. Returns `None` for codes outside the closed
    /// set.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::SlaveDeviceFailure),
            0x05 => Some(Self::Acknowledge),
            0x06 => Some(Self::SlaveDeviceBusy),
            0x08 => Some(Self::MemoryParityError),
            0x0A => Some(Self::GatewayPathUnavailable),
            0x0B => Some(Self::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Human-readable description taken from the protocol specification.
    pub fn description(self) -> &'static str {
        match self {
            Self::IllegalFunction => {
                "The function code received in the query is not an allowable action for the server"
            }
            Self::IllegalDataAddress => {
                "The data address received in the query is not an allowable address for the server"
            }
            Self::IllegalDataValue => {
                "A value contained in the query data field is not an allowable value for the server"
            }
            Self::SlaveDeviceFailure => {
                "An unrecoverable error occurred while the server was attempting to perform the requested action"
            }
            Self::Acknowledge => {
                "The server has accepted the request and is processing it, but a long duration of time will be required"
            }
            Self::SlaveDeviceBusy => {
                "The server is engaged in processing a long-duration program command"
            }
            Self::MemoryParityError => {
                "The server attempted to read a record file but detected a parity error in the memory"
            }
            Self::GatewayPathUnavailable => {
                "The gateway was unable to allocate an internal communication path"
            }
            Self::GatewayTargetDeviceFailedToRespond => {
                "No response was obtained from the target device"
            }
        }
    }
}
