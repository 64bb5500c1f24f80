//! Error types for the gateway core
//!
//! Failures fall into five groups:
//!
//! | Group | Variants | Handling |
//! |-------|----------|----------|
//! | connection | [`ModbusError::Connection`], [`ModbusError::Io`] | aborts the cycle, sets `read_error` |
//! | timeout | [`ModbusError::Timeout`] | aborts the cycle, sets `read_error` |
//! | exception | [`ModbusError::Exception`], [`ModbusError::Frame`], [`ModbusError::Protocol`] | aborts the cycle, sets `read_error` |
//! | decode | [`ModbusError::Decode`], [`ModbusError::InvalidData`] | contained to one field |
//! | implausible | [`ModbusError::OutOfRange`] | consumer decides (scanner rejects) |
//!
//! Configuration problems ([`ModbusError::Configuration`]) are reported while
//! loading maps and installer files, before any polling starts.

use thiserror::Error;

/// Result alias used across the crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// Port or socket could not be opened, or the link dropped.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// No response within the transaction window.
    #[error("Timeout during {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Device answered with a Modbus exception response.
    #[error("Modbus exception: function=0x{function:02X}, code=0x{code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Malformed frame (length, CRC, MBAP header).
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Well-formed frame that violates the request/response contract.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    /// Unknown or unsupported function code.
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Request or value outside what the protocol allows.
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Register slice could not be turned into a value.
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Decoded value outside its declared range.
    #[error("Value {value} for '{param}' outside [{min}, {max}]")]
    OutOfRange {
        param: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl ModbusError {
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Build an exception error from the raw function and exception codes.
    pub fn exception(function: u8, code: u8) -> Self {
        Self::Exception {
            function,
            code,
            message: exception_description(code).to_string(),
        }
    }

    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Connection, timeout and protocol-level failures. These abort a block
    /// read and fail the whole acquisition cycle.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Io { .. }
                | Self::Timeout { .. }
                | Self::Exception { .. }
                | Self::Frame { .. }
                | Self::Protocol { .. }
        )
    }

    /// Failures contained to a single field.
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::InvalidData { .. })
    }

    /// Worth retrying on the next cycle without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Io { .. } | Self::Timeout { .. } | Self::Frame { .. }
        )
    }

    /// True when the device answered, even if only with an exception.
    /// The scanner treats such slaves as present on the bus.
    pub fn is_device_response(&self) -> bool {
        matches!(self, Self::Exception { .. })
    }
}

/// Human readable name for a Modbus exception code.
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal function",
        0x02 => "Illegal data address",
        0x03 => "Illegal data value",
        0x04 => "Slave device failure",
        0x05 => "Acknowledge",
        0x06 => "Slave device busy",
        0x08 => "Memory parity error",
        0x0A => "Gateway path unavailable",
        0x0B => "Gateway target device failed to respond",
        _ => "Unknown exception",
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::timeout(err.to_string(), 0),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe => Self::connection(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON: {}", err))
    }
}

impl From<figment::Error> for ModbusError {
    fn from(err: figment::Error) -> Self {
        Self::configuration(err.to_string())
    }
}

#[cfg(feature = "rtu")]
impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(format!("Serial port: {}", err))
    }
}
