//! Modbus master error types
//!
//! Two local-validation kinds (`InvalidAddress`, `InvalidArgument`) fail before
//! any wire traffic. `Protocol` carries a slave exception response. `Transport`
//! wraps everything that went wrong on the connection after retries ran out.

use std::fmt;

use thiserror::Error;

/// Result type for modbus-master operations
pub type ModbusResult<T> = std::result::Result<T, ModbusError>;

/// Modbus exception code returned by a slave in an exception response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    SlaveDeviceBusy,
    NegativeAcknowledge,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    Unknown(u8),
}

impl ExceptionCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::SlaveDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::SlaveDeviceBusy,
            0x07 => Self::NegativeAcknowledge,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetFailedToRespond,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::SlaveDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::SlaveDeviceBusy => 0x06,
            Self::NegativeAcknowledge => 0x07,
            Self::MemoryParityError => 0x08,
            Self::GatewayPathUnavailable => 0x0A,
            Self::GatewayTargetFailedToRespond => 0x0B,
            Self::Unknown(code) => code,
        }
    }

    /// Human-readable category
    pub fn description(self) -> &'static str {
        match self {
            Self::IllegalFunction => "illegal function",
            Self::IllegalDataAddress => "illegal data address",
            Self::IllegalDataValue => "illegal data value",
            Self::SlaveDeviceFailure => "slave device failure",
            Self::Acknowledge => "acknowledge",
            Self::SlaveDeviceBusy => "slave device busy",
            Self::NegativeAcknowledge => "negative acknowledge",
            Self::MemoryParityError => "memory parity error",
            Self::GatewayPathUnavailable => "gateway path unavailable",
            Self::GatewayTargetFailedToRespond => "gateway target device failed to respond",
            Self::Unknown(_) => "unknown exception",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self.to_u8(), self.description())
    }
}

/// Failures on the connection itself
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    /// TCP connect refused, unreachable or timed out
    #[error("Connection to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    /// Session gave up after a failed connect; only `reconnect()` clears this
    #[error("Session unusable: {0}")]
    Unusable(String),

    /// Read/write failure on an established socket
    #[error("IO error: {0}")]
    Io(String),

    /// Frame that cannot be decoded or does not answer the request
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// No matching response in any attempt
    #[error("No response after {attempts} attempts ({timeout_ms}ms each)")]
    TimedOut { attempts: u32, timeout_ms: u64 },

    /// Session closed, possibly while a request was outstanding
    #[error("Session closed")]
    Closed,
}

impl TransportError {
    /// Whether a single failed attempt with this error may be repeated
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { .. } | TransportError::Io(_) | TransportError::Malformed(_)
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Top-level error returned by every client operation
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModbusError {
    /// Address outside the four ranges or of the wrong data type
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: i32, reason: String },

    /// Count or value array violates a function's bound
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Slave answered with an exception response
    #[error("Modbus exception for function 0x{function:02X}: {code}")]
    Protocol { function: u8, code: ExceptionCode },

    /// Transport failure after retries were exhausted
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Connection parameters could not be loaded or are invalid
    #[error("Configuration error: {0}")]
    Config(String),
}

// Helper methods for creating errors
impl ModbusError {
    pub fn invalid_address(address: i32, reason: impl Into<String>) -> Self {
        ModbusError::InvalidAddress {
            address,
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ModbusError::InvalidArgument(msg.into())
    }

    pub fn protocol(function: u8, code: u8) -> Self {
        ModbusError::Protocol {
            function,
            code: ExceptionCode::from_u8(code),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ModbusError::Config(msg.into())
    }

    /// Detected locally, no bytes were sent
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ModbusError::InvalidAddress { .. }
                | ModbusError::InvalidArgument(_)
                | ModbusError::Config(_)
        )
    }

    /// Whether repeating the whole operation later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ModbusError::Transport(e) => {
                e.is_recoverable() || matches!(e, TransportError::TimedOut { .. })
            },
            _ => false,
        }
    }

    /// Exception code if this is a slave exception response
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            ModbusError::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Check if this error indicates a need for reconnection
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            ModbusError::Transport(
                TransportError::Connect { .. }
                    | TransportError::Unusable(_)
                    | TransportError::Closed
            )
        )
    }
}
