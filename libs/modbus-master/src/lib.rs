//! Modbus TCP master
//!
//! Client-side driver for Modbus TCP slaves and gateways.
//!
//! # Architecture
//!
//! - [`address`] - 5-digit logical addresses to data type and protocol offset
//! - [`frame`] - MBAP framing and typed request/response codec
//! - [`session`] - one TCP connection, transaction matching, timeout and retry
//! - [`client`] - typed read/write operations for FC01-06, FC15 and FC16
//!
//! Failures surface as [`ModbusError`]. Connection changes, retries and
//! failed operations are reported to a [`LogSink`], which defaults to
//! `tracing`.

pub mod address;
pub mod client;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod frame;
pub mod logger;
pub mod pdu;
pub mod session;

pub use address::{classify, to_offset, DataType, ModbusAddress};
pub use client::{ModbusClient, UnitClient};
pub use config::ModbusConfig;
pub use error::{ExceptionCode, ModbusError, ModbusResult, TransportError};
pub use frame::{f32_from_registers, f32_to_registers, Frame, MbapHeader, Request, Response};
pub use logger::{EventKind, LogEvent, LogLevel, LogSink, MemorySink, TracingSink};
pub use pdu::FunctionCode;
pub use session::{SessionState, SessionStats, TransportSession};
