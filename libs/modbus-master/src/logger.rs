//! Pluggable log sink
//!
//! Every connection change, retry and failed operation produces one
//! [`LogEvent`]. The default [`TracingSink`] forwards events to `tracing`;
//! [`MemorySink`] records them so tests can assert on exact counts.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::ModbusAddress;
use crate::pdu::FunctionCode;

/// Severity of a [`LogEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// TCP connection established
    Connected,
    /// Connection dropped or closed
    Disconnected,
    /// Operation failed; emitted once per failed public call
    Failure,
    /// Attempt failed and another one follows
    Retry,
    /// Frame received that did not answer the outstanding request
    Discarded,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            EventKind::Connected => "CONNECT",
            EventKind::Disconnected => "DISCONNECT",
            EventKind::Failure => "FAILURE",
            EventKind::Retry => "RETRY",
            EventKind::Discarded => "DISCARD",
        };
        f.write_str(tag)
    }
}

/// Structured log record
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub level: LogLevel,
    pub kind: EventKind,
    pub unit_id: Option<u8>,
    /// Logical 5-digit address of the failed operation
    pub address: Option<i32>,
    pub function: Option<FunctionCode>,
    pub detail: String,
}

impl LogEvent {
    pub fn new(level: LogLevel, kind: EventKind, detail: impl Into<String>) -> Self {
        Self {
            level,
            kind,
            unit_id: None,
            address: None,
            function: None,
            detail: detail.into(),
        }
    }

    pub fn with_unit(mut self, unit_id: u8) -> Self {
        self.unit_id = Some(unit_id);
        self
    }

    pub fn with_address(mut self, address: i32) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_function(mut self, function: FunctionCode) -> Self {
        self.function = Some(function);
        self
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.kind)?;
        if let Some(unit) = self.unit_id {
            write!(f, " Slave={}", unit)?;
        }
        if let Some(address) = self.address {
            match ModbusAddress::new(address) {
                Ok(parsed) => write!(f, " Addr={}", parsed)?,
                Err(_) => write!(f, " Addr={}", address)?,
            }
        }
        if let Some(function) = self.function {
            write!(f, " FC={:02X}", function.to_u8())?;
        }
        write!(f, " - {}", self.detail)
    }
}

/// Destination for session and client log events
pub trait LogSink: Send + Sync {
    fn log(&self, event: &LogEvent);
}

/// Forward events to the `tracing` subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, event: &LogEvent) {
        match event.level {
            LogLevel::Debug => tracing::debug!(kind = %event.kind, "{}", event),
            LogLevel::Info => tracing::info!(kind = %event.kind, "{}", event),
            LogLevel::Warn => tracing::warn!(kind = %event.kind, "{}", event),
            LogLevel::Error => tracing::error!(kind = %event.kind, "{}", event),
        }
    }
}

/// Record events in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<LogEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events
    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl LogSink for MemorySink {
    fn log(&self, event: &LogEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Hex dump for TX/RX debug output
pub(crate) fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
