//! Transport session
//!
//! One TCP connection, one request in flight. Each call to
//! [`TransportSession::send`] walks
//! `Idle -> Sent -> AwaitingMatch -> {Completed | TimedOut | TransportError}`
//! and repeats the request up to `retries` more times on a timeout or a
//! recoverable error.
//!
//! Retry rules:
//! - Timeout: nothing matched, so the next attempt reuses the transaction id.
//! - IO error: the connection is dropped and reopened on the next attempt;
//!   the transaction id is reused.
//! - Malformed matching frame: the connection is dropped and the next attempt
//!   allocates a fresh transaction id.
//! - Connect failure: the next attempt connects again after
//!   `reconnect_delay_ms`. When the last attempt's connect fails the session
//!   becomes [`SessionState::Unusable`] and every later call fails fast until
//!   [`TransportSession::reconnect`].
//! - Exception responses are returned to the caller and never retried.

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ModbusConfig;
use crate::connection::ModbusConnection;
use crate::constants::MBAP_HEADER_LEN;
use crate::error::{ModbusResult, TransportError};
use crate::frame::{Frame, Request, Response};
use crate::logger::{hex, EventKind, LogEvent, LogLevel, LogSink};
use crate::pdu::ModbusPdu;

/// Connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No connection yet, or dropped after a recoverable error
    Disconnected,
    Connected,
    /// Last connect failed; only `reconnect()` leaves this state
    Unusable(String),
    /// `close()` was called; terminal
    Closed,
}

/// Session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub exceptions: u64,
    pub discarded_frames: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Owns the connection and correlates responses to requests
pub struct TransportSession {
    config: ModbusConfig,
    /// Held for a whole request/response exchange
    connection: Mutex<Option<ModbusConnection>>,
    state: parking_lot::Mutex<SessionState>,
    stats: parking_lot::Mutex<SessionStats>,
    next_tid: AtomicU16,
    sink: Arc<dyn LogSink>,
    cancel: CancellationToken,
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("endpoint", &self.config.endpoint())
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl TransportSession {
    /// Create a disconnected session; nothing touches the network yet
    pub fn new(config: ModbusConfig, sink: Arc<dyn LogSink>) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
            state: parking_lot::Mutex::new(SessionState::Disconnected),
            stats: parking_lot::Mutex::new(SessionStats::default()),
            next_tid: AtomicU16::new(1),
            sink,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ModbusConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.state.lock(), SessionState::Connected)
    }

    pub fn stats(&self) -> SessionStats {
        *self.stats.lock()
    }

    /// Allocate the next transaction id (wrapping)
    pub fn next_transaction_id(&self) -> u16 {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    /// Establish the connection now instead of on first request
    pub async fn open(&self) -> Result<(), TransportError> {
        let mut slot = self.lock().await?;
        self.connect_or_give_up(&mut *slot).await
    }

    /// Drop any connection and connect again, clearing `Unusable`
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        let mut slot = self.lock().await?;
        if slot.take().is_some() {
            self.emit(LogEvent::new(
                LogLevel::Info,
                EventKind::Disconnected,
                format!("{} reconnecting", self.config.endpoint()),
            ));
        }
        self.set_state(SessionState::Disconnected);
        self.connect_or_give_up(&mut *slot).await
    }

    // Single connect outside the retry loop; failure leaves the session unusable
    async fn connect_or_give_up(
        &self,
        slot: &mut Option<ModbusConnection>,
    ) -> Result<(), TransportError> {
        match self.ensure_connected(slot).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.give_up_on_connect(&e);
                Err(e)
            },
        }
    }

    /// Close the session; an outstanding request fails with `Closed`
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.set_state(SessionState::Closed);
        self.cancel.cancel();

        // The in-flight request, if any, releases the lock once it observes the token
        let mut slot = self.connection.lock().await;
        if slot.take().is_some() {
            self.emit(LogEvent::new(
                LogLevel::Info,
                EventKind::Disconnected,
                format!("{} closed", self.config.endpoint()),
            ));
        }
    }

    /// Send a request to `unit_id` and wait for its matching response
    ///
    /// The request's quantity is checked first; an oversized request fails
    /// with `InvalidArgument` and nothing is sent.
    pub async fn send(&self, unit_id: u8, request: &Request) -> ModbusResult<Response> {
        request.validate()?;
        Ok(self.exchange(unit_id, request).await?)
    }

    async fn exchange(&self, unit_id: u8, request: &Request) -> Result<Response, TransportError> {
        let pdu = request.encode_pdu()?;
        let mut slot = self.lock().await?;

        let attempts = self.config.retries.saturating_add(1);
        let timeout_ms = self.config.timeout_ms;
        let mut tid = self.next_transaction_id();
        let mut last_error = None;

        for attempt in 1..=attempts {
            if matches!(last_error, Some(TransportError::Connect { .. })) {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(TransportError::Closed),
                    _ = sleep(self.config.reconnect_delay()) => {},
                }
            }

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(TransportError::Closed),
                outcome = self.attempt(&mut *slot, unit_id, tid, request, &pdu) => outcome,
            };

            let error = match outcome {
                Ok(response) => return Ok(response),
                Err(TransportError::TimedOut { .. }) => {
                    self.stats.lock().timeouts += 1;
                    TransportError::TimedOut {
                        attempts: attempt,
                        timeout_ms,
                    }
                },
                Err(e @ TransportError::Connect { .. }) => {
                    if attempt == attempts {
                        self.give_up_on_connect(&e);
                        return Err(e);
                    }
                    e
                },
                Err(e) if e.is_recoverable() => {
                    self.drop_connection(&mut *slot, &e);
                    if matches!(e, TransportError::Malformed(_)) {
                        tid = self.next_transaction_id();
                    }
                    e
                },
                Err(e) => return Err(e),
            };

            if attempt < attempts {
                self.stats.lock().retries += 1;
                self.emit(
                    LogEvent::new(
                        LogLevel::Warn,
                        EventKind::Retry,
                        format!("Attempt {}/{} failed: {}", attempt, attempts, error),
                    )
                    .with_unit(unit_id)
                    .with_function(request.function_code()),
                );
            }
            last_error = Some(error);
        }

        Err(last_error.unwrap_or(TransportError::TimedOut {
            attempts,
            timeout_ms,
        }))
    }

    // One write followed by reads until the matching frame or the deadline
    async fn attempt(
        &self,
        slot: &mut Option<ModbusConnection>,
        unit_id: u8,
        tid: u16,
        request: &Request,
        pdu: &ModbusPdu,
    ) -> Result<Response, TransportError> {
        let conn = self.ensure_connected(slot).await?;

        let frame = Frame::new(tid, unit_id, pdu.clone()).encode();
        debug!(
            "[TX] TID={:04X} Slave={} FC={:02X} Frame:[{}]",
            tid,
            unit_id,
            request.function_code().to_u8(),
            hex(&frame)
        );
        conn.send(&frame).await?;
        {
            let mut stats = self.stats.lock();
            stats.requests_sent += 1;
            stats.bytes_sent += frame.len() as u64;
        }

        let deadline = Instant::now() + self.config.timeout();
        loop {
            let received = match timeout_at(deadline, conn.receive_frame()).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(TransportError::TimedOut {
                        attempts: 1,
                        timeout_ms: self.config.timeout_ms,
                    })
                },
            };

            if received.transaction_id != tid || received.unit_id != unit_id {
                self.stats.lock().discarded_frames += 1;
                self.emit(
                    LogEvent::new(
                        LogLevel::Debug,
                        EventKind::Discarded,
                        format!(
                            "TID={:04X} Slave={} while awaiting TID={:04X}",
                            received.transaction_id, received.unit_id, tid
                        ),
                    )
                    .with_unit(unit_id),
                );
                continue;
            }

            debug!(
                "[RX] TID={:04X} Slave={} Frame:[{:02X?}]",
                tid,
                unit_id,
                received.pdu.as_slice()
            );
            {
                let mut stats = self.stats.lock();
                stats.responses_received += 1;
                stats.bytes_received += (MBAP_HEADER_LEN + 1 + received.pdu.len()) as u64;
            }

            let response = Response::decode_pdu(request, &received.pdu)?;
            if matches!(response, Response::Exception { .. }) {
                self.stats.lock().exceptions += 1;
            }
            return Ok(response);
        }
    }

    async fn ensure_connected<'a>(
        &self,
        slot: &'a mut Option<ModbusConnection>,
    ) -> Result<&'a mut ModbusConnection, TransportError> {
        match self.state() {
            SessionState::Closed => return Err(TransportError::Closed),
            SessionState::Unusable(reason) => return Err(TransportError::Unusable(reason)),
            SessionState::Disconnected | SessionState::Connected => {},
        }

        if slot.is_none() {
            let connect = ModbusConnection::connect_tcp(
                &self.config.host,
                self.config.port,
                self.config.connect_timeout(),
            );
            match connect.await {
                Ok(conn) => {
                    self.emit(LogEvent::new(
                        LogLevel::Info,
                        EventKind::Connected,
                        conn.endpoint().to_string(),
                    ));
                    *slot = Some(conn);
                    self.set_state(SessionState::Connected);
                },
                Err(e) => {
                    self.set_state(SessionState::Disconnected);
                    return Err(e);
                },
            }
        }

        slot.as_mut()
            .ok_or_else(|| TransportError::Io("Not connected".to_string()))
    }

    fn give_up_on_connect(&self, cause: &TransportError) {
        if matches!(cause, TransportError::Connect { .. }) {
            self.set_state(SessionState::Unusable(cause.to_string()));
        }
    }

    fn drop_connection(&self, slot: &mut Option<ModbusConnection>, cause: &TransportError) {
        if slot.take().is_some() {
            self.set_state(SessionState::Disconnected);
            self.emit(LogEvent::new(
                LogLevel::Warn,
                EventKind::Disconnected,
                format!("{} dropped: {}", self.config.endpoint(), cause),
            ));
        }
    }

    async fn lock(&self) -> Result<MutexGuard<'_, Option<ModbusConnection>>, TransportError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
            guard = self.connection.lock() => Ok(guard),
        }
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != SessionState::Closed {
            *state = next;
        }
    }

    fn emit(&self, event: LogEvent) {
        self.sink.log(&event);
    }
}
