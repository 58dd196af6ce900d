//! Modbus TCP master client
//!
//! [`ModbusClient`] talks to the configured default unit; [`ModbusClient::unit`]
//! returns a [`UnitClient`] scope for any other unit behind the same gateway.
//!
//! ```no_run
//! use modbus_master::{ModbusClient, ModbusConfig};
//!
//! # async fn demo() -> modbus_master::ModbusResult<()> {
//! let client = ModbusClient::connect(ModbusConfig::new("192.168.1.10", 502)).await?;
//!
//! let setpoints = client.read_holding_registers(40001, 4).await?;
//! client.write_single_coil(17, true).await?;
//! let power = client.unit(3).read_float(40101).await?;
//! # let _ = (setpoints, power);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use crate::address::{DataType, ModbusAddress};
use crate::config::ModbusConfig;
use crate::error::{ModbusError, ModbusResult, TransportError};
use crate::frame::{f32_from_registers, f32_to_registers, Request, Response};
use crate::logger::{EventKind, LogEvent, LogLevel, LogSink, TracingSink};
use crate::pdu::FunctionCode;
use crate::session::{SessionState, SessionStats, TransportSession};

/// Typed Modbus TCP master bound to one connection
pub struct ModbusClient {
    session: TransportSession,
    default_unit: u8,
    sink: Arc<dyn LogSink>,
}

impl fmt::Debug for ModbusClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusClient")
            .field("session", &self.session)
            .field("default_unit", &self.default_unit)
            .finish_non_exhaustive()
    }
}

impl ModbusClient {
    /// Build a client that logs through `tracing`
    ///
    /// Connects immediately when `keep_alive` is set, otherwise on first use.
    pub async fn connect(config: ModbusConfig) -> ModbusResult<Self> {
        Self::with_sink(config, Arc::new(TracingSink)).await
    }

    /// Build a client that reports connection and failure events to `sink`
    pub async fn with_sink(config: ModbusConfig, sink: Arc<dyn LogSink>) -> ModbusResult<Self> {
        config.validate()?;

        let keep_alive = config.keep_alive;
        let client = Self {
            default_unit: config.unit_id,
            session: TransportSession::new(config, Arc::clone(&sink)),
            sink,
        };

        if keep_alive {
            if let Err(e) = client.session.open().await {
                let err = ModbusError::from(e);
                client.sink.log(
                    &LogEvent::new(
                        LogLevel::Error,
                        EventKind::Failure,
                        format!("Initial connect failed: {}", err),
                    )
                    .with_unit(client.default_unit),
                );
                return Err(err);
            }
        }
        Ok(client)
    }

    /// Scope for operations addressed to `unit_id`
    pub fn unit(&self, unit_id: u8) -> UnitClient<'_> {
        UnitClient {
            client: self,
            unit_id,
        }
    }

    pub fn default_unit(&self) -> u8 {
        self.default_unit
    }

    pub fn config(&self) -> &ModbusConfig {
        self.session.config()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn stats(&self) -> SessionStats {
        self.session.stats()
    }

    /// Re-establish the connection; required after a failed connect
    pub async fn reconnect(&self) -> ModbusResult<()> {
        self.session.reconnect().await.map_err(|e| {
            let err = ModbusError::from(e);
            self.log_failure(self.default_unit, None, None, &err);
            err
        })
    }

    /// Close the connection; pending and later operations fail with `Closed`
    pub async fn close(&self) {
        self.session.close().await;
    }

    /// FC01
    pub async fn read_coils(&self, address: i32, count: u16) -> ModbusResult<Vec<bool>> {
        self.unit(self.default_unit).read_coils(address, count).await
    }

    /// FC02
    pub async fn read_discrete_inputs(&self, address: i32, count: u16) -> ModbusResult<Vec<bool>> {
        self.unit(self.default_unit)
            .read_discrete_inputs(address, count)
            .await
    }

    /// FC03
    pub async fn read_holding_registers(
        &self,
        address: i32,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.unit(self.default_unit)
            .read_holding_registers(address, count)
            .await
    }

    /// FC04
    pub async fn read_input_registers(&self, address: i32, count: u16) -> ModbusResult<Vec<u16>> {
        self.unit(self.default_unit)
            .read_input_registers(address, count)
            .await
    }

    /// FC05
    pub async fn write_single_coil(&self, address: i32, value: bool) -> ModbusResult<()> {
        self.unit(self.default_unit)
            .write_single_coil(address, value)
            .await
    }

    /// FC06
    pub async fn write_single_register(&self, address: i32, value: u16) -> ModbusResult<()> {
        self.unit(self.default_unit)
            .write_single_register(address, value)
            .await
    }

    /// FC15
    pub async fn write_multiple_coils(&self, address: i32, values: &[bool]) -> ModbusResult<()> {
        self.unit(self.default_unit)
            .write_multiple_coils(address, values)
            .await
    }

    /// FC16
    pub async fn write_multiple_registers(&self, address: i32, values: &[u16]) -> ModbusResult<()> {
        self.unit(self.default_unit)
            .write_multiple_registers(address, values)
            .await
    }

    /// Two holding registers as an IEEE-754 float, high word first
    pub async fn read_float(&self, address: i32) -> ModbusResult<f32> {
        self.unit(self.default_unit).read_float(address).await
    }

    pub async fn write_float(&self, address: i32, value: f32) -> ModbusResult<()> {
        self.unit(self.default_unit).write_float(address, value).await
    }

    fn log_failure(
        &self,
        unit_id: u8,
        address: Option<i32>,
        function: Option<FunctionCode>,
        err: &ModbusError,
    ) {
        let mut event =
            LogEvent::new(LogLevel::Error, EventKind::Failure, err.to_string()).with_unit(unit_id);
        event.address = address;
        event.function = function;
        self.sink.log(&event);
    }
}

/// Operations addressed to one unit id
#[derive(Debug, Clone, Copy)]
pub struct UnitClient<'a> {
    client: &'a ModbusClient,
    unit_id: u8,
}

impl UnitClient<'_> {
    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub async fn read_coils(&self, address: i32, count: u16) -> ModbusResult<Vec<bool>> {
        self.call(
            address,
            DataType::Coil,
            FunctionCode::ReadCoils,
            |offset| Request::ReadCoils { offset, count },
            |response| match response {
                Response::ReadCoils(bits) => Some(bits),
                _ => None,
            },
        )
        .await
    }

    pub async fn read_discrete_inputs(&self, address: i32, count: u16) -> ModbusResult<Vec<bool>> {
        self.call(
            address,
            DataType::DiscreteInput,
            FunctionCode::ReadDiscreteInputs,
            |offset| Request::ReadDiscreteInputs { offset, count },
            |response| match response {
                Response::ReadDiscreteInputs(bits) => Some(bits),
                _ => None,
            },
        )
        .await
    }

    pub async fn read_holding_registers(
        &self,
        address: i32,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.call(
            address,
            DataType::HoldingRegister,
            FunctionCode::ReadHoldingRegisters,
            |offset| Request::ReadHoldingRegisters { offset, count },
            |response| match response {
                Response::ReadHoldingRegisters(values) => Some(values),
                _ => None,
            },
        )
        .await
    }

    pub async fn read_input_registers(&self, address: i32, count: u16) -> ModbusResult<Vec<u16>> {
        self.call(
            address,
            DataType::InputRegister,
            FunctionCode::ReadInputRegisters,
            |offset| Request::ReadInputRegisters { offset, count },
            |response| match response {
                Response::ReadInputRegisters(values) => Some(values),
                _ => None,
            },
        )
        .await
    }

    pub async fn write_single_coil(&self, address: i32, value: bool) -> ModbusResult<()> {
        self.call(
            address,
            DataType::Coil,
            FunctionCode::WriteSingleCoil,
            |offset| Request::WriteSingleCoil { offset, value },
            |response| matches!(response, Response::WriteSingleCoil { .. }).then_some(()),
        )
        .await
    }

    pub async fn write_single_register(&self, address: i32, value: u16) -> ModbusResult<()> {
        self.call(
            address,
            DataType::HoldingRegister,
            FunctionCode::WriteSingleRegister,
            |offset| Request::WriteSingleRegister { offset, value },
            |response| matches!(response, Response::WriteSingleRegister { .. }).then_some(()),
        )
        .await
    }

    pub async fn write_multiple_coils(&self, address: i32, values: &[bool]) -> ModbusResult<()> {
        self.call(
            address,
            DataType::Coil,
            FunctionCode::WriteMultipleCoils,
            |offset| Request::WriteMultipleCoils {
                offset,
                values: values.to_vec(),
            },
            |response| matches!(response, Response::WriteMultipleCoils { .. }).then_some(()),
        )
        .await
    }

    pub async fn write_multiple_registers(&self, address: i32, values: &[u16]) -> ModbusResult<()> {
        self.call(
            address,
            DataType::HoldingRegister,
            FunctionCode::WriteMultipleRegisters,
            |offset| Request::WriteMultipleRegisters {
                offset,
                values: values.to_vec(),
            },
            |response| matches!(response, Response::WriteMultipleRegisters { .. }).then_some(()),
        )
        .await
    }

    pub async fn read_float(&self, address: i32) -> ModbusResult<f32> {
        let registers = self.read_holding_registers(address, 2).await?;
        match registers.as_slice() {
            [high, low] => Ok(f32_from_registers(*high, *low)),
            _ => Err(ModbusError::from(TransportError::Malformed(format!(
                "Expected 2 registers for float, got {}",
                registers.len()
            )))),
        }
    }

    pub async fn write_float(&self, address: i32, value: f32) -> ModbusResult<()> {
        self.write_multiple_registers(address, &f32_to_registers(value))
            .await
    }

    // Validate, send, map the response; logs exactly one failure event on error
    async fn call<T>(
        &self,
        address: i32,
        data_type: DataType,
        function: FunctionCode,
        build: impl FnOnce(u16) -> Request,
        extract: impl FnOnce(Response) -> Option<T>,
    ) -> ModbusResult<T> {
        let result = self.execute(address, data_type, build, extract).await;
        if let Err(err) = &result {
            self.client
                .log_failure(self.unit_id, Some(address), Some(function), err);
        }
        result
    }

    async fn execute<T>(
        &self,
        address: i32,
        data_type: DataType,
        build: impl FnOnce(u16) -> Request,
        extract: impl FnOnce(Response) -> Option<T>,
    ) -> ModbusResult<T> {
        let target = ModbusAddress::expect(address, data_type)?;
        let request = build(target.offset());
        request.validate()?;
        target.check_span(request.quantity() as u16)?;

        match self.client.session.send(self.unit_id, &request).await? {
            Response::Exception { function, code } => Err(ModbusError::Protocol {
                function: function.to_u8(),
                code,
            }),
            response => extract(response).ok_or_else(|| {
                ModbusError::from(TransportError::Malformed(format!(
                    "Unexpected response to {}",
                    request.function_code()
                )))
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::error::ExceptionCode;
    use crate::logger::MemorySink;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    // Client whose endpoint is never contacted
    async fn offline_client(sink: &MemorySink) -> ModbusClient {
        let config = ModbusConfig::new("127.0.0.1", 1)
            .with_keep_alive(false)
            .with_timeout(Duration::from_millis(50));
        ModbusClient::with_sink(config, Arc::new(sink.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_wrong_data_type_rejected_locally() {
        let sink = MemorySink::new();
        let client = offline_client(&sink).await;

        let err = client.read_holding_registers(1, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::InvalidAddress { address: 1, .. }));

        let err = client.write_single_register(30001, 5).await.unwrap_err();
        assert!(matches!(err, ModbusError::InvalidAddress { .. }));

        let err = client.read_coils(20000, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::InvalidAddress { .. }));

        assert_eq!(client.stats().requests_sent, 0);
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_count_bounds_rejected_locally() {
        let sink = MemorySink::new();
        let client = offline_client(&sink).await;

        let err = client
            .write_multiple_registers(40001, &[0u16; 124])
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::InvalidArgument(_)));

        assert!(matches!(
            client.read_coils(1, 2001).await,
            Err(ModbusError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.read_input_registers(30001, 0).await,
            Err(ModbusError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.write_multiple_coils(1, &[]).await,
            Err(ModbusError::InvalidArgument(_))
        ));

        // Span must stay inside the holding register range
        assert!(matches!(
            client.read_holding_registers(49999, 2).await,
            Err(ModbusError::InvalidAddress { .. })
        ));
        assert!(matches!(
            client.read_float(49999).await,
            Err(ModbusError::InvalidAddress { .. })
        ));

        assert_eq!(client.stats().requests_sent, 0);
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_one_failure_event_per_operation() {
        let sink = MemorySink::new();
        let client = offline_client(&sink).await;

        let _ = client.unit(7).read_input_registers(40001, 1).await;
        let _ = client.write_float(1, 1.5).await;

        let failures: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| e.kind == EventKind::Failure)
            .collect();
        assert_eq!(failures.len(), 2);

        assert_eq!(failures[0].unit_id, Some(7));
        assert_eq!(failures[0].address, Some(40001));
        assert_eq!(failures[0].function, Some(FunctionCode::ReadInputRegisters));
        assert_eq!(failures[0].level, LogLevel::Error);

        assert_eq!(failures[1].unit_id, Some(1));
        assert_eq!(failures[1].function, Some(FunctionCode::WriteMultipleRegisters));
    }

    #[tokio::test]
    async fn test_eager_connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let sink = MemorySink::new();
        let config = ModbusConfig::new("127.0.0.1", port);
        let err = ModbusClient::with_sink(config, Arc::new(sink.clone()))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ModbusError::Transport(TransportError::Connect { .. })
        ));
        assert_eq!(sink.count(EventKind::Failure), 1);
        assert_eq!(sink.count(EventKind::Connected), 0);
    }

    #[tokio::test]
    async fn test_lazy_connect_failure_retried_and_logged_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let sink = MemorySink::new();
        let config = ModbusConfig::new("127.0.0.1", port)
            .with_keep_alive(false)
            .with_retries(2)
            .with_reconnect_delay(Duration::from_millis(10));
        let client = ModbusClient::with_sink(config, Arc::new(sink.clone()))
            .await
            .unwrap();

        let err = client.read_holding_registers(40001, 1).await.unwrap_err();
        assert!(matches!(
            err,
            ModbusError::Transport(TransportError::Connect { .. })
        ));
        assert_eq!(sink.count(EventKind::Retry), 2);
        assert_eq!(sink.count(EventKind::Failure), 1);
        assert!(matches!(client.state(), SessionState::Unusable(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let err = ModbusClient::connect(ModbusConfig::new("", 502))
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Config(_)));
    }

    #[tokio::test]
    async fn test_exception_maps_to_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 12];
            socket.read_exact(&mut request).await.unwrap();
            let mut reply = request[..4].to_vec();
            reply.extend_from_slice(&[0x00, 0x03, request[6], 0x84, 0x04]);
            socket.write_all(&reply).await.unwrap();
            // Keep the socket open until the client is done
            let _ = socket.read(&mut request).await;
        });

        let sink = MemorySink::new();
        let config = ModbusConfig::new("127.0.0.1", port).with_unit_id(5);
        let client = ModbusClient::with_sink(config, Arc::new(sink.clone()))
            .await
            .unwrap();
        assert!(client.is_connected());
        assert_eq!(sink.count(EventKind::Connected), 1);

        let err = client.read_input_registers(30001, 1).await.unwrap_err();
        assert_eq!(
            err,
            ModbusError::Protocol {
                function: 0x04,
                code: ExceptionCode::SlaveDeviceFailure,
            }
        );
        assert_eq!(client.stats().retries, 0);
        assert_eq!(client.stats().exceptions, 1);
        assert_eq!(sink.count(EventKind::Failure), 1);
    }
}
