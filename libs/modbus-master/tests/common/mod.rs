//! In-process Modbus TCP slave simulator
//!
//! Serves every accepted connection from one shared data model. The
//! [`Behavior`] switch scripts the failure cases the client must survive.

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use modbus_master::{
    ExceptionCode, Frame, FunctionCode, LogSink, MemorySink, ModbusClient, ModbusConfig, Request,
    Response,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// How the simulator answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Execute requests against the data model
    Normal,
    /// Read requests, never answer
    Silent,
    /// Answer every request with this exception code
    Exception(u8),
    /// Send an answer with a stale transaction id before the real one
    StaleFirst,
    /// Send an answer for another unit with the same transaction id first
    WrongUnitFirst,
    /// Close the connection on the first request, then behave normally
    DropFirst,
    /// Answer a write with a different value than requested
    BadEcho,
}

/// Modbus data tables by zero-based offset; unset points read as zero
#[derive(Debug, Default)]
pub struct DataModel {
    pub coils: HashMap<u16, bool>,
    pub discrete_inputs: HashMap<u16, bool>,
    pub holding_registers: HashMap<u16, u16>,
    pub input_registers: HashMap<u16, u16>,
}

impl DataModel {
    fn seeded() -> Self {
        let mut model = Self::default();
        for i in 0..100u16 {
            model.discrete_inputs.insert(i, i % 3 == 0);
            model.input_registers.insert(i, i * 100);
        }
        model
    }

    fn execute(&mut self, request: &Request) -> Response {
        let bits = |table: &HashMap<u16, bool>, offset: u16, count: u16| {
            (offset..offset + count)
                .map(|i| table.get(&i).copied().unwrap_or(false))
                .collect::<Vec<_>>()
        };
        let registers = |table: &HashMap<u16, u16>, offset: u16, count: u16| {
            (offset..offset + count)
                .map(|i| table.get(&i).copied().unwrap_or(0))
                .collect::<Vec<_>>()
        };

        match request {
            Request::ReadCoils { offset, count } => {
                Response::ReadCoils(bits(&self.coils, *offset, *count))
            },
            Request::ReadDiscreteInputs { offset, count } => {
                Response::ReadDiscreteInputs(bits(&self.discrete_inputs, *offset, *count))
            },
            Request::ReadHoldingRegisters { offset, count } => {
                Response::ReadHoldingRegisters(registers(&self.holding_registers, *offset, *count))
            },
            Request::ReadInputRegisters { offset, count } => {
                Response::ReadInputRegisters(registers(&self.input_registers, *offset, *count))
            },
            Request::WriteSingleCoil { offset, value } => {
                self.coils.insert(*offset, *value);
                Response::echo(request).unwrap()
            },
            Request::WriteSingleRegister { offset, value } => {
                self.holding_registers.insert(*offset, *value);
                Response::echo(request).unwrap()
            },
            Request::WriteMultipleCoils { offset, values } => {
                for (i, value) in values.iter().enumerate() {
                    self.coils.insert(offset + i as u16, *value);
                }
                Response::echo(request).unwrap()
            },
            Request::WriteMultipleRegisters { offset, values } => {
                for (i, value) in values.iter().enumerate() {
                    self.holding_registers.insert(offset + i as u16, *value);
                }
                Response::echo(request).unwrap()
            },
        }
    }
}

/// Modbus TCP slave simulator
pub struct ModbusTcpSimulator {
    pub addr: SocketAddr,
    pub model: Arc<Mutex<DataModel>>,
    behavior: Arc<Mutex<Behavior>>,
    requests: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl ModbusTcpSimulator {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let model = Arc::new(Mutex::new(DataModel::seeded()));
        let behavior = Arc::new(Mutex::new(behavior));
        let requests = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(AtomicUsize::new(0));

        let handle = {
            let model = Arc::clone(&model);
            let behavior = Arc::clone(&behavior);
            let requests = Arc::clone(&requests);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        socket,
                        Arc::clone(&model),
                        Arc::clone(&behavior),
                        Arc::clone(&requests),
                    ));
                }
            })
        };

        Self {
            addr,
            model,
            behavior,
            requests,
            connections,
            handle,
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    /// Request frames received so far
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> ModbusConfig {
        ModbusConfig::new(self.addr.ip().to_string(), self.addr.port())
            .with_timeout(Duration::from_millis(500))
    }

    /// Client with a recording sink
    pub async fn client(&self, config: ModbusConfig) -> (ModbusClient, MemorySink) {
        let sink = MemorySink::new();
        let client = ModbusClient::with_sink(config, Arc::new(sink.clone()) as Arc<dyn LogSink>)
            .await
            .unwrap();
        (client, sink)
    }
}

impl Drop for ModbusTcpSimulator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn read_frame(socket: &mut TcpStream) -> Option<Frame> {
    let mut header = [0u8; 6];
    socket.read_exact(&mut header).await.ok()?;
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;

    let mut frame = header.to_vec();
    frame.resize(6 + length, 0);
    socket.read_exact(&mut frame[6..]).await.ok()?;
    Frame::decode(&frame).ok()
}

async fn reply(socket: &mut TcpStream, tid: u16, unit_id: u8, response: &Response) {
    let frame = Frame::new(tid, unit_id, response.encode_pdu().unwrap());
    let _ = socket.write_all(&frame.encode()).await;
}

async fn serve(
    mut socket: TcpStream,
    model: Arc<Mutex<DataModel>>,
    behavior: Arc<Mutex<Behavior>>,
    requests: Arc<AtomicUsize>,
) {
    while let Some(frame) = read_frame(&mut socket).await {
        requests.fetch_add(1, Ordering::SeqCst);
        let Ok(request) = Request::decode_pdu(&frame.pdu) else {
            continue;
        };
        let (tid, unit) = (frame.transaction_id, frame.unit_id);

        let current = *behavior.lock();
        match current {
            Behavior::Silent => continue,
            Behavior::Exception(code) => {
                let response = Response::Exception {
                    function: request.function_code(),
                    code: ExceptionCode::from_u8(code),
                };
                reply(&mut socket, tid, unit, &response).await;
                continue;
            },
            Behavior::DropFirst => {
                *behavior.lock() = Behavior::Normal;
                return;
            },
            Behavior::StaleFirst => {
                let stale = Response::Exception {
                    function: FunctionCode::ReadCoils,
                    code: ExceptionCode::SlaveDeviceBusy,
                };
                reply(&mut socket, tid.wrapping_sub(1), unit, &stale).await;
            },
            Behavior::WrongUnitFirst => {
                let other = Response::Exception {
                    function: request.function_code(),
                    code: ExceptionCode::GatewayPathUnavailable,
                };
                reply(&mut socket, tid, unit.wrapping_add(1), &other).await;
            },
            Behavior::BadEcho => {
                if let Request::WriteSingleRegister { offset, value } = request {
                    let wrong = Response::WriteSingleRegister {
                        offset,
                        value: value.wrapping_add(1),
                    };
                    reply(&mut socket, tid, unit, &wrong).await;
                    continue;
                }
            },
            Behavior::Normal => {},
        }

        let response = model.lock().execute(&request);
        reply(&mut socket, tid, unit, &response).await;
    }
}
