//! Modbus TCP frame codec
//!
//! ```text
//! +----------------+-------------+---------+---------+------------------+
//! | Transaction(2) | Protocol(2) | Len(2)  | Unit(1) | FC(1) + data(N)  |
//! +----------------+-------------+---------+---------+------------------+
//!                                  `Len` counts Unit + FC + data
//! ```
//!
//! Requests and responses are typed per function code. Encoding and decoding
//! are symmetric so both sides of a conversation can be exercised in tests.

use crate::constants::{
    COIL_OFF, COIL_ON, MAX_MBAP_LENGTH, MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS, MBAP_HEADER_LEN, MODBUS_PROTOCOL_ID,
};
use crate::error::{ExceptionCode, ModbusError, ModbusResult, TransportError};
use crate::pdu::{FunctionCode, ModbusPdu, PduBuilder, EXCEPTION_FLAG};

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier
    pub transaction_id: u16,
    /// Protocol identifier (fixed to 0)
    pub protocol_id: u16,
    /// Byte count of unit id + PDU
    pub length: u16,
    /// Unit identifier (slave ID)
    pub unit_id: u8,
}

/// Transaction id and length field of a received header
///
/// The unit id is counted by `length` and travels with the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MbapPrefix {
    pub transaction_id: u16,
    pub length: u16,
}

impl MbapPrefix {
    /// Parse the fixed six bytes and validate protocol id and length
    pub(crate) fn parse(prefix: &[u8; MBAP_HEADER_LEN]) -> Result<Self, TransportError> {
        let transaction_id = u16::from_be_bytes([prefix[0], prefix[1]]);
        let protocol_id = u16::from_be_bytes([prefix[2], prefix[3]]);
        let length = u16::from_be_bytes([prefix[4], prefix[5]]);

        if protocol_id != MODBUS_PROTOCOL_ID {
            return Err(TransportError::Malformed(format!(
                "Invalid protocol ID: expected 0, got {}",
                protocol_id
            )));
        }
        // Unit id + function code at minimum
        if length < 2 || length as usize > MAX_MBAP_LENGTH {
            return Err(TransportError::Malformed(format!(
                "Invalid MBAP length: {}",
                length
            )));
        }

        Ok(Self {
            transaction_id,
            length,
        })
    }
}

/// One Modbus TCP application data unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: ModbusPdu,
}

impl Frame {
    pub fn new(transaction_id: u16, unit_id: u8, pdu: ModbusPdu) -> Self {
        Self {
            transaction_id,
            unit_id,
            pdu,
        }
    }

    pub fn header(&self) -> MbapHeader {
        MbapHeader {
            transaction_id: self.transaction_id,
            protocol_id: MODBUS_PROTOCOL_ID,
            length: (self.pdu.len() + 1) as u16,
            unit_id: self.unit_id,
        }
    }

    /// Serialize to MBAP + PDU
    pub fn encode(&self) -> Vec<u8> {
        let header = self.header();
        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + self.pdu.len());

        frame.extend_from_slice(&header.transaction_id.to_be_bytes());
        frame.extend_from_slice(&header.protocol_id.to_be_bytes());
        frame.extend_from_slice(&header.length.to_be_bytes());
        frame.push(header.unit_id);
        frame.extend_from_slice(self.pdu.as_slice());

        frame
    }

    /// Parse a complete frame; the length field must match exactly
    pub fn decode(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() < MBAP_HEADER_LEN + 2 {
            return Err(TransportError::Malformed(format!(
                "TCP frame too short: {} bytes",
                data.len()
            )));
        }

        let mut prefix = [0u8; MBAP_HEADER_LEN];
        prefix.copy_from_slice(&data[..MBAP_HEADER_LEN]);
        let header = MbapPrefix::parse(&prefix)?;

        let expected = MBAP_HEADER_LEN + header.length as usize;
        if data.len() != expected {
            return Err(TransportError::Malformed(format!(
                "Invalid TCP frame length: expected {}, got {}",
                expected,
                data.len()
            )));
        }

        Self::from_parts(header, &data[MBAP_HEADER_LEN..])
    }

    /// Assemble from a parsed header prefix and the `length` bytes that follow it
    pub(crate) fn from_parts(header: MbapPrefix, body: &[u8]) -> Result<Self, TransportError> {
        let (unit_id, pdu) = body
            .split_first()
            .ok_or_else(|| TransportError::Malformed("Missing unit id".to_string()))?;
        Ok(Self {
            transaction_id: header.transaction_id,
            unit_id: *unit_id,
            pdu: ModbusPdu::from_slice(pdu)?,
        })
    }
}

/// Typed request, one variant per supported function code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { offset: u16, count: u16 },
    ReadDiscreteInputs { offset: u16, count: u16 },
    ReadHoldingRegisters { offset: u16, count: u16 },
    ReadInputRegisters { offset: u16, count: u16 },
    WriteSingleCoil { offset: u16, value: bool },
    WriteSingleRegister { offset: u16, value: u16 },
    WriteMultipleCoils { offset: u16, values: Vec<bool> },
    WriteMultipleRegisters { offset: u16, values: Vec<u16> },
}

impl Request {
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Request::ReadCoils { .. } => FunctionCode::ReadCoils,
            Request::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            Request::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Request::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Request::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Request::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Request::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Request::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    pub fn offset(&self) -> u16 {
        match self {
            Request::ReadCoils { offset, .. }
            | Request::ReadDiscreteInputs { offset, .. }
            | Request::ReadHoldingRegisters { offset, .. }
            | Request::ReadInputRegisters { offset, .. }
            | Request::WriteSingleCoil { offset, .. }
            | Request::WriteSingleRegister { offset, .. }
            | Request::WriteMultipleCoils { offset, .. }
            | Request::WriteMultipleRegisters { offset, .. } => *offset,
        }
    }

    /// Number of bits or registers addressed
    pub fn quantity(&self) -> usize {
        match self {
            Request::ReadCoils { count, .. }
            | Request::ReadDiscreteInputs { count, .. }
            | Request::ReadHoldingRegisters { count, .. }
            | Request::ReadInputRegisters { count, .. } => *count as usize,
            Request::WriteSingleCoil { .. } | Request::WriteSingleRegister { .. } => 1,
            Request::WriteMultipleCoils { values, .. } => values.len(),
            Request::WriteMultipleRegisters { values, .. } => values.len(),
        }
    }

    /// Check the quantity against the function's bound
    pub fn validate(&self) -> ModbusResult<()> {
        let max = match self {
            Request::ReadCoils { .. } | Request::ReadDiscreteInputs { .. } => MAX_READ_BITS,
            Request::ReadHoldingRegisters { .. } | Request::ReadInputRegisters { .. } => {
                MAX_READ_REGISTERS
            },
            Request::WriteMultipleCoils { .. } => MAX_WRITE_COILS,
            Request::WriteMultipleRegisters { .. } => MAX_WRITE_REGISTERS,
            Request::WriteSingleCoil { .. } | Request::WriteSingleRegister { .. } => return Ok(()),
        };

        let quantity = self.quantity();
        if quantity == 0 || quantity > max as usize {
            return Err(ModbusError::invalid_argument(format!(
                "{} quantity {} outside 1..={}",
                self.function_code(),
                quantity,
                max
            )));
        }
        Ok(())
    }

    pub fn encode_pdu(&self) -> Result<ModbusPdu, TransportError> {
        let builder = PduBuilder::new()
            .function_code(self.function_code().to_u8())?
            .address(self.offset())?;

        let pdu = match self {
            Request::ReadCoils { count, .. }
            | Request::ReadDiscreteInputs { count, .. }
            | Request::ReadHoldingRegisters { count, .. }
            | Request::ReadInputRegisters { count, .. } => builder.quantity(*count)?.build(),
            Request::WriteSingleCoil { value, .. } => builder.quantity(coil_value(*value))?.build(),
            Request::WriteSingleRegister { value, .. } => builder.quantity(*value)?.build(),
            Request::WriteMultipleCoils { values, .. } => {
                let packed = pack_bits(values);
                builder
                    .quantity(values.len() as u16)?
                    .byte(packed.len() as u8)?
                    .data(&packed)?
                    .build()
            },
            Request::WriteMultipleRegisters { values, .. } => {
                let mut builder = builder
                    .quantity(values.len() as u16)?
                    .byte((values.len() * 2) as u8)?;
                for value in values {
                    builder = builder.data(&value.to_be_bytes())?;
                }
                builder.build()
            },
        };
        Ok(pdu)
    }

    /// Parse a request PDU as a slave would
    pub fn decode_pdu(pdu: &ModbusPdu) -> Result<Self, TransportError> {
        let code = pdu
            .function_code()
            .ok_or_else(|| TransportError::Malformed("Empty request PDU".to_string()))?;
        let function = FunctionCode::from_u8(code).ok_or_else(|| {
            TransportError::Malformed(format!("Unsupported function code 0x{:02X}", code))
        })?;

        let mut body = pdu.body();
        let offset = body.u16()?;
        let request = match function {
            FunctionCode::ReadCoils => Request::ReadCoils {
                offset,
                count: body.u16()?,
            },
            FunctionCode::ReadDiscreteInputs => Request::ReadDiscreteInputs {
                offset,
                count: body.u16()?,
            },
            FunctionCode::ReadHoldingRegisters => Request::ReadHoldingRegisters {
                offset,
                count: body.u16()?,
            },
            FunctionCode::ReadInputRegisters => Request::ReadInputRegisters {
                offset,
                count: body.u16()?,
            },
            FunctionCode::WriteSingleCoil => Request::WriteSingleCoil {
                offset,
                value: parse_coil_value(body.u16()?)?,
            },
            FunctionCode::WriteSingleRegister => Request::WriteSingleRegister {
                offset,
                value: body.u16()?,
            },
            FunctionCode::WriteMultipleCoils => {
                let count = body.u16()? as usize;
                let byte_count = body.u8()? as usize;
                if byte_count != count.div_ceil(8) {
                    return Err(TransportError::Malformed(format!(
                        "Byte count {} does not match {} coils",
                        byte_count, count
                    )));
                }
                Request::WriteMultipleCoils {
                    offset,
                    values: unpack_bits(body.bytes(byte_count)?, count),
                }
            },
            FunctionCode::WriteMultipleRegisters => {
                let count = body.u16()? as usize;
                let byte_count = body.u8()? as usize;
                if byte_count != count * 2 {
                    return Err(TransportError::Malformed(format!(
                        "Byte count {} does not match {} registers",
                        byte_count, count
                    )));
                }
                Request::WriteMultipleRegisters {
                    offset,
                    values: unpack_registers(body.bytes(byte_count)?),
                }
            },
        };
        body.finish()?;
        Ok(request)
    }
}

/// Typed response, including the exception indication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ReadCoils(Vec<bool>),
    ReadDiscreteInputs(Vec<bool>),
    ReadHoldingRegisters(Vec<u16>),
    ReadInputRegisters(Vec<u16>),
    WriteSingleCoil { offset: u16, value: bool },
    WriteSingleRegister { offset: u16, value: u16 },
    WriteMultipleCoils { offset: u16, count: u16 },
    WriteMultipleRegisters { offset: u16, count: u16 },
    Exception {
        function: FunctionCode,
        code: ExceptionCode,
    },
}

impl Response {
    /// Echo a conforming slave returns for a write request; `None` for reads
    pub fn echo(request: &Request) -> Option<Self> {
        match request {
            Request::WriteSingleCoil { offset, value } => Some(Response::WriteSingleCoil {
                offset: *offset,
                value: *value,
            }),
            Request::WriteSingleRegister { offset, value } => Some(Response::WriteSingleRegister {
                offset: *offset,
                value: *value,
            }),
            Request::WriteMultipleCoils { offset, values } => Some(Response::WriteMultipleCoils {
                offset: *offset,
                count: values.len() as u16,
            }),
            Request::WriteMultipleRegisters { offset, values } => {
                Some(Response::WriteMultipleRegisters {
                    offset: *offset,
                    count: values.len() as u16,
                })
            },
            _ => None,
        }
    }

    pub fn encode_pdu(&self) -> Result<ModbusPdu, TransportError> {
        let pdu = match self {
            Response::ReadCoils(bits) | Response::ReadDiscreteInputs(bits) => {
                let packed = pack_bits(bits);
                PduBuilder::new()
                    .function_code(self.function_byte())?
                    .byte(packed.len() as u8)?
                    .data(&packed)?
                    .build()
            },
            Response::ReadHoldingRegisters(values) | Response::ReadInputRegisters(values) => {
                let mut builder = PduBuilder::new()
                    .function_code(self.function_byte())?
                    .byte((values.len() * 2) as u8)?;
                for value in values {
                    builder = builder.data(&value.to_be_bytes())?;
                }
                builder.build()
            },
            Response::WriteSingleCoil { offset, value } => PduBuilder::new()
                .function_code(self.function_byte())?
                .address(*offset)?
                .quantity(coil_value(*value))?
                .build(),
            Response::WriteSingleRegister { offset, value } => PduBuilder::new()
                .function_code(self.function_byte())?
                .address(*offset)?
                .quantity(*value)?
                .build(),
            Response::WriteMultipleCoils { offset, count }
            | Response::WriteMultipleRegisters { offset, count } => PduBuilder::new()
                .function_code(self.function_byte())?
                .address(*offset)?
                .quantity(*count)?
                .build(),
            Response::Exception { code, .. } => PduBuilder::new()
                .function_code(self.function_byte())?
                .byte(code.to_u8())?
                .build(),
        };
        Ok(pdu)
    }

    fn function_byte(&self) -> u8 {
        match self {
            Response::ReadCoils(_) => FunctionCode::ReadCoils.to_u8(),
            Response::ReadDiscreteInputs(_) => FunctionCode::ReadDiscreteInputs.to_u8(),
            Response::ReadHoldingRegisters(_) => FunctionCode::ReadHoldingRegisters.to_u8(),
            Response::ReadInputRegisters(_) => FunctionCode::ReadInputRegisters.to_u8(),
            Response::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil.to_u8(),
            Response::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister.to_u8(),
            Response::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils.to_u8(),
            Response::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters.to_u8(),
            Response::Exception { function, .. } => function.to_u8() | EXCEPTION_FLAG,
        }
    }

    /// Decode the slave's answer to `request`
    ///
    /// Exception responses decode successfully into `Response::Exception`; a
    /// body that does not answer the request is `TransportError::Malformed`.
    pub fn decode_pdu(request: &Request, pdu: &ModbusPdu) -> Result<Self, TransportError> {
        let expected = request.function_code();
        let code = pdu
            .function_code()
            .ok_or_else(|| TransportError::Malformed("Empty response PDU".to_string()))?;

        if code & EXCEPTION_FLAG != 0 {
            if code & !EXCEPTION_FLAG != expected.to_u8() {
                return Err(TransportError::Malformed(format!(
                    "Exception for FC{:02X} in response to {}",
                    code & !EXCEPTION_FLAG,
                    expected
                )));
            }
            let exception = pdu
                .exception_code()
                .ok_or_else(|| TransportError::Malformed("Missing exception code".to_string()))?;
            return Ok(Response::Exception {
                function: expected,
                code: ExceptionCode::from_u8(exception),
            });
        }

        if code != expected.to_u8() {
            return Err(TransportError::Malformed(format!(
                "Unexpected function code: expected 0x{:02X}, got 0x{:02X}",
                expected.to_u8(),
                code
            )));
        }

        let mut body = pdu.body();
        let response = match request {
            Request::ReadCoils { count, .. } | Request::ReadDiscreteInputs { count, .. } => {
                let count = *count as usize;
                let byte_count = body.u8()? as usize;
                if byte_count != count.div_ceil(8) {
                    return Err(TransportError::Malformed(format!(
                        "Byte count {} does not match {} bits",
                        byte_count, count
                    )));
                }
                let bits = unpack_bits(body.bytes(byte_count)?, count);
                if expected == FunctionCode::ReadCoils {
                    Response::ReadCoils(bits)
                } else {
                    Response::ReadDiscreteInputs(bits)
                }
            },
            Request::ReadHoldingRegisters { count, .. } | Request::ReadInputRegisters { count, .. } => {
                let byte_count = body.u8()? as usize;
                if byte_count != *count as usize * 2 {
                    return Err(TransportError::Malformed(format!(
                        "Byte count {} does not match {} registers",
                        byte_count, count
                    )));
                }
                let values = unpack_registers(body.bytes(byte_count)?);
                if expected == FunctionCode::ReadHoldingRegisters {
                    Response::ReadHoldingRegisters(values)
                } else {
                    Response::ReadInputRegisters(values)
                }
            },
            Request::WriteSingleCoil { .. } => Response::WriteSingleCoil {
                offset: body.u16()?,
                value: parse_coil_value(body.u16()?)?,
            },
            Request::WriteSingleRegister { .. } => Response::WriteSingleRegister {
                offset: body.u16()?,
                value: body.u16()?,
            },
            Request::WriteMultipleCoils { .. } => Response::WriteMultipleCoils {
                offset: body.u16()?,
                count: body.u16()?,
            },
            Request::WriteMultipleRegisters { .. } => Response::WriteMultipleRegisters {
                offset: body.u16()?,
                count: body.u16()?,
            },
        };
        body.finish()?;

        if let Some(echo) = Response::echo(request) {
            if echo != response {
                return Err(TransportError::Malformed(format!(
                    "Write response {:?} does not echo request {:?}",
                    response, echo
                )));
            }
        }
        Ok(response)
    }
}

fn coil_value(on: bool) -> u16 {
    if on {
        COIL_ON
    } else {
        COIL_OFF
    }
}

fn parse_coil_value(raw: u16) -> Result<bool, TransportError> {
    match raw {
        COIL_ON => Ok(true),
        COIL_OFF => Ok(false),
        other => Err(TransportError::Malformed(format!(
            "Invalid coil value 0x{:04X}",
            other
        ))),
    }
}

/// Pack bits LSB-first; element 0 lands in bit 0 of the first byte
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |byte, (i, &bit)| if bit { byte | (1 << i) } else { byte })
        })
        .collect()
}

/// Unpack `count` bits; padding in the last byte is ignored
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).is_some_and(|byte| (byte >> (i % 8)) & 0x01 == 1))
        .collect()
}

fn unpack_registers(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Compose an IEEE-754 float from two registers, high word first
pub fn f32_from_registers(high: u16, low: u16) -> f32 {
    f32::from_bits((u32::from(high) << 16) | u32::from(low))
}

/// Split an IEEE-754 float into `[high, low]` registers
pub fn f32_to_registers(value: f32) -> [u16; 2] {
    let bits = value.to_bits();
    [(bits >> 16) as u16, bits as u16]
}
