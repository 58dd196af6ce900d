//! Conventional 5-digit Modbus addressing
//!
//! | Range         | Data type        | Offset        |
//! |---------------|------------------|---------------|
//! | 1 - 9999      | Coil             | address - 1     |
//! | 10001 - 19999 | Discrete input   | address - 10001 |
//! | 30001 - 39999 | Input register   | address - 30001 |
//! | 40001 - 49999 | Holding register | address - 40001 |
//!
//! Every range restarts at a 10000 boundary, so the offset is always
//! `(address % 10000) - 1` regardless of type.

use std::fmt;
use std::ops::RangeInclusive;

use crate::error::{ModbusError, ModbusResult};

/// Data table an address belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

impl DataType {
    /// Closed range of logical addresses for this type
    pub fn range(self) -> RangeInclusive<i32> {
        match self {
            DataType::Coil => 1..=9999,
            DataType::DiscreteInput => 10001..=19999,
            DataType::InputRegister => 30001..=39999,
            DataType::HoldingRegister => 40001..=49999,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Coil => "coil",
            DataType::DiscreteInput => "discrete input",
            DataType::InputRegister => "input register",
            DataType::HoldingRegister => "holding register",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const ALL_TYPES: [DataType; 4] = [
    DataType::Coil,
    DataType::DiscreteInput,
    DataType::InputRegister,
    DataType::HoldingRegister,
];

/// Classify a logical address into its data table
pub fn classify(address: i32) -> ModbusResult<DataType> {
    ALL_TYPES
        .into_iter()
        .find(|data_type| data_type.range().contains(&address))
        .ok_or_else(|| ModbusError::invalid_address(address, "not in any Modbus address range"))
}

/// Zero-based protocol offset of a logical address
pub fn to_offset(address: i32) -> ModbusResult<u16> {
    classify(address)?;
    Ok(offset_of(address))
}

// Caller guarantees `address` was classified
fn offset_of(address: i32) -> u16 {
    (address % 10000 - 1) as u16
}

/// A classified logical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModbusAddress {
    address: i32,
    data_type: DataType,
}

impl ModbusAddress {
    pub fn new(address: i32) -> ModbusResult<Self> {
        let data_type = classify(address)?;
        Ok(Self { address, data_type })
    }

    /// Classify and require a specific data type
    pub fn expect(address: i32, expected: DataType) -> ModbusResult<Self> {
        let parsed = Self::new(address)?;
        if parsed.data_type != expected {
            return Err(ModbusError::invalid_address(
                address,
                format!("is a {}, expected a {}", parsed.data_type, expected),
            ));
        }
        Ok(parsed)
    }

    /// Require `count` consecutive elements starting here to stay inside the range
    pub fn check_span(&self, count: u16) -> ModbusResult<()> {
        if count == 0 {
            return Ok(());
        }
        let last = self.address + i32::from(count) - 1;
        let end = *self.data_type.range().end();
        if last > end {
            return Err(ModbusError::invalid_address(
                self.address,
                format!(
                    "{} {}s end at {}, past the last {} address {}",
                    count, self.data_type, last, self.data_type, end
                ),
            ));
        }
        Ok(())
    }

    pub fn raw(&self) -> i32 {
        self.address
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn offset(&self) -> u16 {
        offset_of(self.address)
    }
}

impl fmt::Display for ModbusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05}", self.address)
    }
}
