//! Modbus TCP protocol constants
//!
//! Values follow the Modbus Application Protocol v1.1b3 and the
//! Modbus Messaging on TCP/IP Implementation Guide.

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Bytes of the MBAP header read before the length field can be trusted:
/// Transaction ID(2) + Protocol ID(2) + Length(2).
/// The unit id is counted by the length field and read with the PDU.
pub const MBAP_HEADER_LEN: usize = 6;

/// Protocol identifier carried by every Modbus TCP frame
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Maximum PDU size: RS485 ADU (256) - slave address (1) - CRC (2)
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Largest complete frame on the wire
pub const MAX_FRAME_LEN: usize = MBAP_HEADER_LEN + MAX_MBAP_LENGTH;

// ============================================================================
// Quantity Limits
// ============================================================================

/// FC01/FC02: 1 + 1 + ceil(N / 8) <= 253, rounded down to 2000
pub const MAX_READ_BITS: u16 = 2000;

/// FC03/FC04: 1 + 1 + 2N <= 253
pub const MAX_READ_REGISTERS: u16 = 125;

/// FC15: 1 + 2 + 2 + 1 + ceil(N / 8) <= 253, protocol limit 0x7B0
pub const MAX_WRITE_COILS: u16 = 1968;

/// FC16: 1 + 2 + 2 + 1 + 2N <= 253
pub const MAX_WRITE_REGISTERS: u16 = 123;

// ============================================================================
// Coil Values
// ============================================================================

/// FC05 value for ON
pub const COIL_ON: u16 = 0xFF00;

/// FC05 value for OFF
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Session Defaults
// ============================================================================

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Unit id used when the caller does not name one
pub const DEFAULT_UNIT_ID: u8 = 1;

/// Response timeout per attempt
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Retries after the first attempt
pub const DEFAULT_RETRIES: u32 = 2;

/// Pause before reconnecting after a refused or failed connect
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 100;

/// Default response timeout as a `Duration`
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(DEFAULT_TIMEOUT_MS);

/// Environment prefix for configuration overrides
pub const CONFIG_ENV_PREFIX: &str = "MODBUS_";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MBAP_HEADER_LEN, 6);
        assert_eq!(MAX_PDU_SIZE, 253);
        assert_eq!(MAX_MBAP_LENGTH, 254);
        assert_eq!(MAX_FRAME_LEN, 260);
    }

    #[test]
    fn test_register_limits_fit_pdu() {
        let read_pdu = 1 + 1 + (MAX_READ_REGISTERS as usize * 2);
        assert!(read_pdu <= MAX_PDU_SIZE);

        let write_pdu = 1 + 2 + 2 + 1 + (MAX_WRITE_REGISTERS as usize * 2);
        assert!(write_pdu <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_coil_limits_fit_pdu() {
        let read_pdu = 1 + 1 + (MAX_READ_BITS as usize).div_ceil(8);
        assert!(read_pdu <= MAX_PDU_SIZE);

        let write_pdu = 1 + 2 + 2 + 1 + (MAX_WRITE_COILS as usize).div_ceil(8);
        assert!(write_pdu <= MAX_PDU_SIZE);
    }
}
