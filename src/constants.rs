//! Protocol limits and gateway defaults
//!
//! Register/coil limits follow from the 253-byte PDU ceiling:
//! a read response carries `1 (fc) + 1 (byte count) + 2N` bytes, so N ≤ 125;
//! a write-multiple request carries `1 + 2 + 2 + 1 + 2N` bytes, so N ≤ 123.

use std::time::Duration;

// ============================================================================
// Frame sizes
// ============================================================================

/// MBAP header without the unit id: transaction(2) + protocol(2) + length(2).
pub const MBAP_HEADER_LEN: usize = 6;

/// RS485 ADU (256) - slave address (1) - CRC (2).
pub const MAX_PDU_SIZE: usize = 253;

/// Largest legal MBAP length field (unit id + PDU).
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Slave address + PDU + CRC.
pub const MAX_RTU_FRAME_SIZE: usize = 1 + MAX_PDU_SIZE + 2;

/// Smallest valid RTU frame: slave + fc + exception code + CRC.
pub const MIN_RTU_FRAME_SIZE: usize = 5;

// ============================================================================
// Register / coil limits
// ============================================================================

/// FC03/FC04 per-request register ceiling.
pub const MAX_READ_REGISTERS: u16 = 125;

/// FC16 per-request register ceiling.
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// FC01/FC02 per-request bit ceiling.
pub const MAX_READ_COILS: u16 = 2000;

/// FC15 per-request bit ceiling.
pub const MAX_WRITE_COILS: u16 = 1968;

// ============================================================================
// Exception codes
// ============================================================================

pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;

// ============================================================================
// Gateway defaults
// ============================================================================

/// Modbus TCP port.
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Transaction timeout used by acquisition when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

/// Poll period used when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Largest plausible step of a cumulative energy counter between two cycles.
pub const ENERGY_JUMP_THRESHOLD: f64 = 1000.0;

/// Baud rates tried by the scanner, most common first.
pub const SCAN_BAUD_RATES: [u32; 3] = [9600, 4800, 19200];

/// Slave ids tried by the scanner.
pub const SCAN_SLAVE_RANGE: std::ops::RangeInclusive<u8> = 1..=60;

/// Timeout for the full verification reads.
pub const SCAN_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Timeout for the phase 1 probe.
pub const SCAN_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Timeout for the optional fast slave discovery pass.
pub const SCAN_PING_TIMEOUT: Duration = Duration::from_millis(80);

/// Pause after every scanner transaction.
pub const SCAN_PROBE_DELAY: Duration = Duration::from_millis(10);

/// Pause between two candidate device checks at the same slave id.
pub const SCAN_DEVICE_DELAY: Duration = Duration::from_millis(100);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_limits_fit_pdu() {
        let read_pdu = 1 + 1 + (MAX_READ_REGISTERS as usize * 2);
        assert!(read_pdu <= MAX_PDU_SIZE);

        let write_pdu = 1 + 2 + 2 + 1 + (MAX_WRITE_REGISTERS as usize * 2);
        assert!(write_pdu <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_coil_limits_fit_pdu() {
        let read_pdu = 1 + 1 + (MAX_READ_COILS as usize).div_ceil(8);
        assert!(read_pdu <= MAX_PDU_SIZE);

        let write_pdu = 1 + 2 + 2 + 1 + (MAX_WRITE_COILS as usize).div_ceil(8);
        assert!(write_pdu <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_scan_timeouts_ordered() {
        assert!(SCAN_PING_TIMEOUT < SCAN_PROBE_TIMEOUT);
        assert!(SCAN_PROBE_TIMEOUT < SCAN_RESPONSE_TIMEOUT);
    }
}
