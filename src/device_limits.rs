//! # Device Limits
//!
//! Per-device request ceilings. Register blocks longer than
//! `max_read_registers` are split into consecutive requests, each starting
//! where the previous one ended; results are concatenated in order.
//!
//! ```text
//! block 0..300 @ 125  →  [0, 125) [125, 250) [250, 300)
//! ```
//!
//! Some inverters cap reads well below the protocol limit; installer
//! configuration can lower any field.

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};

pub const DEFAULT_MAX_READ_REGISTERS: u16 = MAX_READ_REGISTERS;
pub const DEFAULT_MAX_WRITE_REGISTERS: u16 = MAX_WRITE_REGISTERS;
pub const DEFAULT_MAX_READ_COILS: u16 = MAX_READ_COILS;
pub const DEFAULT_INTER_REQUEST_DELAY_MS: u64 = 0;

/// Device-specific protocol limits.
///
/// # Example
///
/// ```rust
/// use voltage_gateway::DeviceLimits;
///
/// let limits = DeviceLimits::new().with_max_read_registers(50);
/// let chunks: Vec<_> = limits.register_chunks(100, 120).collect();
/// assert_eq!(chunks, vec![(100, 50), (150, 50), (200, 20)]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceLimits {
    /// Registers per FC03/FC04 request.
    pub max_read_registers: u16,
    /// Registers per FC16 request.
    pub max_write_registers: u16,
    /// Bits per FC01/FC02 request.
    pub max_read_coils: u16,
    /// Pause between consecutive chunks of one block (milliseconds).
    pub inter_request_delay_ms: u64,
}

impl DeviceLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lower limits for slow or older devices.
    pub fn conservative() -> Self {
        Self {
            max_read_registers: 50,
            max_write_registers: 50,
            max_read_coils: 500,
            inter_request_delay_ms: 10,
        }
    }

    pub fn with_max_read_registers(mut self, count: u16) -> Self {
        self.max_read_registers = count;
        self
    }

    pub fn with_max_write_registers(mut self, count: u16) -> Self {
        self.max_write_registers = count;
        self
    }

    pub fn with_max_read_coils(mut self, count: u16) -> Self {
        self.max_read_coils = count;
        self
    }

    pub fn with_inter_request_delay_ms(mut self, delay_ms: u64) -> Self {
        self.inter_request_delay_ms = delay_ms;
        self
    }

    /// Clamp configured values into the protocol range (1..=ceiling).
    pub fn normalized(self) -> Self {
        Self {
            max_read_registers: self.max_read_registers.clamp(1, MAX_READ_REGISTERS),
            max_write_registers: self.max_write_registers.clamp(1, MAX_WRITE_REGISTERS),
            max_read_coils: self.max_read_coils.clamp(1, MAX_READ_COILS),
            inter_request_delay_ms: self.inter_request_delay_ms,
        }
    }

    /// `(address, count)` pairs covering a register range.
    pub fn register_chunks(&self, start: u16, length: u16) -> Chunks {
        Chunks::new(start, length, self.max_read_registers)
    }

    /// `(address, count)` pairs covering a coil range.
    pub fn coil_chunks(&self, start: u16, length: u16) -> Chunks {
        Chunks::new(start, length, self.max_read_coils)
    }

    pub fn read_request_count(&self, total_registers: u16) -> u16 {
        if total_registers == 0 {
            return 0;
        }
        total_registers.div_ceil(self.max_read_registers.max(1))
    }

    pub fn is_write_within_limits(&self, register_count: usize) -> bool {
        register_count <= self.max_write_registers as usize
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_read_registers: DEFAULT_MAX_READ_REGISTERS,
            max_write_registers: DEFAULT_MAX_WRITE_REGISTERS,
            max_read_coils: DEFAULT_MAX_READ_COILS,
            inter_request_delay_ms: DEFAULT_INTER_REQUEST_DELAY_MS,
        }
    }
}

/// Iterator over request-sized pieces of a range.
#[derive(Debug, Clone)]
pub struct Chunks {
    next: u16,
    remaining: u16,
    ceiling: u16,
}

impl Chunks {
    fn new(start: u16, length: u16, ceiling: u16) -> Self {
        Self {
            next: start,
            remaining: length,
            ceiling: ceiling.max(1),
        }
    }
}

impl Iterator for Chunks {
    type Item = (u16, u16);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let count = self.remaining.min(self.ceiling);
        let chunk = (self.next, count);
        self.next = self.next.saturating_add(count);
        self.remaining -= count;
        Some(chunk)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_limits() {
        let limits = DeviceLimits::default();
        assert_eq!(limits.max_read_registers, 125);
        assert_eq!(limits.max_write_registers, 123);
        assert_eq!(limits.inter_request_delay_ms, 0);
    }

    #[test]
    fn test_chunks_at_protocol_ceiling() {
        let chunks: Vec<_> = DeviceLimits::new().register_chunks(0, 300).collect();
        assert_eq!(chunks, vec![(0, 125), (125, 125), (250, 50)]);
    }

    #[test]
    fn test_chunks_empty_range() {
        assert_eq!(DeviceLimits::new().register_chunks(10, 0).count(), 0);
    }

    #[test]
    fn test_normalized_clamps() {
        let limits = DeviceLimits::new()
            .with_max_read_registers(0)
            .with_max_write_registers(500)
            .normalized();
        assert_eq!(limits.max_read_registers, 1);
        assert_eq!(limits.max_write_registers, 123);
    }

    #[test]
    fn test_partial_override_from_json() {
        let limits: DeviceLimits = serde_json::from_str(r#"{"max_read_registers": 60}"#).unwrap();
        assert_eq!(limits.max_read_registers, 60);
        assert_eq!(limits.max_write_registers, 123);
    }

    #[test]
    fn test_read_request_count() {
        let limits = DeviceLimits::new().with_max_read_registers(50);
        assert_eq!(limits.read_request_count(0), 0);
        assert_eq!(limits.read_request_count(50), 1);
        assert_eq!(limits.read_request_count(101), 3);
    }

    proptest! {
        #[test]
        fn prop_chunks_tile_the_range(start in 0u16..1000, len in 0u16..2000, ceiling in 1u16..=125) {
            let limits = DeviceLimits::new().with_max_read_registers(ceiling);
            let mut expected = start;
            let mut total = 0u32;
            for (addr, count) in limits.register_chunks(start, len) {
                prop_assert_eq!(addr, expected);
                prop_assert!(count >= 1 && count <= ceiling);
                expected += count;
                total += count as u32;
            }
            prop_assert_eq!(total, len as u32);
            prop_assert_eq!(limits.read_request_count(len) as usize, limits.register_chunks(start, len).count());
        }
    }
}
