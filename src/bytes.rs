//! # Byte Order Handling
//!
//! Register maps describe multi-register values with two independent
//! settings, `byteorder` (bytes inside each 16-bit register) and `wordorder`
//! (registers inside the value). Both are folded into one [`ByteOrder`]
//! using ABCD notation, where A is the most significant byte:
//!
//! | byteorder | wordorder | ByteOrder | 0x12345678 on the wire |
//! |-----------|-----------|-----------|------------------------|
//! | BIG | BIG | `BigEndian` (ABCD) | `[0x1234, 0x5678]` |
//! | BIG | LITTLE | `BigEndianSwap` (CDAB) | `[0x5678, 0x1234]` |
//! | LITTLE | LITTLE | `LittleEndian` (DCBA) | `[0x7856, 0x3412]` |
//! | LITTLE | BIG | `LittleEndianSwap` (BADC) | `[0x3412, 0x7856]` |
//!
//! Single-register values only honour the byte half of the setting.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unified byte/word order for 16/32/64-bit values.
///
/// # Example
///
/// ```rust
/// use voltage_gateway::bytes::{ByteOrder, Endian};
///
/// let order = ByteOrder::from_endian(Endian::Big, Endian::Little);
/// assert_eq!(order, ByteOrder::BigEndianSwap);
/// assert_eq!(ByteOrder::from_str("CDAB"), Some(order));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteOrder {
    /// ABCD
    #[default]
    BigEndian,
    /// DCBA
    LittleEndian,
    /// CDAB, big-endian registers in reverse order
    BigEndianSwap,
    /// BADC, byte-swapped registers in natural order
    LittleEndianSwap,
}

/// One half of a `byteorder`/`wordorder` pair as written in register maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Endian {
    #[default]
    #[serde(alias = "BIG", alias = "big", alias = ">")]
    Big,
    #[serde(alias = "LITTLE", alias = "little", alias = "<")]
    Little,
}

impl ByteOrder {
    /// Fold a `(byteorder, wordorder)` pair into one order.
    pub fn from_endian(byte_order: Endian, word_order: Endian) -> Self {
        match (byte_order, word_order) {
            (Endian::Big, Endian::Big) => Self::BigEndian,
            (Endian::Big, Endian::Little) => Self::BigEndianSwap,
            (Endian::Little, Endian::Little) => Self::LittleEndian,
            (Endian::Little, Endian::Big) => Self::LittleEndianSwap,
        }
    }

    /// Parse ABCD-style and short names ("ABCD", "CD-AB", "BE", "le", ...).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "ABCD" | "AB" | "BE" | "BIGENDIAN" | "ABCDEFGH" => Some(Self::BigEndian),
            "DCBA" | "LE" | "LITTLEENDIAN" | "HGFEDCBA" => Some(Self::LittleEndian),
            "CDAB" | "BIGENDIANSWAP" => Some(Self::BigEndianSwap),
            "BADC" | "BA" | "LITTLEENDIANSWAP" => Some(Self::LittleEndianSwap),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BigEndian => "ABCD",
            Self::LittleEndian => "DCBA",
            Self::BigEndianSwap => "CDAB",
            Self::LittleEndianSwap => "BADC",
        }
    }

    /// Registers of a multi-register value arrive least significant first.
    #[inline]
    pub fn reverses_words(&self) -> bool {
        matches!(self, Self::LittleEndian | Self::BigEndianSwap)
    }

    /// Bytes inside each register arrive least significant first.
    #[inline]
    pub fn swaps_bytes(&self) -> bool {
        matches!(self, Self::LittleEndian | Self::LittleEndianSwap)
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Register <-> byte conversions
// ============================================================================

/// Reassemble registers into the value's big-endian byte image.
///
/// # Example
///
/// ```rust
/// use voltage_gateway::bytes::{regs_to_be_bytes, ByteOrder};
///
/// let regs = [0x5678, 0x1234];
/// assert_eq!(
///     regs_to_be_bytes(&regs, ByteOrder::BigEndianSwap),
///     vec![0x12, 0x34, 0x56, 0x78]
/// );
/// ```
pub fn regs_to_be_bytes(regs: &[u16], order: ByteOrder) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(regs.len() * 2);
    let mut push = |reg: u16| {
        let reg = if order.swaps_bytes() { reg.swap_bytes() } else { reg };
        bytes.extend_from_slice(&reg.to_be_bytes());
    };
    if order.reverses_words() {
        regs.iter().rev().copied().for_each(&mut push);
    } else {
        regs.iter().copied().for_each(&mut push);
    }
    bytes
}

/// Split a big-endian byte image into registers in wire order.
/// An odd trailing byte is padded with zero.
pub fn be_bytes_to_regs(bytes: &[u8], order: ByteOrder) -> Vec<u16> {
    let mut regs: Vec<u16> = bytes
        .chunks(2)
        .map(|pair| {
            let reg = u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]);
            if order.swaps_bytes() {
                reg.swap_bytes()
            } else {
                reg
            }
        })
        .collect();
    if order.reverses_words() {
        regs.reverse();
    }
    regs
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ORDERS: [ByteOrder; 4] = [
        ByteOrder::BigEndian,
        ByteOrder::LittleEndian,
        ByteOrder::BigEndianSwap,
        ByteOrder::LittleEndianSwap,
    ];

    #[test]
    fn test_from_endian_table() {
        assert_eq!(ByteOrder::from_endian(Endian::Big, Endian::Big), ByteOrder::BigEndian);
        assert_eq!(
            ByteOrder::from_endian(Endian::Big, Endian::Little),
            ByteOrder::BigEndianSwap
        );
        assert_eq!(
            ByteOrder::from_endian(Endian::Little, Endian::Little),
            ByteOrder::LittleEndian
        );
        assert_eq!(
            ByteOrder::from_endian(Endian::Little, Endian::Big),
            ByteOrder::LittleEndianSwap
        );
    }

    #[test]
    fn test_endian_deserialize() {
        let e: Endian = serde_json::from_str("\"LITTLE\"").unwrap();
        assert_eq!(e, Endian::Little);
        let e: Endian = serde_json::from_str("\"BIG\"").unwrap();
        assert_eq!(e, Endian::Big);
    }

    #[test]
    fn test_from_str() {
        assert_eq!(ByteOrder::from_str("AB-CD"), Some(ByteOrder::BigEndian));
        assert_eq!(ByteOrder::from_str("le"), Some(ByteOrder::LittleEndian));
        assert_eq!(ByteOrder::from_str("cd_ab"), Some(ByteOrder::BigEndianSwap));
        assert_eq!(ByteOrder::from_str("BADC"), Some(ByteOrder::LittleEndianSwap));
        assert_eq!(ByteOrder::from_str("XYZ"), None);
    }

    #[test]
    fn test_two_register_orders() {
        let regs = [0x1234, 0x5678];
        assert_eq!(regs_to_be_bytes(&regs, ByteOrder::BigEndian), vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(regs_to_be_bytes(&regs, ByteOrder::LittleEndian), vec![0x78, 0x56, 0x34, 0x12]);
        assert_eq!(regs_to_be_bytes(&regs, ByteOrder::BigEndianSwap), vec![0x56, 0x78, 0x12, 0x34]);
        assert_eq!(
            regs_to_be_bytes(&regs, ByteOrder::LittleEndianSwap),
            vec![0x34, 0x12, 0x78, 0x56]
        );
    }

    #[test]
    fn test_four_register_word_swap() {
        let regs = [0x1234, 0x5678, 0x9ABC, 0xDEF0];
        assert_eq!(
            regs_to_be_bytes(&regs, ByteOrder::BigEndianSwap),
            vec![0xDE, 0xF0, 0x9A, 0xBC, 0x56, 0x78, 0x12, 0x34]
        );
    }

    #[test]
    fn test_single_register_ignores_word_order() {
        assert_eq!(regs_to_be_bytes(&[0x1234], ByteOrder::BigEndianSwap), vec![0x12, 0x34]);
        assert_eq!(regs_to_be_bytes(&[0x1234], ByteOrder::LittleEndianSwap), vec![0x34, 0x12]);
    }

    #[test]
    fn test_bytes_regs_inverse() {
        let image = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        for order in ORDERS {
            let regs = be_bytes_to_regs(&image, order);
            assert_eq!(regs_to_be_bytes(&regs, order), image.to_vec(), "{}", order);
        }
    }
}
