//! # Register Codec
//!
//! Typed decode/encode operations for register slices.
//!
//! Register maps name their formats in several dialects; all of them parse
//! into one [`FieldFormat`] once, when the device map is compiled:
//!
//! | FieldFormat | Registers | Accepted names |
//! |-------------|-----------|----------------|
//! | `U8` / `I8` | 1 | `decode_8bit_uint`, `uint8`, `u8` / `decode_8bit_int`, `int8`, `i8` |
//! | `U16` | 1 | `decode_16bit_uint`, `add_16bit_uint`, `UINT16`, `u16`, `word`, `decode_bits` |
//! | `I16` | 1 | `decode_16bit_int`, `INT16`, `i16`, `short` |
//! | `U32` | 2 | `decode_32bit_uint`, `UINT32`, `u32`, `dword` |
//! | `I32` | 2 | `decode_32bit_int`, `INT32`, `i32`, `long` |
//! | `F32` | 2 | `decode_32bit_float`, `FLOAT32`, `f32`, `float`, `real` |
//! | `U64` | 4 | `decode_64bit_uint`, `UINT64`, `u64`, `qword` |
//! | `I64` | 4 | `decode_64bit_int`, `INT64`, `i64` |
//! | `F64` | 4 | `decode_64bit_float`, `FLOAT64`, `f64`, `double` |
//!
//! String formats (`decode_string`, `STRING`) are descriptive only and carry
//! no numeric value.

use std::fmt;

use crate::bytes::{be_bytes_to_regs, regs_to_be_bytes, ByteOrder};
use crate::error::{ModbusError, ModbusResult};

/// Numeric layout of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldFormat {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    U64,
    I64,
    F64,
}

/// Result of parsing a format name from a register map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatName {
    Numeric(FieldFormat),
    /// Present in the map for documentation only.
    Descriptive,
    Unknown(String),
}

impl FieldFormat {
    /// Parse any supported format spelling.
    pub fn parse(name: &str) -> FormatName {
        let lowered = name.trim().to_ascii_lowercase();
        let key = lowered
            .strip_prefix("decode_")
            .or_else(|| lowered.strip_prefix("add_"))
            .unwrap_or(&lowered);
        let format = match key {
            "8bit_uint" | "uint8" | "u8" => Self::U8,
            "8bit_int" | "int8" | "i8" => Self::I8,
            "16bit_uint" | "uint16" | "u16" | "word" | "bits" => Self::U16,
            "16bit_int" | "int16" | "i16" | "short" => Self::I16,
            "32bit_uint" | "uint32" | "u32" | "dword" => Self::U32,
            "32bit_int" | "int32" | "i32" | "long" => Self::I32,
            "32bit_float" | "float32" | "f32" | "float" | "real" => Self::F32,
            "64bit_uint" | "uint64" | "u64" | "qword" => Self::U64,
            "64bit_int" | "int64" | "i64" => Self::I64,
            "64bit_float" | "float64" | "f64" | "double" => Self::F64,
            "string" | "str" => return FormatName::Descriptive,
            _ => return FormatName::Unknown(name.to_string()),
        };
        FormatName::Numeric(format)
    }

    /// Registers occupied by one value.
    pub fn register_count(self) -> usize {
        match self {
            Self::U8 | Self::I8 | Self::U16 | Self::I16 => 1,
            Self::U32 | Self::I32 | Self::F32 => 2,
            Self::U64 | Self::I64 | Self::F64 => 4,
        }
    }

    /// Decode the leading registers of `registers`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use voltage_gateway::bytes::ByteOrder;
    /// use voltage_gateway::codec::FieldFormat;
    ///
    /// let value = FieldFormat::I32.decode(&[0xFFFF, 0xFFFE], ByteOrder::BigEndian).unwrap();
    /// assert_eq!(value.as_f64(), -2.0);
    /// ```
    pub fn decode(self, registers: &[u16], order: ByteOrder) -> ModbusResult<RawValue> {
        let needed = self.register_count();
        if registers.len() < needed {
            return Err(ModbusError::decode(format!(
                "{} needs {} registers, got {}",
                self,
                needed,
                registers.len()
            )));
        }
        let b = regs_to_be_bytes(&registers[..needed], order);
        let value = match self {
            Self::U8 => RawValue::U16(b[0] as u16),
            Self::I8 => RawValue::I16(b[0] as i8 as i16),
            Self::U16 => RawValue::U16(u16::from_be_bytes([b[0], b[1]])),
            Self::I16 => RawValue::I16(i16::from_be_bytes([b[0], b[1]])),
            Self::U32 => RawValue::U32(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
            Self::I32 => RawValue::I32(i32::from_be_bytes([b[0], b[1], b[2], b[3]])),
            Self::F32 => RawValue::F32(f32::from_be_bytes([b[0], b[1], b[2], b[3]])),
            Self::U64 => RawValue::U64(u64::from_be_bytes(eight(&b))),
            Self::I64 => RawValue::I64(i64::from_be_bytes(eight(&b))),
            Self::F64 => RawValue::F64(f64::from_be_bytes(eight(&b))),
        };
        Ok(value)
    }

    /// Serialize an engineering-domain number into wire registers.
    ///
    /// Integer formats truncate toward zero; values that do not fit the
    /// format are rejected rather than clamped.
    pub fn encode(self, value: f64, order: ByteOrder) -> ModbusResult<Vec<u16>> {
        if !value.is_finite() {
            return Err(ModbusError::invalid_data(format!(
                "Cannot encode non-finite value {} as {}",
                value, self
            )));
        }
        let t = value.trunc();
        let image: Vec<u8> = match self {
            Self::U8 => vec![fit::<u8>(t, self)?, 0],
            Self::I8 => vec![fit::<i8>(t, self)? as u8, 0],
            Self::U16 => fit::<u16>(t, self)?.to_be_bytes().to_vec(),
            Self::I16 => fit::<i16>(t, self)?.to_be_bytes().to_vec(),
            Self::U32 => fit::<u32>(t, self)?.to_be_bytes().to_vec(),
            Self::I32 => fit::<i32>(t, self)?.to_be_bytes().to_vec(),
            Self::F32 => (value as f32).to_be_bytes().to_vec(),
            Self::U64 => fit::<u64>(t, self)?.to_be_bytes().to_vec(),
            Self::I64 => fit::<i64>(t, self)?.to_be_bytes().to_vec(),
            Self::F64 => value.to_be_bytes().to_vec(),
        };
        Ok(be_bytes_to_regs(&image, order))
    }
}

impl fmt::Display for FieldFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::U8 => "uint8",
            Self::I8 => "int8",
            Self::U16 => "uint16",
            Self::I16 => "int16",
            Self::U32 => "uint32",
            Self::I32 => "int32",
            Self::F32 => "float32",
            Self::U64 => "uint64",
            Self::I64 => "int64",
            Self::F64 => "float64",
        };
        f.write_str(name)
    }
}

fn eight(b: &[u8]) -> [u8; 8] {
    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]
}

/// Range-checked float → integer conversion.
fn fit<T>(value: f64, format: FieldFormat) -> ModbusResult<T>
where
    T: TryFrom<i128>,
{
    if value < i128::MIN as f64 || value > i128::MAX as f64 {
        return Err(out_of_range(value, format));
    }
    T::try_from(value as i128).map_err(|_| out_of_range(value, format))
}

fn out_of_range(value: f64, format: FieldFormat) -> ModbusError {
    ModbusError::invalid_data(format!("Value {} does not fit {}", value, format))
}

/// A decoded, not yet scaled register value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawValue {
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl RawValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::U16(v) => v as f64,
            Self::I16(v) => v as f64,
            Self::U32(v) => v as f64,
            Self::I32(v) => v as f64,
            Self::F32(v) => v as f64,
            Self::U64(v) => v as f64,
            Self::I64(v) => v as f64,
            Self::F64(v) => v,
        }
    }

    /// Bit pattern of integer values, used for bitfield fault registers.
    pub fn bits(&self) -> Option<u64> {
        match *self {
            Self::U16(v) => Some(v as u64),
            Self::I16(v) => Some(v as u16 as u64),
            Self::U32(v) => Some(v as u64),
            Self::I32(v) => Some(v as u32 as u64),
            Self::U64(v) => Some(v),
            Self::I64(v) => Some(v as u64),
            Self::F32(_) | Self::F64(_) => None,
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U16(v) => write!(f, "{}", v),
            Self::I16(v) => write!(f, "{}", v),
            Self::U32(v) => write!(f, "{}", v),
            Self::I32(v) => write!(f, "{}", v),
            Self::F32(v) => write!(f, "{}", v),
            Self::U64(v) => write!(f, "{}", v),
            Self::I64(v) => write!(f, "{}", v),
            Self::F64(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_dialects() {
        assert_eq!(FieldFormat::parse("decode_16bit_int"), FormatName::Numeric(FieldFormat::I16));
        assert_eq!(FieldFormat::parse("add_16bit_uint"), FormatName::Numeric(FieldFormat::U16));
        assert_eq!(FieldFormat::parse("FLOAT32"), FormatName::Numeric(FieldFormat::F32));
        assert_eq!(FieldFormat::parse("u64"), FormatName::Numeric(FieldFormat::U64));
        assert_eq!(FieldFormat::parse("decode_string"), FormatName::Descriptive);
        assert_eq!(
            FieldFormat::parse("decode_24bit_weird"),
            FormatName::Unknown("decode_24bit_weird".to_string())
        );
    }

    #[test]
    fn test_decode_int16() {
        let v = FieldFormat::I16.decode(&[0xFFFE], ByteOrder::BigEndian).unwrap();
        assert_eq!(v, RawValue::I16(-2));
    }

    #[test]
    fn test_decode_uint32_word_swapped() {
        let v = FieldFormat::U32
            .decode(&[0x5678, 0x1234], ByteOrder::BigEndianSwap)
            .unwrap();
        assert_eq!(v, RawValue::U32(0x1234_5678));
    }

    #[test]
    fn test_decode_float32() {
        // 25.0 = 0x41C80000
        let v = FieldFormat::F32.decode(&[0x41C8, 0x0000], ByteOrder::BigEndian).unwrap();
        assert_eq!(v.as_f64(), 25.0);
    }

    #[test]
    fn test_decode_short_slice() {
        let err = FieldFormat::U32.decode(&[0x0001], ByteOrder::BigEndian).unwrap_err();
        assert!(err.is_decode_failure());
    }

    #[test]
    fn test_encode_rejects_overflow() {
        assert!(FieldFormat::U16.encode(70_000.0, ByteOrder::BigEndian).is_err());
        assert!(FieldFormat::U16.encode(-1.0, ByteOrder::BigEndian).is_err());
        assert!(FieldFormat::I16.encode(f64::NAN, ByteOrder::BigEndian).is_err());
    }

    #[test]
    fn test_encode_truncates() {
        assert_eq!(FieldFormat::I16.encode(-12.9, ByteOrder::BigEndian).unwrap(), vec![0xFFF4]);
        assert_eq!(
            FieldFormat::U32.encode(65_537.0, ByteOrder::BigEndianSwap).unwrap(),
            vec![0x0001, 0x0001]
        );
    }

    #[test]
    fn test_bits() {
        assert_eq!(RawValue::I16(-1).bits(), Some(0xFFFF));
        assert_eq!(RawValue::F32(1.0).bits(), None);
    }

    fn any_order() -> impl Strategy<Value = ByteOrder> {
        prop_oneof![
            Just(ByteOrder::BigEndian),
            Just(ByteOrder::LittleEndian),
            Just(ByteOrder::BigEndianSwap),
            Just(ByteOrder::LittleEndianSwap),
        ]
    }

    proptest! {
        #[test]
        fn prop_integer_encode_inverts_decode(raw in any::<i32>(), order in any_order()) {
            let regs = FieldFormat::I32.encode(raw as f64, order).unwrap();
            let back = FieldFormat::I32.decode(&regs, order).unwrap();
            prop_assert_eq!(back, RawValue::I32(raw));
        }

        #[test]
        fn prop_decode_then_encode_restores_registers(a in any::<u16>(), b in any::<u16>(), order in any_order()) {
            let value = FieldFormat::U32.decode(&[a, b], order).unwrap();
            let regs = FieldFormat::U32.encode(value.as_f64(), order).unwrap();
            prop_assert_eq!(regs, vec![a, b]);
        }
    }
}
