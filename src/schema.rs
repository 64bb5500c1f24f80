//! # Register Map Schema
//!
//! Declarative, per part number description of a device's register blocks.
//! A map file is a JSON object keyed by part number:
//!
//! ```json
//! {
//!   "SUN2000-10KTL": {
//!     "block1": {
//!       "start_address": 32064, "Length": 20, "registers": "hr",
//!       "byteorder": "BIG", "wordorder": "BIG",
//!       "data": {
//!         "total_power": {"offset": 0, "size": 2, "format": "decode_32bit_int", "m_f": 0.001, "s_f": "NA"},
//!         "acfreq": {"offset": 11, "size": 1, "format": "decode_16bit_uint", "m_f": 0.01, "s_f": "NA"}
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! Block and field order is the file order; block indices handed to field
//! models depend on it. Schemas are immutable once loaded.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::bytes::{ByteOrder, Endian};
use crate::codec::{FieldFormat, FormatName};
use crate::error::{ModbusError, ModbusResult};

/// Register table a block lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterKind {
    #[serde(rename = "ir")]
    Input,
    #[serde(rename = "hr")]
    Holding,
    #[serde(rename = "co")]
    Coil,
    #[serde(rename = "di")]
    DiscreteInput,
}

impl RegisterKind {
    pub fn is_bit_table(self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "ir",
            Self::Holding => "hr",
            Self::Coil => "co",
            Self::DiscreteInput => "di",
        }
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A multiplier or scale factor.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Factor {
    /// `"NA"`, empty or missing.
    #[default]
    None,
    Const(f64),
    /// Name of the field holding the factor.
    Indirect(String),
}

impl Factor {
    fn from_json(value: Option<&Value>) -> ModbusResult<Self> {
        match value {
            None | Some(Value::Null) => Ok(Self::None),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(Self::Const)
                .ok_or_else(|| ModbusError::configuration(format!("Bad factor {}", n))),
            Some(Value::String(s)) => {
                let s = s.trim();
                if s.is_empty() || s.eq_ignore_ascii_case("NA") {
                    Ok(Self::None)
                } else if let Ok(v) = s.parse::<f64>() {
                    Ok(Self::Const(v))
                } else {
                    Ok(Self::Indirect(s.to_string()))
                }
            }
            Some(other) => Err(ModbusError::configuration(format!("Bad factor {}", other))),
        }
    }

    pub fn indirect_name(&self) -> Option<&str> {
        match self {
            Self::Indirect(name) => Some(name),
            _ => None,
        }
    }
}

/// One named field inside a block.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    /// Register offset from the block start.
    pub offset: u16,
    /// Register count.
    pub size: u16,
    /// Format name as written in the map, `None` for metadata-only fields.
    pub format: Option<String>,
    /// `m_f`: plain multiplier.
    pub multiplier: Factor,
    /// `s_f`: power-of-ten exponent.
    pub scale: Factor,
    /// `a_f`: additive offset.
    pub addition: f64,
    /// `switch_register`: field asserted before a control write.
    pub enable_register: Option<String>,
    /// `mode_reg`: field selecting remote mode before a control write.
    pub mode_register: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawField {
    offset: u16,
    size: u16,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    m_f: Option<Value>,
    #[serde(default)]
    s_f: Option<Value>,
    #[serde(default)]
    a_f: Option<Value>,
    #[serde(default)]
    switch_register: Option<String>,
    #[serde(default)]
    mode_reg: Option<String>,
}

fn optional_name(name: Option<String>) -> Option<String> {
    name.map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("NA"))
}

impl FieldSpec {
    fn from_json(name: &str, value: &Value) -> ModbusResult<Self> {
        let raw: RawField = serde_json::from_value(value.clone())
            .map_err(|e| ModbusError::configuration(format!("field {}: {}", name, e)))?;
        let addition = match Factor::from_json(raw.a_f.as_ref())? {
            Factor::None => 0.0,
            Factor::Const(v) => v,
            Factor::Indirect(s) => {
                return Err(ModbusError::configuration(format!(
                    "field {}: a_f must be numeric, got {:?}",
                    name, s
                )))
            }
        };
        Ok(Self {
            name: name.to_string(),
            offset: raw.offset,
            size: raw.size,
            format: optional_name(raw.format),
            multiplier: Factor::from_json(raw.m_f.as_ref())?,
            scale: Factor::from_json(raw.s_f.as_ref())?,
            addition,
            enable_register: optional_name(raw.switch_register),
            mode_register: optional_name(raw.mode_reg),
        })
    }

    /// Registers a decode touches: the declared size, or the format's
    /// width when that is larger.
    pub fn span(&self) -> u16 {
        match self.format.as_deref().map(FieldFormat::parse) {
            Some(FormatName::Numeric(format)) => self.size.max(format.register_count() as u16),
            _ => self.size,
        }
    }
}

/// A contiguous register range read with one logical request.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterBlock {
    pub name: String,
    pub start_address: u16,
    pub length: u16,
    pub kind: RegisterKind,
    pub byte_order: Endian,
    pub word_order: Endian,
    /// Fields in file order.
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    start_address: u16,
    #[serde(rename = "Length", alias = "length")]
    length: u16,
    registers: RegisterKind,
    #[serde(default)]
    byteorder: Endian,
    #[serde(default)]
    wordorder: Endian,
    #[serde(default)]
    data: Map<String, Value>,
}

impl RegisterBlock {
    fn from_json(name: &str, value: &Value) -> ModbusResult<Self> {
        let raw: RawBlock = serde_json::from_value(value.clone())
            .map_err(|e| ModbusError::configuration(format!("block {}: {}", name, e)))?;
        let fields = raw
            .data
            .iter()
            .map(|(field_name, spec)| FieldSpec::from_json(field_name, spec))
            .collect::<ModbusResult<Vec<_>>>()?;

        let block = Self {
            name: name.to_string(),
            start_address: raw.start_address,
            length: raw.length,
            kind: raw.registers,
            byte_order: raw.byteorder,
            word_order: raw.wordorder,
            fields,
        };
        block.validate()?;
        Ok(block)
    }

    fn validate(&self) -> ModbusResult<()> {
        if u32::from(self.start_address) + u32::from(self.length) > 0x1_0000 {
            return Err(ModbusError::configuration(format!(
                "block {} runs past address 65535",
                self.name
            )));
        }
        for field in &self.fields {
            let span = field.span();
            if u32::from(field.offset) + u32::from(span) > u32::from(self.length) {
                return Err(ModbusError::configuration(format!(
                    "field {}.{} (offset {} span {}) exceeds block length {}",
                    self.name, field.name, field.offset, span, self.length
                )));
            }
            for reference in [&field.enable_register, &field.mode_register]
                .into_iter()
                .flatten()
            {
                if self.field(reference).is_none() {
                    return Err(ModbusError::configuration(format!(
                        "field {}.{} references {} outside its block",
                        self.name, field.name, reference
                    )));
                }
            }
        }
        Ok(())
    }

    /// Combined byte/word order of the block.
    pub fn order(&self) -> ByteOrder {
        ByteOrder::from_endian(self.byte_order, self.word_order)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Absolute address of a field.
    pub fn address_of(&self, field: &FieldSpec) -> u16 {
        self.start_address.wrapping_add(field.offset)
    }
}

/// Where a named field lives.
#[derive(Debug, Clone, Copy)]
pub struct FieldLocation<'a> {
    pub block_index: usize,
    pub block: &'a RegisterBlock,
    pub field: &'a FieldSpec,
}

/// Register map of one part number.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterMap {
    pub part_num: String,
    pub blocks: Vec<RegisterBlock>,
}

impl RegisterMap {
    /// Build from the JSON object of one part number.
    pub fn from_json(part_num: &str, value: &Value) -> ModbusResult<Self> {
        let blocks = value.as_object().ok_or_else(|| {
            ModbusError::configuration(format!("map for {} is not an object", part_num))
        })?;
        let blocks = blocks
            .iter()
            .map(|(name, block)| RegisterBlock::from_json(name, block))
            .collect::<ModbusResult<Vec<_>>>()?;
        debug!("map {}: {} blocks", part_num, blocks.len());
        Ok(Self {
            part_num: part_num.to_string(),
            blocks,
        })
    }

    /// An empty map, used for devices without a control schema.
    pub fn empty(part_num: &str) -> Self {
        Self {
            part_num: part_num.to_string(),
            blocks: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// First field with this name, in file order.
    pub fn find_field(&self, name: &str) -> Option<FieldLocation<'_>> {
        self.blocks
            .iter()
            .enumerate()
            .find_map(|(block_index, block)| {
                block.field(name).map(|field| FieldLocation {
                    block_index,
                    block,
                    field,
                })
            })
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.blocks
            .iter()
            .flat_map(|b| b.fields.iter().map(|f| f.name.as_str()))
    }

    pub fn total_registers(&self) -> u32 {
        self.blocks.iter().map(|b| u32::from(b.length)).sum()
    }
}

/// All register maps of one file, keyed by part number.
///
/// Entries are parsed on lookup so one malformed part does not make the
/// whole file unusable.
#[derive(Debug, Clone, Default)]
pub struct MapLibrary {
    entries: Map<String, Value>,
}

impl MapLibrary {
    pub fn from_json_str(json: &str) -> ModbusResult<Self> {
        let entries: Map<String, Value> = serde_json::from_str(json)?;
        Ok(Self { entries })
    }

    pub fn load(path: impl AsRef<Path>) -> ModbusResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ModbusError::configuration(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn contains(&self, part_num: &str) -> bool {
        self.entries.contains_key(part_num)
    }

    pub fn part_numbers(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn get(&self, part_num: &str) -> ModbusResult<RegisterMap> {
        let value = self.entries.get(part_num).ok_or_else(|| {
            ModbusError::configuration(format!("no register map for part {}", part_num))
        })?;
        RegisterMap::from_json(part_num, value)
    }

    /// Like [`get`](Self::get), but a missing part yields an empty map.
    pub fn get_or_empty(&self, part_num: &str) -> ModbusResult<RegisterMap> {
        if self.contains(part_num) {
            self.get(part_num)
        } else {
            Ok(RegisterMap::empty(part_num))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = r#"{
        "INV-1": {
            "z_block": {
                "start_address": 100, "Length": 4, "registers": "ir",
                "byteorder": "BIG", "wordorder": "LITTLE",
                "data": {
                    "total_power": {"offset": 0, "size": 2, "format": "decode_32bit_int", "m_f": 1, "s_f": "power_sf"},
                    "power_sf": {"offset": 2, "size": 1, "format": "decode_16bit_int", "m_f": "NA", "s_f": "NA"},
                    "note": {"offset": 3, "size": 1}
                }
            },
            "a_block": {
                "start_address": 200, "Length": 2, "registers": "hr",
                "byteorder": "LITTLE", "wordorder": "LITTLE",
                "data": {
                    "acfreq": {"offset": 0, "size": 1, "format": "decode_16bit_uint", "m_f": "0.01", "a_f": -5}
                }
            }
        },
        "BROKEN": {"b": {"start_address": 0, "Length": 1, "registers": "ir",
            "data": {"x": {"offset": 1, "size": 1, "format": "decode_16bit_uint"}}}}
    }"#;

    #[test]
    fn test_blocks_keep_file_order() {
        let lib = MapLibrary::from_json_str(MAPS).unwrap();
        let map = lib.get("INV-1").unwrap();
        let names: Vec<_> = map.blocks.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["z_block", "a_block"]);
        let fields: Vec<_> = map.blocks[0].fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(fields, vec!["total_power", "power_sf", "note"]);
    }

    #[test]
    fn test_factor_parsing() {
        let map = MapLibrary::from_json_str(MAPS).unwrap().get("INV-1").unwrap();
        let power = map.find_field("total_power").unwrap().field;
        assert_eq!(power.multiplier, Factor::Const(1.0));
        assert_eq!(power.scale, Factor::Indirect("power_sf".into()));

        let sf = map.find_field("power_sf").unwrap().field;
        assert_eq!(sf.multiplier, Factor::None);
        assert_eq!(sf.scale, Factor::None);

        let freq = map.find_field("acfreq").unwrap();
        assert_eq!(freq.block_index, 1);
        assert_eq!(freq.field.multiplier, Factor::Const(0.01));
        assert_eq!(freq.field.addition, -5.0);
        assert_eq!(freq.block.kind, RegisterKind::Holding);
        assert_eq!(freq.block.order(), ByteOrder::LittleEndian);
    }

    #[test]
    fn test_metadata_field_has_no_format() {
        let map = MapLibrary::from_json_str(MAPS).unwrap().get("INV-1").unwrap();
        assert_eq!(map.find_field("note").unwrap().field.format, None);
    }

    #[test]
    fn test_field_past_block_end_rejected() {
        let lib = MapLibrary::from_json_str(MAPS).unwrap();
        let err = lib.get("BROKEN").unwrap_err();
        assert!(matches!(err, ModbusError::Configuration { .. }));
        // other parts of the same file still load
        assert!(lib.get("INV-1").is_ok());
    }

    #[test]
    fn test_format_width_counts_against_block_length() {
        let json = r#"{"P": {"b": {"start_address": 0, "Length": 2, "registers": "ir", "data": {
            "a": {"offset": 0, "size": 1, "format": "decode_16bit_uint"},
            "energy": {"offset": 1, "size": 1, "format": "decode_32bit_uint"}}}}}"#;
        let lib = MapLibrary::from_json_str(json).unwrap();
        assert!(matches!(lib.get("P"), Err(ModbusError::Configuration { .. })));

        let fits = json.replace("\"Length\": 2", "\"Length\": 3");
        let map = MapLibrary::from_json_str(&fits).unwrap().get("P").unwrap();
        assert_eq!(map.find_field("energy").unwrap().field.span(), 2);
    }

    #[test]
    fn test_missing_part() {
        let lib = MapLibrary::from_json_str(MAPS).unwrap();
        assert!(lib.get("NOPE").is_err());
        assert!(lib.get_or_empty("NOPE").unwrap().is_empty());
    }

    #[test]
    fn test_control_references_must_be_local() {
        let json = r#"{"p": {"start_address": 0, "Length": 3, "registers": "hr",
            "data": {
                "power_limit": {"offset": 0, "size": 1, "format": "add_16bit_uint", "switch_register": "enable", "mode_reg": "remote"},
                "enable": {"offset": 1, "size": 1, "format": "add_16bit_uint"},
                "remote": {"offset": 2, "size": 1, "format": "add_16bit_uint"}
            }}}"#;
        let map = RegisterMap::from_json("C", &serde_json::from_str(json).unwrap()).unwrap();
        let limit = map.find_field("power_limit").unwrap().field;
        assert_eq!(limit.enable_register.as_deref(), Some("enable"));
        assert_eq!(limit.mode_register.as_deref(), Some("remote"));

        let dangling = json.replace("\"enable\": {", "\"other\": {");
        let value: Value = serde_json::from_str(&dangling).unwrap();
        assert!(RegisterMap::from_json("C", &value).is_err());
    }

    #[test]
    fn test_na_control_references_ignored() {
        let json = r#"{"p": {"start_address": 0, "Length": 1, "registers": "hr",
            "data": {"power_limit_pct": {"offset": 0, "size": 1, "format": "add_16bit_uint", "switch_register": "NA", "mode_reg": ""}}}}"#;
        let map = RegisterMap::from_json("C", &serde_json::from_str(json).unwrap()).unwrap();
        let field = &map.blocks[0].fields[0];
        assert_eq!(field.enable_register, None);
        assert_eq!(field.mode_register, None);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mappings.json");
        std::fs::write(&path, MAPS).unwrap();
        let lib = MapLibrary::load(&path).unwrap();
        let parts: Vec<_> = lib.part_numbers().collect();
        assert_eq!(parts, vec!["INV-1", "BROKEN"]);
        assert_eq!(lib.get("INV-1").unwrap().total_registers(), 6);
    }
}
