//! # Field Model
//!
//! Runtime unit bound to one field of a register map. A model is created
//! once per device and updated every cycle from that cycle's
//! [`CycleFrame`]:
//!
//! 1. [`FieldModel::get_factor`] resolves indirect factors (fields whose
//!    `m_f` or `s_f` names another field).
//! 2. [`FieldModel::decode`] turns the field's slice into an engineering
//!    value: `raw * multiplier * 10^scale + addition`.
//!
//! Factors are stamped with the cycle they were read in. A decode whose
//! factors are not resolved for the same cycle does nothing, so a value is
//! never computed with a factor from another frame.
//!
//! Decode failures are contained: the error is logged and the previous
//! value kept.

use tracing::{debug, warn};

use crate::bytes::ByteOrder;
use crate::codec::{FieldFormat, FormatName, RawValue};
use crate::error::{ModbusError, ModbusResult};
use crate::schema::{Factor, FieldLocation, RegisterKind, RegisterMap};

/// Per-cycle raw registers, one vector per block in map order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleFrame {
    cycle: u64,
    blocks: Vec<Vec<u16>>,
}

impl CycleFrame {
    pub fn new(cycle: u64, blocks: Vec<Vec<u16>>) -> Self {
        Self { cycle, blocks }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn blocks(&self) -> &[Vec<u16>] {
        &self.blocks
    }

    pub fn block(&self, index: usize) -> Option<&[u16]> {
        self.blocks.get(index).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn slice(&self, block: usize, offset: u16, count: usize) -> ModbusResult<&[u16]> {
        let regs = self.block(block).ok_or_else(|| {
            ModbusError::decode(format!("block {} missing from cycle {}", block, self.cycle))
        })?;
        let start = offset as usize;
        regs.get(start..start + count).ok_or_else(|| {
            ModbusError::decode(format!(
                "block {} has {} registers, need {}..{}",
                block,
                regs.len(),
                start,
                start + count
            ))
        })
    }
}

/// Decode operation of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldCodec {
    /// No numeric format; decode is a no-op.
    Absent,
    Known(FieldFormat),
    /// Format name not recognised; every decode fails and is logged.
    Unsupported(String),
}

impl FieldCodec {
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(FieldFormat::parse) {
            None | Some(FormatName::Descriptive) => Self::Absent,
            Some(FormatName::Numeric(format)) => Self::Known(format),
            Some(FormatName::Unknown(name)) => Self::Unsupported(name),
        }
    }

    pub fn format(&self) -> ModbusResult<Option<FieldFormat>> {
        match self {
            Self::Absent => Ok(None),
            Self::Known(format) => Ok(Some(*format)),
            Self::Unsupported(name) => {
                Err(ModbusError::decode(format!("unsupported format {}", name)))
            }
        }
    }
}

/// Absolute address of a register referenced by a control field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRef {
    pub name: String,
    pub address: u16,
    pub kind: RegisterKind,
}

/// Where an indirect factor is read from.
#[derive(Debug, Clone, PartialEq)]
struct FactorSource {
    block_index: usize,
    offset: u16,
    format: FieldFormat,
    order: ByteOrder,
}

#[derive(Debug, Clone, PartialEq)]
struct IndirectFactor {
    field: String,
    source: Option<FactorSource>,
    /// `(cycle, value)` of the last successful read.
    resolved: Option<(u64, f64)>,
}

impl IndirectFactor {
    fn locate(map: &RegisterMap, field: &str) -> Self {
        let source = map.find_field(field).and_then(|loc| {
            let format = match FieldCodec::from_name(loc.field.format.as_deref()) {
                FieldCodec::Known(format) => format,
                FieldCodec::Absent => FieldFormat::I16,
                FieldCodec::Unsupported(name) => {
                    warn!("factor {} has unsupported format {}", field, name);
                    return None;
                }
            };
            Some(FactorSource {
                block_index: loc.block_index,
                offset: loc.field.offset,
                format,
                order: loc.block.order(),
            })
        });
        if source.is_none() {
            warn!("factor field {} not found in map {}", field, map.part_num);
        }
        Self {
            field: field.to_string(),
            source,
            resolved: None,
        }
    }

    fn read(&self, frame: &CycleFrame) -> ModbusResult<f64> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| ModbusError::decode(format!("factor field {} not in map", self.field)))?;
        let regs = frame.slice(
            source.block_index,
            source.offset,
            source.format.register_count(),
        )?;
        Ok(source.format.decode(regs, source.order)?.as_f64())
    }

    fn value_for(&self, cycle: u64) -> Option<f64> {
        match self.resolved {
            Some((c, v)) if c == cycle => Some(v),
            _ => None,
        }
    }

    fn latest(&self) -> Option<f64> {
        self.resolved.map(|(_, v)| v)
    }
}

/// One compiled field.
#[derive(Debug, Clone)]
pub struct FieldModel {
    name: String,
    kind: RegisterKind,
    block_index: usize,
    offset: u16,
    size: u16,
    batch_start_address: u16,
    order: ByteOrder,
    codec: FieldCodec,
    multiplier: f64,
    scale_exponent: f64,
    addition: f64,
    indirect_multiplier: Option<IndirectFactor>,
    indirect_scale: Option<IndirectFactor>,
    enable: Option<RegisterRef>,
    mode: Option<RegisterRef>,
    raw: Vec<u16>,
    raw_value: Option<RawValue>,
    value: f64,
    updated_cycle: Option<u64>,
}

impl FieldModel {
    /// Bind a model to a field of `map`. Indirect factors are looked up by
    /// name across the whole map, first match in file order.
    pub fn bind(map: &RegisterMap, location: FieldLocation<'_>) -> Self {
        let spec = location.field;
        let block = location.block;

        let (multiplier, indirect_multiplier) = match &spec.multiplier {
            Factor::None => (1.0, None),
            Factor::Const(m) => (*m, None),
            Factor::Indirect(name) => (1.0, Some(IndirectFactor::locate(map, name))),
        };
        let (scale_exponent, indirect_scale) = match &spec.scale {
            Factor::None => (0.0, None),
            Factor::Const(s) => (*s, None),
            Factor::Indirect(name) => (0.0, Some(IndirectFactor::locate(map, name))),
        };

        let local_ref = |name: &Option<String>| {
            name.as_ref().and_then(|n| {
                block.field(n).map(|f| RegisterRef {
                    name: n.clone(),
                    address: block.address_of(f),
                    kind: block.kind,
                })
            })
        };

        Self {
            name: spec.name.clone(),
            kind: block.kind,
            block_index: location.block_index,
            offset: spec.offset,
            size: spec.size,
            batch_start_address: block.start_address,
            order: block.order(),
            codec: FieldCodec::from_name(spec.format.as_deref()),
            multiplier,
            scale_exponent,
            addition: spec.addition,
            indirect_multiplier,
            indirect_scale,
            enable: local_ref(&spec.enable_register),
            mode: local_ref(&spec.mode_register),
            raw: Vec::new(),
            raw_value: None,
            value: 0.0,
            updated_cycle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RegisterKind {
        self.kind
    }

    pub fn block_index(&self) -> usize {
        self.block_index
    }

    pub fn offset(&self) -> u16 {
        self.offset
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn codec(&self) -> &FieldCodec {
        &self.codec
    }

    /// Absolute address of the field's first register.
    pub fn address(&self) -> u16 {
        self.batch_start_address.wrapping_add(self.offset)
    }

    /// Last decoded engineering value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Registers of the last successful decode.
    pub fn raw(&self) -> &[u16] {
        &self.raw
    }

    /// Cycle of the last successful decode.
    pub fn updated_cycle(&self) -> Option<u64> {
        self.updated_cycle
    }

    pub fn enable_register(&self) -> Option<&RegisterRef> {
        self.enable.as_ref()
    }

    pub fn mode_register(&self) -> Option<&RegisterRef> {
        self.mode.as_ref()
    }

    pub fn has_indirect_factor(&self) -> bool {
        self.indirect_multiplier.is_some() || self.indirect_scale.is_some()
    }

    /// Resolve indirect factors from this cycle's frame.
    pub fn get_factor(&mut self, frame: &CycleFrame) {
        let cycle = frame.cycle();
        for factor in [&mut self.indirect_multiplier, &mut self.indirect_scale]
            .into_iter()
            .flatten()
        {
            match factor.read(frame) {
                Ok(value) => factor.resolved = Some((cycle, value)),
                Err(e) => warn!(
                    "factor {} for {} unresolved in cycle {}: {}",
                    factor.field, self.name, cycle, e
                ),
            }
        }
    }

    fn factors_for(&self, cycle: u64) -> Option<(f64, f64)> {
        let multiplier = match &self.indirect_multiplier {
            Some(f) => f.value_for(cycle)?,
            None => self.multiplier,
        };
        let exponent = match &self.indirect_scale {
            Some(f) => f.value_for(cycle)?,
            None => self.scale_exponent,
        };
        Some((multiplier, exponent))
    }

    /// Compute the value this frame would produce, without storing it.
    /// `Ok(None)` for metadata-only fields.
    pub fn try_decode(&self, frame: &CycleFrame) -> ModbusResult<Option<(f64, RawValue)>> {
        let Some(format) = self.codec.format()? else {
            return Ok(None);
        };
        let (multiplier, exponent) = self.factors_for(frame.cycle()).ok_or_else(|| {
            ModbusError::decode(format!(
                "factor for {} not resolved in cycle {}",
                self.name,
                frame.cycle()
            ))
        })?;
        let regs = frame.slice(self.block_index, self.offset, format.register_count())?;
        let raw = format.decode(regs, self.order)?;
        let value = raw.as_f64() * multiplier * 10f64.powf(exponent) + self.addition;
        Ok(Some((value, raw)))
    }

    /// Decode this field from the frame. Returns the new value, or `None`
    /// when the previous value was kept.
    pub fn decode(&mut self, frame: &CycleFrame) -> Option<f64> {
        if matches!(self.codec, FieldCodec::Absent) {
            return None;
        }
        if self.factors_for(frame.cycle()).is_none() {
            debug!(
                "{}: factor not resolved in cycle {}, keeping {}",
                self.name,
                frame.cycle(),
                self.value
            );
            return None;
        }
        match self.try_decode(frame) {
            Ok(Some((value, raw))) => {
                let count = match self.codec {
                    FieldCodec::Known(format) => format.register_count(),
                    _ => 0,
                };
                self.raw.clear();
                if let Ok(slice) = frame.slice(self.block_index, self.offset, count) {
                    self.raw.extend_from_slice(slice);
                }
                self.raw_value = Some(raw);
                self.value = value;
                self.updated_cycle = Some(frame.cycle());
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(
                    "decode failed {} block={} offset={}: {}",
                    self.name, self.block_index, self.offset, e
                );
                None
            }
        }
    }

    /// Registers that encode `value`, using the most recently resolved
    /// factors. Integer formats truncate toward zero; values outside the
    /// format's range are refused.
    pub fn encode(&self, value: f64) -> ModbusResult<Vec<u16>> {
        let format = match self.codec.format()? {
            Some(format) => format,
            None => {
                return Err(ModbusError::invalid_data(format!(
                    "{} has no format to encode with",
                    self.name
                )))
            }
        };
        let multiplier = match &self.indirect_multiplier {
            Some(f) => f.latest().ok_or_else(|| self.unresolved(&f.field))?,
            None => self.multiplier,
        };
        let exponent = match &self.indirect_scale {
            Some(f) => f.latest().ok_or_else(|| self.unresolved(&f.field))?,
            None => self.scale_exponent,
        };
        let factor = multiplier * 10f64.powf(exponent);
        if factor == 0.0 || !factor.is_finite() {
            return Err(ModbusError::invalid_data(format!(
                "{}: unusable factor {}",
                self.name, factor
            )));
        }
        let scaled = (value - self.addition) / factor;
        // undo float noise from the division before truncation
        let nearest = scaled.round();
        let scaled = if (scaled - nearest).abs() < 1e-6 {
            nearest
        } else {
            scaled
        };
        format.encode(scaled, self.order)
    }

    fn unresolved(&self, factor: &str) -> ModbusError {
        ModbusError::invalid_data(format!(
            "{}: factor {} has never been read",
            self.name, factor
        ))
    }

    /// Set bit positions of the last decoded value (bitfield faults).
    pub fn active_bits(&self) -> Vec<u32> {
        let Some(bits) = self.raw_value.as_ref().and_then(RawValue::bits) else {
            return Vec::new();
        };
        let width = match self.codec {
            FieldCodec::Known(format) => format.register_count() as u32 * 16,
            _ => 64,
        };
        (0..width.min(64)).filter(|b| bits & (1u64 << b) != 0).collect()
    }
}
