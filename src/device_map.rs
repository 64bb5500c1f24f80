//! # Device Map Compiler
//!
//! Walks a register map once and binds a [`FieldModel`] to every field the
//! gateway understands. Names are classified by pattern:
//!
//! | Pattern | Shape | Example |
//! |---------|-------|---------|
//! | `L{n}_{quantity}` | per-phase array, slot `n-1` | `L2_voltage` |
//! | `{family}{n}_{quantity}` | per-component array, slot `n-1` | `mppt3_power`, `cell12_voltage` |
//! | aggregate name | scalar | `total_power`, `SoC` |
//! | `fault` / `warning` | bitfield scalar | `fault` |
//!
//! Anything else is ignored. Array slots follow the declared index, never
//! encounter order, and missing indices stay `None`. When a name appears
//! in more than one block the first one in file order wins.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::field::{CycleFrame, FieldModel};
use crate::schema::{FieldLocation, RegisterMap};

/// Aggregate scalars the report and control layers consume.
pub static AGGREGATE_FIELDS: &[&str] = &[
    "Pf",
    "total_power",
    "total_energy",
    "today_energy",
    "total_voltage",
    "acfreq",
    "temperature",
    "apparent_power",
    "reactive_power",
    "input_power",
    "SoC",
    "SoH",
    "current",
    "import_energy",
    "export_energy",
    "irradiance",
    "ambient_temperature",
    "internal_ambient_temperature",
    "module_temperature",
    "internal_module_temperature",
    "wind_direction",
    "wind_speed",
    "humidity",
    "solar_radition",
    "rain_gauge",
    "global_horizontal_irradiance",
    "global_tilt_irradiance",
    "maximum_charging_current",
    "maximum_discharging_current",
    "available_charging_capacity",
    "available_discharging_capacity",
    "maximum_cell_voltage",
    "cell_number_with_maximum_voltage",
    "minimum_cell_voltage",
    "cell_number_with_minimum_voltage",
    "maximum_cell_temperature",
    "cell_number_with_maximum_temperature",
    "minimum_cell_temperature",
    "cell_number_with_minimum_temperature",
];

/// Bitfield registers handed to the fault layer.
pub static FAULT_FIELDS: &[&str] = &["fault", "warning"];

/// Quantities measured per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhaseQuantity {
    Voltage,
    Current,
    Power,
    /// Reactive power
    Reactive,
    /// Apparent power
    Apparent,
    Energy,
}

impl PhaseQuantity {
    pub const ALL: [PhaseQuantity; 6] = [
        Self::Voltage,
        Self::Current,
        Self::Power,
        Self::Reactive,
        Self::Apparent,
        Self::Energy,
    ];

    /// Suffix used in register maps (`L1_<suffix>`).
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Voltage => "voltage",
            Self::Current => "current",
            Self::Power => "power",
            Self::Reactive => "Q",
            Self::Apparent => "S",
            Self::Energy => "energy",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|q| q.suffix() == suffix)
    }

    /// Short key used in snapshots.
    pub fn short(self) -> &'static str {
        match self {
            Self::Voltage => "V",
            Self::Current => "I",
            Self::Power => "P",
            Self::Reactive => "Q",
            Self::Apparent => "S",
            Self::Energy => "En",
        }
    }
}

/// Indexed sub-units of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComponentFamily {
    Mppt,
    String,
    Cell,
}

impl ComponentFamily {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Mppt => "mppt",
            Self::String => "string",
            Self::Cell => "cell",
        }
    }
}

/// A component family paired with one of its measured quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentKey {
    pub family: ComponentFamily,
    pub quantity: PhaseQuantity,
}

impl ComponentKey {
    pub const ALL: [ComponentKey; 7] = [
        ComponentKey::new(ComponentFamily::Mppt, PhaseQuantity::Voltage),
        ComponentKey::new(ComponentFamily::Mppt, PhaseQuantity::Current),
        ComponentKey::new(ComponentFamily::Mppt, PhaseQuantity::Power),
        ComponentKey::new(ComponentFamily::String, PhaseQuantity::Voltage),
        ComponentKey::new(ComponentFamily::String, PhaseQuantity::Current),
        ComponentKey::new(ComponentFamily::String, PhaseQuantity::Power),
        ComponentKey::new(ComponentFamily::Cell, PhaseQuantity::Voltage),
    ];

    pub const fn new(family: ComponentFamily, quantity: PhaseQuantity) -> Self {
        Self { family, quantity }
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.family.prefix(), self.quantity.suffix())
    }
}

/// Outcome of classifying one field name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
    /// Zero-based phase slot.
    Phase(PhaseQuantity, usize),
    /// Zero-based component slot.
    Component(ComponentKey, usize),
    Aggregate(&'static str),
    Fault(&'static str),
    Ignored,
}

/// Parse a one-based index, rejecting 0 and non-digits.
fn slot(digits: &str) -> Option<usize> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<usize>().ok()?.checked_sub(1)
}

pub fn classify(name: &str) -> FieldClass {
    if let Some(rest) = name.strip_prefix('L') {
        if let Some((digits, suffix)) = rest.split_once('_') {
            if let (Some(index), Some(quantity)) = (slot(digits), PhaseQuantity::from_suffix(suffix)) {
                return FieldClass::Phase(quantity, index);
            }
        }
    }

    for key in ComponentKey::ALL {
        let Some(rest) = name.strip_prefix(key.family.prefix()) else {
            continue;
        };
        let Some(digits) = rest
            .strip_suffix(key.quantity.suffix())
            .and_then(|r| r.strip_suffix('_'))
        else {
            continue;
        };
        if let Some(index) = slot(digits) {
            return FieldClass::Component(key, index);
        }
    }

    if let Some(&canonical) = AGGREGATE_FIELDS.iter().find(|&&n| n == name) {
        return FieldClass::Aggregate(canonical);
    }
    if let Some(&canonical) = FAULT_FIELDS.iter().find(|&&n| n == name) {
        return FieldClass::Fault(canonical);
    }
    FieldClass::Ignored
}

fn place(slots: &mut Vec<Option<FieldModel>>, index: usize, model: FieldModel) {
    if slots.len() <= index {
        slots.resize_with(index + 1, || None);
    }
    if slots[index].is_none() {
        slots[index] = Some(model);
    }
}

/// Compiled measurement side of a device.
#[derive(Debug, Clone)]
pub struct MeasurementMap {
    schema: Arc<RegisterMap>,
    phases: BTreeMap<PhaseQuantity, Vec<Option<FieldModel>>>,
    components: BTreeMap<ComponentKey, Vec<Option<FieldModel>>>,
    scalars: BTreeMap<&'static str, FieldModel>,
    faults: BTreeMap<&'static str, FieldModel>,
}

/// Classify every field of `schema`. Phases above `num_phases` are skipped
/// (a single-phase device only gets `L1_*`).
pub fn compile_measurement_map(schema: Arc<RegisterMap>, num_phases: usize) -> MeasurementMap {
    let mut phases: BTreeMap<PhaseQuantity, Vec<Option<FieldModel>>> = BTreeMap::new();
    let mut components: BTreeMap<ComponentKey, Vec<Option<FieldModel>>> = BTreeMap::new();
    let mut scalars = BTreeMap::new();
    let mut faults = BTreeMap::new();
    let phase_limit = num_phases.max(1);

    for (block_index, block) in schema.blocks.iter().enumerate() {
        for field in &block.fields {
            let location = FieldLocation {
                block_index,
                block,
                field,
            };
            match classify(&field.name) {
                FieldClass::Phase(quantity, index) => {
                    if index >= phase_limit {
                        debug!("{}: skipping {} (num_phases={})", schema.part_num, field.name, num_phases);
                        continue;
                    }
                    let model = FieldModel::bind(&schema, location);
                    place(phases.entry(quantity).or_default(), index, model);
                }
                FieldClass::Component(key, index) => {
                    let model = FieldModel::bind(&schema, location);
                    place(components.entry(key).or_default(), index, model);
                }
                FieldClass::Aggregate(name) => {
                    scalars
                        .entry(name)
                        .or_insert_with(|| FieldModel::bind(&schema, location));
                }
                FieldClass::Fault(name) => {
                    faults
                        .entry(name)
                        .or_insert_with(|| FieldModel::bind(&schema, location));
                }
                FieldClass::Ignored => {}
            }
        }
    }

    debug!(
        "{}: {} scalars, {} phase arrays, {} component arrays, {} fault registers",
        schema.part_num,
        scalars.len(),
        phases.len(),
        components.len(),
        faults.len()
    );
    MeasurementMap {
        schema,
        phases,
        components,
        scalars,
        faults,
    }
}

impl MeasurementMap {
    pub fn schema(&self) -> &Arc<RegisterMap> {
        &self.schema
    }

    pub fn scalar(&self, name: &str) -> Option<&FieldModel> {
        self.scalars.get(name)
    }

    pub fn scalars(&self) -> impl Iterator<Item = (&'static str, &FieldModel)> {
        self.scalars.iter().map(|(k, v)| (*k, v))
    }

    /// Slots of one phase quantity; empty when the map has none.
    pub fn phase(&self, quantity: PhaseQuantity) -> &[Option<FieldModel>] {
        self.phases.get(&quantity).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn component(&self, key: ComponentKey) -> &[Option<FieldModel>] {
        self.components.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn fault(&self, name: &str) -> Option<&FieldModel> {
        self.faults.get(name)
    }

    pub fn faults(&self) -> impl Iterator<Item = (&'static str, &FieldModel)> {
        self.faults.iter().map(|(k, v)| (*k, v))
    }

    pub fn phases(&self) -> impl Iterator<Item = (PhaseQuantity, &[Option<FieldModel>])> {
        self.phases.iter().map(|(q, v)| (*q, v.as_slice()))
    }

    pub fn components(&self) -> impl Iterator<Item = (ComponentKey, &[Option<FieldModel>])> {
        self.components.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    pub fn field_count(&self) -> usize {
        self.scalars.len()
            + self.faults.len()
            + self.phases.values().flatten().flatten().count()
            + self.components.values().flatten().flatten().count()
    }

    fn models_mut(&mut self) -> impl Iterator<Item = &mut FieldModel> + '_ {
        self.scalars
            .values_mut()
            .chain(self.faults.values_mut())
            .chain(self.phases.values_mut().flatten().flatten())
            .chain(self.components.values_mut().flatten().flatten())
    }

    /// Update every model from this cycle's frame. Returns the number of
    /// fields that took a new value.
    pub fn decode_frame(&mut self, frame: &CycleFrame) -> usize {
        let cycle = frame.cycle();
        for model in self.models_mut() {
            if model.has_indirect_factor() {
                model.get_factor(frame);
            }
        }
        let decoded = self.models_mut().filter_map(|m| m.decode(frame)).count();
        debug!("{} cycle {}: {} fields decoded", self.schema.part_num, cycle, decoded);
        decoded
    }
}

/// Writable control fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControlField {
    /// Absolute active power limit.
    PowerLimit,
    /// Active power limit in percent of rated power.
    PowerLimitPct,
    /// On/off.
    DeviceState,
}

impl ControlField {
    pub const ALL: [ControlField; 3] = [Self::PowerLimit, Self::PowerLimitPct, Self::DeviceState];

    pub fn name(self) -> &'static str {
        match self {
            Self::PowerLimit => "power_limit",
            Self::PowerLimitPct => "power_limit_pct",
            Self::DeviceState => "device_state",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

/// Compiled control side of a device. Models carry their enable and mode
/// registers, wired from `switch_register` and `mode_reg`.
#[derive(Debug, Clone)]
pub struct ControlMap {
    schema: Arc<RegisterMap>,
    fields: BTreeMap<ControlField, FieldModel>,
}

pub fn compile_control_map(schema: Arc<RegisterMap>) -> ControlMap {
    let mut fields = BTreeMap::new();
    for (block_index, block) in schema.blocks.iter().enumerate() {
        for field in &block.fields {
            let Some(control) = ControlField::from_name(&field.name) else {
                continue;
            };
            fields.entry(control).or_insert_with(|| {
                FieldModel::bind(
                    &schema,
                    FieldLocation {
                        block_index,
                        block,
                        field,
                    },
                )
            });
        }
    }
    debug!("{}: {} control fields", schema.part_num, fields.len());
    ControlMap { schema, fields }
}

impl ControlMap {
    pub fn schema(&self) -> &Arc<RegisterMap> {
        &self.schema
    }

    pub fn get(&self, field: ControlField) -> Option<&FieldModel> {
        self.fields.get(&field)
    }

    pub fn contains(&self, field: ControlField) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (ControlField, &FieldModel)> {
        self.fields.iter().map(|(k, v)| (*k, v))
    }

    /// Resolve factors and read back current setpoints.
    pub fn decode_frame(&mut self, frame: &CycleFrame) -> usize {
        for model in self.fields.values_mut() {
            if model.has_indirect_factor() {
                model.get_factor(frame);
            }
        }
        self.fields
            .values_mut()
            .filter_map(|m| m.decode(frame))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::MapLibrary;

    fn schema(json: &str) -> Arc<RegisterMap> {
        let wrapped = format!("{{\"P\": {}}}", json);
        Arc::new(MapLibrary::from_json_str(&wrapped).unwrap().get("P").unwrap())
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("L1_voltage"), FieldClass::Phase(PhaseQuantity::Voltage, 0));
        assert_eq!(classify("L3_Q"), FieldClass::Phase(PhaseQuantity::Reactive, 2));
        assert_eq!(
            classify("mppt2_power"),
            FieldClass::Component(
                ComponentKey::new(ComponentFamily::Mppt, PhaseQuantity::Power),
                1
            )
        );
        assert_eq!(
            classify("cell16_voltage"),
            FieldClass::Component(
                ComponentKey::new(ComponentFamily::Cell, PhaseQuantity::Voltage),
                15
            )
        );
        assert_eq!(classify("total_power"), FieldClass::Aggregate("total_power"));
        assert_eq!(
            classify("cell_number_with_maximum_voltage"),
            FieldClass::Aggregate("cell_number_with_maximum_voltage")
        );
        assert_eq!(classify("current"), FieldClass::Aggregate("current"));
        assert_eq!(classify("warning"), FieldClass::Fault("warning"));
        assert_eq!(classify("L0_voltage"), FieldClass::Ignored);
        assert_eq!(classify("cell3_current"), FieldClass::Ignored);
        assert_eq!(classify("Lx_voltage"), FieldClass::Ignored);
        assert_eq!(classify("serial_number"), FieldClass::Ignored);
    }

    #[test]
    fn test_missing_phase_stays_unset() {
        let s = schema(
            r#"{"b": {"start_address": 0, "Length": 2, "registers": "ir", "data": {
                "L3_voltage": {"offset": 1, "size": 1, "format": "decode_16bit_uint"},
                "L1_voltage": {"offset": 0, "size": 1, "format": "decode_16bit_uint"}}}}"#,
        );
        let map = compile_measurement_map(s, 3);
        let v = map.phase(PhaseQuantity::Voltage);
        assert_eq!(v.len(), 3);
        assert_eq!(v[0].as_ref().unwrap().name(), "L1_voltage");
        assert!(v[1].is_none());
        assert_eq!(v[2].as_ref().unwrap().name(), "L3_voltage");
        assert!(map.phase(PhaseQuantity::Current).is_empty());
    }

    #[test]
    fn test_phase_slot_independent_of_block_order() {
        let s = schema(
            r#"{
            "late": {"start_address": 10, "Length": 1, "registers": "ir", "data": {
                "L2_power": {"offset": 0, "size": 1, "format": "decode_16bit_int"}}},
            "early": {"start_address": 0, "Length": 1, "registers": "ir", "data": {
                "L1_power": {"offset": 0, "size": 1, "format": "decode_16bit_int"}}}
        }"#,
        );
        let mut map = compile_measurement_map(s, 3);
        map.decode_frame(&CycleFrame::new(1, vec![vec![222], vec![111]]));
        let p = map.phase(PhaseQuantity::Power);
        assert_eq!(p[0].as_ref().unwrap().value(), 111.0);
        assert_eq!(p[1].as_ref().unwrap().value(), 222.0);
        assert_eq!(p[1].as_ref().unwrap().block_index(), 0);
    }

    #[test]
    fn test_single_phase_device_skips_upper_phases() {
        let s = schema(
            r#"{"b": {"start_address": 0, "Length": 2, "registers": "ir", "data": {
                "L1_voltage": {"offset": 0, "size": 1, "format": "decode_16bit_uint"},
                "L2_voltage": {"offset": 1, "size": 1, "format": "decode_16bit_uint"}}}}"#,
        );
        let map = compile_measurement_map(s, 1);
        assert_eq!(map.phase(PhaseQuantity::Voltage).len(), 1);
    }

    #[test]
    fn test_components_aggregates_faults() {
        let s = schema(
            r#"{"b": {"start_address": 0, "Length": 5, "registers": "ir", "data": {
                "mppt2_voltage": {"offset": 0, "size": 1, "format": "decode_16bit_uint", "m_f": 0.1},
                "string1_current": {"offset": 1, "size": 1, "format": "decode_16bit_uint"},
                "SoC": {"offset": 2, "size": 1, "format": "decode_16bit_uint"},
                "fault": {"offset": 3, "size": 1, "format": "decode_16bit_uint"},
                "vendor_secret": {"offset": 4, "size": 1, "format": "decode_16bit_uint"}}}}"#,
        );
        let mut map = compile_measurement_map(s, 3);
        assert_eq!(map.field_count(), 4);
        map.decode_frame(&CycleFrame::new(1, vec![vec![3800, 7, 88, 0b10, 1]]));

        let mppt_v = map.component(ComponentKey::new(ComponentFamily::Mppt, PhaseQuantity::Voltage));
        assert_eq!(mppt_v.len(), 2);
        assert!(mppt_v[0].is_none());
        assert!((mppt_v[1].as_ref().unwrap().value() - 380.0).abs() < 1e-9);
        assert_eq!(map.scalar("SoC").unwrap().value(), 88.0);
        assert_eq!(map.fault("fault").unwrap().active_bits(), vec![1]);
        assert!(map.scalar("vendor_secret").is_none());
    }

    #[test]
    fn test_first_occurrence_wins() {
        let s = schema(
            r#"{
            "a": {"start_address": 0, "Length": 1, "registers": "ir", "data": {
                "total_power": {"offset": 0, "size": 1, "format": "decode_16bit_int"}}},
            "b": {"start_address": 100, "Length": 1, "registers": "ir", "data": {
                "total_power": {"offset": 0, "size": 1, "format": "decode_16bit_int"}}}
        }"#,
        );
        let map = compile_measurement_map(s, 1);
        assert_eq!(map.scalar("total_power").unwrap().address(), 0);
    }

    #[test]
    fn test_factors_resolve_before_dependent_fields() {
        // the dependent field comes first in the map
        let s = schema(
            r#"{"b": {"start_address": 0, "Length": 2, "registers": "ir", "data": {
                "total_power": {"offset": 0, "size": 1, "format": "decode_16bit_int", "s_f": "total_energy"},
                "total_energy": {"offset": 1, "size": 1, "format": "decode_16bit_int"}}}}"#,
        );
        let mut map = compile_measurement_map(s, 1);
        map.decode_frame(&CycleFrame::new(1, vec![vec![5, 2]]));
        assert_eq!(map.scalar("total_power").unwrap().value(), 500.0);
    }

    #[test]
    fn test_control_map() {
        let s = schema(
            r#"{"ctrl": {"start_address": 40100, "Length": 4, "registers": "hr", "data": {
                "power_limit_pct": {"offset": 0, "size": 1, "format": "add_16bit_uint", "switch_register": "limit_en"},
                "limit_en": {"offset": 1, "size": 1, "format": "add_16bit_uint"},
                "device_state": {"offset": 2, "size": 1, "format": "add_16bit_uint"},
                "pct_sf": {"offset": 3, "size": 1, "format": "decode_16bit_int"}}}}"#,
        );
        let map = compile_control_map(s);
        assert!(!map.contains(ControlField::PowerLimit));
        let pct = map.get(ControlField::PowerLimitPct).unwrap();
        assert_eq!(pct.address(), 40100);
        assert_eq!(pct.enable_register().unwrap().address, 40101);
        assert!(pct.mode_register().is_none());
        assert!(map.contains(ControlField::DeviceState));
    }
}
