//! Acquisition cycle
//!
//! A [`Device`] owns one link, its compiled measurement and control maps and
//! the `read_error` flag consumers use as the liveness signal. Each
//! [`Device::poll`] is one cycle:
//!
//! 1. open the link (serial links always, sockets only when not open),
//! 2. read every measurement block, then every control-readback block,
//! 3. on any failure set `read_error`, drop the partial frames and close,
//! 4. otherwise decode (factors first) and release the link according to its
//!    [`LinkPolicy`].
//!
//! Read failures never escape a poll. Writes do report their errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::client::{GenericModbusClient, ModbusClient};
use crate::control::{ControlCommand, ControlParam};
use crate::device_limits::DeviceLimits;
use crate::device_map::{ComponentKey, ControlField, ControlMap, MeasurementMap, PhaseQuantity};
use crate::error::{ModbusError, ModbusResult};
use crate::field::{CycleFrame, FieldModel, RegisterRef};
use crate::protocol::SlaveId;
use crate::schema::{RegisterKind, RegisterMap};
use crate::transport::{LinkPolicy, ModbusTransport, TransportStats};

/// One polled field device.
pub struct Device<T: ModbusTransport> {
    id: String,
    slave_id: SlaveId,
    rated_power: f64,
    connected_to: Option<String>,
    limits: DeviceLimits,
    client: GenericModbusClient<T>,
    measurements: MeasurementMap,
    controls: ControlMap,
    read_error: bool,
    cycle: u64,
    last_update: Option<DateTime<Utc>>,
}

impl<T: ModbusTransport> Device<T> {
    pub fn new(
        id: impl Into<String>,
        slave_id: SlaveId,
        transport: T,
        measurements: MeasurementMap,
        controls: ControlMap,
    ) -> Self {
        let limits = transport.default_limits();
        Self {
            id: id.into(),
            slave_id,
            rated_power: 0.0,
            connected_to: None,
            limits,
            client: GenericModbusClient::new(transport),
            measurements,
            controls,
            read_error: false,
            cycle: 0,
            last_update: None,
        }
    }

    pub fn with_rated_power(mut self, rated_power: f64) -> Self {
        self.rated_power = rated_power;
        self
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits.normalized();
        self
    }

    /// Topology hint passed through to the dispatch layer.
    pub fn with_connected_to(mut self, connected_to: Option<String>) -> Self {
        self.connected_to = connected_to;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn slave_id(&self) -> SlaveId {
        self.slave_id
    }

    pub fn part_num(&self) -> &str {
        &self.measurements.schema().part_num
    }

    pub fn rated_power(&self) -> f64 {
        self.rated_power
    }

    pub fn connected_to(&self) -> Option<&str> {
        self.connected_to.as_deref()
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    /// Liveness flag: set by a failed cycle, cleared by a successful one.
    pub fn read_error(&self) -> bool {
        self.read_error
    }

    /// Number of cycles started so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    pub fn measurements(&self) -> &MeasurementMap {
        &self.measurements
    }

    pub fn controls(&self) -> &ControlMap {
        &self.controls
    }

    pub fn transport(&self) -> &T {
        self.client.transport()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn link_stats(&self) -> TransportStats {
        self.client.get_stats()
    }

    /// Key of the shared medium this device sits on, if any.
    pub fn shared_bus(&self) -> Option<String> {
        self.client.transport().shared_bus()
    }

    // ------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------

    /// Run one acquisition cycle and decode it. Returns whether the device
    /// answered.
    pub async fn poll(&mut self) -> bool {
        let Some((measurements, controls)) = self.acquire().await else {
            return false;
        };
        if measurements.is_empty() && controls.is_empty() {
            return true;
        }
        let decoded = self.measurements.decode_frame(&measurements);
        let readback = self.controls.decode_frame(&controls);
        self.last_update = Some(Utc::now());
        debug!(
            "{} cycle {}: {} measurements, {} control readbacks",
            self.id, self.cycle, decoded, readback
        );
        true
    }

    /// Read this cycle's raw frames: measurement blocks, then control
    /// readback blocks. `None` when any block failed.
    pub async fn acquire(&mut self) -> Option<(CycleFrame, CycleFrame)> {
        self.cycle += 1;
        let result = match self.open_link().await {
            Ok(()) => self.read_frames().await,
            Err(e) => Err(e),
        };
        self.release_link(result.is_err()).await;

        match result {
            Ok(frames) => {
                if self.read_error {
                    info!("{} slave {} answering again", self.id, self.slave_id);
                }
                self.read_error = false;
                Some(frames)
            }
            Err(e) => {
                self.read_error = true;
                if e.is_retryable() {
                    warn!(
                        "{} slave {} cycle {} failed: {}",
                        self.id, self.slave_id, self.cycle, e
                    );
                } else {
                    error!(
                        "{} slave {} cycle {} failed: {}",
                        self.id, self.slave_id, self.cycle, e
                    );
                }
                None
            }
        }
    }

    async fn read_frames(&mut self) -> ModbusResult<(CycleFrame, CycleFrame)> {
        let measurement_map = Arc::clone(self.measurements.schema());
        let control_map = Arc::clone(self.controls.schema());
        let measurements = self.read_map(&measurement_map).await?;
        let controls = self.read_map(&control_map).await?;
        Ok((
            CycleFrame::new(self.cycle, measurements),
            CycleFrame::new(self.cycle, controls),
        ))
    }

    async fn read_map(&mut self, map: &RegisterMap) -> ModbusResult<Vec<Vec<u16>>> {
        let mut blocks = Vec::with_capacity(map.blocks.len());
        for block in &map.blocks {
            let registers = self
                .client
                .read_chunked(
                    self.slave_id,
                    block.kind,
                    block.start_address,
                    block.length,
                    &self.limits,
                )
                .await?;
            debug!(
                "{} block={} start={} len={} read",
                self.id, block.name, block.start_address, block.length
            );
            blocks.push(registers);
        }
        Ok(blocks)
    }

    async fn open_link(&mut self) -> ModbusResult<()> {
        let reconnect = match self.client.link_policy() {
            LinkPolicy::ReleaseAfterCycle => true,
            LinkPolicy::KeepAlive => !self.client.is_connected(),
        };
        if reconnect {
            self.client.connect().await?;
        }
        Ok(())
    }

    async fn release_link(&mut self, failed: bool) {
        if failed || self.client.link_policy() == LinkPolicy::ReleaseAfterCycle {
            if let Err(e) = self.client.close().await {
                debug!("{}: close failed: {}", self.id, e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Write raw holding registers starting at `address`.
    pub async fn write_raw(&mut self, values: &[u16], address: u16) -> ModbusResult<()> {
        let target = RegisterRef {
            name: format!("raw@{}", address),
            address,
            kind: RegisterKind::Holding,
        };
        self.write_plan(vec![(target, values.to_vec())]).await
    }

    /// Write a setpoint through the control map. Mode and enable registers
    /// are asserted first when the control field declares them.
    pub async fn encode_write(&mut self, param: ControlParam, value: f64) -> ModbusResult<()> {
        let (field, setpoint) = self.resolve_setpoint(param, value)?;
        let model = self.controls.get(field).ok_or_else(|| self.no_control(field))?;

        let mut plan = Vec::with_capacity(3);
        if let Some(mode) = model.mode_register() {
            plan.push((mode.clone(), vec![1]));
        }
        if let Some(enable) = model.enable_register() {
            plan.push((enable.clone(), vec![1]));
        }
        plan.push((register_of(model), model.encode(setpoint)?));

        info!(
            "{} slave {}: {} <- {} via {}",
            self.id,
            self.slave_id,
            param,
            setpoint,
            field.name()
        );
        self.write_plan(plan).await
    }

    /// Apply a validated control command.
    pub async fn apply(&mut self, command: ControlCommand) -> ModbusResult<()> {
        self.encode_write(command.param, command.value).await
    }

    fn resolve_setpoint(&self, param: ControlParam, value: f64) -> ModbusResult<(ControlField, f64)> {
        match param {
            ControlParam::ActivePower => {
                if self.controls.contains(ControlField::PowerLimit) {
                    Ok((ControlField::PowerLimit, value))
                } else if self.controls.contains(ControlField::PowerLimitPct) {
                    if self.rated_power <= 0.0 {
                        return Err(ModbusError::configuration(format!(
                            "{}: percent power limit needs a rated power",
                            self.id
                        )));
                    }
                    if value < 0.0 {
                        return Err(ModbusError::invalid_data(format!(
                            "{}: percent power limit cannot take {} W",
                            self.id, value
                        )));
                    }
                    // 0 % goes out as 1 %
                    let pct = match (value * 100.0 / self.rated_power).trunc() {
                        p if p == 0.0 => 1.0,
                        p => p,
                    };
                    Ok((ControlField::PowerLimitPct, pct))
                } else {
                    Err(self.no_control(ControlField::PowerLimit))
                }
            }
            ControlParam::DeviceState => {
                if self.controls.contains(ControlField::DeviceState) {
                    Ok((ControlField::DeviceState, value))
                } else {
                    Err(self.no_control(ControlField::DeviceState))
                }
            }
        }
    }

    fn no_control(&self, field: ControlField) -> ModbusError {
        ModbusError::configuration(format!(
            "{} ({}) has no {} register",
            self.id,
            self.part_num(),
            field.name()
        ))
    }

    async fn write_plan(&mut self, plan: Vec<(RegisterRef, Vec<u16>)>) -> ModbusResult<()> {
        let mut result = self.open_link().await;
        if result.is_ok() {
            for (target, values) in &plan {
                result = self.write_target(target, values).await;
                if result.is_err() {
                    break;
                }
            }
        }
        self.release_link(result.is_err()).await;
        if let Err(e) = &result {
            error!("{} slave {}: write failed: {}", self.id, self.slave_id, e);
        }
        result
    }

    async fn write_target(&mut self, target: &RegisterRef, values: &[u16]) -> ModbusResult<()> {
        debug!("{}: write {} @{} {:?}", self.id, target.name, target.address, values);
        match target.kind {
            RegisterKind::Holding => {
                self.client
                    .write_registers(self.slave_id, target.address, values, &self.limits)
                    .await
            }
            RegisterKind::Coil => {
                let on = values.first().is_some_and(|v| *v != 0);
                self.client.write_05(self.slave_id, target.address, on).await
            }
            kind => Err(ModbusError::invalid_data(format!(
                "{} lives in read-only table {}",
                target.name, kind
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Decoded aggregate or fault value by canonical name.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.measurements
            .scalar(name)
            .or_else(|| self.measurements.fault(name))
            .and_then(decoded)
    }

    /// Per-phase values, index 0 is L1.
    pub fn phase_values(&self, quantity: PhaseQuantity) -> Vec<Option<f64>> {
        self.measurements
            .phase(quantity)
            .iter()
            .map(|slot| slot.as_ref().and_then(decoded))
            .collect()
    }

    /// Per-component values, index 0 is component 1.
    pub fn component_values(&self, key: ComponentKey) -> Vec<Option<f64>> {
        self.measurements
            .component(key)
            .iter()
            .map(|slot| slot.as_ref().and_then(decoded))
            .collect()
    }

    /// Set bits of a fault or warning register.
    pub fn active_faults(&self, name: &str) -> Vec<u32> {
        self.measurements
            .fault(name)
            .map(FieldModel::active_bits)
            .unwrap_or_default()
    }

    /// Last read-back value of a control register.
    pub fn control_value(&self, field: ControlField) -> Option<f64> {
        self.controls.get(field).and_then(decoded)
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let scalars = self
            .measurements
            .scalars()
            .filter_map(|(name, model)| decoded(model).map(|v| (name.to_string(), v)))
            .collect();
        let phases = self
            .measurements
            .phases()
            .map(|(q, _)| (q.short().to_string(), self.phase_values(q)))
            .collect();
        let components = self
            .measurements
            .components()
            .map(|(key, _)| (key.to_string(), self.component_values(key)))
            .collect();
        let faults = self
            .measurements
            .faults()
            .filter(|(_, model)| model.updated_cycle().is_some())
            .map(|(name, model)| (name.to_string(), model.active_bits()))
            .collect();
        DeviceSnapshot {
            device_id: self.id.clone(),
            part_num: self.part_num().to_string(),
            timestamp: self.last_update.unwrap_or_else(Utc::now),
            cycle: self.cycle,
            read_error: self.read_error,
            scalars,
            phases,
            components,
            faults,
        }
    }
}

fn decoded(model: &FieldModel) -> Option<f64> {
    model.updated_cycle().map(|_| model.value())
}

fn register_of(model: &FieldModel) -> RegisterRef {
    RegisterRef {
        name: model.name().to_string(),
        address: model.address(),
        kind: model.kind(),
    }
}

/// Decoded state of one device for the report layer.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub part_num: String,
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    pub read_error: bool,
    pub scalars: BTreeMap<String, f64>,
    pub phases: BTreeMap<String, Vec<Option<f64>>>,
    pub components: BTreeMap<String, Vec<Option<f64>>>,
    pub faults: BTreeMap<String, Vec<u32>>,
}
