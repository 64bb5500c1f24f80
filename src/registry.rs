//! Fleet registry and polling schedule
//!
//! The registry is owned by the entry point and handed to whoever needs the
//! devices. Devices that share a physical medium (RTU devices on one serial
//! port) are polled one after the other by a single ticker task; every other
//! device gets a task of its own. Writes take the same bus lock as the
//! pollers, so a setpoint never interleaves with a poll on a shared line.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::control::{ControlCommand, ControlParam};
use crate::device::{Device, DeviceSnapshot};
use crate::device_map::{compile_control_map, compile_measurement_map};
use crate::energy::EnergyLedger;
use crate::error::{ModbusError, ModbusResult};
use crate::schema::{MapLibrary, RegisterMap};
use crate::transport::{Link, ModbusTransport};

pub type SharedDevice<T> = Arc<Mutex<Device<T>>>;

struct Entry<T: ModbusTransport> {
    id: String,
    bus: String,
    device: SharedDevice<T>,
}

/// Devices polled together on one medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollGroup {
    pub bus: String,
    pub device_ids: Vec<String>,
}

pub struct FleetRegistry<T: ModbusTransport = Link> {
    entries: Vec<Entry<T>>,
    index: HashMap<String, usize>,
    bus_locks: HashMap<String, Arc<Mutex<()>>>,
}

impl<T: ModbusTransport> Default for FleetRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            bus_locks: HashMap::new(),
        }
    }
}

impl<T: ModbusTransport + 'static> FleetRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, device: Device<T>) -> ModbusResult<()> {
        let id = device.id().to_string();
        if self.index.contains_key(&id) {
            return Err(ModbusError::configuration(format!("duplicate device id {}", id)));
        }
        let bus = device.shared_bus().unwrap_or_else(|| format!("device:{}", id));
        self.bus_locks.entry(bus.clone()).or_default();
        self.index.insert(id.clone(), self.entries.len());
        self.entries.push(Entry {
            id,
            bus,
            device: Arc::new(Mutex::new(device)),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.id.as_str())
    }

    pub fn get(&self, id: &str) -> Option<SharedDevice<T>> {
        self.entry(id).map(|e| Arc::clone(&e.device))
    }

    fn entry(&self, id: &str) -> Option<&Entry<T>> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    fn bus_lock(&self, bus: &str) -> Arc<Mutex<()>> {
        self.bus_locks.get(bus).cloned().unwrap_or_default()
    }

    /// Poll groups in insertion order of their first device.
    pub fn groups(&self) -> Vec<PollGroup> {
        let mut groups: Vec<PollGroup> = Vec::new();
        for entry in &self.entries {
            match groups.iter_mut().find(|g| g.bus == entry.bus) {
                Some(group) => group.device_ids.push(entry.id.clone()),
                None => groups.push(PollGroup {
                    bus: entry.bus.clone(),
                    device_ids: vec![entry.id.clone()],
                }),
            }
        }
        groups
    }

    /// Poll every device once, sequentially.
    pub async fn poll_all(&self) -> usize {
        let mut answered = 0;
        for entry in &self.entries {
            let lock = self.bus_lock(&entry.bus);
            let _bus = lock.lock().await;
            if entry.device.lock().await.poll().await {
                answered += 1;
            }
        }
        answered
    }

    /// Start one ticker task per poll group. Tasks stop when `token` is
    /// cancelled.
    pub fn spawn_pollers(&self, interval: Duration, token: CancellationToken) -> Vec<JoinHandle<()>> {
        self.groups()
            .into_iter()
            .map(|group| {
                let devices: Vec<(String, SharedDevice<T>)> = group
                    .device_ids
                    .iter()
                    .filter_map(|id| self.get(id).map(|d| (id.clone(), d)))
                    .collect();
                let bus_lock = self.bus_lock(&group.bus);
                let token = token.clone();
                tokio::spawn(run_group(group.bus, devices, bus_lock, interval, token))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub async fn encode_write(&self, id: &str, param: ControlParam, value: f64) -> ModbusResult<()> {
        let entry = self.entry(id).ok_or_else(|| unknown(id))?;
        let lock = self.bus_lock(&entry.bus);
        let _bus = lock.lock().await;
        entry.device.lock().await.encode_write(param, value).await
    }

    pub async fn write_raw(&self, id: &str, values: &[u16], address: u16) -> ModbusResult<()> {
        let entry = self.entry(id).ok_or_else(|| unknown(id))?;
        let lock = self.bus_lock(&entry.bus);
        let _bus = lock.lock().await;
        entry.device.lock().await.write_raw(values, address).await
    }

    /// Validate an inbound control message against the device and apply it.
    pub async fn apply_json(&self, id: &str, message: &Value) -> ModbusResult<ControlCommand> {
        let entry = self.entry(id).ok_or_else(|| unknown(id))?;
        let lock = self.bus_lock(&entry.bus);
        let _bus = lock.lock().await;
        let mut device = entry.device.lock().await;
        let command = ControlCommand::from_json(message, device.rated_power())?;
        device.apply(command).await?;
        Ok(command)
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    pub async fn read_errors(&self) -> BTreeMap<String, bool> {
        let mut flags = BTreeMap::new();
        for entry in &self.entries {
            flags.insert(entry.id.clone(), entry.device.lock().await.read_error());
        }
        flags
    }

    pub async fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut snapshots = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            snapshots.push(entry.device.lock().await.snapshot());
        }
        snapshots
    }

    /// Snapshots with `total_energy` passed through the ledger, which is
    /// saved afterwards.
    pub async fn report(&self, ledger: &mut EnergyLedger) -> Vec<DeviceSnapshot> {
        let mut snapshots = self.snapshots().await;
        for snapshot in &mut snapshots {
            if let Some(reading) = snapshot.scalars.remove("total_energy") {
                if let Some(energy) = ledger.record(&snapshot.device_id, reading) {
                    snapshot.scalars.insert("total_energy".to_string(), energy);
                }
            }
        }
        if let Err(e) = ledger.save() {
            warn!("energy log not saved: {}", e);
        }
        snapshots
    }
}

impl FleetRegistry<Link> {
    /// Build the fleet described by the installer configuration. Devices
    /// with `comm_type: none` are skipped; a part number missing from the
    /// measurement maps is an error.
    pub fn from_config(
        config: &GatewayConfig,
        measurements: &MapLibrary,
        controls: &MapLibrary,
    ) -> ModbusResult<Self> {
        let mut registry = Self::new();
        let mut schemas: HashMap<String, (Arc<RegisterMap>, Arc<RegisterMap>)> = HashMap::new();

        for entry in &config.devices {
            let Some(link) = entry.build_link(config.request_timeout(), config.packet_logging)? else {
                debug!("{}: not polled", entry.id);
                continue;
            };
            let (measurement_map, control_map) = match schemas.get(&entry.part_num) {
                Some(pair) => pair.clone(),
                None => {
                    let pair = (
                        Arc::new(measurements.get(&entry.part_num)?),
                        Arc::new(controls.get_or_empty(&entry.part_num)?),
                    );
                    schemas.insert(entry.part_num.clone(), pair.clone());
                    pair
                }
            };
            let mut device = Device::new(
                entry.id.clone(),
                entry.slave_id,
                link,
                compile_measurement_map(measurement_map, entry.num_phases),
                compile_control_map(control_map),
            )
            .with_rated_power(entry.rated_power)
            .with_connected_to(entry.connected_to.clone());
            if let Some(limits) = entry.limits {
                device = device.with_limits(limits);
            }
            info!(
                "{}: {} slave {} via {}",
                entry.id,
                entry.part_num,
                entry.slave_id,
                device.transport().endpoint()
            );
            registry.insert(device)?;
        }
        Ok(registry)
    }
}

fn unknown(id: &str) -> ModbusError {
    ModbusError::configuration(format!("unknown device {}", id))
}

async fn run_group<T: ModbusTransport>(
    bus: String,
    devices: Vec<(String, SharedDevice<T>)>,
    bus_lock: Arc<Mutex<()>>,
    interval: Duration,
    token: CancellationToken,
) {
    info!("poller {}: {} device(s) every {:?}", bus, devices.len(), interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for (id, device) in &devices {
                    if token.is_cancelled() {
                        break;
                    }
                    let _bus = bus_lock.lock().await;
                    let answered = device.lock().await.poll().await;
                    debug!("poller {}: {} answered={}", bus, id, answered);
                }
            }
            () = token.cancelled() => {
                break;
            }
        }
    }
    info!("poller {} stopped", bus);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{SimulatedBus, SimulatedTransport, SlaveImage};
    use crate::transport::Parity;
    use serde_json::json;

    const MAPS: &str = r#"{"M": {
        "b": {"start_address": 0, "Length": 3, "registers": "ir",
            "data": {
                "total_power": {"offset": 0, "size": 1, "format": "decode_16bit_int"},
                "total_energy": {"offset": 1, "size": 2, "format": "decode_32bit_uint"}
            }}
    }}"#;

    const CONTROLS: &str = r#"{"M": {
        "c": {"start_address": 10, "Length": 1, "registers": "hr",
            "data": {"device_state": {"offset": 0, "size": 1, "format": "decode_16bit_uint"}}}
    }}"#;

    fn device(id: &str, slave: u8, link: SimulatedTransport) -> Device<SimulatedTransport> {
        let m = MapLibrary::from_json_str(MAPS).unwrap().get("M").unwrap();
        let c = MapLibrary::from_json_str(CONTROLS).unwrap().get("M").unwrap();
        Device::new(
            id,
            slave,
            link,
            compile_measurement_map(Arc::new(m), 3),
            compile_control_map(Arc::new(c)),
        )
        .with_rated_power(5000.0)
    }

    fn slave(energy: u32) -> SlaveImage {
        SlaveImage::new().with_input(0, &[1200, (energy >> 16) as u16, energy as u16])
    }

    fn fleet() -> (SimulatedBus, SimulatedBus, FleetRegistry<SimulatedTransport>) {
        let serial = SimulatedBus::new("/dev/ttyUSB0")
            .with_line(9600, Parity::None)
            .with_slave(1, slave(1000))
            .with_slave(2, slave(2000));
        let plant = SimulatedBus::new("plant").with_slave(1, slave(3000));
        let mut registry = FleetRegistry::new();
        registry.insert(device("a", 1, serial.rtu_link(9600, Parity::None))).unwrap();
        registry.insert(device("t", 1, plant.tcp_link())).unwrap();
        registry.insert(device("b", 2, serial.rtu_link(9600, Parity::None))).unwrap();
        (serial, plant, registry)
    }

    #[test]
    fn test_groups_follow_shared_medium() {
        let (_, _, registry) = fleet();
        let groups = registry.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].bus, "/dev/ttyUSB0");
        assert_eq!(groups[0].device_ids, vec!["a", "b"]);
        assert_eq!(groups[1].device_ids, vec!["t"]);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let (serial, _, mut registry) = fleet();
        assert!(registry.insert(device("a", 3, serial.rtu_link(9600, Parity::None))).is_err());
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_poll_all_and_read_errors() {
        let (serial, _, registry) = fleet();
        assert_eq!(registry.poll_all().await, 3);
        serial.set_offline(true);
        assert_eq!(registry.poll_all().await, 1);
        let flags = registry.read_errors().await;
        assert_eq!(flags.get("a"), Some(&true));
        assert_eq!(flags.get("t"), Some(&false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pollers_tick_and_stop() {
        let (serial, _, registry) = fleet();
        let token = CancellationToken::new();
        let handles = registry.spawn_pollers(Duration::from_secs(1), token.clone());
        assert_eq!(handles.len(), 2);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        for id in ["a", "b", "t"] {
            let cycles = registry.get(id).unwrap().lock().await.cycle();
            assert_eq!(cycles, 3, "{}", id);
        }
        // shared line never left open between cycles
        assert_eq!(serial.open_links(), 0);

        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(registry.get("a").unwrap().lock().await.cycle(), 3);
    }

    #[tokio::test]
    async fn test_apply_json_validates_then_writes() {
        let (serial, _, registry) = fleet();
        let cmd = registry
            .apply_json("b", &json!({"param": "device_state", "value": "1"}))
            .await
            .unwrap();
        assert_eq!(cmd.param, ControlParam::DeviceState);
        assert_eq!(serial.writes(), vec![(2, 10, vec![1])]);

        assert!(registry
            .apply_json("b", &json!({"param": "active_power", "value": "9e9"}))
            .await
            .is_err());
        assert!(registry.apply_json("zz", &json!({})).await.is_err());
        registry.write_raw("a", &[5], 20).await.unwrap();
        assert_eq!(serial.writes().last(), Some(&(1, 20, vec![5])));
    }

    #[tokio::test]
    async fn test_report_filters_energy() {
        let (serial, _, registry) = fleet();
        let mut ledger = EnergyLedger::in_memory();
        registry.poll_all().await;
        let first = registry.report(&mut ledger).await;
        assert_eq!(first[0].scalars.get("total_energy"), Some(&1000.0));

        // counter jumped backwards on device a
        serial.update_slave(1, |s| *s = slave(900));
        registry.poll_all().await;
        let second = registry.report(&mut ledger).await;
        assert_eq!(second[0].scalars.get("total_energy"), Some(&1000.0));
        assert_eq!(second[0].scalars.get("total_power"), Some(&1200.0));
    }
}
