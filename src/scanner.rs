//! Device fingerprint scanner
//!
//! Finds out which `(baud, parity, slave id, device)` sits behind a serial
//! port without any prior configuration.
//!
//! - Optional fast discovery: every slave id is pinged at a very short
//!   timeout under every line setting; only ids that answered anywhere stay
//!   candidates.
//! - Phase 1: one cheap read (holding register 0, count 1) per
//!   `(baud, parity, slave)`. Any reply counts, exception replies included.
//! - Phase 2: for the combinations that answered, each catalogue device's
//!   identification parameters are read and range checked. The first device
//!   that passes every check wins that slave id; its `config_list` is then
//!   read into [`DeviceIdentity::details`].
//!
//! Every transaction is followed by a short pause so a live bus is not
//! flooded.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::bytes::ByteOrder;
use crate::client::{GenericModbusClient, ModbusClient};
use crate::codec::FieldFormat;
use crate::constants::{
    SCAN_BAUD_RATES, SCAN_DEVICE_DELAY, SCAN_PING_TIMEOUT, SCAN_PROBE_DELAY, SCAN_PROBE_TIMEOUT,
    SCAN_RESPONSE_TIMEOUT, SCAN_SLAVE_RANGE,
};
use crate::device_limits::DeviceLimits;
use crate::error::{ModbusError, ModbusResult};
use crate::field::FieldCodec;
use crate::protocol::SlaveId;
use crate::schema::{Factor, MapLibrary, RegisterKind, RegisterMap};
use crate::transport::{ModbusTransport, Parity};

// ============================================================================
// Catalogue
// ============================================================================

/// Inclusive plausibility range of an identification parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct ValidRange {
    pub min: f64,
    pub max: f64,
}

impl ValidRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}

impl Default for ValidRange {
    fn default() -> Self {
        Self::new(f64::NEG_INFINITY, f64::INFINITY)
    }
}

impl From<[f64; 2]> for ValidRange {
    fn from([min, max]: [f64; 2]) -> Self {
        Self::new(min, max)
    }
}

impl From<ValidRange> for [f64; 2] {
    fn from(range: ValidRange) -> Self {
        [range.min, range.max]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ParamLists {
    #[serde(default)]
    pub param_list: Vec<String>,
    #[serde(default)]
    pub config_list: Vec<String>,
}

/// What identifies one device type.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceProfile {
    /// Parameters read with FC04.
    #[serde(default)]
    pub input: ParamLists,
    /// Parameters read with FC03; `config_list` lives here.
    #[serde(default)]
    pub holding: ParamLists,
}

/// Identification catalogue, `auto_config_details.json` layout:
///
/// ```json
/// {
///   "devices": {"growatt": {"input": {"param_list": ["L1_voltage"]},
///                           "holding": {"param_list": [], "config_list": ["rated_power"]}}},
///   "param_range": {"L1_voltage": [180, 280]}
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentificationCatalog {
    /// Profiles in file order; earlier entries are tried first.
    pub devices: Vec<(String, DeviceProfile)>,
    pub param_range: HashMap<String, ValidRange>,
}

#[derive(Deserialize)]
struct RawCatalog {
    #[serde(default)]
    devices: Map<String, Value>,
    #[serde(default)]
    param_range: HashMap<String, ValidRange>,
}

impl IdentificationCatalog {
    pub fn from_json_str(json: &str) -> ModbusResult<Self> {
        let raw: RawCatalog = serde_json::from_str(json)?;
        let devices = raw
            .devices
            .into_iter()
            .map(|(name, value)| {
                serde_json::from_value(value)
                    .map(|profile| (name.clone(), profile))
                    .map_err(|e| ModbusError::configuration(format!("catalogue entry {}: {}", name, e)))
            })
            .collect::<ModbusResult<_>>()?;
        Ok(Self {
            devices,
            param_range: raw.param_range,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> ModbusResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    pub fn profile(&self, device_name: &str) -> Option<&DeviceProfile> {
        self.devices
            .iter()
            .find(|(name, _)| name == device_name)
            .map(|(_, profile)| profile)
    }

    /// Range for `param`, unbounded when the catalogue has none.
    pub fn range(&self, param: &str) -> ValidRange {
        self.param_range.get(param).copied().unwrap_or_default()
    }
}

/// A device found on a port. Enough to fill an installer entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub port: String,
    pub baud: u32,
    pub parity: Parity,
    pub slave_id: SlaveId,
    pub device_name: String,
    #[serde(default)]
    pub details: BTreeMap<String, f64>,
}

// ============================================================================
// Parameter lookup
// ============================================================================

/// Absolute location of a named parameter in a device's register map.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamLocation {
    pub address: u16,
    pub size: u16,
    pub kind: RegisterKind,
    pub format: FieldFormat,
    pub order: ByteOrder,
    pub multiplier: f64,
    pub exponent: f64,
    pub addition: f64,
}

impl ParamLocation {
    /// Engineering value of the registers read at this location.
    pub fn value(&self, registers: &[u16]) -> ModbusResult<f64> {
        let raw = self.format.decode(registers, self.order)?;
        Ok(raw.as_f64() * self.multiplier * 10f64.powf(self.exponent) + self.addition)
    }
}

/// Locate `param` in `map` (first match in file order). Fields without a
/// format are read as 16-bit unsigned. Indirect factors cannot be resolved
/// from a single read and make the parameter unusable here.
pub fn find_parameter(map: &RegisterMap, param: &str) -> ModbusResult<ParamLocation> {
    let location = map.find_field(param).ok_or_else(|| {
        ModbusError::configuration(format!("{} has no parameter {}", map.part_num, param))
    })?;
    let field = location.field;
    let format = FieldCodec::from_name(field.format.as_deref())
        .format()?
        .unwrap_or(FieldFormat::U16);
    let constant = |factor: &Factor, default: f64| match factor {
        Factor::None => Ok(default),
        Factor::Const(v) => Ok(*v),
        Factor::Indirect(name) => Err(ModbusError::configuration(format!(
            "{}: factor {} is indirect",
            param, name
        ))),
    };
    Ok(ParamLocation {
        address: location.block.address_of(field),
        size: field.size.max(format.register_count() as u16),
        kind: location.block.kind,
        format,
        order: location.block.order(),
        multiplier: constant(&field.multiplier, 1.0)?,
        exponent: constant(&field.scale, 0.0)?,
        addition: field.addition,
    })
}

// ============================================================================
// Links
// ============================================================================

/// Opens a link on a serial port with given line settings.
pub trait LinkOpener: Send + Sync {
    type Link: ModbusTransport;

    fn open(&self, port: &str, baud: u32, parity: Parity, timeout: Duration) -> Self::Link;
}

/// Opens real serial ports.
#[cfg(feature = "rtu")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

#[cfg(feature = "rtu")]
impl LinkOpener for SerialOpener {
    type Link = crate::transport::RtuTransport;

    fn open(&self, port: &str, baud: u32, parity: Parity, timeout: Duration) -> Self::Link {
        crate::transport::RtuTransport::new(
            crate::transport::SerialSettings::new(port, baud, parity),
            timeout,
        )
    }
}

// ============================================================================
// Scanner
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    pub bauds: Vec<u32>,
    pub parities: Vec<Parity>,
    pub slaves: Vec<SlaveId>,
    /// Run the fast discovery pass before phase 1.
    pub fast_discovery: bool,
    /// Stop once this many devices were found on a port.
    pub max_devices: Option<usize>,
    pub ping_timeout: Duration,
    pub probe_timeout: Duration,
    pub verify_timeout: Duration,
    pub probe_delay: Duration,
    pub device_delay: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            bauds: SCAN_BAUD_RATES.to_vec(),
            parities: vec![Parity::Odd, Parity::None, Parity::Even],
            slaves: SCAN_SLAVE_RANGE.collect(),
            fast_discovery: false,
            max_devices: None,
            ping_timeout: SCAN_PING_TIMEOUT,
            probe_timeout: SCAN_PROBE_TIMEOUT,
            verify_timeout: SCAN_RESPONSE_TIMEOUT,
            probe_delay: SCAN_PROBE_DELAY,
            device_delay: SCAN_DEVICE_DELAY,
        }
    }
}

/// Work done by a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub pings: u64,
    pub probes: u64,
    /// Full verifications run, one per `(line, slave, device)` tried.
    pub verifications: u64,
    /// `(baud, parity, slave)` combinations that got a full verification.
    pub verified: Vec<(u32, Parity, SlaveId)>,
}

pub struct Scanner<O: LinkOpener> {
    opener: O,
    catalog: IdentificationCatalog,
    maps: HashMap<String, Arc<RegisterMap>>,
    options: ScanOptions,
    stats: ScanStats,
}

impl<O: LinkOpener> Scanner<O> {
    /// Catalogue devices without a register map are skipped with a warning.
    pub fn new(opener: O, catalog: IdentificationCatalog, library: &MapLibrary) -> Self {
        let mut maps = HashMap::new();
        for (name, _) in &catalog.devices {
            match library.get(name) {
                Ok(map) => {
                    maps.insert(name.clone(), Arc::new(map));
                }
                Err(e) => warn!("scanner: no usable map for {}: {}", name, e),
            }
        }
        Self {
            opener,
            catalog,
            maps,
            options: ScanOptions::default(),
            stats: ScanStats::default(),
        }
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    /// Scan several ports one after the other.
    pub async fn scan_ports(&mut self, ports: &[String]) -> Vec<DeviceIdentity> {
        let mut found = Vec::new();
        for port in ports {
            info!("scanning port {}", port);
            found.extend(self.scan_port(port).await);
        }
        found
    }

    /// Scan one port across every configured line setting.
    pub async fn scan_port(&mut self, port: &str) -> Vec<DeviceIdentity> {
        let candidates = if self.options.fast_discovery {
            self.discover_candidates(port).await
        } else {
            self.options.slaves.clone()
        };
        if candidates.is_empty() {
            info!("{}: nothing answered discovery", port);
            return Vec::new();
        }

        let mut found = Vec::new();
        for baud in self.options.bauds.clone() {
            for parity in self.options.parities.clone() {
                let alive = self.probe(port, baud, parity, &candidates).await;
                if alive.is_empty() {
                    debug!("{} {}{}: no replies", port, baud, parity);
                    continue;
                }
                info!("{} {}{}: slaves {:?} answered", port, baud, parity, alive);
                for identity in self.verify(port, baud, parity, &alive).await {
                    found.push(identity);
                    if self.options.max_devices.is_some_and(|max| found.len() >= max) {
                        return found;
                    }
                }
            }
        }
        found
    }

    /// Fast discovery: slave ids that answer a short ping under any line
    /// setting.
    pub async fn discover_candidates(&mut self, port: &str) -> Vec<SlaveId> {
        let mut candidates = BTreeSet::new();
        for baud in self.options.bauds.clone() {
            for parity in self.options.parities.clone() {
                let slaves = self.options.slaves.clone();
                let alive = self.discover_slaves(port, baud, parity, &slaves).await;
                candidates.extend(alive);
            }
        }
        candidates.into_iter().collect()
    }

    /// Ping every id in `slaves` at the discovery timeout.
    pub async fn discover_slaves(
        &mut self,
        port: &str,
        baud: u32,
        parity: Parity,
        slaves: &[SlaveId],
    ) -> Vec<SlaveId> {
        let timeout = self.options.ping_timeout;
        let alive = self.answering(port, baud, parity, slaves, timeout).await;
        self.stats.pings += slaves.len() as u64;
        alive
    }

    /// Phase 1: one cheap read per slave id.
    pub async fn probe(
        &mut self,
        port: &str,
        baud: u32,
        parity: Parity,
        slaves: &[SlaveId],
    ) -> Vec<SlaveId> {
        let timeout = self.options.probe_timeout;
        let alive = self.answering(port, baud, parity, slaves, timeout).await;
        self.stats.probes += slaves.len() as u64;
        alive
    }

    async fn answering(
        &self,
        port: &str,
        baud: u32,
        parity: Parity,
        slaves: &[SlaveId],
        timeout: Duration,
    ) -> Vec<SlaveId> {
        let mut client = GenericModbusClient::new(self.opener.open(port, baud, parity, timeout));
        if let Err(e) = client.connect().await {
            warn!("{}: cannot open at {}{}: {}", port, baud, parity, e);
            return Vec::new();
        }
        let mut alive = Vec::new();
        for &slave in slaves {
            match client.read_03(slave, 0, 1).await {
                Ok(_) => alive.push(slave),
                Err(e) if e.is_device_response() => alive.push(slave),
                Err(_) => {}
            }
            tokio::time::sleep(self.options.probe_delay).await;
        }
        if let Err(e) = client.close().await {
            debug!("{}: close failed: {}", port, e);
        }
        alive
    }

    /// Phase 2: identify the devices behind slave ids that answered phase 1.
    pub async fn verify(
        &mut self,
        port: &str,
        baud: u32,
        parity: Parity,
        slaves: &[SlaveId],
    ) -> Vec<DeviceIdentity> {
        let link = self
            .opener
            .open(port, baud, parity, self.options.verify_timeout);
        let mut client = GenericModbusClient::new(link);
        if let Err(e) = client.connect().await {
            warn!("{}: cannot open at {}{}: {}", port, baud, parity, e);
            return Vec::new();
        }

        let mut found = Vec::new();
        for &slave in slaves {
            self.stats.verified.push((baud, parity, slave));
            for (device_name, profile) in self.catalog.devices.clone() {
                let Some(map) = self.maps.get(&device_name).cloned() else {
                    continue;
                };
                self.stats.verifications += 1;
                let matched = self.verify_part(&mut client, &map, &profile, slave).await;
                tokio::time::sleep(self.options.device_delay).await;
                if !matched {
                    continue;
                }
                info!(
                    "found {} on {} {}{} slave {}",
                    device_name, port, baud, parity, slave
                );
                let details = self.read_details(&mut client, &map, &profile, slave).await;
                found.push(DeviceIdentity {
                    port: port.to_string(),
                    baud,
                    parity,
                    slave_id: slave,
                    device_name,
                    details,
                });
                break;
            }
        }
        if let Err(e) = client.close().await {
            debug!("{}: close failed: {}", port, e);
        }
        found
    }

    /// Every identification parameter must read and fall inside its range.
    async fn verify_part<T: ModbusTransport>(
        &self,
        client: &mut GenericModbusClient<T>,
        map: &RegisterMap,
        profile: &DeviceProfile,
        slave: SlaveId,
    ) -> bool {
        let lists = [
            (&profile.input.param_list, RegisterKind::Input),
            (&profile.holding.param_list, RegisterKind::Holding),
        ];
        for (params, kind) in lists {
            for param in params {
                let value = match self.read_param(client, map, param, Some(kind), slave).await {
                    Ok(value) => value,
                    Err(e) => {
                        debug!("{} slave {}: {} unreadable: {}", map.part_num, slave, param, e);
                        return false;
                    }
                };
                let range = self.catalog.range(param);
                if !range.contains(value) {
                    debug!(
                        "{} slave {}: {} = {} outside [{}, {}]",
                        map.part_num, slave, param, value, range.min, range.max
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Read `config_list`, skipping parameters that cannot be read.
    async fn read_details<T: ModbusTransport>(
        &self,
        client: &mut GenericModbusClient<T>,
        map: &RegisterMap,
        profile: &DeviceProfile,
        slave: SlaveId,
    ) -> BTreeMap<String, f64> {
        let mut details = BTreeMap::new();
        for param in &profile.holding.config_list {
            match self.read_param(client, map, param, None, slave).await {
                Ok(value) => {
                    debug!("{} slave {}: {} = {}", map.part_num, slave, param, value);
                    details.insert(param.clone(), value);
                }
                Err(e) => warn!("{} slave {}: config {} unreadable: {}", map.part_num, slave, param, e),
            }
        }
        details
    }

    /// Read one parameter. `kind` overrides the table of the map's block.
    async fn read_param<T: ModbusTransport>(
        &self,
        client: &mut GenericModbusClient<T>,
        map: &RegisterMap,
        param: &str,
        kind: Option<RegisterKind>,
        slave: SlaveId,
    ) -> ModbusResult<f64> {
        let location = find_parameter(map, param)?;
        let kind = kind.unwrap_or(location.kind);
        let result = client
            .read_chunked(slave, kind, location.address, location.size, &DeviceLimits::default())
            .await;
        tokio::time::sleep(self.options.probe_delay).await;
        location.value(&result?)
    }
}
