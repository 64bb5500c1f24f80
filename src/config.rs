//! Gateway and installer configuration
//!
//! Settings come from a JSON file merged with `VGW_` prefixed environment
//! variables (`VGW_POLL_INTERVAL=2000`, `VGW_LOG_LEVEL=debug`). The device
//! list only comes from the file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_POLL_INTERVAL, DEFAULT_REQUEST_TIMEOUT, DEFAULT_TCP_PORT};
use crate::device_limits::DeviceLimits;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::SlaveId;
use crate::transport::{Link, Parity, TcpTransport};

/// How a device is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommType {
    #[serde(rename = "modbus-rtu", alias = "modbus_rtu", alias = "rtu")]
    ModbusRtu,
    #[serde(rename = "modbus-tcp", alias = "modbus_tcp", alias = "tcp")]
    ModbusTcp,
    /// Listed for topology only, never polled.
    #[serde(rename = "none")]
    None,
}

/// One installer entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(alias = "device_id")]
    pub id: String,
    pub part_num: String,
    pub comm_type: CommType,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub baud: Option<u32>,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_slave_id")]
    pub slave_id: SlaveId,
    #[serde(default)]
    pub rated_power: f64,
    #[serde(default = "default_num_phases")]
    pub num_phases: usize,
    /// Opaque topology hint for the dispatch layer.
    #[serde(default)]
    pub connected_to: Option<String>,
    /// Overrides the transport's chunking ceilings.
    #[serde(default)]
    pub limits: Option<DeviceLimits>,
}

fn default_stop_bits() -> u8 {
    1
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_slave_id() -> SlaveId {
    1
}

fn default_num_phases() -> usize {
    3
}

impl DeviceConfig {
    pub fn validate(&self) -> ModbusResult<()> {
        let invalid = |what: &str| {
            Err(ModbusError::configuration(format!("device {}: {}", self.id, what)))
        };
        if self.id.trim().is_empty() {
            return Err(ModbusError::configuration("device with empty id"));
        }
        match self.comm_type {
            CommType::ModbusRtu => {
                if self.port.as_deref().map_or(true, |p| p.trim().is_empty()) {
                    return invalid("modbus-rtu needs a port");
                }
                if self.baud.map_or(true, |b| b == 0) {
                    return invalid("modbus-rtu needs a baud rate");
                }
            }
            CommType::ModbusTcp => {
                if self.ip.as_deref().map_or(true, |ip| ip.trim().is_empty()) {
                    return invalid("modbus-tcp needs an ip");
                }
            }
            CommType::None => return Ok(()),
        }
        if !(1..=247).contains(&self.slave_id) {
            return invalid("slave_id must be within 1..=247");
        }
        if !self.rated_power.is_finite() || self.rated_power < 0.0 {
            return invalid("rated_power must be a non-negative number");
        }
        Ok(())
    }

    pub fn is_polled(&self) -> bool {
        self.comm_type != CommType::None
    }

    /// Build the link for this device. `None` for devices that are not polled.
    pub fn build_link(&self, timeout: Duration, packet_logging: bool) -> ModbusResult<Option<Link>> {
        match self.comm_type {
            CommType::None => Ok(None),
            CommType::ModbusTcp => {
                let ip = self
                    .ip
                    .as_deref()
                    .ok_or_else(|| ModbusError::configuration(format!("device {}: no ip", self.id)))?;
                let mut transport = TcpTransport::new(format!("{}:{}", ip, self.tcp_port), timeout);
                transport.set_packet_logging(packet_logging);
                Ok(Some(Link::Tcp(transport)))
            }
            CommType::ModbusRtu => self.build_serial_link(timeout, packet_logging).map(Some),
        }
    }

    #[cfg(feature = "rtu")]
    fn build_serial_link(&self, timeout: Duration, packet_logging: bool) -> ModbusResult<Link> {
        use crate::transport::{RtuTransport, SerialSettings};

        let (Some(port), Some(baud)) = (self.port.as_deref(), self.baud) else {
            return Err(ModbusError::configuration(format!(
                "device {}: port and baud required",
                self.id
            )));
        };
        let mut settings = SerialSettings::new(port, baud, self.parity);
        settings.stop_bits = self.stop_bits;
        let mut transport = RtuTransport::new(settings, timeout);
        transport.set_packet_logging(packet_logging);
        Ok(Link::Rtu(transport))
    }

    #[cfg(not(feature = "rtu"))]
    fn build_serial_link(&self, _timeout: Duration, _packet_logging: bool) -> ModbusResult<Link> {
        Err(ModbusError::configuration(format!(
            "device {}: built without the rtu feature",
            self.id
        )))
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Register maps keyed by part number.
    pub mappings_path: PathBuf,
    /// Control register maps keyed by part number.
    pub control_path: PathBuf,
    pub energy_log_path: PathBuf,
    /// Milliseconds between polls.
    pub poll_interval: u64,
    /// Transaction timeout in milliseconds.
    pub request_timeout: u64,
    pub log_level: String,
    pub packet_logging: bool,
    pub devices: Vec<DeviceConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mappings_path: PathBuf::from("modbus_registers.json"),
            control_path: PathBuf::from("control_registers.json"),
            energy_log_path: PathBuf::from("control/total_energy_log.json"),
            poll_interval: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            request_timeout: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            log_level: "info".to_string(),
            packet_logging: false,
            devices: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Defaults, then `path` (when given), then `VGW_*` variables.
    pub fn load(path: Option<&Path>) -> ModbusResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(GatewayConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(ModbusError::configuration(format!(
                    "config file {} not found",
                    path.display()
                )));
            }
            figment = figment.merge(Json::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed("VGW_").ignore(&["devices"]))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.poll_interval == 0 {
            return Err(ModbusError::configuration("poll_interval must be positive"));
        }
        if self.request_timeout == 0 {
            return Err(ModbusError::configuration("request_timeout must be positive"));
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !seen.insert(device.id.as_str()) {
                return Err(ModbusError::configuration(format!(
                    "duplicate device id {}",
                    device.id
                )));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    const CONFIG: &str = r#"{
        "mappings_path": "maps/modbus_registers.json",
        "poll_interval": 2000,
        "devices": [
            {"id": "inv-1", "part_num": "SUN2000", "comm_type": "modbus-tcp", "ip": "192.168.1.20",
             "slave_id": 1, "rated_power": 10000},
            {"device_id": "meter", "part_num": "EM24", "comm_type": "modbus-rtu", "port": "/dev/ttyUSB0",
             "baud": 9600, "parity": "E", "slave_id": 7, "num_phases": 1,
             "limits": {"max_read_registers": 50}},
            {"id": "grid", "part_num": "", "comm_type": "none"}
        ]
    }"#;

    #[test]
    fn test_load_file_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file("gateway.json", CONFIG)?;
            jail.set_env("VGW_LOG_LEVEL", "debug");
            jail.set_env("VGW_REQUEST_TIMEOUT", "250");

            let config = GatewayConfig::load(Some(Path::new("gateway.json"))).unwrap();
            assert_eq!(config.poll_interval(), Duration::from_secs(2));
            assert_eq!(config.request_timeout(), Duration::from_millis(250));
            assert_eq!(config.log_level, "debug");
            assert_eq!(config.mappings_path, PathBuf::from("maps/modbus_registers.json"));
            assert_eq!(config.control_path, PathBuf::from("control_registers.json"));

            let meter = &config.devices[1];
            assert_eq!(meter.id, "meter");
            assert_eq!(meter.comm_type, CommType::ModbusRtu);
            assert_eq!(meter.parity, Parity::Even);
            assert_eq!(meter.tcp_port, 502);
            assert_eq!(meter.stop_bits, 1);
            assert_eq!(meter.num_phases, 1);
            assert_eq!(meter.limits.unwrap().max_read_registers, 50);
            assert_eq!(config.devices[0].num_phases, 3);
            assert!(!config.devices[2].is_polled());
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_rejected() {
        assert!(GatewayConfig::load(Some(Path::new("/nonexistent/gateway.json"))).is_err());
    }

    fn device(json: &str) -> DeviceConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_device_validation() {
        assert!(device(r#"{"id": "a", "part_num": "P", "comm_type": "modbus-rtu", "baud": 9600}"#)
            .validate()
            .is_err());
        assert!(device(r#"{"id": "a", "part_num": "P", "comm_type": "modbus-rtu", "port": "/dev/ttyS0"}"#)
            .validate()
            .is_err());
        assert!(device(r#"{"id": "a", "part_num": "P", "comm_type": "modbus-tcp"}"#)
            .validate()
            .is_err());
        assert!(device(r#"{"id": "a", "part_num": "P", "comm_type": "modbus-tcp", "ip": "10.0.0.2", "slave_id": 0}"#)
            .validate()
            .is_err());
        assert!(device(r#"{"id": "a", "part_num": "P", "comm_type": "modbus-tcp", "ip": "10.0.0.2", "slave_id": 248}"#)
            .validate()
            .is_err());
        assert!(device(r#"{"id": "a", "part_num": "P", "comm_type": "modbus-tcp", "ip": "10.0.0.2"}"#)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let entry = r#"{"id": "a", "part_num": "P", "comm_type": "modbus-tcp", "ip": "10.0.0.2"}"#;
        let config = GatewayConfig {
            devices: vec![device(entry), device(entry)],
            ..GatewayConfig::default()
        };
        assert!(matches!(config.validate(), Err(ModbusError::Configuration { .. })));
    }

    #[test]
    fn test_build_link() {
        let tcp = device(r#"{"id": "a", "part_num": "P", "comm_type": "modbus-tcp", "ip": "10.0.0.2", "tcp_port": 1502}"#);
        match tcp.build_link(Duration::from_millis(500), false).unwrap() {
            Some(Link::Tcp(t)) => assert_eq!(t.address(), "10.0.0.2:1502"),
            _ => panic!("expected a tcp link"),
        }
        let none = device(r#"{"id": "g", "part_num": "", "comm_type": "none"}"#);
        assert!(none.build_link(Duration::from_millis(500), false).unwrap().is_none());
    }
}
