//! # Voltage Gateway - Modbus RTU/TCP Edge-Gateway Core
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **License:** MIT
//!
//! Polls inverters, meters, batteries and sensors over Modbus RTU and TCP,
//! turns raw registers into engineering values using per-part JSON register
//! maps, writes setpoints back, and fingerprints unknown devices on a serial
//! port.
//!
//! ## Features
//!
//! - **Data-driven register maps**: blocks and fields from JSON, read in file
//!   order, decoded through a typed format enum
//! - **Indirect scale factors**: factors read from other registers in the
//!   same cycle, resolved before the fields that depend on them
//! - **Chunked reads**: blocks of any length split at the device ceiling
//! - **Link discipline**: serial lines released after every cycle, sockets
//!   kept open until an error
//! - **Fingerprint scanner**: cheap probe first, full verification only where
//!   something answered
//!
//! ## Layers
//!
//! | Layer | Modules |
//! |-------|---------|
//! | Wire | [`protocol`], [`transport`], [`client`] |
//! | Values | [`bytes`], [`codec`], [`field`] |
//! | Maps | [`schema`], [`device_map`] |
//! | Devices | [`device`], [`control`], [`energy`], [`registry`] |
//! | Discovery | [`scanner`] |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use voltage_gateway::device_map::{compile_control_map, compile_measurement_map};
//! use voltage_gateway::{Device, MapLibrary, ModbusResult, RegisterMap, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let maps = MapLibrary::load("modbus_registers.json")?;
//!     let schema = Arc::new(maps.get("SUN2000")?);
//!
//!     let link = TcpTransport::new("192.168.1.20:502", Duration::from_secs(1));
//!     let mut device = Device::new(
//!         "inv-1",
//!         1,
//!         link,
//!         compile_measurement_map(schema, 3),
//!         compile_control_map(Arc::new(RegisterMap::empty("SUN2000"))),
//!     );
//!
//!     if device.poll().await {
//!         println!("total_power = {:?}", device.value("total_power"));
//!     }
//!     Ok(())
//! }
//! ```

// ============================================================================
// Wire modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants and gateway defaults
pub mod constants;

/// Modbus protocol definitions and message handling
pub mod protocol;

/// Network transport layer for TCP and RTU communication
pub mod transport;

/// Modbus client implementations
pub mod client;

/// Device-specific protocol limits configuration
pub mod device_limits;

// ============================================================================
// Value modules
// ============================================================================

/// Byte order handling for multi-register data types
pub mod bytes;

/// Typed register formats
pub mod codec;

/// Field models bound to a register map
pub mod field;

// ============================================================================
// Gateway modules
// ============================================================================

/// Register map files
pub mod schema;

/// Measurement and control map compilation
pub mod device_map;

/// Acquisition cycle and setpoint writes
pub mod device;

/// Inbound control commands
pub mod control;

/// Energy counter plausibility filter
pub mod energy;

/// Fleet registry and pollers
pub mod registry;

/// Device fingerprint scanner
pub mod scanner;

/// Gateway and installer configuration
pub mod config;

/// In-memory Modbus bus
pub mod simulator;

/// Subscriber set-up for the binaries
pub mod logging;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use tokio;

// === Core client API ===
pub use client::{GenericModbusClient, ModbusClient};

// === Error handling ===
pub use error::{ModbusError, ModbusResult};

// === Core types ===
pub use bytes::ByteOrder;
pub use codec::{FieldFormat, RawValue};
pub use protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};
pub use schema::{MapLibrary, RegisterKind, RegisterMap};

// === Gateway ===
pub use config::{DeviceConfig, GatewayConfig};
pub use control::{ControlCommand, ControlParam};
pub use device::{Device, DeviceSnapshot};
pub use device_limits::DeviceLimits;
pub use energy::EnergyLedger;
pub use registry::FleetRegistry;
pub use scanner::{DeviceIdentity, IdentificationCatalog, Scanner};

// === Transports ===
pub use transport::{
    Link, LinkPolicy, ModbusTransport, Parity, SerialSettings, TcpTransport, TransportStats,
};

#[cfg(feature = "rtu")]
pub use transport::RtuTransport;

// === Protocol limits ===
pub use constants::{MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Voltage Gateway v{} - Modbus edge-gateway core by Evan Liu",
        VERSION
    )
}
