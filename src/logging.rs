//! Subscriber set-up for the binaries
//!
//! The library only emits `tracing` events. Entry points call [`init`] once.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ModbusError, ModbusResult};

/// Filter from `RUST_LOG` when set, otherwise `level` (e.g. `"info"` or
/// `"voltage_gateway=debug"`).
pub fn filter(level: &str) -> ModbusResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| ModbusError::configuration(format!("log level {:?}: {}", level, e))),
    }
}

/// Install a formatting subscriber. Fails if one is already installed.
pub fn init(level: &str) -> ModbusResult<()> {
    tracing_subscriber::registry()
        .with(filter(level)?)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| ModbusError::configuration(format!("logging already initialised: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_directives() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(filter("info").is_ok());
            assert!(filter("voltage_gateway=debug,warn").is_ok());
            assert!(filter("voltage_gateway=loud").is_err());
        }
    }
}
