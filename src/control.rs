//! Inbound control commands
//!
//! Commands arrive as small JSON objects such as
//! `{"param": "active_power", "value": "1500"}`. The value is parsed as a
//! number (numeric strings are accepted) and checked against the device
//! before anything is written.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ModbusError, ModbusResult};

/// Setpoints a device can be asked to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlParam {
    /// Active power limit in watts.
    ActivePower,
    /// Run (1) or stop (0).
    DeviceState,
}

impl ControlParam {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActivePower => "active_power",
            Self::DeviceState => "device_state",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "active_power" => Some(Self::ActivePower),
            "device_state" => Some(Self::DeviceState),
            _ => None,
        }
    }
}

impl fmt::Display for ControlParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A checked control request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControlCommand {
    pub param: ControlParam,
    pub value: f64,
}

impl ControlCommand {
    pub fn new(param: ControlParam, value: f64, rated_power: f64) -> ModbusResult<Self> {
        if !value.is_finite() {
            return Err(ModbusError::invalid_data(format!(
                "{}: value {} is not finite",
                param, value
            )));
        }
        match param {
            ControlParam::ActivePower => {
                if value.abs() > rated_power.abs() {
                    return Err(ModbusError::invalid_data(format!(
                        "active_power {} outside +/-{}",
                        value, rated_power
                    )));
                }
            }
            ControlParam::DeviceState => {
                if value != 0.0 && value != 1.0 {
                    return Err(ModbusError::invalid_data(format!(
                        "device_state must be 0 or 1, got {}",
                        value
                    )));
                }
            }
        }
        Ok(Self { param, value })
    }

    /// Parse and check a command message for a device rated at `rated_power`.
    pub fn from_json(message: &Value, rated_power: f64) -> ModbusResult<Self> {
        let name = message
            .get("param")
            .and_then(Value::as_str)
            .ok_or_else(|| ModbusError::invalid_data("control message without param"))?;
        let param = ControlParam::from_name(name)
            .ok_or_else(|| ModbusError::invalid_data(format!("unknown control param {}", name)))?;
        let value = match message.get("value") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .ok_or_else(|| ModbusError::invalid_data(format!("{}: value is not a number", name)))?;
        Self::new(param, value, rated_power)
    }

    pub fn from_json_str(message: &str, rated_power: f64) -> ModbusResult<Self> {
        let value: Value = serde_json::from_str(message)?;
        Self::from_json(&value, rated_power)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_string_accepted() {
        let cmd = ControlCommand::from_json(&json!({"param": "active_power", "value": " 1500 "}), 5000.0)
            .unwrap();
        assert_eq!(cmd.param, ControlParam::ActivePower);
        assert_eq!(cmd.value, 1500.0);

        let cmd = ControlCommand::from_json(&json!({"param": "active_power", "value": -2000}), 5000.0)
            .unwrap();
        assert_eq!(cmd.value, -2000.0);
    }

    #[test]
    fn test_expressions_are_not_evaluated() {
        for value in ["2*1000", "__import__('os')", "", "1e400"] {
            let msg = json!({"param": "active_power", "value": value});
            assert!(ControlCommand::from_json(&msg, 5000.0).is_err(), "{}", value);
        }
        assert!(ControlCommand::from_json(&json!({"param": "active_power", "value": "NaN"}), 5000.0).is_err());
    }

    #[test]
    fn test_power_bounded_by_rating() {
        assert!(ControlCommand::from_json(&json!({"param": "active_power", "value": 5001}), 5000.0).is_err());
        assert!(ControlCommand::from_json(&json!({"param": "active_power", "value": 5000}), 5000.0).is_ok());
    }

    #[test]
    fn test_device_state() {
        assert!(ControlCommand::from_json(&json!({"param": "device_state", "value": 1}), 0.0).is_ok());
        assert!(ControlCommand::from_json(&json!({"param": "device_state", "value": "0"}), 0.0).is_ok());
        assert!(ControlCommand::from_json(&json!({"param": "device_state", "value": 2}), 0.0).is_err());
    }

    #[test]
    fn test_unknown_or_malformed() {
        assert!(ControlCommand::from_json(&json!({"param": "reactive_power", "value": 1}), 10.0).is_err());
        assert!(ControlCommand::from_json(&json!({"value": 1}), 10.0).is_err());
        assert!(ControlCommand::from_json(&json!({"param": "device_state"}), 10.0).is_err());
        assert!(ControlCommand::from_json_str("not json", 10.0).is_err());
    }
}
