//! Cumulative energy plausibility filter
//!
//! Energy counters only move forward and only by a bounded amount between
//! reports. A reading is accepted when
//! `new >= logged && (logged == 0 || new - logged <= threshold)`;
//! otherwise the last accepted value is reported again. Accepted values are
//! persisted as a flat JSON object `{device_id: kWh}` so the filter survives
//! restarts.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::constants::ENERGY_JUMP_THRESHOLD;
use crate::error::ModbusResult;

#[derive(Debug, Clone)]
pub struct EnergyLedger {
    path: Option<PathBuf>,
    threshold: f64,
    logged: BTreeMap<String, f64>,
    dirty: bool,
}

impl EnergyLedger {
    /// A ledger that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            threshold: ENERGY_JUMP_THRESHOLD,
            logged: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Load the ledger at `path`. A missing or unreadable file starts empty.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let logged = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("energy log {} unreadable, starting empty: {}", path.display(), e);
                BTreeMap::new()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!("energy log {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };
        Self {
            path: Some(path),
            threshold: ENERGY_JUMP_THRESHOLD,
            logged,
            dirty: false,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Last accepted reading, 0 when none.
    pub fn logged(&self, device_id: &str) -> f64 {
        self.logged.get(device_id).copied().unwrap_or(0.0)
    }

    pub fn is_plausible(&self, logged: f64, reading: f64) -> bool {
        reading >= logged && (logged == 0.0 || reading - logged <= self.threshold)
    }

    /// Filter one reading. Returns the value to report, `None` while nothing
    /// positive has been accepted yet.
    pub fn record(&mut self, device_id: &str, reading: f64) -> Option<f64> {
        let logged = self.logged(device_id);
        let accepted = if reading.is_finite() && self.is_plausible(logged, reading) {
            if reading != logged {
                self.logged.insert(device_id.to_string(), reading);
                self.dirty = true;
            }
            reading
        } else {
            debug!(
                "{}: energy reading {} rejected, keeping {}",
                device_id, reading, logged
            );
            logged
        };
        (accepted > 0.0).then_some(accepted)
    }

    /// Write accepted values back to disk if anything changed.
    pub fn save(&mut self) -> ModbusResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, serde_json::to_vec(&self.logged)?)?;
        fs::rename(&staging, path)?;
        self.dirty = false;
        Ok(())
    }

    /// Filter and persist in one step.
    pub fn record_and_save(&mut self, device_id: &str, reading: f64) -> ModbusResult<Option<f64>> {
        let value = self.record(device_id, reading);
        self.save()?;
        Ok(value)
    }
}
