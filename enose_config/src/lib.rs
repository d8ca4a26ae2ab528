//! Typed configuration for the e-nose supervisory controller.
//!
//! Two on-disk artifacts live here:
//! - the service config (TOML), loaded once at startup;
//! - the load-cell calibration side-file (JSON), read at startup and
//!   rewritten whenever the calibration wizard completes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("calibration file error: {0}")]
    Calibration(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActuatorCfg {
    /// Motion firmware host (Moonraker-compatible endpoint).
    pub host: String,
    pub port: u16,
    /// Load-cell object name as configured on the firmware side.
    #[serde(default = "default_load_cell_name")]
    pub load_cell_name: String,
}

fn default_load_cell_name() -> String {
    "bottle_cell".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorCfg {
    /// Serial device path, e.g. /dev/ttyUSB0.
    pub device: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

fn default_baud() -> u32 {
    115_200
}

/// Load-cell filtering, detection and calibration parameters.
///
/// The calibration fields double as the persisted side-file schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadCellCfg {
    pub overflow_threshold: f64,
    pub drain_complete_margin: f64,
    pub stable_stddev_threshold: f64,
    pub trend_threshold: f64,
    pub max_bottle_weight: f64,
    pub overflow_margin: f64,
    pub drain_stable_duration: f64,
    pub filter_window_size: usize,
    pub invert_reading: bool,
    /// Motor distance (mm) to expected measured weight (g): slope.
    pub pump_mm_to_ml: f64,
    /// Motor distance (mm) to expected measured weight (g): offset.
    pub pump_mm_offset: f64,
    /// Measured weight to physical weight: slope.
    pub weight_scale: f64,
    /// Measured weight to physical weight: offset.
    pub weight_offset: f64,
}

impl Default for LoadCellCfg {
    fn default() -> Self {
        Self {
            overflow_threshold: 400.0,
            drain_complete_margin: 10.0,
            stable_stddev_threshold: 2.0,
            trend_threshold: 5.0,
            max_bottle_weight: 500.0,
            overflow_margin: 50.0,
            drain_stable_duration: 2.0,
            filter_window_size: 10,
            invert_reading: true,
            pump_mm_to_ml: 0.001,
            pump_mm_offset: 0.0,
            weight_scale: 1.0,
            weight_offset: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingCfg {
    /// Path to a .log file (JSON lines); console only when absent.
    pub file: Option<String>,
    /// "error" | "warn" | "info" | "debug" | "trace"
    pub level: Option<String>,
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub actuator: ActuatorCfg,
    pub sensor: Option<SensorCfg>,
    #[serde(default)]
    pub load_cell: LoadCellCfg,
    #[serde(default)]
    pub logging: LoggingCfg,
}

impl Config {
    /// Non-panicking sanity checks over parsed values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.actuator.host.is_empty() {
            return Err(ConfigError::Invalid("actuator.host must not be empty"));
        }
        if self.actuator.port == 0 {
            return Err(ConfigError::Invalid("actuator.port must be non-zero"));
        }
        if let Some(sensor) = &self.sensor {
            if sensor.device.is_empty() {
                return Err(ConfigError::Invalid("sensor.device must not be empty"));
            }
            if sensor.baud == 0 {
                return Err(ConfigError::Invalid("sensor.baud must be non-zero"));
            }
        }
        let lc = &self.load_cell;
        if lc.filter_window_size == 0 {
            return Err(ConfigError::Invalid("load_cell.filter_window_size must be >= 1"));
        }
        if lc.drain_stable_duration < 0.0 {
            return Err(ConfigError::Invalid("load_cell.drain_stable_duration must be >= 0"));
        }
        if lc.max_bottle_weight <= 0.0 {
            return Err(ConfigError::Invalid("load_cell.max_bottle_weight must be > 0"));
        }
        if lc.overflow_margin < 0.0 {
            return Err(ConfigError::Invalid("load_cell.overflow_margin must be >= 0"));
        }
        if lc.pump_mm_to_ml == 0.0 || !lc.pump_mm_to_ml.is_finite() {
            return Err(ConfigError::Invalid("load_cell.pump_mm_to_ml must be finite and non-zero"));
        }
        if lc.weight_scale == 0.0 || !lc.weight_scale.is_finite() {
            return Err(ConfigError::Invalid("load_cell.weight_scale must be finite and non-zero"));
        }
        Ok(())
    }
}

pub fn load_toml(s: &str) -> Result<Config, ConfigError> {
    let cfg = toml::from_str::<Config>(s)?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let cfg = load_toml(&text)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Read the persisted load-cell calibration. A missing file yields defaults
/// so a fresh install starts with the identity model.
pub fn load_calibration_json(path: &Path) -> Result<LoadCellCfg, ConfigError> {
    if !path.exists() {
        return Ok(LoadCellCfg::default());
    }
    let text = std::fs::read_to_string(path)?;
    let cfg = serde_json::from_str::<LoadCellCfg>(&text)?;
    Ok(cfg)
}

pub fn save_calibration_json(path: &Path, cfg: &LoadCellCfg) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(cfg)?;
    std::fs::write(path, text)?;
    Ok(())
}
