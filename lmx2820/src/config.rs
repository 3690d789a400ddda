/* Board configuration
 *
 * Read from TOML; every field has a default so an empty file describes the
 * reference board:
 *
 *   defaults = "lmx2820-init.txt"
 *
 *   [planner]
 *   mode = "fractional"
 *   reference_hz = 200_000_000
 *   denominator = 16777216
 *   mash = "second"
 *
 *   [lock]
 *   interval_ms = 1
 *   debounce = 3
 *   timeout_ms = 100
 *   attempts = 3
 *
 *   [calibration]
 *   mode = "pulse"
 *   settle_us = 500
 *
 *   [spi]
 *   path = "/dev/spidev0.0"
 *
 *   [gpio]
 *   chip = "/dev/gpiochip0"
 *   band_select = [16, 19]
 * */
use serde::Deserialize;
use std::{fs, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

use crate::device::{Calibration, LockSettings};
use crate::plan::PlannerConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("Invalid config")]
    Toml(#[from] toml::de::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub planner: PlannerConfig,
    pub lock: LockConfig,
    pub calibration: CalibrationConfig,
    pub spi: SpiConfig,
    pub gpio: GpioConfig,
    /// Register image written after power-on instead of the built-in one.
    pub defaults: Option<PathBuf>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Ok(toml::from_str(&fs::read_to_string(path)?)?)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub interval_ms: u64,
    pub debounce: u32,
    pub timeout_ms: u64,
    pub attempts: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1,
            debounce: 3,
            timeout_ms: 100,
            attempts: 3,
        }
    }
}

impl From<&LockConfig> for LockSettings {
    fn from(c: &LockConfig) -> Self {
        Self {
            interval: Duration::from_millis(c.interval_ms),
            debounce: c.debounce,
            timeout: Duration::from_millis(c.timeout_ms),
            attempts: c.attempts,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationMode {
    #[default]
    Edge,
    Pulse,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub mode: CalibrationMode,
    /// Pulse mode only.
    pub settle_us: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            mode: CalibrationMode::Edge,
            settle_us: 100,
        }
    }
}

impl From<&CalibrationConfig> for Calibration {
    fn from(c: &CalibrationConfig) -> Self {
        match c.mode {
            CalibrationMode::Edge => Calibration::Edge,
            CalibrationMode::Pulse => Calibration::Pulse {
                settle: Duration::from_micros(c.settle_us),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SpiConfig {
    pub path: PathBuf,
    pub speed_hz: u32,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/spidev0.0"),
            speed_hz: 10_000_000,
        }
    }
}

/// Line offsets on `chip`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    pub chip: PathBuf,
    pub power: u32,
    pub reset: u32,
    pub rf_enable: u32,
    pub doubler: u32,
    /// SP4T select lines, least significant first.
    pub band_select: [u32; 2],
    pub lock_detect: u32,
}

#[rustfmt::skip]
impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            chip:        PathBuf::from("/dev/gpiochip0"),
            power:       5,
            reset:       12,
            rf_enable:   6,
            doubler:     13,
            band_select: [16, 19],
            lock_detect: 26,
        }
    }
}
