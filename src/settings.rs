//! Shared settings for the microscope CLI and demos.
//! Persisted in the platform-specific config directory via `directories::ProjectDirs`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::calibration::{CalibrationConfig, TransformMatrix};
use crate::servo::{ServoConfig, DEFAULT_UM_PER_PIXEL};
use crate::stage::{TransportMode, DEFAULT_BAUD, DEFAULT_TTY, DEFAULT_XYZ_BOUND};

/// Application settings that can be saved and loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Serial device of the stage controller
    pub tty: String,
    /// Serial baud rate
    pub baud: u32,
    /// Use the emulated stage instead of the serial port
    pub emulate: bool,
    /// Travel bound on every axis, in microsteps
    pub xyz_bound: i64,
    /// Centring tolerance in microns
    pub servo_tolerance: f64,
    /// Camera pixel size in the sample plane, in microns
    pub servo_um_per_pixel: f64,
    /// Maximum centring moves
    pub servo_max_iterations: u32,
    /// Settle time after a centring move, in milliseconds
    pub servo_settle_ms: u64,
    /// Half side of the calibration square, in microsteps
    pub calibration_half_width: i64,
    /// Settle time after a calibration move, in milliseconds
    pub calibration_settle_ms: u64,
    /// Pixel-to-microstep transform
    pub transform: TransformMatrix,
    /// Image file served as the camera frame (empty for a blank frame)
    pub camera_image: String,
    /// Datafile path (empty for the dated default)
    pub datafile: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            tty: DEFAULT_TTY.to_string(),
            baud: DEFAULT_BAUD,
            emulate: false,
            xyz_bound: DEFAULT_XYZ_BOUND,
            servo_tolerance: 1.0,
            servo_um_per_pixel: DEFAULT_UM_PER_PIXEL,
            servo_max_iterations: 10,
            servo_settle_ms: 500,
            calibration_half_width: 128,
            calibration_settle_ms: 1000,
            transform: TransformMatrix::default(),
            camera_image: String::new(),
            datafile: String::new(),
        }
    }
}

impl AppSettings {
    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "openflexure", "microscope-stage")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the settings file path.
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.json"))
    }

    /// Load settings from the config file.
    pub fn load() -> Self {
        let defaults = Self::default();

        let mut loaded: Self = Self::settings_path()
            .and_then(|path| fs::read_to_string(&path).ok())
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();

        // Backfill fields that older files may have zeroed
        if loaded.tty.is_empty() {
            loaded.tty = defaults.tty;
        }
        if loaded.baud == 0 {
            loaded.baud = defaults.baud;
        }
        if loaded.xyz_bound <= 0 {
            loaded.xyz_bound = defaults.xyz_bound;
        }

        loaded
    }

    /// Save settings to the config file.
    pub fn save(&self) -> Result<(), String> {
        let dir = Self::config_dir().ok_or("Cannot determine config directory")?;

        fs::create_dir_all(&dir)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;

        let path = dir.join("settings.json");
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        fs::write(&path, content)
            .map_err(|e| format!("Failed to write settings file: {}", e))?;

        Ok(())
    }

    /// Override fields from environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Override fields from `lookup`. Unparseable values are ignored with a
    /// warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(tty) = lookup("STAGE_TTY") {
            self.tty = tty;
        }
        if let Some(image) = lookup("CAMERA_IMAGE") {
            self.camera_image = image;
        }
        if let Some(path) = lookup("DATAFILE") {
            self.datafile = path;
        }
        override_parsed(&lookup, "STAGE_BAUD", &mut self.baud);
        override_parsed(&lookup, "SERVO_TOLERANCE", &mut self.servo_tolerance);
        override_parsed(&lookup, "SERVO_UM_PER_PIXEL", &mut self.servo_um_per_pixel);
        override_parsed(&lookup, "SERVO_MAX_ITERATIONS", &mut self.servo_max_iterations);
        override_parsed(&lookup, "CALIBRATION_HALF_WIDTH", &mut self.calibration_half_width);
        if let Some(value) = lookup("STAGE_EMULATE") {
            self.emulate = matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
    }

    pub fn transport_mode(&self) -> TransportMode {
        if self.emulate {
            TransportMode::Emulated
        } else {
            TransportMode::Serial {
                path: self.tty.clone(),
                baud: self.baud,
            }
        }
    }

    pub fn servo_config(&self) -> ServoConfig {
        ServoConfig::default()
            .with_tolerance(self.servo_tolerance)
            .with_um_per_pixel(self.servo_um_per_pixel)
            .with_max_iterations(self.servo_max_iterations)
            .with_settle(Duration::from_millis(self.servo_settle_ms))
    }

    pub fn calibration_config(&self) -> CalibrationConfig {
        CalibrationConfig::default()
            .with_half_width(self.calibration_half_width)
            .with_settle(Duration::from_millis(self.calibration_settle_ms))
    }
}

fn override_parsed<V: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    field: &mut V,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *field = value,
        Err(_) => tracing::warn!("Ignoring {}={:?}: not a valid value", key, raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = AppSettings::default();
        assert_eq!(settings.tty, "/dev/ttyACM0");
        assert_eq!(settings.xyz_bound, 5000);
        assert_eq!(settings.transform, TransformMatrix::default());
        assert_eq!(
            settings.transport_mode(),
            TransportMode::Serial {
                path: "/dev/ttyACM0".to_string(),
                baud: 9600
            }
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: AppSettings = serde_json::from_str(r#"{"emulate": true}"#).unwrap();
        assert!(settings.emulate);
        assert_eq!(settings.servo_max_iterations, 10);
        assert_eq!(settings.transport_mode(), TransportMode::Emulated);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("STAGE_TTY", "/dev/ttyUSB1"),
            ("STAGE_EMULATE", "yes"),
            ("SERVO_TOLERANCE", "0.5"),
            ("SERVO_MAX_ITERATIONS", "lots"),
            ("CALIBRATION_HALF_WIDTH", "256"),
        ]
        .into_iter()
        .collect();

        let mut settings = AppSettings::default();
        settings.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(settings.tty, "/dev/ttyUSB1");
        assert!(settings.emulate);
        assert_eq!(settings.servo_tolerance, 0.5);
        assert_eq!(settings.servo_max_iterations, 10);
        assert_eq!(settings.calibration_config().half_width, 256);
        assert_eq!(settings.servo_config().tolerance, 0.5);
        assert_eq!(settings.servo_config().um_per_pixel, DEFAULT_UM_PER_PIXEL);
    }
}
