/// Config loader - host configuration from `plate_scanner.yaml`
/// 
/// Single source of truth: every setting comes from the YAML host block of the
/// current hostname, found under the `RaspberryPi`, `Ubuntu` or `macOS`
/// section. Missing or invalid required keys fail loudly.

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::axis::{AxisConfig, Direction};
use crate::calibration::SequenceMode;
use crate::camera::CameraSettings;
use crate::image_metrics::AnalysisSettings;
use crate::ramp::{RampLevel, RampProfile};

pub const YAML_NAME: &str = "plate_scanner.yaml";
const OS_SECTIONS: [&str; 3] = ["RaspberryPi", "Ubuntu", "macOS"];
/// BCM numbering of the 40-pin header.
const MAX_PIN: u32 = 27;

fn default_steady_hz() -> f64 {
    1000.0
}

fn default_home_timeout_s() -> f64 {
    20.0
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_home_direction() -> Direction {
    Direction::Reverse
}

/// Mechanical model used when the host runs simulated.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SimAxisSettings {
    /// Carriage position in steps from the home switch at start-up.
    pub start: i64,
    /// Far switch position, none for an open end.
    pub travel: Option<i64>,
    /// Wall-clock pacing, 1.0 is real time and 0 disables pacing.
    pub time_scale: f64,
}

impl Default for SimAxisSettings {
    fn default() -> Self {
        Self { start: 2000, travel: Some(20_000), time_scale: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AxisSettings {
    pub name: String,
    /// Driver enable, low active.
    #[serde(rename = "NEN_PIN")]
    pub enable_pin: u32,
    pub dir_pin: u32,
    #[serde(rename = "STP_PIN")]
    pub step_pin: u32,
    /// Home limit switch.
    #[serde(rename = "LIM_PIN", default)]
    pub limit_pin: Option<u32>,
    /// End-of-travel switch opposite the home switch.
    #[serde(default)]
    pub safety_pin: Option<u32>,
    #[serde(default)]
    pub invert_direction: bool,
    #[serde(default = "default_steady_hz")]
    pub steady_hz: f64,
    #[serde(rename = "HOME_TIMEOUT_S", default = "default_home_timeout_s")]
    pub home_timeout_s: f64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_home_direction")]
    pub home_direction: Direction,
    #[serde(default)]
    pub sim: SimAxisSettings,
}

impl AxisSettings {
    pub fn pins(&self) -> Vec<u32> {
        let mut pins = vec![self.enable_pin, self.dir_pin, self.step_pin];
        pins.extend(self.limit_pin);
        pins.extend(self.safety_pin);
        pins
    }

    pub fn axis_config(&self, ramp: &RampProfile) -> AxisConfig {
        AxisConfig {
            name: self.name.clone(),
            ramp: ramp.clone(),
            steady_hz: self.steady_hz,
            home_direction: self.home_direction,
            home_timeout: Duration::from_secs_f64(self.home_timeout_s),
            debounce: Duration::from_millis(self.debounce_ms),
            home_pin: self.limit_pin,
            far_pin: self.safety_pin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SigmoidSettings {
    pub levels: usize,
    pub min_hz: f64,
    pub max_hz: f64,
    pub steps_per_level: u32,
    pub steepness: f64,
}

/// Either an explicit `[[hz, steps], ...]` table or sigmoid parameters;
/// neither selects the built-in rig table.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RampSettings {
    pub table: Option<Vec<(f64, u32)>>,
    pub sigmoid: Option<SigmoidSettings>,
}

impl RampSettings {
    pub fn profile(&self) -> Result<RampProfile> {
        match (&self.table, &self.sigmoid) {
            (Some(_), Some(_)) => Err(anyhow!("RAMP must set either TABLE or SIGMOID, not both")),
            (Some(table), None) => {
                RampProfile::from_table(table.iter().map(|&(hz, steps)| RampLevel::new(hz, steps)).collect())
            }
            (None, Some(s)) => RampProfile::sigmoid(s.levels, s.min_hz, s.max_hz, s.steps_per_level, s.steepness),
            (None, None) => Ok(RampProfile::default_table()),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("calibration_data")
}

fn default_app_name() -> String {
    "platescanner".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct CalibrationSettings {
    pub log_dir: PathBuf,
    pub app_name: String,
    pub mode: SequenceMode,
    /// Absolute step coordinates visited after homing.
    pub points: Vec<Vec<i64>>,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            app_name: default_app_name(),
            mode: SequenceMode::Sequential,
            points: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ScannerSettings {
    #[serde(default)]
    pub gpio_enabled: bool,
    /// e.g. `/dev/gpiochip0`; searched when absent.
    #[serde(default)]
    pub gpio_chip: Option<String>,
    #[serde(default)]
    pub simulate: bool,
    pub axes: Vec<AxisSettings>,
    #[serde(default)]
    pub ramp: RampSettings,
    #[serde(default)]
    pub camera: CameraSettings,
    #[serde(default)]
    pub calibration: CalibrationSettings,
    #[serde(default)]
    pub image: AnalysisSettings,
}

impl ScannerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.gpio_enabled && self.simulate {
            return Err(anyhow!("GPIO_ENABLED and SIMULATE cannot both be true"));
        }
        if self.axes.is_empty() {
            return Err(anyhow!("AXES must list at least one axis"));
        }

        let mut names = HashSet::new();
        let mut pins = HashSet::new();
        for axis in &self.axes {
            if !names.insert(axis.name.as_str()) {
                return Err(anyhow!("Axis name '{}' is used twice", axis.name));
            }
            for pin in axis.pins() {
                if pin > MAX_PIN {
                    return Err(anyhow!("Axis {}: pin {} is outside 0..={}", axis.name, pin, MAX_PIN));
                }
                if !pins.insert(pin) {
                    return Err(anyhow!("Axis {}: pin {} is assigned twice", axis.name, pin));
                }
            }
            if !(axis.steady_hz.is_finite() && axis.steady_hz > 0.0) {
                return Err(anyhow!("Axis {}: STEADY_HZ must be positive (got {})", axis.name, axis.steady_hz));
            }
            if !(axis.home_timeout_s.is_finite() && axis.home_timeout_s > 0.0) {
                return Err(anyhow!(
                    "Axis {}: HOME_TIMEOUT_S must be positive (got {})",
                    axis.name,
                    axis.home_timeout_s
                ));
            }
            if !(axis.sim.time_scale.is_finite() && axis.sim.time_scale >= 0.0) {
                return Err(anyhow!("Axis {}: SIM.TIME_SCALE must not be negative", axis.name));
            }
        }

        self.ramp.profile().context("Invalid RAMP")?;
        self.image.validate().context("Invalid IMAGE settings")?;
        self.camera.validate().context("Invalid CAMERA settings")?;
        for point in &self.calibration.points {
            if point.len() != self.axes.len() {
                return Err(anyhow!(
                    "Calibration point {:?} needs {} coordinates, one per axis",
                    point,
                    self.axes.len()
                ));
            }
        }
        Ok(())
    }

    pub fn axis(&self, name: &str) -> Option<&AxisSettings> {
        self.axes.iter().find(|a| a.name == name)
    }
}

/// `PLATE_SCANNER_YAML` if set, else the YAML next to `Cargo.toml`.
pub fn yaml_path() -> PathBuf {
    let _ = dotenv();
    match env::var("PLATE_SCANNER_YAML") {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(YAML_NAME),
    }
}

/// `PLATE_SCANNER_HOST` if set, else the machine's hostname.
pub fn current_hostname() -> String {
    let _ = dotenv();
    match env::var("PLATE_SCANNER_HOST") {
        Ok(host) if !host.trim().is_empty() => host,
        _ => gethostname().to_string_lossy().to_string(),
    }
}

fn find_host_block<'a>(yaml: &'a serde_yaml::Value, hostname: &str) -> Option<&'a serde_yaml::Mapping> {
    for os_key in OS_SECTIONS.iter() {
        if let Some(os_map) = yaml.get(*os_key).and_then(|v| v.as_mapping()) {
            for (k, v) in os_map.iter() {
                if k.as_str() == Some(hostname) {
                    return v.as_mapping();
                }
            }
        }
    }
    None
}

/// Parse and validate the host block of `hostname` from YAML text.
pub fn parse_scanner_settings(text: &str, hostname: &str) -> Result<ScannerSettings> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(text)?;
    let block = find_host_block(&yaml, hostname)
        .ok_or_else(|| anyhow!("No host entry for '{}' in {}", hostname, YAML_NAME))?;
    let settings: ScannerSettings = serde_yaml::from_value(serde_yaml::Value::Mapping(block.clone()))
        .map_err(|e| anyhow!("Invalid host entry for '{}' in {}: {}", hostname, YAML_NAME, e))?;
    settings
        .validate()
        .with_context(|| format!("Invalid host entry for '{}' in {}", hostname, YAML_NAME))?;
    Ok(settings)
}

pub fn load_scanner_settings_from(path: &Path, hostname: &str) -> Result<ScannerSettings> {
    let file = File::open(path).map_err(|e| anyhow!("Missing required {} at {:?}: {}", YAML_NAME, path, e))?;
    let text = std::io::read_to_string(file).with_context(|| format!("Failed to read {:?}", path))?;
    let settings = parse_scanner_settings(&text, hostname)?;
    log::info!(
        target: "config_loader",
        "{}: {} axes, gpio={}, simulate={} (from {:?})",
        hostname,
        settings.axes.len(),
        settings.gpio_enabled,
        settings.simulate,
        path
    );
    Ok(settings)
}

/// Load settings for `hostname` from the default YAML location.
pub fn load_scanner_settings(hostname: &str) -> Result<ScannerSettings> {
    load_scanner_settings_from(&yaml_path(), hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
RaspberryPi:
  wormscanner-1:
    GPIO_ENABLED: true
    GPIO_CHIP: /dev/gpiochip0
    AXES:
      - NAME: X
        NEN_PIN: 17
        DIR_PIN: 27
        STP_PIN: 22
        LIM_PIN: 5
      - NAME: Y
        NEN_PIN: 23
        DIR_PIN: 24
        STP_PIN: 25
        LIM_PIN: 6
        SAFETY_PIN: 13
        HOME_DIRECTION: forward
        STEADY_HZ: 800
    RAMP:
      TABLE: [[7, 0], [20, 0], [57, 1], [154, 1], [354, 1]]
    CALIBRATION:
      MODE: parallel
      POINTS:
        - [1000, 1500]
Ubuntu:
  devbox:
    SIMULATE: true
    AXES:
      - NAME: X
        NEN_PIN: 1
        DIR_PIN: 2
        STP_PIN: 3
"#;

    #[test]
    fn pi_host_block_is_parsed() {
        let settings = parse_scanner_settings(YAML, "wormscanner-1").unwrap();
        assert!(settings.gpio_enabled);
        assert_eq!(settings.gpio_chip.as_deref(), Some("/dev/gpiochip0"));
        assert_eq!(settings.axes.len(), 2);

        let y = settings.axis("Y").unwrap();
        assert_eq!(y.pins(), vec![23, 24, 25, 6, 13]);
        assert_eq!(y.home_direction, Direction::Forward);
        assert_eq!(y.steady_hz, 800.0);
        assert_eq!(y.debounce_ms, 300);

        let profile = settings.ramp.profile().unwrap();
        assert_eq!(profile.ramp_steps(), 3);
        let config = y.axis_config(&profile);
        assert_eq!(config.home_timeout, Duration::from_secs(20));
        assert_eq!((config.home_pin, config.far_pin), (Some(6), Some(13)));

        assert_eq!(settings.calibration.mode, SequenceMode::Parallel);
        assert_eq!(settings.calibration.points, vec![vec![1000, 1500]]);
        assert_eq!(settings.calibration.log_dir, PathBuf::from("calibration_data"));
    }

    #[test]
    fn defaults_fill_a_minimal_block() {
        let settings = parse_scanner_settings(YAML, "devbox").unwrap();
        assert!(settings.simulate);
        assert_eq!(settings.image, AnalysisSettings::default());
        assert_eq!(settings.axes[0].sim, SimAxisSettings::default());
        assert_eq!(settings.ramp.profile().unwrap(), RampProfile::default_table());
    }

    #[test]
    fn unknown_host_fails_loudly() {
        let err = parse_scanner_settings(YAML, "nobody").unwrap_err();
        assert!(err.to_string().contains("No host entry for 'nobody'"));
    }

    fn with_axes(axes: &str) -> String {
        format!("macOS:\n  mac:\n    SIMULATE: true\n    AXES:\n{}", axes)
    }

    #[test]
    fn pin_checks() {
        let duplicate = with_axes(
            "      - {NAME: X, NEN_PIN: 1, DIR_PIN: 2, STP_PIN: 3}\n      - {NAME: Y, NEN_PIN: 4, DIR_PIN: 2, STP_PIN: 5}\n",
        );
        let err = parse_scanner_settings(&duplicate, "mac").unwrap_err();
        assert!(format!("{:#}", err).contains("pin 2 is assigned twice"));

        let out_of_range = with_axes("      - {NAME: X, NEN_PIN: 1, DIR_PIN: 2, STP_PIN: 40}\n");
        assert!(format!("{:#}", parse_scanner_settings(&out_of_range, "mac").unwrap_err()).contains("outside"));
    }

    #[test]
    fn rates_and_points_are_checked() {
        let bad_rate = with_axes("      - {NAME: X, NEN_PIN: 1, DIR_PIN: 2, STP_PIN: 3, STEADY_HZ: 0}\n");
        assert!(parse_scanner_settings(&bad_rate, "mac").is_err());

        let bad_timeout = with_axes("      - {NAME: X, NEN_PIN: 1, DIR_PIN: 2, STP_PIN: 3, HOME_TIMEOUT_S: -1}\n");
        assert!(parse_scanner_settings(&bad_timeout, "mac").is_err());

        let bad_point = format!(
            "{}    CALIBRATION:\n      POINTS: [[1, 2]]\n",
            with_axes("      - {NAME: X, NEN_PIN: 1, DIR_PIN: 2, STP_PIN: 3}\n")
        );
        assert!(parse_scanner_settings(&bad_point, "mac").is_err());
    }

    #[test]
    fn ramp_table_and_sigmoid_are_exclusive() {
        let ramp = RampSettings {
            table: Some(vec![(100.0, 1)]),
            sigmoid: Some(SigmoidSettings { levels: 5, min_hz: 10.0, max_hz: 900.0, steps_per_level: 1, steepness: 1.0 }),
        };
        assert!(ramp.profile().is_err());
    }

    #[test]
    fn shipped_yaml_parses_for_every_host() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(YAML_NAME);
        let text = std::fs::read_to_string(&path).unwrap();
        let yaml: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        let mut hosts = 0;
        for os_key in OS_SECTIONS {
            if let Some(map) = yaml.get(os_key).and_then(|v| v.as_mapping()) {
                for host in map.keys().filter_map(|k| k.as_str()) {
                    parse_scanner_settings(&text, host).unwrap();
                    hosts += 1;
                }
            }
        }
        assert!(hosts > 0);
    }
}
