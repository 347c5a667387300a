//! Configuration System using Figment
//!
//! Strongly-typed configuration for the acquisition session. Configuration is
//! loaded from:
//! 1. an optional TOML file (base configuration)
//! 2. environment variables prefixed with `SCOPE_DAQ_`
//!
//! Every section has serde defaults, so an empty or missing file yields the
//! built-in instrument defaults.
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! SCOPE_DAQ_APPLICATION__LOG_LEVEL=debug
//! SCOPE_DAQ_TIMING__PREVIEW_TIMEOUT_S=120
//! SCOPE_DAQ_OPTICS__SAMPLE_PX_UM=0.1
//! ```
//!
//! # Example
//!
//! ```no_run
//! use scope_daq::config::ScopeConfig;
//!
//! fn main() -> scope_daq::error::AppResult<()> {
//!     let config = ScopeConfig::load_from(Some("scope.toml".as_ref()))?;
//!     println!("Session root: {}", config.application.session_root.display());
//!     Ok(())
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::settings::{Channel, EmissionFilter};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Tick, snoutfocus and preview-wait timing
    pub timing: TimingConfig,
    /// Inclusive bounds for every operator-editable setting
    pub limits: SettingsLimits,
    /// Initial settings snapshot
    pub defaults: SettingsDefaults,
    /// Optical constants
    pub optics: OpticsConfig,
    /// Focus and XY step sizes
    pub navigation: NavigationConfig,
    /// Software autofocus estimator
    pub autofocus: AutofocusConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Directory in which session folders are created
    pub session_root: PathBuf,
    /// Suffix of the session folder name
    pub session_tag: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "scope_daq".to_string(),
            log_level: "info".to_string(),
            session_root: PathBuf::from("."),
            session_tag: "scope_session".to_string(),
        }
    }
}

/// Timer configuration for the session event loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// UI refresh interval; also the settings-check period
    pub ui_refresh_ms: u64,
    /// Period between snoutfocus routines
    pub snoutfocus_period_s: u64,
    /// How long a run waits for a preview file before failing
    pub preview_timeout_s: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ui_refresh_ms: 33,
            snoutfocus_period_s: 300,
            preview_timeout_s: 60,
        }
    }
}

impl TimingConfig {
    /// UI refresh interval as a duration
    pub fn ui_refresh(&self) -> Duration {
        Duration::from_millis(self.ui_refresh_ms)
    }

    /// Snoutfocus period as a duration
    pub fn snoutfocus_period(&self) -> Duration {
        Duration::from_secs(self.snoutfocus_period_s)
    }

    /// Preview wait timeout as a duration
    pub fn preview_timeout(&self) -> Duration {
        Duration::from_secs(self.preview_timeout_s)
    }
}

/// Inclusive range for a numeric setting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds<T> {
    /// Smallest accepted value
    pub min: T,
    /// Largest accepted value
    pub max: T,
}

impl<T: PartialOrd + Copy> Bounds<T> {
    /// Create a new range.
    pub const fn new(min: T, max: T) -> Self {
        Self { min, max }
    }

    /// Clamp `value` into the range.
    pub fn clamp(&self, value: T) -> T {
        if value < self.min {
            self.min
        } else if value > self.max {
            self.max
        } else {
            value
        }
    }

    /// Whether `value` lies inside the range.
    pub fn contains(&self, value: T) -> bool {
        value >= self.min && value <= self.max
    }

    fn is_ordered(&self) -> bool {
        self.min <= self.max
    }
}

/// Bounds for operator-editable settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsLimits {
    /// Laser power in percent
    pub power: Bounds<f64>,
    /// Exposure per slice
    pub illumination_time_us: Bounds<u32>,
    /// Camera ROI height
    pub height_px: Bounds<u32>,
    /// Camera ROI width
    pub width_px: Bounds<u32>,
    /// Slice spacing relative to the pixel size
    pub voxel_aspect_ratio: Bounds<u32>,
    /// Light-sheet scan range
    pub scan_range_um: Bounds<u32>,
    /// Volumes captured per buffer
    pub volumes_per_buffer: Bounds<u32>,
    /// Focus piezo travel
    pub focus_z_um: Bounds<f64>,
    /// Acquisitions per run
    pub acquire_number: Bounds<u32>,
    /// Delay between acquisitions
    pub delay_s: Bounds<f64>,
}

impl Default for SettingsLimits {
    fn default() -> Self {
        Self {
            power: Bounds::new(0.0, 100.0),
            illumination_time_us: Bounds::new(100, 1_000_000),
            height_px: Bounds::new(12, 500),
            width_px: Bounds::new(60, 1000),
            voxel_aspect_ratio: Bounds::new(2, 32),
            scan_range_um: Bounds::new(1, 100),
            volumes_per_buffer: Bounds::new(1, 1000),
            focus_z_um: Bounds::new(0.0, 200.0),
            acquire_number: Bounds::new(1, 1_000_000),
            delay_s: Bounds::new(0.0, 3600.0),
        }
    }
}

/// Power and enable state of one illumination channel at startup
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelDefault {
    /// Illumination channel
    pub channel: Channel,
    /// Enabled at startup
    pub enabled: bool,
    /// Percent
    pub power: f64,
}

/// Initial settings snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsDefaults {
    /// Channel re-enabled when the operator disables every channel
    pub default_channel: Channel,
    /// Per-channel state in panel order
    pub channels: Vec<ChannelDefault>,
    /// Startup emission filter
    pub emission_filter: EmissionFilter,
    /// Exposure per slice
    pub illumination_time_us: u32,
    /// Camera ROI height
    pub height_px: u32,
    /// Camera ROI width
    pub width_px: u32,
    /// Slice spacing relative to the pixel size
    pub voxel_aspect_ratio: u32,
    /// Light-sheet scan range
    pub scan_range_um: u32,
    /// Volumes captured per buffer
    pub volumes_per_buffer: u32,
}

impl Default for SettingsDefaults {
    fn default() -> Self {
        let channels = Channel::ALL
            .iter()
            .map(|&channel| match channel {
                Channel::Led => ChannelDefault {
                    channel,
                    enabled: true,
                    power: 25.0,
                },
                _ => ChannelDefault {
                    channel,
                    enabled: false,
                    power: 5.0,
                },
            })
            .collect();
        Self {
            default_channel: Channel::Led,
            channels,
            emission_filter: EmissionFilter::Zet405_488_561_640m,
            illumination_time_us: 1000,
            height_px: 250,
            width_px: 1000,
            voxel_aspect_ratio: 32,
            scan_range_um: 50,
            volumes_per_buffer: 1,
        }
    }
}

/// Optical constants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpticsConfig {
    /// Sample-space size of one camera pixel
    pub sample_px_um: f64,
}

impl Default for OpticsConfig {
    fn default() -> Self {
        Self { sample_px_um: 0.117 }
    }
}

/// Focus nudge and XY step configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// Small focus button step
    pub focus_small_step_um: f64,
    /// Large focus button step
    pub focus_large_step_um: f64,
    /// Target of the "centre" focus button
    pub focus_center_um: f64,
    /// Default XY step as a percentage of the field of view
    pub xy_step_pct: f64,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            focus_small_step_um: 1.0,
            focus_large_step_um: 5.0,
            focus_center_um: 100.0,
            xy_step_pct: 100.0,
        }
    }
}

/// Software autofocus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutofocusConfig {
    /// Focus distance represented by one preview row
    pub um_per_preview_row: f64,
}

impl Default for AutofocusConfig {
    fn default() -> Self {
        Self {
            um_per_preview_row: 1.0,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl ScopeConfig {
    /// Load configuration from an optional TOML file plus environment overrides.
    pub fn load_from(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(ScopeConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: ScopeConfig = figment
            .merge(Env::prefixed("SCOPE_DAQ_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints that serde cannot express.
    pub fn validate(&self) -> AppResult<()> {
        if !LOG_LEVELS.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        if self.timing.ui_refresh_ms == 0 {
            return Err(DaqError::Configuration(
                "timing.ui_refresh_ms must be positive".to_string(),
            ));
        }

        let limits = &self.limits;
        let ordered = [
            ("power", limits.power.is_ordered()),
            ("illumination_time_us", limits.illumination_time_us.is_ordered()),
            ("height_px", limits.height_px.is_ordered()),
            ("width_px", limits.width_px.is_ordered()),
            ("voxel_aspect_ratio", limits.voxel_aspect_ratio.is_ordered()),
            ("scan_range_um", limits.scan_range_um.is_ordered()),
            ("volumes_per_buffer", limits.volumes_per_buffer.is_ordered()),
            ("focus_z_um", limits.focus_z_um.is_ordered()),
            ("acquire_number", limits.acquire_number.is_ordered()),
            ("delay_s", limits.delay_s.is_ordered()),
        ];
        if let Some((name, _)) = ordered.iter().find(|(_, ok)| !ok) {
            return Err(DaqError::Configuration(format!(
                "limits.{} has min greater than max",
                name
            )));
        }
        if limits.volumes_per_buffer.min == 0 {
            return Err(DaqError::Configuration(
                "limits.volumes_per_buffer must start at 1".to_string(),
            ));
        }

        let d = &self.defaults;
        let in_range = [
            ("illumination_time_us", limits.illumination_time_us.contains(d.illumination_time_us)),
            ("height_px", limits.height_px.contains(d.height_px)),
            ("width_px", limits.width_px.contains(d.width_px)),
            ("voxel_aspect_ratio", limits.voxel_aspect_ratio.contains(d.voxel_aspect_ratio)),
            ("scan_range_um", limits.scan_range_um.contains(d.scan_range_um)),
            ("volumes_per_buffer", limits.volumes_per_buffer.contains(d.volumes_per_buffer)),
        ];
        if let Some((name, _)) = in_range.iter().find(|(_, ok)| !ok) {
            return Err(DaqError::Configuration(format!(
                "defaults.{} is outside limits.{}",
                name, name
            )));
        }
        if let Some(bad) = d.channels.iter().find(|c| !limits.power.contains(c.power)) {
            return Err(DaqError::Configuration(format!(
                "default power {} for channel {} is outside limits.power",
                bad.power, bad.channel
            )));
        }
        if !limits.focus_z_um.contains(self.navigation.focus_center_um) {
            return Err(DaqError::Configuration(
                "navigation.focus_center_um is outside limits.focus_z_um".to_string(),
            ));
        }
        if self.optics.sample_px_um <= 0.0 {
            return Err(DaqError::Configuration(
                "optics.sample_px_um must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    #[serial]
    fn test_defaults_without_file() {
        let config = ScopeConfig::load_from(None).unwrap();
        assert_eq!(config.timing.ui_refresh_ms, 33);
        assert_eq!(config.timing.snoutfocus_period_s, 300);
        assert_eq!(config.defaults.height_px, 250);
        assert_eq!(config.defaults.default_channel, Channel::Led);
        assert_eq!(config.defaults.channels.len(), 5);
    }

    #[test]
    #[serial]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[timing]
preview_timeout_s = 5

[optics]
sample_px_um = 0.2
"#
        )
        .unwrap();

        let config = ScopeConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.timing.preview_timeout(), Duration::from_secs(5));
        assert_eq!(config.timing.ui_refresh_ms, 33);
        assert!((config.optics.sample_px_um - 0.2).abs() < 1e-12);
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("SCOPE_DAQ_TIMING__SNOUTFOCUS_PERIOD_S", "60");
        let config = ScopeConfig::load_from(None);
        std::env::remove_var("SCOPE_DAQ_TIMING__SNOUTFOCUS_PERIOD_S");
        assert_eq!(config.unwrap().timing.snoutfocus_period_s, 60);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = ScopeConfig::default();
        config.application.log_level = "loud".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let mut config = ScopeConfig::default();
        config.limits.height_px = Bounds::new(500, 12);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_outside_bounds_rejected() {
        let mut config = ScopeConfig::default();
        config.defaults.width_px = 5000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("width_px"));
    }

    #[test]
    fn test_bounds_clamp() {
        let b = Bounds::new(12u32, 500);
        assert_eq!(b.clamp(3), 12);
        assert_eq!(b.clamp(250), 250);
        assert_eq!(b.clamp(900), 500);
    }
}
