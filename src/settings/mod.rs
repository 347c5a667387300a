//! Instrument settings: the desired snapshot and its reconciliation.
//!
//! The [`SettingsModel`] holds what the operator wants the instrument to do.
//! It is the only writer of the desired [`SettingsSnapshot`], which it
//! publishes through an [`Observable`] so any UI surface can follow it. The
//! [`reconcile`] submodule compares the desired snapshot against what was last
//! applied and produces sparse change-sets.
//!
//! Operator input is clamped to the configured [`SettingsLimits`]; disabling
//! the last illumination channel silently re-enables the default channel.

pub mod estimates;
pub mod metadata;
pub mod reconcile;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::config::{ScopeConfig, SettingsLimits};
use crate::observable::Observable;

pub use metadata::RestoredSettings;
pub use reconcile::{diff, AppliedSettings, Change, ChangeSet, ReconcileOptions, Reconciler};

// =============================================================================
// Illumination and emission
// =============================================================================

/// Illumination source, in panel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Transmitted-light LED
    #[serde(rename = "LED")]
    Led,
    /// 405 nm laser
    #[serde(rename = "405")]
    L405,
    /// 488 nm laser
    #[serde(rename = "488")]
    L488,
    /// 561 nm laser
    #[serde(rename = "561")]
    L561,
    /// 640 nm laser
    #[serde(rename = "640")]
    L640,
}

impl Channel {
    /// Every channel, in the order the hardware expects them.
    pub const ALL: [Channel; 5] = [
        Channel::Led,
        Channel::L405,
        Channel::L488,
        Channel::L561,
        Channel::L640,
    ];

    /// Identifier sent to the hardware collaborator.
    pub fn label(self) -> &'static str {
        match self {
            Channel::Led => "LED",
            Channel::L405 => "405",
            Channel::L488 => "488",
            Channel::L561 => "561",
            Channel::L640 => "640",
        }
    }

    fn index(self) -> usize {
        match self {
            Channel::Led => 0,
            Channel::L405 => 1,
            Channel::L488 => 2,
            Channel::L561 => 3,
            Channel::L640 => 4,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .iter()
            .copied()
            .find(|c| c.label() == s.trim())
            .ok_or_else(|| format!("unknown channel '{}'", s))
    }
}

/// Emission filter wheel position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmissionFilter {
    /// Blocks all emission
    Shutter,
    /// Empty slot
    Open,
    #[serde(rename = "ET450/50M")]
    Et450_50m,
    #[serde(rename = "ET525/50M")]
    Et525_50m,
    #[serde(rename = "ET600/50M")]
    Et600_50m,
    #[serde(rename = "ET690/50M")]
    Et690_50m,
    #[serde(rename = "ZET405/488/561/640m")]
    Zet405_488_561_640m,
    #[serde(rename = "LP02-488RU")]
    Lp02_488ru,
    #[serde(rename = "LP02-561RU")]
    Lp02_561ru,
    /// Slot with no filter fitted
    #[serde(rename = "(unused)")]
    Unused,
}

impl EmissionFilter {
    /// Wheel order.
    pub const ALL: [EmissionFilter; 10] = [
        EmissionFilter::Shutter,
        EmissionFilter::Open,
        EmissionFilter::Et450_50m,
        EmissionFilter::Et525_50m,
        EmissionFilter::Et600_50m,
        EmissionFilter::Et690_50m,
        EmissionFilter::Zet405_488_561_640m,
        EmissionFilter::Lp02_488ru,
        EmissionFilter::Lp02_561ru,
        EmissionFilter::Unused,
    ];

    /// Name as printed on the filter and in metadata files.
    pub fn label(self) -> &'static str {
        match self {
            EmissionFilter::Shutter => "Shutter",
            EmissionFilter::Open => "Open",
            EmissionFilter::Et450_50m => "ET450/50M",
            EmissionFilter::Et525_50m => "ET525/50M",
            EmissionFilter::Et600_50m => "ET600/50M",
            EmissionFilter::Et690_50m => "ET690/50M",
            EmissionFilter::Zet405_488_561_640m => "ZET405/488/561/640m",
            EmissionFilter::Lp02_488ru => "LP02-488RU",
            EmissionFilter::Lp02_561ru => "LP02-561RU",
            EmissionFilter::Unused => "(unused)",
        }
    }
}

impl fmt::Display for EmissionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EmissionFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EmissionFilter::ALL
            .iter()
            .copied()
            .find(|e| e.label() == s.trim())
            .ok_or_else(|| format!("unknown emission filter '{}'", s))
    }
}

// =============================================================================
// Motion targets
// =============================================================================

/// Whether a motion target is an offset or a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionFrame {
    /// Offset from the current position
    Relative,
    /// Position in the instrument frame
    Absolute,
}

/// A focus or stage target tagged with its frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Motion<V> {
    /// Target or offset
    pub value: V,
    /// How `value` is read
    pub frame: MotionFrame,
}

impl<V> Motion<V> {
    /// Target in the instrument frame.
    pub fn absolute(value: V) -> Self {
        Self {
            value,
            frame: MotionFrame::Absolute,
        }
    }

    /// Offset from wherever the instrument is.
    pub fn relative(value: V) -> Self {
        Self {
            value,
            frame: MotionFrame::Relative,
        }
    }

    /// Whether this is an absolute target.
    ///
    /// ```
    /// use scope_daq::settings::Motion;
    ///
    /// assert!(Motion::absolute(50.0).is_absolute());
    /// assert!(!Motion::relative(-2.5).is_absolute());
    /// ```
    pub fn is_absolute(&self) -> bool {
        self.frame == MotionFrame::Absolute
    }
}

/// Values that can be offset by a relative move.
pub trait Displacement: Copy + PartialEq {
    /// `self` moved by `by`.
    fn displaced(self, by: Self) -> Self;
    /// Whether this offset is a no-op.
    fn is_zero(&self) -> bool;
}

impl Displacement for f64 {
    fn displaced(self, by: Self) -> Self {
        self + by
    }

    fn is_zero(&self) -> bool {
        *self == 0.0
    }
}

impl Displacement for (f64, f64) {
    fn displaced(self, by: Self) -> Self {
        (self.0 + by.0, self.1 + by.1)
    }

    fn is_zero(&self) -> bool {
        self.0 == 0.0 && self.1 == 0.0
    }
}

/// Focus piezo target in µm.
pub type FocusTarget = Motion<f64>;
/// XY stage target in mm.
pub type XyTarget = Motion<(f64, f64)>;

// =============================================================================
// Snapshot
// =============================================================================

/// One complete desired instrument configuration.
///
/// `channels` and `powers` are paired positionally and never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    /// Enabled channels in display order
    pub channels: Vec<Channel>,
    /// Percent power of each enabled channel
    pub powers: Vec<f64>,
    /// Filter wheel position
    pub emission_filter: EmissionFilter,
    /// Exposure per slice
    pub illumination_time_us: u32,
    /// Camera region height
    pub height_px: u32,
    /// Camera region width
    pub width_px: u32,
    /// Slice spacing relative to the sample pixel size
    pub voxel_aspect_ratio: u32,
    /// Volume depth
    pub scan_range_um: u32,
    /// Volumes captured per acquire call
    pub volumes_per_buffer: u32,
    /// Focus piezo target in um
    pub focus_z_um: FocusTarget,
    /// Stage target in mm
    pub xy_mm: XyTarget,
}

/// Checkbox and power slider of one illumination channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelPanel {
    /// Checkbox state
    pub enabled: bool,
    /// Slider value, kept while disabled
    pub power: f64,
}

// =============================================================================
// SettingsModel
// =============================================================================

/// Desired settings, edited by the operator and published to observers.
#[derive(Debug)]
pub struct SettingsModel {
    limits: SettingsLimits,
    default_channel: Channel,
    panels: [ChannelPanel; 5],
    desired: Observable<SettingsSnapshot>,
}

impl SettingsModel {
    /// Build the model from the configured defaults.
    ///
    /// Focus and XY start as zero relative moves: the actuators stay where
    /// they are until their real positions have been read back.
    pub fn new(config: &ScopeConfig) -> Self {
        let defaults = &config.defaults;
        let limits = config.limits.clone();
        let mut panels = [ChannelPanel {
            enabled: false,
            power: 0.0,
        }; 5];
        for channel_default in &defaults.channels {
            panels[channel_default.channel.index()] = ChannelPanel {
                enabled: channel_default.enabled,
                power: limits.power.clamp(channel_default.power),
            };
        }
        let snapshot = SettingsSnapshot {
            channels: Vec::new(),
            powers: Vec::new(),
            emission_filter: defaults.emission_filter,
            illumination_time_us: limits
                .illumination_time_us
                .clamp(defaults.illumination_time_us),
            height_px: limits.height_px.clamp(defaults.height_px),
            width_px: limits.width_px.clamp(defaults.width_px),
            voxel_aspect_ratio: limits.voxel_aspect_ratio.clamp(defaults.voxel_aspect_ratio),
            scan_range_um: limits.scan_range_um.clamp(defaults.scan_range_um),
            volumes_per_buffer: limits.volumes_per_buffer.clamp(defaults.volumes_per_buffer),
            focus_z_um: Motion::relative(0.0),
            xy_mm: Motion::relative((0.0, 0.0)),
        };
        let mut model = Self {
            limits,
            default_channel: defaults.default_channel,
            panels,
            desired: Observable::new("desired_settings", snapshot),
        };
        model.publish_illumination();
        model
    }

    /// Current desired snapshot.
    pub fn snapshot(&self) -> SettingsSnapshot {
        self.desired.get()
    }

    /// Subscribe to desired-settings changes.
    pub fn subscribe(&self) -> watch::Receiver<SettingsSnapshot> {
        self.desired.subscribe()
    }

    /// Panel state of one channel.
    pub fn panel(&self, channel: Channel) -> ChannelPanel {
        self.panels[channel.index()]
    }

    /// Bounds every edit is clamped to.
    pub fn limits(&self) -> &SettingsLimits {
        &self.limits
    }

    /// Enable or disable a channel.
    pub fn set_channel_enabled(&mut self, channel: Channel, enabled: bool) {
        self.panels[channel.index()].enabled = enabled;
        self.publish_illumination();
    }

    /// Set the power of a channel, whether or not it is enabled.
    pub fn set_power(&mut self, channel: Channel, power: f64) {
        self.panels[channel.index()].power = self.limits.power.clamp(power);
        self.publish_illumination();
    }

    /// Select a filter wheel position.
    pub fn set_emission_filter(&mut self, filter: EmissionFilter) {
        self.desired.modify(|s| s.emission_filter = filter);
    }

    /// Clamped.
    pub fn set_illumination_time_us(&mut self, value: u32) {
        let value = self.limits.illumination_time_us.clamp(value);
        self.desired.modify(|s| s.illumination_time_us = value);
    }

    /// Clamped.
    pub fn set_height_px(&mut self, value: u32) {
        let value = self.limits.height_px.clamp(value);
        self.desired.modify(|s| s.height_px = value);
    }

    /// Clamped.
    pub fn set_width_px(&mut self, value: u32) {
        let value = self.limits.width_px.clamp(value);
        self.desired.modify(|s| s.width_px = value);
    }

    /// Clamped.
    pub fn set_voxel_aspect_ratio(&mut self, value: u32) {
        let value = self.limits.voxel_aspect_ratio.clamp(value);
        self.desired.modify(|s| s.voxel_aspect_ratio = value);
    }

    /// Clamped.
    pub fn set_scan_range_um(&mut self, value: u32) {
        let value = self.limits.scan_range_um.clamp(value);
        self.desired.modify(|s| s.scan_range_um = value);
    }

    /// Clamped.
    pub fn set_volumes_per_buffer(&mut self, value: u32) {
        let value = self.limits.volumes_per_buffer.clamp(value);
        self.desired.modify(|s| s.volumes_per_buffer = value);
    }

    /// Absolute focus target, clamped to the piezo range.
    pub fn set_focus_z_um(&mut self, z_um: f64) {
        let z_um = self.limits.focus_z_um.clamp(z_um);
        self.desired.modify(|s| s.focus_z_um = Motion::absolute(z_um));
    }

    /// Offset the focus target.
    ///
    /// Before the piezo position is known the offset accumulates as a
    /// relative move.
    pub fn move_focus_by(&mut self, dz_um: f64) {
        let current = self.desired.get().focus_z_um;
        if current.is_absolute() {
            self.set_focus_z_um(current.value + dz_um);
        } else {
            self.desired
                .modify(|s| s.focus_z_um = Motion::relative(current.value + dz_um));
        }
    }

    /// Absolute stage target.
    pub fn set_xy_mm(&mut self, xy_mm: (f64, f64)) {
        self.desired.modify(|s| s.xy_mm = Motion::absolute(xy_mm));
    }

    /// Offset the stage target.
    pub fn move_xy_by(&mut self, dxy_mm: (f64, f64)) {
        let current = self.desired.get().xy_mm;
        let moved = current.value.displaced(dxy_mm);
        self.desired.modify(|s| {
            s.xy_mm = Motion {
                value: moved,
                frame: current.frame,
            }
        });
    }

    /// Absolute focus target, if known.
    pub fn focus_z_um(&self) -> Option<f64> {
        let focus = self.desired.get().focus_z_um;
        focus.is_absolute().then_some(focus.value)
    }

    /// Absolute stage target, if known.
    pub fn xy_mm(&self) -> Option<(f64, f64)> {
        let xy = self.desired.get().xy_mm;
        xy.is_absolute().then_some(xy.value)
    }

    /// Replace relative targets with the absolute ones recorded as applied.
    ///
    /// Called after every commit so a relative move is sent at most once.
    pub fn adopt_applied_motion(&mut self, applied: &AppliedSettings) {
        let snapshot = self.desired.get();
        if let Some(focus) = applied.focus_z_um.filter(|f| f.is_absolute()) {
            if !snapshot.focus_z_um.is_absolute() {
                self.desired.modify(|s| s.focus_z_um = focus);
            }
        }
        if let Some(xy) = applied.xy_mm.filter(|xy| xy.is_absolute()) {
            if !snapshot.xy_mm.is_absolute() {
                self.desired.modify(|s| s.xy_mm = xy);
            }
        }
    }

    /// Apply settings restored from a previous acquisition's metadata.
    ///
    /// Every channel not named in `restored` is disabled.
    pub fn restore(&mut self, restored: &RestoredSettings) {
        for panel in &mut self.panels {
            panel.enabled = false;
        }
        for &(channel, power) in &restored.channels {
            let panel = &mut self.panels[channel.index()];
            panel.enabled = true;
            panel.power = self.limits.power.clamp(power);
        }
        self.publish_illumination();
        self.set_emission_filter(restored.emission_filter);
        self.set_illumination_time_us(restored.illumination_time_us);
        self.set_height_px(restored.height_px);
        self.set_width_px(restored.width_px);
        self.set_voxel_aspect_ratio(restored.voxel_aspect_ratio);
        self.set_scan_range_um(restored.scan_range_um);
        self.set_volumes_per_buffer(restored.volumes_per_buffer);
    }

    fn publish_illumination(&mut self) {
        if !self.panels.iter().any(|p| p.enabled) {
            debug!(channel = %self.default_channel, "no channel enabled, re-enabling default");
            self.panels[self.default_channel.index()].enabled = true;
        }
        let (channels, powers): (Vec<Channel>, Vec<f64>) = Channel::ALL
            .iter()
            .filter(|c| self.panels[c.index()].enabled)
            .map(|&c| (c, self.panels[c.index()].power))
            .unzip();
        self.desired.modify(|s| {
            s.channels = channels;
            s.powers = powers;
        });
    }
}

/// One operator edit of a non-motion setting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsEdit {
    /// Channel checkbox
    ChannelEnabled { channel: Channel, enabled: bool },
    /// Channel power slider
    Power { channel: Channel, power: f64 },
    /// Filter wheel
    EmissionFilter(EmissionFilter),
    /// Exposure per slice
    IlluminationTimeUs(u32),
    /// Region height
    HeightPx(u32),
    /// Region width
    WidthPx(u32),
    /// Slice spacing
    VoxelAspectRatio(u32),
    /// Volume depth
    ScanRangeUm(u32),
    /// Volumes per acquire call
    VolumesPerBuffer(u32),
}

impl SettingsEdit {
    /// Apply this edit through the model's clamping setters.
    pub fn apply(self, model: &mut SettingsModel) {
        match self {
            SettingsEdit::ChannelEnabled { channel, enabled } => {
                model.set_channel_enabled(channel, enabled)
            }
            SettingsEdit::Power { channel, power } => model.set_power(channel, power),
            SettingsEdit::EmissionFilter(filter) => model.set_emission_filter(filter),
            SettingsEdit::IlluminationTimeUs(v) => model.set_illumination_time_us(v),
            SettingsEdit::HeightPx(v) => model.set_height_px(v),
            SettingsEdit::WidthPx(v) => model.set_width_px(v),
            SettingsEdit::VoxelAspectRatio(v) => model.set_voxel_aspect_ratio(v),
            SettingsEdit::ScanRangeUm(v) => model.set_scan_range_um(v),
            SettingsEdit::VolumesPerBuffer(v) => model.set_volumes_per_buffer(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> SettingsModel {
        SettingsModel::new(&ScopeConfig::default())
    }

    #[test]
    fn test_defaults() {
        let s = model().snapshot();
        assert_eq!(s.channels, vec![Channel::Led]);
        assert_eq!(s.powers, vec![25.0]);
        assert_eq!(s.emission_filter, EmissionFilter::Zet405_488_561_640m);
        assert_eq!(s.height_px, 250);
        assert_eq!(s.focus_z_um, Motion::relative(0.0));
    }

    #[test]
    fn test_channels_stay_in_panel_order() {
        let mut m = model();
        m.set_channel_enabled(Channel::L561, true);
        m.set_channel_enabled(Channel::L405, true);
        m.set_power(Channel::L561, 12.0);
        let s = m.snapshot();
        assert_eq!(s.channels, vec![Channel::Led, Channel::L405, Channel::L561]);
        assert_eq!(s.powers, vec![25.0, 5.0, 12.0]);
        assert_eq!(s.channels.len(), s.powers.len());
    }

    #[test]
    fn test_disabling_every_channel_reenables_default() {
        let mut m = model();
        m.set_channel_enabled(Channel::L488, true);
        m.set_channel_enabled(Channel::Led, false);
        m.set_channel_enabled(Channel::L488, false);
        let s = m.snapshot();
        assert_eq!(s.channels, vec![Channel::Led]);
        assert!(m.panel(Channel::Led).enabled);
    }

    #[test]
    fn test_input_is_clamped() {
        let mut m = model();
        m.set_height_px(5);
        m.set_width_px(4000);
        m.set_power(Channel::Led, 180.0);
        m.set_focus_z_um(-3.0);
        let s = m.snapshot();
        assert_eq!(s.height_px, 12);
        assert_eq!(s.width_px, 1000);
        assert_eq!(s.powers, vec![100.0]);
        assert_eq!(s.focus_z_um, Motion::absolute(0.0));
    }

    #[test]
    fn test_relative_focus_accumulates_until_known() {
        let mut m = model();
        m.move_focus_by(2.0);
        m.move_focus_by(1.0);
        assert_eq!(m.snapshot().focus_z_um, Motion::relative(3.0));
        assert_eq!(m.focus_z_um(), None);

        m.set_focus_z_um(50.0);
        m.move_focus_by(-5.0);
        assert_eq!(m.focus_z_um(), Some(45.0));
    }

    #[test]
    fn test_adopt_applied_motion_replaces_relative_targets() {
        let mut m = model();
        let applied = AppliedSettings::unknown().with_actuators(42.0, (1.5, -2.0));
        m.adopt_applied_motion(&applied);
        assert_eq!(m.focus_z_um(), Some(42.0));
        assert_eq!(m.xy_mm(), Some((1.5, -2.0)));
    }

    #[tokio::test]
    async fn test_edits_are_published() {
        let mut m = model();
        let mut rx = m.subscribe();
        m.set_volumes_per_buffer(8);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().volumes_per_buffer, 8);
    }

    #[test]
    fn test_edits_apply_to_model() {
        let mut m = model();
        SettingsEdit::ChannelEnabled {
            channel: Channel::L640,
            enabled: true,
        }
        .apply(&mut m);
        SettingsEdit::ScanRangeUm(500).apply(&mut m);
        let s = m.snapshot();
        assert_eq!(s.channels, vec![Channel::Led, Channel::L640]);
        assert_eq!(s.scan_range_um, 100);
    }

    #[test]
    fn test_channel_and_filter_parse() {
        assert_eq!("488".parse::<Channel>().unwrap(), Channel::L488);
        assert!("532".parse::<Channel>().is_err());
        assert_eq!(
            "LP02-561RU".parse::<EmissionFilter>().unwrap(),
            EmissionFilter::Lp02_561ru
        );
        assert_eq!(EmissionFilter::Unused.to_string(), "(unused)");
    }
}
