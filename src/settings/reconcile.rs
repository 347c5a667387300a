//! Settings reconciliation.
//!
//! [`diff`] compares a desired [`SettingsSnapshot`] with the [`AppliedSettings`]
//! last sent to the instrument and returns a sparse [`ChangeSet`]. The
//! [`Reconciler`] owns the applied record: [`Reconciler::commit`] sends a
//! change-set and replaces the record with a new value built from what was
//! actually sent, so nothing aliases the operator's snapshot.
//!
//! Rules:
//! - `channels` and `powers` change together or not at all
//! - focus and XY are emitted as absolute targets once the applied position is
//!   known; a zero relative move is never emitted after the first commit
//! - XY is left alone while the operator is moving the stage by hand
//! - the single-volume override sends `volumes_per_buffer = 1` without
//!   touching the desired snapshot

use serde::Serialize;
use tracing::debug;

use super::{Channel, Displacement, EmissionFilter, FocusTarget, Motion, SettingsSnapshot, XyTarget};
use crate::error::AppResult;
use crate::hardware::{Microscope, TaskHandle};

/// One field of a change-set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Change<T> {
    /// Leave the instrument as it is.
    NoChange,
    /// Send this value.
    Set(T),
}

impl<T> Default for Change<T> {
    fn default() -> Self {
        Change::NoChange
    }
}

impl<T> Change<T> {
    /// Whether a value is present.
    ///
    /// ```
    /// use scope_daq::settings::Change;
    ///
    /// assert!(Change::Set(3_u32).is_set());
    /// assert!(!Change::<u32>::NoChange.is_set());
    /// ```
    pub fn is_set(&self) -> bool {
        matches!(self, Change::Set(_))
    }

    /// The value, if present.
    pub fn as_set(&self) -> Option<&T> {
        match self {
            Change::Set(v) => Some(v),
            Change::NoChange => None,
        }
    }
}

/// Sparse settings delta for the hardware collaborator.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ChangeSet {
    /// Enabled channels
    pub channels: Change<Vec<Channel>>,
    /// Channel powers, sent whenever `channels` is
    pub powers: Change<Vec<f64>>,
    /// Filter wheel
    pub emission_filter: Change<EmissionFilter>,
    /// Exposure per slice
    pub illumination_time_us: Change<u32>,
    /// Region height
    pub height_px: Change<u32>,
    /// Region width
    pub width_px: Change<u32>,
    /// Slice spacing
    pub voxel_aspect_ratio: Change<u32>,
    /// Volume depth
    pub scan_range_um: Change<u32>,
    /// Volumes per acquire call
    pub volumes_per_buffer: Change<u32>,
    /// Focus target, always absolute
    pub focus_z_um: Change<FocusTarget>,
    /// Stage target
    pub xy_mm: Change<XyTarget>,
}

impl ChangeSet {
    /// Whether every field is `NoChange`.
    pub fn is_empty(&self) -> bool {
        !(self.channels.is_set()
            || self.powers.is_set()
            || self.emission_filter.is_set()
            || self.illumination_time_us.is_set()
            || self.height_px.is_set()
            || self.width_px.is_set()
            || self.voxel_aspect_ratio.is_set()
            || self.scan_range_um.is_set()
            || self.volumes_per_buffer.is_set()
            || self.focus_z_um.is_set()
            || self.xy_mm.is_set())
    }

    /// Whether this change-set moves the focus piezo or the stage.
    pub fn moves(&self) -> bool {
        self.focus_z_um.is_set() || self.xy_mm.is_set()
    }
}

/// What the instrument was last told; `None` means unknown.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AppliedSettings {
    /// Enabled channels
    pub channels: Option<Vec<Channel>>,
    /// Channel powers
    pub powers: Option<Vec<f64>>,
    /// Filter wheel
    pub emission_filter: Option<EmissionFilter>,
    /// Exposure per slice
    pub illumination_time_us: Option<u32>,
    /// Region height
    pub height_px: Option<u32>,
    /// Region width
    pub width_px: Option<u32>,
    /// Slice spacing
    pub voxel_aspect_ratio: Option<u32>,
    /// Volume depth
    pub scan_range_um: Option<u32>,
    /// Volumes per acquire call
    pub volumes_per_buffer: Option<u32>,
    /// Last focus target
    pub focus_z_um: Option<FocusTarget>,
    /// Last stage target
    pub xy_mm: Option<XyTarget>,
}

impl AppliedSettings {
    /// Nothing known; the next diff is a full change-set.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Record of a snapshot sent in full.
    pub fn from_snapshot(snapshot: &SettingsSnapshot) -> Self {
        Self {
            channels: Some(snapshot.channels.clone()),
            powers: Some(snapshot.powers.clone()),
            emission_filter: Some(snapshot.emission_filter),
            illumination_time_us: Some(snapshot.illumination_time_us),
            height_px: Some(snapshot.height_px),
            width_px: Some(snapshot.width_px),
            voxel_aspect_ratio: Some(snapshot.voxel_aspect_ratio),
            scan_range_um: Some(snapshot.scan_range_um),
            volumes_per_buffer: Some(snapshot.volumes_per_buffer),
            focus_z_um: Some(snapshot.focus_z_um),
            xy_mm: Some(snapshot.xy_mm),
        }
    }

    /// A new record with every `Set` field of `changes` applied.
    pub fn merged(&self, changes: &ChangeSet) -> Self {
        fn pick<T: Clone>(change: &Change<T>, current: &Option<T>) -> Option<T> {
            match change {
                Change::Set(v) => Some(v.clone()),
                Change::NoChange => current.clone(),
            }
        }
        Self {
            channels: pick(&changes.channels, &self.channels),
            powers: pick(&changes.powers, &self.powers),
            emission_filter: pick(&changes.emission_filter, &self.emission_filter),
            illumination_time_us: pick(&changes.illumination_time_us, &self.illumination_time_us),
            height_px: pick(&changes.height_px, &self.height_px),
            width_px: pick(&changes.width_px, &self.width_px),
            voxel_aspect_ratio: pick(&changes.voxel_aspect_ratio, &self.voxel_aspect_ratio),
            scan_range_um: pick(&changes.scan_range_um, &self.scan_range_um),
            volumes_per_buffer: pick(&changes.volumes_per_buffer, &self.volumes_per_buffer),
            focus_z_um: pick(&changes.focus_z_um, &self.focus_z_um),
            xy_mm: pick(&changes.xy_mm, &self.xy_mm),
        }
    }

    /// A new record whose actuator positions are the reported absolute ones.
    pub fn with_actuators(&self, focus_z_um: f64, xy_mm: (f64, f64)) -> Self {
        Self {
            focus_z_um: Some(Motion::absolute(focus_z_um)),
            xy_mm: Some(Motion::absolute(xy_mm)),
            ..self.clone()
        }
    }
}

/// Per-commit adjustments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// The stage is being moved by hand: leave XY alone.
    pub manual_motion: bool,
    /// Send exactly one volume per buffer.
    pub single_volume: bool,
}

fn field<T: Clone + PartialEq>(desired: &T, applied: &Option<T>) -> Change<T> {
    match applied {
        Some(current) if current == desired => Change::NoChange,
        _ => Change::Set(desired.clone()),
    }
}

fn motion<V: Displacement>(desired: &Motion<V>, applied: &Option<Motion<V>>) -> Change<Motion<V>> {
    if applied.as_ref() == Some(desired) {
        return Change::NoChange;
    }
    if desired.is_absolute() {
        return Change::Set(*desired);
    }
    match applied {
        None => Change::Set(*desired),
        Some(_) if desired.value.is_zero() => Change::NoChange,
        Some(current) if current.is_absolute() => {
            Change::Set(Motion::absolute(current.value.displaced(desired.value)))
        }
        Some(_) => Change::Set(*desired),
    }
}

/// Compute the change-set that takes the instrument from `applied` to `desired`.
pub fn diff(
    desired: &SettingsSnapshot,
    applied: &AppliedSettings,
    options: ReconcileOptions,
) -> ChangeSet {
    let illumination_changed = field(&desired.channels, &applied.channels).is_set()
        || field(&desired.powers, &applied.powers).is_set();
    let (channels, powers) = if illumination_changed {
        (
            Change::Set(desired.channels.clone()),
            Change::Set(desired.powers.clone()),
        )
    } else {
        (Change::NoChange, Change::NoChange)
    };

    let volumes = if options.single_volume {
        1
    } else {
        desired.volumes_per_buffer
    };

    ChangeSet {
        channels,
        powers,
        emission_filter: field(&desired.emission_filter, &applied.emission_filter),
        illumination_time_us: field(&desired.illumination_time_us, &applied.illumination_time_us),
        height_px: field(&desired.height_px, &applied.height_px),
        width_px: field(&desired.width_px, &applied.width_px),
        voxel_aspect_ratio: field(&desired.voxel_aspect_ratio, &applied.voxel_aspect_ratio),
        scan_range_um: field(&desired.scan_range_um, &applied.scan_range_um),
        volumes_per_buffer: field(&volumes, &applied.volumes_per_buffer),
        focus_z_um: motion(&desired.focus_z_um, &applied.focus_z_um),
        xy_mm: if options.manual_motion {
            Change::NoChange
        } else {
            motion(&desired.xy_mm, &applied.xy_mm)
        },
    }
}

/// Owner of the applied-settings record.
#[derive(Debug, Default)]
pub struct Reconciler {
    applied: AppliedSettings,
}

impl Reconciler {
    /// Start with nothing known about the instrument.
    pub fn new() -> Self {
        Self::default()
    }

    /// What the instrument was last told.
    pub fn applied(&self) -> &AppliedSettings {
        &self.applied
    }

    /// Change-set from the current applied record to `desired`.
    pub fn diff(&self, desired: &SettingsSnapshot, options: ReconcileOptions) -> ChangeSet {
        diff(desired, &self.applied, options)
    }

    /// Send `changes` and record them as applied.
    ///
    /// The record is only replaced once the collaborator accepted the
    /// change-set.
    pub async fn commit(
        &mut self,
        microscope: &dyn Microscope,
        changes: ChangeSet,
    ) -> AppResult<TaskHandle> {
        let next = self.applied.merged(&changes);
        if !changes.is_empty() {
            debug!(?changes, "applying settings");
        }
        let task = microscope.apply_settings(changes).await?;
        self.applied = next;
        Ok(task)
    }

    /// Record actuator positions read back from the instrument.
    pub fn record_actuators(&mut self, focus_z_um: f64, xy_mm: (f64, f64)) {
        self.applied = self.applied.with_actuators(focus_z_um, xy_mm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScopeConfig;
    use crate::settings::SettingsModel;

    fn snapshot() -> SettingsSnapshot {
        let mut model = SettingsModel::new(&ScopeConfig::default());
        model.set_focus_z_um(100.0);
        model.set_xy_mm((1.0, 2.0));
        model.snapshot()
    }

    #[test]
    fn test_diff_of_identical_snapshots_is_empty() {
        let s = snapshot();
        let applied = AppliedSettings::from_snapshot(&s);
        assert!(diff(&s, &applied, ReconcileOptions::default()).is_empty());
    }

    #[test]
    fn test_diff_against_unknown_is_full() {
        let s = snapshot();
        let changes = diff(&s, &AppliedSettings::unknown(), ReconcileOptions::default());
        assert_eq!(changes.channels, Change::Set(vec![Channel::Led]));
        assert_eq!(changes.height_px, Change::Set(250));
        assert_eq!(changes.focus_z_um, Change::Set(Motion::absolute(100.0)));
        assert_eq!(changes.xy_mm, Change::Set(Motion::absolute((1.0, 2.0))));
    }

    #[test]
    fn test_commit_converges() {
        let s = snapshot();
        let applied = AppliedSettings::unknown();
        let changes = diff(&s, &applied, ReconcileOptions::default());
        let applied = applied.merged(&changes);
        assert!(diff(&s, &applied, ReconcileOptions::default()).is_empty());
    }

    #[test]
    fn test_power_change_emits_channels_too() {
        let mut s = snapshot();
        let applied = AppliedSettings::from_snapshot(&s);
        s.powers = vec![30.0];
        let changes = diff(&s, &applied, ReconcileOptions::default());
        assert_eq!(changes.channels, Change::Set(vec![Channel::Led]));
        assert_eq!(changes.powers, Change::Set(vec![30.0]));
        assert_eq!(changes.height_px, Change::NoChange);
    }

    #[test]
    fn test_manual_motion_suppresses_xy_only() {
        let mut s = snapshot();
        let applied = AppliedSettings::from_snapshot(&s);
        s.xy_mm = Motion::absolute((5.0, 5.0));
        s.focus_z_um = Motion::absolute(90.0);
        let options = ReconcileOptions {
            manual_motion: true,
            ..Default::default()
        };
        let changes = diff(&s, &applied, options);
        assert_eq!(changes.xy_mm, Change::NoChange);
        assert_eq!(changes.focus_z_um, Change::Set(Motion::absolute(90.0)));
    }

    #[test]
    fn test_single_volume_override_leaves_desired_alone() {
        let mut s = snapshot();
        s.volumes_per_buffer = 6;
        let applied = AppliedSettings::from_snapshot(&s);
        let options = ReconcileOptions {
            single_volume: true,
            ..Default::default()
        };
        let changes = diff(&s, &applied, options);
        assert_eq!(changes.volumes_per_buffer, Change::Set(1));
        assert_eq!(s.volumes_per_buffer, 6);

        // Without the override the configured depth comes back.
        let applied = applied.merged(&changes);
        let changes = diff(&s, &applied, ReconcileOptions::default());
        assert_eq!(changes.volumes_per_buffer, Change::Set(6));
    }

    #[test]
    fn test_relative_move_resolves_to_absolute() {
        let mut s = snapshot();
        let applied = AppliedSettings::from_snapshot(&s).with_actuators(40.0, (0.0, 0.0));
        s.focus_z_um = Motion::relative(2.5);
        s.xy_mm = Motion::relative((0.0, 0.0));
        let changes = diff(&s, &applied, ReconcileOptions::default());
        assert_eq!(changes.focus_z_um, Change::Set(Motion::absolute(42.5)));
        assert_eq!(changes.xy_mm, Change::NoChange);
    }

    #[test]
    fn test_initial_relative_zero_is_sent_once() {
        let model = SettingsModel::new(&ScopeConfig::default());
        let s = model.snapshot();
        let changes = diff(&s, &AppliedSettings::unknown(), ReconcileOptions::default());
        assert_eq!(changes.focus_z_um, Change::Set(Motion::relative(0.0)));
        let applied = AppliedSettings::unknown().merged(&changes);
        assert!(diff(&s, &applied, ReconcileOptions::default()).is_empty());
    }

    #[test]
    fn test_merged_returns_new_record() {
        let s = snapshot();
        let before = AppliedSettings::from_snapshot(&s);
        let changes = ChangeSet {
            height_px: Change::Set(100),
            ..Default::default()
        };
        let after = before.merged(&changes);
        assert_eq!(before.height_px, Some(250));
        assert_eq!(after.height_px, Some(100));
        assert_eq!(after.width_px, before.width_px);
    }
}
