//! Software autofocus.
//!
//! A [`FocusEstimator`] turns one preview frame into a focus position. The
//! [`AutofocusCorrector`] keeps the first estimate of every position as its
//! set-point and, on later visits, converts the estimated drift into a
//! corrected absolute focus target for the next visit.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::{AppResult, DaqError};
use crate::hardware::{PreviewFrame, PreviewGeometry, TimestampMode};
use crate::settings::{FocusTarget, Motion};

/// Estimates the sample's focal position from a preview frame.
///
/// `geometry` must describe the capture that produced `frame`.
pub trait FocusEstimator: Send + Sync {
    fn estimate(&self, frame: &PreviewFrame, geometry: &PreviewGeometry) -> AppResult<f64>;
}

/// Background-subtracted intensity centroid along the frame rows.
///
/// Rows carrying the embedded timestamp and the cropped columns on each side
/// are excluded.
#[derive(Debug, Clone, Copy)]
pub struct IntensityCentroidEstimator {
    /// Focus travel per preview row
    pub um_per_row: f64,
}

impl IntensityCentroidEstimator {
    /// Estimator with the given row pitch.
    pub fn new(um_per_row: f64) -> Self {
        Self { um_per_row }
    }
}

impl FocusEstimator for IntensityCentroidEstimator {
    fn estimate(&self, frame: &PreviewFrame, geometry: &PreviewGeometry) -> AppResult<f64> {
        if frame.height != geometry.height_px || frame.width != geometry.width_px {
            return Err(DaqError::GeometryMismatch {
                frame_height: frame.height,
                frame_width: frame.width,
                height: geometry.height_px,
                width: geometry.width_px,
            });
        }
        let first_row = match geometry.timestamp_mode {
            TimestampMode::Off => 0,
            _ => geometry.preview_line_px,
        };
        let crop = geometry.preview_crop_px;
        if first_row >= frame.height || 2 * crop >= frame.width {
            return Err(DaqError::Instrument(
                "preview header and crop cover the whole frame".into(),
            ));
        }

        let row_sums: Vec<(usize, f64)> = (first_row..frame.height)
            .map(|r| {
                let row = &frame.row(r)[crop..frame.width - crop];
                (r, row.iter().map(|&p| f64::from(p)).sum())
            })
            .collect();
        let background = row_sums
            .iter()
            .map(|&(_, s)| s)
            .fold(f64::INFINITY, f64::min);
        let (moment, total) = row_sums
            .iter()
            .fold((0.0, 0.0), |(m, t), &(r, s)| {
                let w = s - background;
                (m + r as f64 * w, t + w)
            });
        if total <= 0.0 {
            return Err(DaqError::Instrument("preview has no signal to focus on".into()));
        }
        Ok(moment / total * self.um_per_row)
    }
}

/// Per-position focus set-points and drift correction.
#[derive(Debug, Default)]
pub struct AutofocusCorrector {
    set_points: HashMap<usize, f64>,
}

impl AutofocusCorrector {
    /// Corrector with no set-points.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an estimate for `position`.
    ///
    /// The first estimate becomes the set-point and yields no correction.
    /// Later estimates return the absolute focus that cancels the drift,
    /// relative to the current actuator value.
    pub fn observe(&mut self, position: usize, z_um: f64, actuator_z_um: f64) -> Option<FocusTarget> {
        match self.set_points.get(&position) {
            None => {
                self.set_points.insert(position, z_um);
                debug!(position, z_um, "autofocus set-point recorded");
                None
            }
            Some(&z0) => {
                let drift = z_um - z0;
                info!(position, drift_um = drift, "sample z-axis change");
                Some(Motion::absolute(actuator_z_um + drift))
            }
        }
    }

    /// Set-point recorded for `position`, if any.
    pub fn set_point(&self, position: usize) -> Option<f64> {
        self.set_points.get(&position).copied()
    }

    /// Forget every set-point; the next run starts fresh.
    pub fn reset(&mut self) {
        self.set_points.clear();
    }
}
