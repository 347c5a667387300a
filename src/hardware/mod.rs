//! Hardware collaborator contract.
//!
//! The session never talks to motors, lasers or the camera directly. It drives
//! one [`Microscope`] through four calls and reads its [`InstrumentStatus`]:
//!
//! ```text
//! apply_settings(change-set) ──► TaskHandle   settings in effect, status refreshed
//! acquire(request)           ──► TaskHandle   one capture, preview at <folder>/preview/<file>
//! snoutfocus(settle)         ──► TaskHandle   periodic stabilisation
//! finish_all_tasks()                          barrier over every outstanding task
//! ```
//!
//! Calls return as soon as the work is queued; the returned [`TaskHandle`]
//! completes in the background.

/// Simulated microscope.
pub mod mock;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::{AppResult, DaqError};
use crate::settings::ChangeSet;

// =============================================================================
// Task handles
// =============================================================================

/// Background work started by the collaborator.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    inner: Option<JoinHandle<AppResult<()>>>,
}

impl TaskHandle {
    /// Run `work` on the runtime and track it.
    pub fn spawn<F>(name: impl Into<String>, work: F) -> Self
    where
        F: Future<Output = AppResult<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            inner: Some(tokio::spawn(work)),
        }
    }

    /// A handle for work that has already finished.
    pub fn completed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: None,
        }
    }

    /// Label used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the work has finished, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.inner.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the work to finish and return its result.
    pub async fn wait(mut self) -> AppResult<()> {
        match self.inner.take() {
            None => Ok(()),
            Some(handle) => handle
                .await
                .map_err(|e| DaqError::TaskFailed(self.name.clone(), e.to_string()))?,
        }
    }
}

// =============================================================================
// Requests and status
// =============================================================================

/// One capture.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AcquireRequest {
    /// File name inside `folder`; `None` for a display-only capture
    pub filename: Option<String>,
    /// Run folder the capture is saved under
    pub folder: Option<PathBuf>,
    /// Stored with the saved data
    pub description: Option<String>,
    /// Write the preview only, not the full data
    pub preview_only: bool,
    /// Delay the driver inserts before the capture
    pub delay_s: Option<f64>,
}

impl AcquireRequest {
    /// Capture for display only.
    pub fn display() -> Self {
        Self::default()
    }

    /// Capture saved as `filename` inside `folder`.
    pub fn saved(filename: impl Into<String>, folder: impl Into<PathBuf>) -> Self {
        Self {
            filename: Some(filename.into()),
            folder: Some(folder.into()),
            ..Self::default()
        }
    }

    /// Attach a free-text description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Save the preview without the full data.
    pub fn preview_only(mut self, preview_only: bool) -> Self {
        self.preview_only = preview_only;
        self
    }

    /// Ask the driver to wait before capturing.
    pub fn with_delay_s(mut self, delay_s: f64) -> Self {
        self.delay_s = Some(delay_s);
        self
    }

    /// Where the collaborator writes the preview of this capture.
    pub fn preview_path(&self) -> Option<PathBuf> {
        match (&self.folder, &self.filename) {
            (Some(folder), Some(filename)) => Some(preview_path(folder, filename)),
            _ => None,
        }
    }
}

/// `<folder>/preview/<filename>`
pub fn preview_path(folder: &Path, filename: &str) -> PathBuf {
    folder.join("preview").join(filename)
}

/// Stage soft limits in mm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageLimits {
    /// Lower X limit
    pub x_min: f64,
    /// Upper X limit
    pub x_max: f64,
    /// Lower Y limit
    pub y_min: f64,
    /// Upper Y limit
    pub y_max: f64,
}

impl Default for StageLimits {
    fn default() -> Self {
        Self {
            x_min: -50.0,
            x_max: 50.0,
            y_min: -50.0,
            y_max: 50.0,
        }
    }
}

impl StageLimits {
    /// Direction of manual joystick motion, inferred from a position pinned at
    /// a soft limit.
    ///
    /// A programmed move that ends exactly on a limit looks the same.
    pub fn pinned_direction(&self, xy_mm: (f64, f64)) -> Option<XyDirection> {
        let (x, y) = xy_mm;
        if x == self.x_min {
            Some(XyDirection::Left)
        } else if x == self.x_max {
            Some(XyDirection::Right)
        } else if y == self.y_min {
            Some(XyDirection::Down)
        } else if y == self.y_max {
            Some(XyDirection::Up)
        } else {
            None
        }
    }
}

/// Stage move direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XyDirection {
    /// +Y
    Up,
    /// -Y
    Down,
    /// -X
    Left,
    /// +X
    Right,
}

impl XyDirection {
    /// Unit step in stage coordinates.
    pub fn unit(self) -> (f64, f64) {
        match self {
            XyDirection::Up => (0.0, 1.0),
            XyDirection::Down => (0.0, -1.0),
            XyDirection::Left => (-1.0, 0.0),
            XyDirection::Right => (1.0, 0.0),
        }
    }
}

impl fmt::Display for XyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            XyDirection::Up => "up (+Y)",
            XyDirection::Down => "down (-Y)",
            XyDirection::Left => "left (-X)",
            XyDirection::Right => "right (+X)",
        })
    }
}

/// How the camera embeds its timestamp in the first preview rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimestampMode {
    /// No timestamp rows.
    #[default]
    Off,
    /// Binary timestamp in the first rows.
    Binary,
    /// Binary timestamp followed by rendered text.
    BinaryAndAscii,
}

/// Geometry of the preview frames produced by the current settings.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PreviewGeometry {
    /// Frame rows
    pub height_px: usize,
    /// Frame columns
    pub width_px: usize,
    /// Rows at the top of the frame carrying the timestamp
    pub preview_line_px: usize,
    /// Columns cropped from each side
    pub preview_crop_px: usize,
    /// Timestamp embedding of the camera
    pub timestamp_mode: TimestampMode,
}

/// A decoded preview image, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewFrame {
    /// Rows
    pub height: usize,
    /// Columns
    pub width: usize,
    /// Row-major intensities
    pub pixels: Vec<u16>,
}

impl PreviewFrame {
    /// Build a frame, checking the pixel count.
    pub fn new(height: usize, width: usize, pixels: Vec<u16>) -> AppResult<Self> {
        if pixels.len() != height * width {
            return Err(DaqError::Instrument(format!(
                "preview has {} pixels, expected {}x{}",
                pixels.len(),
                height,
                width
            )));
        }
        Ok(Self {
            height,
            width,
            pixels,
        })
    }

    /// Pixels of row `r`.
    pub fn row(&self, r: usize) -> &[u16] {
        &self.pixels[r * self.width..(r + 1) * self.width]
    }
}

/// Read-only attributes refreshed by every completed collaborator task.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct InstrumentStatus {
    /// Time one capture occupies the instrument
    pub buffer_time_s: f64,
    /// Volume rate at the applied settings
    pub volumes_per_s: f64,
    /// Size of one data buffer
    pub bytes_per_data_buffer: u64,
    /// Size of one preview buffer
    pub bytes_per_preview_buffer: u64,
    /// Data plus preview
    pub total_bytes: u64,
    /// Data buffer larger than `max_bytes_per_buffer`
    pub data_buffer_exceeded: bool,
    /// Preview buffer larger than `max_bytes_per_buffer`
    pub preview_buffer_exceeded: bool,
    /// Total larger than `max_allocated_bytes`
    pub total_bytes_exceeded: bool,
    /// Largest single buffer the driver can allocate
    pub max_bytes_per_buffer: u64,
    /// Memory available to the driver
    pub max_allocated_bytes: u64,
    /// Focus piezo position reported by the driver
    pub focus_z_um: f64,
    /// Stage position reported by the driver
    pub xy_mm: (f64, f64),
    /// Soft limits; a stage pinned at one is being moved by joystick
    pub stage_limits: StageLimits,
    /// Geometry of previews at the applied settings
    pub preview_geometry: PreviewGeometry,
}

// =============================================================================
// Collaborator trait
// =============================================================================

/// The microscope driver.
#[async_trait]
pub trait Microscope: Send + Sync {
    /// Apply a sparse change-set.
    async fn apply_settings(&self, changes: ChangeSet) -> AppResult<TaskHandle>;

    /// Start one capture.
    async fn acquire(&self, request: AcquireRequest) -> AppResult<TaskHandle>;

    /// Start the stabilisation routine.
    async fn snoutfocus(&self, settle_vibrations: bool) -> AppResult<TaskHandle>;

    /// Wait for every outstanding task.
    async fn finish_all_tasks(&self) -> AppResult<()>;

    /// Current instrument attributes.
    async fn status(&self) -> InstrumentStatus;

    /// Decode a preview file written by [`Microscope::acquire`].
    async fn load_preview(&self, path: &Path) -> AppResult<PreviewFrame>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_task_handle_reports_completion() {
        let task = TaskHandle::spawn("sleep", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        });
        assert!(!task.is_finished());
        task.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_task_handle_propagates_error() {
        let task = TaskHandle::spawn("fail", async {
            Err(DaqError::Instrument("camera timeout".into()))
        });
        let err = task.wait().await.unwrap_err();
        assert!(err.to_string().contains("camera timeout"));
    }

    #[test]
    fn test_completed_handle() {
        assert!(TaskHandle::completed("noop").is_finished());
    }

    #[test]
    fn test_pinned_direction() {
        let limits = StageLimits::default();
        assert_eq!(limits.pinned_direction((-50.0, 3.0)), Some(XyDirection::Left));
        assert_eq!(limits.pinned_direction((2.0, 50.0)), Some(XyDirection::Up));
        assert_eq!(limits.pinned_direction((2.0, 3.0)), None);
        assert_eq!(XyDirection::Down.to_string(), "down (-Y)");
    }

    #[test]
    fn test_preview_path() {
        let request = AcquireRequest::saved("A1.tif", "/data/run_grid");
        assert_eq!(
            request.preview_path().unwrap(),
            PathBuf::from("/data/run_grid/preview/A1.tif")
        );
        assert!(AcquireRequest::display().preview_path().is_none());
    }

    #[test]
    fn test_frame_pixel_count_checked() {
        assert!(PreviewFrame::new(2, 3, vec![0; 6]).is_ok());
        assert!(PreviewFrame::new(2, 3, vec![0; 5]).is_err());
    }
}
