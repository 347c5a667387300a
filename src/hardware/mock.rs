//! Mock Microscope
//!
//! A simulated collaborator for tests and the headless binary. All timing uses
//! `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Behaviour
//!
//! - Settings apply instantly; focus and stage positions follow the change-set.
//! - Each capture occupies the instrument for `capture_time`, then writes a
//!   preview to `<folder>/preview/<filename>` (and, unless `preview_only`, a
//!   data file to `<folder>/data/<filename>`).
//! - The preview shows a bright horizontal band whose row can be shifted to
//!   simulate focal drift.
//! - Preview writes can be split in two with a pause in between, leaving a
//!   truncated file on disk until the capture task completes.
//! - Every call is recorded and can be inspected with [`MockMicroscope::calls`].

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, RwLock};
use tokio::time::{sleep, Duration};
use tracing::debug;

use super::{
    AcquireRequest, InstrumentStatus, Microscope, PreviewFrame, PreviewGeometry, StageLimits,
    TaskHandle,
};
use crate::error::{AppResult, DaqError};
use crate::settings::{AppliedSettings, Change, ChangeSet, Displacement, MotionFrame};

const MAX_BYTES_PER_BUFFER: u64 = 1 << 31;
const MAX_ALLOCATED_BYTES: u64 = 100_000_000_000;

/// One recorded collaborator call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    /// A change-set, empty ones included.
    ApplySettings(ChangeSet),
    /// A capture request.
    Acquire(AcquireRequest),
    /// Stabilisation routine.
    Snoutfocus { settle_vibrations: bool },
    /// Barrier over every outstanding task.
    FinishAllTasks,
}

#[derive(Debug)]
struct MockState {
    applied: AppliedSettings,
    status: InstrumentStatus,
    calls: Vec<MockCall>,
    sample_offset_rows: f64,
    write_previews: bool,
    preview_write_pause: Option<Duration>,
}

/// Simulated microscope.
#[derive(Debug, Clone)]
pub struct MockMicroscope {
    state: Arc<RwLock<MockState>>,
    capture_time: Duration,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl MockMicroscope {
    /// Mock with instant captures, focus at 100 µm and the stage at the origin.
    pub fn new() -> Self {
        Self::with_capture_time(Duration::ZERO)
    }

    /// Mock whose captures take `capture_time`.
    pub fn with_capture_time(capture_time: Duration) -> Self {
        let status = InstrumentStatus {
            buffer_time_s: capture_time.as_secs_f64(),
            max_bytes_per_buffer: MAX_BYTES_PER_BUFFER,
            max_allocated_bytes: MAX_ALLOCATED_BYTES,
            focus_z_um: 100.0,
            xy_mm: (0.0, 0.0),
            stage_limits: StageLimits::default(),
            ..InstrumentStatus::default()
        };
        Self {
            state: Arc::new(RwLock::new(MockState {
                applied: AppliedSettings::unknown(),
                status,
                calls: Vec::new(),
                sample_offset_rows: 0.0,
                write_previews: true,
                preview_write_pause: None,
            })),
            capture_time,
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Every call received so far.
    pub async fn calls(&self) -> Vec<MockCall> {
        self.state.read().await.calls.clone()
    }

    /// Every capture request received so far.
    pub async fn captures(&self) -> Vec<AcquireRequest> {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::Acquire(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// Non-empty change-sets received so far.
    pub async fn applied_changes(&self) -> Vec<ChangeSet> {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::ApplySettings(changes) if !changes.is_empty() => Some(changes.clone()),
                _ => None,
            })
            .collect()
    }

    /// Move the stage as the joystick would, bypassing `apply_settings`.
    pub async fn set_stage_position(&self, xy_mm: (f64, f64)) {
        self.state.write().await.status.xy_mm = xy_mm;
    }

    /// Shift the bright band in subsequent previews.
    pub async fn set_sample_offset_rows(&self, rows: f64) {
        self.state.write().await.sample_offset_rows = rows;
    }

    /// Stop writing preview files, as a stalled pipeline would.
    pub async fn set_write_previews(&self, enabled: bool) {
        self.state.write().await.write_previews = enabled;
    }

    /// Write each preview header first and its pixels `pause` later.
    pub async fn set_preview_write_pause(&self, pause: Option<Duration>) {
        self.state.write().await.preview_write_pause = pause;
    }

    fn begin_task(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn track<F>(&self, name: &str, work: F) -> TaskHandle
    where
        F: std::future::Future<Output = AppResult<()>> + Send + 'static,
    {
        self.begin_task();
        let in_flight = Arc::clone(&self.in_flight);
        let idle = Arc::clone(&self.idle);
        TaskHandle::spawn(name, async move {
            let result = work.await;
            if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
            result
        })
    }
}

impl Default for MockMicroscope {
    fn default() -> Self {
        Self::new()
    }
}

fn refresh_status(state: &mut MockState, capture_time: Duration) {
    let applied = &state.applied;
    let height = applied.height_px.unwrap_or(250) as u64;
    let width = applied.width_px.unwrap_or(1000) as u64;
    let channels = applied.channels.as_ref().map_or(1, Vec::len).max(1) as u64;
    let volumes = applied.volumes_per_buffer.unwrap_or(1) as u64;
    let slices = applied.scan_range_um.unwrap_or(50) as u64
        * applied.voxel_aspect_ratio.unwrap_or(32) as u64
        / 10;

    let status = &mut state.status;
    status.buffer_time_s = capture_time.as_secs_f64();
    status.volumes_per_s = if capture_time.is_zero() {
        0.0
    } else {
        volumes as f64 / capture_time.as_secs_f64()
    };
    status.bytes_per_data_buffer = 2 * height * width * slices * channels * volumes;
    status.bytes_per_preview_buffer = 2 * height * width * channels * volumes;
    status.total_bytes = status.bytes_per_data_buffer + status.bytes_per_preview_buffer;
    status.data_buffer_exceeded = status.bytes_per_data_buffer > status.max_bytes_per_buffer;
    status.preview_buffer_exceeded = status.bytes_per_preview_buffer > status.max_bytes_per_buffer;
    status.total_bytes_exceeded = status.total_bytes > status.max_allocated_bytes;
    status.preview_geometry = PreviewGeometry {
        height_px: height as usize,
        width_px: width as usize,
        ..PreviewGeometry::default()
    };
}

fn band_frame(geometry: &PreviewGeometry, offset_rows: f64) -> PreviewFrame {
    let (height, width) = (geometry.height_px, geometry.width_px);
    let band = height as f64 / 2.0 + offset_rows;
    let mut pixels = Vec::with_capacity(height * width);
    for r in 0..height {
        let d = r as f64 - band;
        let value = 100.0 + 1000.0 * (-d * d / 8.0).exp();
        pixels.extend(std::iter::repeat(value as u16).take(width));
    }
    PreviewFrame {
        height,
        width,
        pixels,
    }
}

fn encode_frame(frame: &PreviewFrame) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + 2 * frame.pixels.len());
    bytes.extend_from_slice(&(frame.height as u32).to_le_bytes());
    bytes.extend_from_slice(&(frame.width as u32).to_le_bytes());
    for p in &frame.pixels {
        bytes.extend_from_slice(&p.to_le_bytes());
    }
    bytes
}

async fn write_preview(path: &Path, bytes: &[u8], pause: Option<Duration>) -> AppResult<()> {
    let Some(pause) = pause else {
        tokio::fs::write(path, bytes).await?;
        return Ok(());
    };
    let (header, pixels) = bytes.split_at(8.min(bytes.len()));
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(header).await?;
    file.flush().await?;
    sleep(pause).await;
    file.write_all(pixels).await?;
    file.flush().await?;
    Ok(())
}

fn decode_frame(path: &Path, bytes: &[u8]) -> AppResult<PreviewFrame> {
    let bad = || DaqError::Instrument(format!("{} is not a mock preview", path.display()));
    let header = |i: usize| -> AppResult<usize> {
        let word: [u8; 4] = bytes.get(i..i + 4).ok_or_else(bad)?.try_into().map_err(|_| bad())?;
        Ok(u32::from_le_bytes(word) as usize)
    };
    let (height, width) = (header(0)?, header(4)?);
    let pixels = bytes[8..]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    PreviewFrame::new(height, width, pixels)
}

#[async_trait]
impl Microscope for MockMicroscope {
    async fn apply_settings(&self, changes: ChangeSet) -> AppResult<TaskHandle> {
        let mut state = self.state.write().await;
        match &changes.focus_z_um {
            Change::Set(target) if target.frame == MotionFrame::Absolute => {
                state.status.focus_z_um = target.value
            }
            Change::Set(target) => state.status.focus_z_um += target.value,
            Change::NoChange => {}
        }
        match &changes.xy_mm {
            Change::Set(target) if target.frame == MotionFrame::Absolute => {
                state.status.xy_mm = target.value
            }
            Change::Set(target) => {
                state.status.xy_mm = state.status.xy_mm.displaced(target.value)
            }
            Change::NoChange => {}
        }
        state.applied = state.applied.merged(&changes);
        refresh_status(&mut state, self.capture_time);
        state.calls.push(MockCall::ApplySettings(changes));
        Ok(TaskHandle::completed("apply_settings"))
    }

    async fn acquire(&self, request: AcquireRequest) -> AppResult<TaskHandle> {
        let (frame, write_previews, pause) = {
            let mut state = self.state.write().await;
            state.calls.push(MockCall::Acquire(request.clone()));
            let frame = band_frame(&state.status.preview_geometry, state.sample_offset_rows);
            (frame, state.write_previews, state.preview_write_pause)
        };
        let capture_time = self.capture_time;
        Ok(self.track("acquire", async move {
            sleep(capture_time).await;
            let (Some(folder), Some(filename)) = (request.folder, request.filename) else {
                return Ok(());
            };
            let bytes = encode_frame(&frame);
            if write_previews {
                let preview_dir = folder.join("preview");
                tokio::fs::create_dir_all(&preview_dir).await?;
                write_preview(&preview_dir.join(&filename), &bytes, pause).await?;
            }
            if !request.preview_only {
                let data_dir = folder.join("data");
                tokio::fs::create_dir_all(&data_dir).await?;
                tokio::fs::write(data_dir.join(&filename), &bytes).await?;
            }
            debug!(file = %filename, "mock capture written");
            Ok(())
        }))
    }

    async fn snoutfocus(&self, settle_vibrations: bool) -> AppResult<TaskHandle> {
        self.state
            .write()
            .await
            .calls
            .push(MockCall::Snoutfocus { settle_vibrations });
        Ok(self.track("snoutfocus", async { Ok(()) }))
    }

    async fn finish_all_tasks(&self) -> AppResult<()> {
        self.state.write().await.calls.push(MockCall::FinishAllTasks);
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn status(&self) -> InstrumentStatus {
        self.state.read().await.status.clone()
    }

    async fn load_preview(&self, path: &Path) -> AppResult<PreviewFrame> {
        let bytes = tokio::fs::read(path).await?;
        decode_frame(path, &bytes)
    }
}
