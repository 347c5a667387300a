//! Acquisition scheduler.
//!
//! Drives one Acquire, GridPreview or TilePreview run as a sequence of
//! discrete steps. Each call to [`AcquisitionScheduler::step`] performs at
//! most one unit of work (one position visit plus capture, or one poll for a
//! pending preview) and tells the caller how long to wait before the next
//! step. The scheduler never sleeps itself; the session event loop owns the
//! timer.
//!
//! ```text
//!            ┌──────── cancel requested ─────────────► finalize ─► Cancelled
//!   step ────┤
//!            ├─ preview pending ─► poll ─┬─ missing ─► Continue(ui tick)
//!            │                           └─ ready ───► autofocus? ─► advance
//!            └─ visit + capture ─┬─ needs preview ───► Continue(ui tick)
//!                                └─────────────────────► advance
//!   advance ─► cursor/iteration ─┬─ done ─► finalize ─► Finished
//!                                └─ Continue(wait)
//! ```
//!
//! Every capture goes through [`RunContext::capture`], which awaits the
//! previous capture before issuing a new one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppResult, DaqError};
use crate::hardware::AcquireRequest;
use crate::mode::RunningMode;
use crate::navigation::PositionListEntry;
use crate::settings::{FocusTarget, Motion};

/// Timing record written into acquisition folders.
pub const TIMING_RECORD_FILE: &str = "gui_delay_s.txt";

// =============================================================================
// Wait computation
// =============================================================================

/// Where the run stands after a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassProgress {
    /// More positions remain in this pass.
    Mid,
    /// The cursor just wrapped; `elapsed` is the duration of the pass.
    Wrapped { elapsed: Duration },
    /// Single-position run; every capture completes an iteration.
    SinglePosition,
}

/// Wait before the next step.
///
/// The buffer time is the floor. A delay longer than the buffer time is
/// spent between passes, minus the time the pass already took.
pub fn compute_wait(buffer_time: Duration, delay: Duration, progress: PassProgress) -> Duration {
    if delay <= buffer_time {
        return buffer_time;
    }
    match progress {
        PassProgress::Mid => buffer_time,
        PassProgress::Wrapped { elapsed } => delay.saturating_sub(elapsed),
        PassProgress::SinglePosition => delay,
    }
}

// =============================================================================
// Run plan
// =============================================================================

/// Which run mode a scheduler drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunKind {
    /// Timed acquisition into an `_acquire` folder
    Acquire,
    /// One pass over the grid cells
    GridPreview,
    /// One pass over the tiles
    TilePreview,
}

impl RunKind {
    /// Running mode this kind of run occupies.
    pub fn mode(self) -> RunningMode {
        match self {
            RunKind::Acquire => RunningMode::Acquire,
            RunKind::GridPreview => RunningMode::GridPreview,
            RunKind::TilePreview => RunningMode::TilePreview,
        }
    }

    fn is_survey(self) -> bool {
        self != RunKind::Acquire
    }
}

/// A named survey position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurveyCell {
    /// File stem for this position
    pub name: String,
    /// Stage position in mm
    pub xy_mm: (f64, f64),
    /// Navigator cell this position belongs to
    pub location: Option<usize>,
}

/// What a run visits.
#[derive(Debug, Clone, PartialEq)]
pub enum RunTargets {
    /// Capture wherever the instrument is.
    Single,
    /// Loop over the first `total` entries of the position list.
    PositionList { total: usize },
    /// Visit each cell once.
    Survey(Vec<SurveyCell>),
}

impl RunTargets {
    fn total(&self) -> usize {
        match self {
            RunTargets::Single => 1,
            RunTargets::PositionList { total } => *total,
            RunTargets::Survey(cells) => cells.len(),
        }
    }
}

/// Everything fixed at the start of a run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    /// What started the run
    pub kind: RunKind,
    /// Positions to visit
    pub targets: RunTargets,
    /// Passes over the targets
    pub iterations: u32,
    /// Time between the starts of consecutive passes
    pub delay: Duration,
    /// Run output folder
    pub folder: PathBuf,
    /// Free text written with the data
    pub description: String,
    /// Persist previews only, not full data
    pub preview_only: bool,
    /// Append each survey position to the position list
    pub save_positions: bool,
    /// Correct focus from each preview
    pub autofocus: bool,
    /// Passes per acquisition; all but the first are preview-only refocus
    /// passes and the delay is split evenly between them
    pub autofocus_rate: u32,
    /// How often to re-poll a pending preview
    pub ui_interval: Duration,
    /// Give up on a preview after this long
    pub preview_timeout: Duration,
}

// =============================================================================
// Run context
// =============================================================================

/// A motion issued before a capture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Visit {
    /// `None` leaves focus where it is.
    pub focus_z_um: Option<FocusTarget>,
    /// Stage target in mm
    pub xy_mm: (f64, f64),
}

/// What the scheduler needs from the session.
#[async_trait]
pub trait RunContext: Send + Sync {
    /// Set the desired motion (if any) and commit pending settings.
    async fn visit(&mut self, visit: Option<Visit>, single_volume: bool) -> AppResult<()>;

    /// Issue one capture after the previous one has completed.
    async fn capture(&mut self, request: AcquireRequest) -> AppResult<()>;

    /// Wait for the last capture, if any.
    async fn await_outstanding_capture(&mut self) -> AppResult<()>;

    /// Collaborator barrier over every task.
    async fn finish_all_tasks(&mut self) -> AppResult<()>;

    /// Position-list entry at a 0-based index.
    fn position_entry(&self, index: usize) -> Option<PositionListEntry>;

    /// Move the position-list cursor (1-based).
    fn set_position_cursor(&mut self, position: usize);

    /// Append the current actuator position to the position list.
    async fn record_position(&mut self) -> AppResult<()>;

    /// Make a visited survey cell the grid or tile navigator's location.
    fn set_survey_location(&mut self, kind: RunKind, location: usize) -> AppResult<()>;

    /// Time the last capture occupied the instrument.
    async fn buffer_time(&self) -> Duration;

    /// Whether a preview file has been written.
    async fn preview_ready(&self, path: &Path) -> bool;

    /// Feed a preview to the autofocus loop. `position` is the 0-based
    /// position-list index, or `None` for a single-position run.
    async fn autofocus(&mut self, position: Option<usize>, preview: &Path) -> AppResult<()>;
}

// =============================================================================
// Scheduler
// =============================================================================

/// Progress of the active run.
#[derive(Debug, Clone, Serialize)]
pub struct AcquisitionRunState {
    /// Id used in log spans
    pub run_id: Uuid,
    pub mode: RunningMode,
    /// Completed passes
    pub iteration_count: u32,
    /// 0 during a full pass, otherwise the refocus pass since the last one
    pub refocus_pass: u32,
    /// 0-based index of the next target
    pub position_cursor: usize,
    /// Targets per pass
    pub total_positions: usize,
    /// Stop at the next step
    pub cancel_requested: bool,
    /// Timing record written
    pub delay_saved: bool,
    /// A capture's preview has not been read yet
    pub awaiting_preview: bool,
    /// Run start
    #[serde(skip)]
    pub started_at: Instant,
    #[serde(skip)]
    loop_started_at: Instant,
}

/// What the caller does after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Step again after this long.
    Continue(Duration),
    /// All iterations done; the run has been finalized.
    Finished,
    /// Stopped on request; the run has been finalized.
    Cancelled,
}

#[derive(Debug, Clone)]
struct PendingPreview {
    path: PathBuf,
    autofocus: Option<Option<usize>>,
    deadline: Instant,
}

/// One run, stepped by the session.
#[derive(Debug)]
pub struct AcquisitionScheduler {
    plan: RunPlan,
    state: AcquisitionRunState,
    pending: Option<PendingPreview>,
}

impl AcquisitionScheduler {
    /// New run. The first step is due at once.
    pub fn new(plan: RunPlan) -> Self {
        let now = Instant::now();
        let state = AcquisitionRunState {
            run_id: Uuid::new_v4(),
            mode: plan.kind.mode(),
            iteration_count: 0,
            refocus_pass: 0,
            position_cursor: 0,
            total_positions: plan.targets.total(),
            cancel_requested: false,
            delay_saved: false,
            awaiting_preview: false,
            started_at: now,
            loop_started_at: now,
        };
        info!(
            run_id = %state.run_id,
            mode = %state.mode,
            iterations = plan.iterations,
            positions = state.total_positions,
            folder = %plan.folder.display(),
            "run started"
        );
        Self {
            plan,
            state,
            pending: None,
        }
    }

    /// The plan this run was started with.
    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    /// Current progress.
    pub fn state(&self) -> &AcquisitionRunState {
        &self.state
    }

    /// Stop at the next step boundary.
    pub fn request_cancel(&mut self) {
        self.state.cancel_requested = true;
    }

    /// Perform one step.
    pub async fn step<C: RunContext + ?Sized>(&mut self, ctx: &mut C) -> AppResult<StepOutcome> {
        if self.state.cancel_requested {
            self.finalize(ctx, true).await?;
            return Ok(StepOutcome::Cancelled);
        }

        if let Some(pending) = self.pending.take() {
            if !ctx.preview_ready(&pending.path).await {
                if Instant::now() >= pending.deadline {
                    return Err(DaqError::PreviewTimeout {
                        path: pending.path,
                        waited: self.plan.preview_timeout,
                    });
                }
                self.pending = Some(pending);
                return Ok(StepOutcome::Continue(self.plan.ui_interval));
            }
            self.state.awaiting_preview = false;
            if let Some(position) = pending.autofocus {
                ctx.autofocus(position, &pending.path).await?;
            }
            return self.advance(ctx).await;
        }

        let cursor = self.state.position_cursor;
        if cursor == 0 {
            self.state.loop_started_at = Instant::now();
        }
        let (filename, needs_preview) = match &self.plan.targets {
            RunTargets::Single => {
                ctx.visit(None, false).await?;
                (self.acquire_filename(None), self.plan.autofocus)
            }
            RunTargets::PositionList { .. } => {
                let entry = ctx.position_entry(cursor).ok_or(DaqError::NoPositions)?;
                let visit = Visit {
                    focus_z_um: Some(Motion::absolute(entry.focus_z_um)),
                    xy_mm: entry.xy_mm,
                };
                ctx.visit(Some(visit), false).await?;
                ctx.set_position_cursor(cursor + 1);
                (self.acquire_filename(Some(cursor)), self.plan.autofocus)
            }
            RunTargets::Survey(cells) => {
                let cell = cells.get(cursor).ok_or(DaqError::NoPositions)?;
                let visit = Visit {
                    focus_z_um: None,
                    xy_mm: cell.xy_mm,
                };
                ctx.visit(Some(visit), true).await?;
                if let Some(location) = cell.location {
                    ctx.set_survey_location(self.plan.kind, location)?;
                }
                if self.plan.save_positions {
                    ctx.record_position().await?;
                }
                (format!("{}.tif", cell.name), true)
            }
        };

        let request = AcquireRequest::saved(&filename, &self.plan.folder)
            .with_description(self.plan.description.clone())
            .preview_only(self.plan.preview_only || self.state.refocus_pass > 0);
        let preview = request.preview_path();
        debug!(run_id = %self.state.run_id, file = %filename, "capture");
        ctx.capture(request).await?;

        match preview.filter(|_| needs_preview) {
            Some(path) => {
                let list_position = matches!(self.plan.targets, RunTargets::PositionList { .. })
                    .then_some(cursor);
                let autofocus = (self.plan.autofocus && !self.plan.kind.is_survey())
                    .then_some(list_position);
                self.pending = Some(PendingPreview {
                    path,
                    autofocus,
                    deadline: Instant::now() + self.plan.preview_timeout,
                });
                self.state.awaiting_preview = true;
                Ok(StepOutcome::Continue(self.plan.ui_interval))
            }
            None => self.advance(ctx).await,
        }
    }

    /// `%06i.tif` / `%06i_p%06i.tif` for full passes. Refocus passes are
    /// named after the acquisition they follow and their 1-based pass number.
    fn acquire_filename(&self, position: Option<usize>) -> String {
        let iteration = self.state.iteration_count;
        match (self.state.refocus_pass, position) {
            (0, None) => format!("{:06}.tif", iteration),
            (0, Some(p)) => format!("{:06}_p{:06}.tif", iteration, p),
            (pass, None) => format!("af_{:06}_{:06}.tif", iteration.saturating_sub(1), pass),
            (pass, Some(p)) => format!(
                "af_{:06}_p{:06}_{:06}.tif",
                iteration.saturating_sub(1),
                p,
                pass
            ),
        }
    }

    async fn advance<C: RunContext + ?Sized>(&mut self, ctx: &mut C) -> AppResult<StepOutcome> {
        let progress = match self.plan.targets {
            RunTargets::Single => PassProgress::SinglePosition,
            _ if self.state.position_cursor + 1 < self.state.total_positions => {
                self.state.position_cursor += 1;
                PassProgress::Mid
            }
            _ => {
                self.state.position_cursor = 0;
                PassProgress::Wrapped {
                    elapsed: self.state.loop_started_at.elapsed(),
                }
            }
        };
        if progress != PassProgress::Mid {
            if self.state.refocus_pass == 0 {
                self.state.iteration_count += 1;
            }
            self.state.refocus_pass =
                (self.state.refocus_pass + 1) % self.plan.autofocus_rate.max(1);
        }
        self.record_timing();

        // No refocus passes after the last acquisition.
        if self.state.iteration_count >= self.plan.iterations {
            self.finalize(ctx, false).await?;
            return Ok(StepOutcome::Finished);
        }
        let buffer_time = ctx.buffer_time().await;
        let delay = self.plan.delay / self.plan.autofocus_rate.max(1);
        Ok(StepOutcome::Continue(compute_wait(buffer_time, delay, progress)))
    }

    /// Wait for the last capture; a completed run also drains the collaborator.
    async fn finalize<C: RunContext + ?Sized>(&mut self, ctx: &mut C, cancelled: bool) -> AppResult<()> {
        ctx.await_outstanding_capture().await?;
        if !cancelled {
            ctx.finish_all_tasks().await?;
        }
        self.record_timing();
        info!(
            run_id = %self.state.run_id,
            mode = %self.state.mode,
            iterations = self.state.iteration_count,
            elapsed_s = self.state.started_at.elapsed().as_secs_f64(),
            cancelled,
            "run finished"
        );
        Ok(())
    }

    /// Stop after a failed step: wait for the last capture and nothing else.
    pub async fn abort<C: RunContext + ?Sized>(&mut self, ctx: &mut C) -> AppResult<()> {
        self.pending = None;
        ctx.await_outstanding_capture().await
    }

    /// Write the delay record once the acquisition folder exists.
    fn record_timing(&mut self) {
        if self.state.delay_saved || self.plan.kind != RunKind::Acquire || !self.plan.folder.exists() {
            return;
        }
        let record = format!("gui_delay_s: {}\n", self.plan.delay.as_secs());
        match std::fs::write(self.plan.folder.join(TIMING_RECORD_FILE), record) {
            Ok(()) => self.state.delay_saved = true,
            Err(e) => warn!(error = %e, "could not write timing record"),
        }
    }
}
