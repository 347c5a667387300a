//! The acquisition session.
//!
//! [`Session`] owns every piece of mutable state: the desired settings, the
//! applied-settings record, the navigation lists, the running mode, the
//! active run and the last capture task. It is driven from a single task
//! (see [`actor`]), so nothing in here needs a lock.
//!
//! Operator operations are plain `async fn`s. Periodic work is split into
//! three tick entry points the event loop calls from its timers:
//!
//! - [`Session::check_settings_tick`]: read instrument status, detect manual
//!   stage motion and commit pending settings
//! - [`Session::snoutfocus_tick`]: stabilisation while no run is active
//! - [`Session::mode_tick`]: one unit of work for Live or the active run

pub mod actor;
mod context;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::autofocus::{AutofocusCorrector, FocusEstimator, IntensityCentroidEstimator};
use crate::config::ScopeConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::{AcquireRequest, InstrumentStatus, Microscope, TaskHandle, XyDirection};
use crate::mode::{ModeController, ModeState, RunningMode};
use crate::navigation::{
    check_tile_size, tile_grid_cells, FieldOfView, GridSpec, NavigateDirection, NavigationStore,
    PositionCursor, PositionListEntry,
};
use crate::scheduler::{
    AcquisitionRunState, AcquisitionScheduler, RunKind, RunPlan, RunTargets, StepOutcome,
    SurveyCell,
};
use crate::settings::estimates::{settings_output, SettingsOutput};
use crate::settings::metadata::load_metadata;
use crate::settings::{
    ReconcileOptions, Reconciler, SettingsEdit, SettingsModel, SettingsSnapshot,
};

pub use actor::SessionActor;

/// Upper bound on autofocus passes per acquisition.
const MAX_AUTOFOCUS_RATE: u32 = 10;

/// Focus buttons. "Up" moves the objective away from the sample (lower z).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusNudge {
    /// Large step away from the sample
    UpLarge,
    /// Small step away from the sample
    UpSmall,
    /// Back to the middle of the focus range
    Center,
    /// Small step toward the sample
    DownSmall,
    /// Large step toward the sample
    DownLarge,
}

/// Operator choices for the next run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Passes over the targets
    pub acquire_number: u32,
    /// Seconds between pass starts
    pub delay_s: f64,
    /// Visit every saved position each pass
    pub loop_over_position_list: bool,
    /// Refocus from the previews
    pub autofocus: bool,
    /// Appended to run folder names
    pub label: String,
    /// Written into each run's metadata
    pub description: String,
    /// Surveys save full data and append every visited position
    pub save_survey_data: bool,
    /// Tiles per grid cell edge; 1 surveys the grid cells only
    pub grid_tile_rc: usize,
    /// Autofocus passes per acquisition when autofocus is on
    pub autofocus_rate: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            acquire_number: 1,
            delay_s: 0.0,
            loop_over_position_list: false,
            autofocus: false,
            label: String::new(),
            description: String::new(),
            save_survey_data: false,
            grid_tile_rc: 1,
            autofocus_rate: 1,
        }
    }
}

/// Grid navigator state for status output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridStatus {
    /// Current grid layout
    pub spec: GridSpec,
    /// Whether a cell has been tied to a stage position
    pub located: bool,
    /// Cell last visited
    pub location: Option<usize>,
}

/// Tile navigator state for status output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileStatus {
    /// Tiles per edge
    pub size: usize,
    /// Whether a tile grid exists
    pub created: bool,
    /// Tile last visited
    pub location: Option<usize>,
}

/// Everything an operator surface displays.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    /// Running mode
    pub mode: ModeState,
    /// Root of everything this session writes
    pub session_folder: PathBuf,
    /// Settings the operator asked for
    pub desired: SettingsSnapshot,
    /// Last report from the microscope
    pub instrument: InstrumentStatus,
    /// Memory and timing estimates for `desired`
    pub settings_output: SettingsOutput,
    /// Position list cursor
    pub positions: PositionCursor,
    /// Grid navigator
    pub grid: GridStatus,
    /// Tile navigator
    pub tiles: TileStatus,
    /// Active run, if any
    pub run: Option<AcquisitionRunState>,
    /// Options for the next run
    pub run_options: RunOptions,
    /// Direction of a manual stage move in progress
    pub joystick: Option<XyDirection>,
    /// Direction of the last manual move
    pub last_move: Option<XyDirection>,
    /// Message from the last failed run
    pub last_error: Option<String>,
}

/// One microscope session.
pub struct Session {
    config: ScopeConfig,
    microscope: Arc<dyn Microscope>,
    folder: PathBuf,
    settings: SettingsModel,
    reconciler: Reconciler,
    navigation: NavigationStore,
    autofocus: AutofocusCorrector,
    estimator: Box<dyn FocusEstimator>,
    modes: ModeController,
    run: Option<AcquisitionScheduler>,
    run_options: RunOptions,
    status: InstrumentStatus,
    last_capture: Option<TaskHandle>,
    pending_settings: Option<TaskHandle>,
    joystick: Option<XyDirection>,
    last_move: Option<XyDirection>,
    tick_request: Option<u64>,
    last_error: Option<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("folder", &self.folder)
            .field("mode", &self.modes.active())
            .field("positions", &self.navigation.positions.len())
            .finish()
    }
}

impl Session {
    /// Create the session folder and bring the instrument to the configured
    /// defaults.
    ///
    /// The first commit sends every setting, with focus and XY as zero
    /// relative moves so the actuators stay put. Their reported positions
    /// then become the desired ones. Finally a volume is snapped and scout
    /// mode enabled.
    #[instrument(skip_all, fields(root = %config.application.session_root.display()))]
    pub async fn start(config: ScopeConfig, microscope: Arc<dyn Microscope>) -> AppResult<Self> {
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let name = format!("{}_{}", stamp, config.application.session_tag);
        let folder = config.application.session_root.join(&name);
        std::fs::create_dir_all(&folder)?;
        info!(folder = %folder.display(), "session started");

        let estimator = Box::new(IntensityCentroidEstimator::new(
            config.autofocus.um_per_preview_row,
        ));
        let mut session = Self {
            settings: SettingsModel::new(&config),
            navigation: NavigationStore::create(&folder, &name)?,
            config,
            microscope,
            folder,
            reconciler: Reconciler::new(),
            autofocus: AutofocusCorrector::new(),
            estimator,
            modes: ModeController::new(),
            run: None,
            run_options: RunOptions::default(),
            status: InstrumentStatus::default(),
            last_capture: None,
            pending_settings: None,
            joystick: None,
            last_move: None,
            tick_request: None,
            last_error: None,
        };

        let initial = session
            .reconciler
            .diff(&session.settings.snapshot(), ReconcileOptions::default());
        session
            .reconciler
            .commit(session.microscope.as_ref(), initial)
            .await?
            .wait()
            .await?;
        session.status = session.microscope.status().await;
        session
            .reconciler
            .record_actuators(session.status.focus_z_um, session.status.xy_mm);
        session
            .settings
            .adopt_applied_motion(session.reconciler.applied());

        session.snap().await?;
        session.modes.enter(RunningMode::Scout)?;
        Ok(session)
    }

    /// Replace the focus estimator used by autofocus runs.
    pub fn set_estimator(&mut self, estimator: Box<dyn FocusEstimator>) {
        self.estimator = estimator;
    }

    /// Loaded configuration.
    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    /// Session output folder.
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Desired settings.
    pub fn settings(&self) -> &SettingsModel {
        &self.settings
    }

    /// Positions, grid and tiles.
    pub fn navigation(&self) -> &NavigationStore {
        &self.navigation
    }

    /// Running mode controller.
    pub fn modes(&self) -> &ModeController {
        &self.modes
    }

    /// Options the next run will use.
    pub fn run_options(&self) -> &RunOptions {
        &self.run_options
    }

    /// Progress of the active run.
    pub fn run_state(&self) -> Option<&AcquisitionRunState> {
        self.run.as_ref().map(AcquisitionScheduler::state)
    }

    /// Generation of a mode that wants ticks, taken once.
    pub fn take_tick_request(&mut self) -> Option<u64> {
        self.tick_request.take()
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Refuse operator input while a run holds the instrument.
    pub fn ensure_no_run(&self) -> AppResult<()> {
        if self.modes.is_run_active() {
            return Err(DaqError::RunActive {
                active: self.modes.active(),
            });
        }
        Ok(())
    }

    /// Apply one operator edit to the desired settings.
    pub fn edit_settings(&mut self, edit: SettingsEdit) -> AppResult<()> {
        self.ensure_no_run()?;
        edit.apply(&mut self.settings);
        Ok(())
    }

    /// Restore settings from a previous acquisition's metadata file.
    pub fn restore_metadata(&mut self, path: &Path) -> AppResult<()> {
        self.ensure_no_run()?;
        let restored = load_metadata(path)?;
        self.settings.restore(&restored);
        info!(path = %path.display(), "settings restored from metadata");
        Ok(())
    }

    /// Replace the run options, clamping counts and delays to their limits.
    pub fn set_run_options(&mut self, options: RunOptions) -> AppResult<()> {
        self.ensure_no_run()?;
        if options.grid_tile_rc != 1 {
            check_tile_size(options.grid_tile_rc)?;
        }
        let limits = self.settings.limits();
        let options = RunOptions {
            acquire_number: limits.acquire_number.clamp(options.acquire_number),
            delay_s: limits.delay_s.clamp(options.delay_s),
            autofocus_rate: options.autofocus_rate.clamp(1, MAX_AUTOFOCUS_RATE),
            ..options
        };
        debug!(?options, "run options updated");
        self.run_options = options;
        Ok(())
    }

    /// Memory, storage and time figures for the current settings and options.
    pub fn settings_output(&self) -> SettingsOutput {
        let positions = if self.run_options.loop_over_position_list {
            self.navigation.positions.len()
        } else {
            1
        };
        settings_output(
            &self.status,
            positions,
            self.run_options.acquire_number,
            self.run_options.delay_s,
        )
    }

    /// Commit the desired settings and return whether anything moved.
    async fn commit_desired(&mut self, single_volume: bool) -> AppResult<bool> {
        let options = ReconcileOptions {
            manual_motion: self.joystick.is_some(),
            single_volume,
        };
        let changes = self.reconciler.diff(&self.settings.snapshot(), options);
        if changes.is_empty() {
            return Ok(false);
        }
        let moves = changes.moves();
        let task = self
            .reconciler
            .commit(self.microscope.as_ref(), changes)
            .await?;
        self.settings.adopt_applied_motion(self.reconciler.applied());
        self.pending_settings = Some(task);
        Ok(moves)
    }

    // =========================================================================
    // Motion
    // =========================================================================

    /// Step focus by one of the configured increments and snap.
    pub async fn nudge_focus(&mut self, nudge: FocusNudge) -> AppResult<()> {
        self.ensure_no_run()?;
        let nav = &self.config.navigation;
        match nudge {
            FocusNudge::UpLarge => self.settings.move_focus_by(-nav.focus_large_step_um),
            FocusNudge::UpSmall => self.settings.move_focus_by(-nav.focus_small_step_um),
            FocusNudge::Center => self.settings.set_focus_z_um(nav.focus_center_um),
            FocusNudge::DownSmall => self.settings.move_focus_by(nav.focus_small_step_um),
            FocusNudge::DownLarge => self.settings.move_focus_by(nav.focus_large_step_um),
        }
        self.scout_snap().await
    }

    /// Absolute focus in um, clamped to the focus range.
    pub async fn set_focus(&mut self, z_um: f64) -> AppResult<()> {
        self.ensure_no_run()?;
        self.settings.set_focus_z_um(z_um);
        self.scout_snap().await
    }

    /// Step the stage by a percentage of the field of view.
    pub async fn move_xy(&mut self, direction: XyDirection, step_pct: Option<f64>) -> AppResult<()> {
        self.ensure_no_run()?;
        let pct = step_pct.unwrap_or(self.config.navigation.xy_step_pct);
        let fov = self.field_of_view();
        let (ux, uy) = direction.unit();
        let step = (
            ux * fov.width_mm * pct / 100.0,
            uy * fov.height_mm * pct / 100.0,
        );
        self.settings.move_xy_by(step);
        self.last_move = Some(direction);
        debug!(%direction, ?step, "xy step");
        self.scout_snap().await
    }

    /// Move the stage to an absolute XY position and snap.
    pub async fn set_xy(&mut self, xy_mm: (f64, f64)) -> AppResult<()> {
        self.ensure_no_run()?;
        self.settings.set_xy_mm(xy_mm);
        self.scout_snap().await
    }

    /// Field of view of the current camera and scan settings.
    pub fn field_of_view(&self) -> FieldOfView {
        let s = self.settings.snapshot();
        FieldOfView::from_settings(s.width_px, s.scan_range_um, self.config.optics.sample_px_um)
    }

    fn current_xy(&self) -> (f64, f64) {
        self.settings.xy_mm().unwrap_or(self.status.xy_mm)
    }

    fn current_focus(&self) -> f64 {
        self.settings.focus_z_um().unwrap_or(self.status.focus_z_um)
    }

    // =========================================================================
    // Captures
    // =========================================================================

    /// Wait for the previous capture, commit settings for one volume and
    /// capture for display.
    pub async fn snap(&mut self) -> AppResult<()> {
        self.await_capture().await?;
        self.commit_desired(true).await?;
        let task = self.microscope.acquire(AcquireRequest::display()).await?;
        self.last_capture = Some(task);
        Ok(())
    }

    async fn scout_snap(&mut self) -> AppResult<()> {
        if self.modes.active() == RunningMode::Scout {
            self.snap().await?;
        }
        Ok(())
    }

    async fn await_capture(&mut self) -> AppResult<()> {
        match self.last_capture.take() {
            Some(task) => task.wait().await,
            None => Ok(()),
        }
    }

    fn capture_idle(&self) -> bool {
        self.last_capture.as_ref().map_or(true, TaskHandle::is_finished)
    }

    /// Append the current position to the list and save one volume.
    #[instrument(skip(self))]
    pub async fn save_volume_and_position(&mut self) -> AppResult<()> {
        self.ensure_no_run()?;
        self.commit_desired(true).await?;
        self.append_current_position()?;
        let folder = self.run_folder("_snap");
        self.await_capture().await?;
        let request = AcquireRequest::saved("snap.tif", folder)
            .with_description(self.run_options.description.clone());
        self.last_capture = Some(self.microscope.acquire(request).await?);
        Ok(())
    }

    fn append_current_position(&mut self) -> AppResult<()> {
        let entry = PositionListEntry {
            focus_z_um: self.current_focus(),
            xy_mm: self.current_xy(),
        };
        self.navigation.positions.append(entry)
    }

    /// `<session>/<timestamp>_<NNN>_<label><suffix>`, first free index.
    fn run_folder(&self, suffix: &str) -> PathBuf {
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let mut index = 0;
        loop {
            let name = format!("{}_{:03}_{}{}", stamp, index, self.run_options.label, suffix);
            let folder = self.folder.join(name);
            if !folder.exists() {
                return folder;
            }
            index += 1;
        }
    }

    // =========================================================================
    // Modes
    // =========================================================================

    /// Live on or off.
    pub fn toggle_live(&mut self) -> AppResult<RunningMode> {
        let mode = self.modes.toggle_live()?;
        if mode == RunningMode::Live {
            self.tick_request = Some(self.modes.generation());
        }
        Ok(mode)
    }

    /// Scout on or off. Switching it on shows a fresh volume.
    pub async fn toggle_scout(&mut self) -> AppResult<RunningMode> {
        let mode = self.modes.toggle_scout()?;
        if mode == RunningMode::Scout {
            self.snap().await?;
        }
        Ok(mode)
    }

    /// Ask the active run to stop. The next step is due immediately, so a
    /// run waiting out its delay finishes now.
    pub fn cancel(&mut self) {
        if self.modes.request_cancel() {
            if let Some(run) = self.run.as_mut() {
                run.request_cancel();
            }
            self.tick_request = Some(self.modes.generation());
        } else {
            debug!("cancel ignored, no run active");
        }
    }

    // =========================================================================
    // Position list
    // =========================================================================

    /// Move to a list entry and snap it, even if the cursor did not move.
    pub async fn navigate_positions(&mut self, direction: NavigateDirection) -> AppResult<()> {
        self.ensure_no_run()?;
        let Some(entry) = self.navigation.positions.navigate(direction) else {
            return Err(DaqError::NoPositions);
        };
        self.settings.set_focus_z_um(entry.focus_z_um);
        self.settings.set_xy_mm(entry.xy_mm);
        self.snap().await
    }

    /// Append the positions saved by a previous session. Returns how many.
    pub fn load_positions(&mut self, folder: &Path) -> AppResult<usize> {
        self.ensure_no_run()?;
        self.navigation.positions.load_from_folder(folder)
    }

    /// Remove the entry under the cursor.
    pub fn delete_current_position(&mut self) -> AppResult<()> {
        self.ensure_no_run()?;
        self.navigation.positions.delete_current()?;
        Ok(())
    }

    /// Clear the list. The session logs keep their history.
    pub fn delete_all_positions(&mut self) -> AppResult<()> {
        self.ensure_no_run()?;
        self.navigation.positions.delete_all()
    }

    // =========================================================================
    // Grid and tiles
    // =========================================================================

    /// Replace the grid layout. The grid must be located again.
    pub fn create_grid(&mut self, spec: GridSpec) -> AppResult<()> {
        self.ensure_no_run()?;
        self.navigation.grid.create(spec)
    }

    /// Read a grid layout saved by an earlier session.
    pub fn load_grid_parameters(&mut self, path: &Path) -> AppResult<GridSpec> {
        self.ensure_no_run()?;
        self.navigation.grid.load_parameters(path)
    }

    /// Declare the current stage position to be grid cell `cell`.
    pub fn locate_grid(&mut self, cell: usize) -> AppResult<()> {
        self.ensure_no_run()?;
        let xy = self.current_xy();
        self.navigation.grid.locate(cell, xy)
    }

    /// Visit a grid cell and snap.
    pub async fn move_to_grid_cell(&mut self, cell: usize) -> AppResult<()> {
        self.ensure_no_run()?;
        let xy = self.navigation.grid.move_to(cell)?;
        self.settings.set_xy_mm(xy);
        self.scout_snap().await
    }

    /// Tile grid of `size × size` fields of view anchored here.
    pub fn create_tiles(&mut self, size: usize) -> AppResult<()> {
        self.ensure_no_run()?;
        let fov = self.field_of_view();
        let anchor = self.current_xy();
        self.navigation.tiles.create(size, fov, anchor)
    }

    /// Visit a tile and snap.
    pub async fn move_to_tile(&mut self, index: usize) -> AppResult<()> {
        self.ensure_no_run()?;
        let xy = self.navigation.tiles.move_to(index)?;
        self.settings.set_xy_mm(xy);
        self.scout_snap().await
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Start an acquisition with the current run options.
    #[instrument(skip(self))]
    pub fn start_acquire(&mut self) -> AppResult<()> {
        self.ensure_no_run()?;
        let options = self.run_options.clone();
        let targets = if options.loop_over_position_list {
            match self.navigation.positions.len() {
                0 => return Err(DaqError::NoPositions),
                total => RunTargets::PositionList { total },
            }
        } else {
            RunTargets::Single
        };
        self.autofocus.reset();
        let folder = self.run_folder("_acquire");
        let plan = self.plan(RunKind::Acquire, targets, folder, options.acquire_number);
        self.begin_run(RunPlan {
            preview_only: false,
            save_positions: false,
            autofocus: options.autofocus,
            autofocus_rate: if options.autofocus {
                options.autofocus_rate
            } else {
                1
            },
            ..plan
        })
    }

    /// Survey every grid cell, or every tile of every cell.
    #[instrument(skip(self))]
    pub fn start_grid_preview(&mut self) -> AppResult<()> {
        self.ensure_no_run()?;
        let cells = self.navigation.grid.cells()?;
        let tile_rc = self.run_options.grid_tile_rc;
        let cols = self.navigation.grid.spec().cols;
        let (cells, suffix) = if tile_rc > 1 {
            (tile_grid_cells(&cells, tile_rc, self.field_of_view()), "_grid_tile")
        } else {
            (cells, "_grid")
        };
        let cells = cells
            .into_iter()
            .map(|c| SurveyCell {
                location: Some(c.row * cols + c.col),
                name: c.name,
                xy_mm: c.xy_mm,
            })
            .collect();
        let folder = self.run_folder(suffix);
        let plan = self.plan(RunKind::GridPreview, RunTargets::Survey(cells), folder, 1);
        self.begin_run(plan)
    }

    /// Create a `size × size` tile grid here and survey it.
    #[instrument(skip(self))]
    pub fn start_tile_preview(&mut self, size: usize) -> AppResult<()> {
        self.create_tiles(size)?;
        let cells = self
            .navigation
            .tiles
            .tiles()
            .into_iter()
            .enumerate()
            .map(|(index, t)| SurveyCell {
                name: t.name,
                xy_mm: t.xy_mm,
                location: Some(index),
            })
            .collect();
        let folder = self.run_folder("_tile");
        let plan = self.plan(RunKind::TilePreview, RunTargets::Survey(cells), folder, 1);
        self.begin_run(plan)
    }

    fn plan(&self, kind: RunKind, targets: RunTargets, folder: PathBuf, iterations: u32) -> RunPlan {
        let options = &self.run_options;
        RunPlan {
            kind,
            targets,
            iterations,
            delay: Duration::try_from_secs_f64(options.delay_s).unwrap_or(Duration::ZERO),
            folder,
            description: options.description.clone(),
            preview_only: !options.save_survey_data,
            save_positions: options.save_survey_data,
            autofocus: false,
            autofocus_rate: 1,
            ui_interval: self.config.timing.ui_refresh(),
            preview_timeout: self.config.timing.preview_timeout(),
        }
    }

    fn begin_run(&mut self, plan: RunPlan) -> AppResult<()> {
        let generation = self.modes.enter(plan.kind.mode())?;
        self.run = Some(AcquisitionScheduler::new(plan));
        self.tick_request = Some(generation);
        self.last_error = None;
        Ok(())
    }

    fn end_run(&mut self) {
        self.run = None;
        self.modes.set_idle();
    }

    // =========================================================================
    // Ticks
    // =========================================================================

    /// Interval of the settings check.
    pub fn ui_refresh(&self) -> Duration {
        self.config.timing.ui_refresh()
    }

    /// Interval between idle snoutfocus runs.
    pub fn snoutfocus_period(&self) -> Duration {
        self.config.timing.snoutfocus_period()
    }

    /// Read instrument status, watch for manual stage motion and commit any
    /// settings the operator changed.
    pub async fn check_settings_tick(&mut self) -> AppResult<()> {
        self.status = self.microscope.status().await;
        let settled = self
            .pending_settings
            .as_ref()
            .map_or(true, TaskHandle::is_finished);
        if settled {
            if let Some(task) = self.pending_settings.take() {
                task.wait().await?;
            }
        }

        self.joystick = self
            .status
            .stage_limits
            .pinned_direction(self.status.xy_mm);
        if let Some(direction) = self.joystick {
            self.last_move = Some(direction);
        }

        let moved = self
            .commit_desired(self.modes.single_volume_override())
            .await?;
        let committed = self.pending_settings.is_some();

        if self.joystick.is_none() && settled && !committed {
            self.adopt_stage_position();
        }
        if self.modes.active() == RunningMode::Scout && (moved || self.joystick.is_some()) {
            self.snap().await?;
        }
        Ok(())
    }

    /// A stage that ended up somewhere else was moved outside the session.
    fn adopt_stage_position(&mut self) {
        let Some(applied) = self.reconciler.applied().xy_mm.filter(|xy| xy.is_absolute()) else {
            return;
        };
        if applied.value != self.status.xy_mm {
            info!(from = ?applied.value, to = ?self.status.xy_mm, "stage moved externally");
            let focus = self
                .reconciler
                .applied()
                .focus_z_um
                .filter(|f| f.is_absolute())
                .map_or(self.status.focus_z_um, |f| f.value);
            self.reconciler.record_actuators(focus, self.status.xy_mm);
            self.settings.set_xy_mm(self.status.xy_mm);
        }
    }

    /// Stabilise unless a run is active.
    pub async fn snoutfocus_tick(&mut self) -> AppResult<()> {
        if self.modes.is_run_active() {
            debug!("snoutfocus skipped during run");
            return Ok(());
        }
        // Completion is awaited by `finish_all_tasks` at run end or close.
        let _task = self.microscope.snoutfocus(false).await?;
        debug!("snoutfocus started");
        Ok(())
    }

    /// One unit of work for the mode active under `generation`.
    ///
    /// Returns the delay before the next tick, or `None` when the mode no
    /// longer wants ticks (stale generation, mode ended).
    pub async fn mode_tick(&mut self, generation: u64) -> AppResult<Option<Duration>> {
        if generation != self.modes.generation() {
            return Ok(None);
        }
        match self.modes.active() {
            RunningMode::Live => {
                if self.capture_idle() {
                    self.snap().await?;
                }
                Ok(Some(self.ui_refresh()))
            }
            mode if mode.is_run() => self.run_tick().await,
            _ => Ok(None),
        }
    }

    async fn run_tick(&mut self) -> AppResult<Option<Duration>> {
        let Some(mut run) = self.run.take() else {
            self.modes.set_idle();
            return Ok(None);
        };
        let outcome = run.step(self).await;
        match outcome {
            Ok(StepOutcome::Continue(wait)) => {
                self.run = Some(run);
                Ok(Some(wait))
            }
            Ok(StepOutcome::Finished) | Ok(StepOutcome::Cancelled) => {
                self.end_run();
                Ok(None)
            }
            Err(e) => {
                error!(error = %e, mode = %self.modes.active(), "run failed");
                if let Err(abort) = run.abort(self).await {
                    warn!(error = %abort, "outstanding capture failed during abort");
                }
                self.last_error = Some(e.to_string());
                self.end_run();
                Err(e)
            }
        }
    }

    // =========================================================================
    // Status and shutdown
    // =========================================================================

    /// Snapshot for display.
    pub fn status(&self) -> SessionStatus {
        let grid = &self.navigation.grid;
        let tiles = &self.navigation.tiles;
        SessionStatus {
            mode: ModeState {
                mode: self.modes.active(),
                generation: self.modes.generation(),
                cancel_armed: self.modes.is_run_active(),
                cancel_requested: self.modes.cancel_requested(),
            },
            session_folder: self.folder.clone(),
            desired: self.settings.snapshot(),
            instrument: self.status.clone(),
            settings_output: self.settings_output(),
            positions: PositionCursor {
                current: self.navigation.positions.current(),
                total: self.navigation.positions.len(),
            },
            grid: GridStatus {
                spec: grid.spec(),
                located: grid.is_located(),
                location: grid.location(),
            },
            tiles: TileStatus {
                size: tiles.size(),
                created: tiles.is_created(),
                location: tiles.location(),
            },
            run: self.run_state().cloned(),
            run_options: self.run_options.clone(),
            joystick: self.joystick,
            last_move: self.last_move,
            last_error: self.last_error.clone(),
        }
    }

    /// Wait for the last capture and every collaborator task.
    #[instrument(skip(self))]
    pub async fn close(&mut self) -> AppResult<()> {
        if let Some(run) = self.run.as_mut() {
            run.request_cancel();
        }
        self.run = None;
        self.await_capture().await?;
        self.microscope.finish_all_tasks().await?;
        self.modes.stop();
        info!(folder = %self.folder.display(), "session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCall, MockMicroscope};
    use crate::navigation::FOCUS_LOG_FILE;
    use crate::settings::Motion;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn config(dir: &TempDir) -> ScopeConfig {
        let mut config = ScopeConfig::default();
        config.application.session_root = dir.path().to_path_buf();
        config
    }

    async fn start(dir: &TempDir) -> (Session, MockMicroscope) {
        let scope = MockMicroscope::new();
        let session = Session::start(config(dir), Arc::new(scope.clone()))
            .await
            .unwrap();
        (session, scope)
    }

    #[tokio::test]
    async fn test_start_bootstraps_instrument() {
        let dir = TempDir::new().unwrap();
        let (session, scope) = start(&dir).await;

        let first = &scope.applied_changes().await[0];
        assert_eq!(first.focus_z_um.as_set(), Some(&Motion::relative(0.0)));
        assert!(first.channels.is_set() && first.height_px.is_set());

        assert_eq!(session.settings().focus_z_um(), Some(100.0));
        assert_eq!(session.settings().xy_mm(), Some((0.0, 0.0)));
        assert_eq!(session.modes().active(), RunningMode::Scout);
        assert_eq!(scope.captures().await, vec![AcquireRequest::display()]);
        assert!(session.folder().join(FOCUS_LOG_FILE).exists());
    }

    #[tokio::test]
    async fn test_settings_check_commits_only_changes() {
        let dir = TempDir::new().unwrap();
        let (mut session, scope) = start(&dir).await;
        let before = scope.applied_changes().await.len();

        session.check_settings_tick().await.unwrap();
        assert_eq!(scope.applied_changes().await.len(), before);

        session.edit_settings(SettingsEdit::HeightPx(100)).unwrap();
        session.check_settings_tick().await.unwrap();
        let changes = scope.applied_changes().await;
        assert_eq!(changes.len(), before + 1);
        assert_eq!(changes[before].height_px.as_set(), Some(&100));
        assert!(!changes[before].xy_mm.is_set());
    }

    #[tokio::test]
    async fn test_focus_nudge_up_decreases_z_and_snaps_in_scout() {
        let dir = TempDir::new().unwrap();
        let (mut session, scope) = start(&dir).await;
        session.nudge_focus(FocusNudge::UpLarge).await.unwrap();
        assert_eq!(scope.status().await.focus_z_um, 95.0);
        assert_eq!(scope.captures().await.len(), 2);
    }

    #[tokio::test]
    async fn test_xy_step_is_a_fraction_of_the_fov() {
        let dir = TempDir::new().unwrap();
        let (mut session, scope) = start(&dir).await;
        session.move_xy(XyDirection::Up, Some(50.0)).await.unwrap();
        session.move_xy(XyDirection::Left, None).await.unwrap();
        let xy = scope.status().await.xy_mm;
        assert!((xy.0 + 0.117).abs() < 1e-9);
        assert!((xy.1 - 0.025).abs() < 1e-9);
        assert_eq!(session.status().last_move, Some(XyDirection::Left));
    }

    #[tokio::test]
    async fn test_joystick_suppresses_xy_and_adopts_final_position() {
        let dir = TempDir::new().unwrap();
        let (mut session, scope) = start(&dir).await;
        let snaps = scope.captures().await.len();

        scope.set_stage_position((-50.0, 1.0)).await;
        session.check_settings_tick().await.unwrap();
        assert_eq!(session.status().joystick, Some(XyDirection::Left));
        assert_eq!(session.status().last_move, Some(XyDirection::Left));
        assert_eq!(scope.captures().await.len(), snaps + 1);

        // An edit made while the joystick is held must not fight it.
        session.edit_settings(SettingsEdit::HeightPx(120)).unwrap();
        session.check_settings_tick().await.unwrap();
        assert_eq!(scope.status().await.xy_mm, (-50.0, 1.0));
        assert!(scope.applied_changes().await.iter().skip(1).all(|c| !c.xy_mm.is_set()));

        scope.set_stage_position((-42.0, 1.0)).await;
        session.check_settings_tick().await.unwrap();
        session.check_settings_tick().await.unwrap();
        assert_eq!(session.settings().xy_mm(), Some((-42.0, 1.0)));
        assert_eq!(session.status().joystick, None);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_external_stage_move_is_adopted() {
        let dir = TempDir::new().unwrap();
        let (mut session, scope) = start(&dir).await;
        scope.set_stage_position((2.0, 3.0)).await;
        session.check_settings_tick().await.unwrap();
        assert_eq!(session.settings().xy_mm(), Some((2.0, 3.0)));
        assert!(logs_contain("stage moved externally"));

        session.check_settings_tick().await.unwrap();
        assert!(scope.applied_changes().await.iter().skip(1).all(|c| !c.xy_mm.is_set()));
    }

    #[tokio::test]
    async fn test_save_volume_and_position() {
        let dir = TempDir::new().unwrap();
        let (mut session, scope) = start(&dir).await;
        session.save_volume_and_position().await.unwrap();
        assert_eq!(session.navigation().positions.len(), 1);
        let last = scope.captures().await.pop().unwrap();
        assert_eq!(last.filename.as_deref(), Some("snap.tif"));
        assert!(last
            .folder
            .unwrap()
            .to_string_lossy()
            .ends_with("_000__snap"));
    }

    #[tokio::test]
    async fn test_navigate_snaps_even_when_cursor_stays() {
        let dir = TempDir::new().unwrap();
        let (mut session, scope) = start(&dir).await;
        session.toggle_scout().await.unwrap();
        session.save_volume_and_position().await.unwrap();
        let before = scope.captures().await.len();
        session
            .navigate_positions(NavigateDirection::Forward)
            .await
            .unwrap();
        session
            .navigate_positions(NavigateDirection::Forward)
            .await
            .unwrap();
        assert_eq!(scope.captures().await.len(), before + 2);
        assert_eq!(session.navigation().positions.current(), 1);
    }

    #[tokio::test]
    async fn test_switching_scout_on_snaps() {
        let dir = TempDir::new().unwrap();
        let (mut session, scope) = start(&dir).await;
        let before = scope.captures().await.len();

        assert_eq!(session.toggle_scout().await.unwrap(), RunningMode::Idle);
        assert_eq!(scope.captures().await.len(), before);

        assert_eq!(session.toggle_scout().await.unwrap(), RunningMode::Scout);
        let captures = scope.captures().await;
        assert_eq!(captures.len(), before + 1);
        assert_eq!(captures.last(), Some(&AcquireRequest::display()));
    }

    #[tokio::test]
    async fn test_cancel_makes_next_step_due_now() {
        let dir = TempDir::new().unwrap();
        let (mut session, _scope) = start(&dir).await;
        session
            .set_run_options(RunOptions {
                acquire_number: 3,
                delay_s: 60.0,
                ..RunOptions::default()
            })
            .unwrap();
        session.start_acquire().unwrap();
        let generation = session.take_tick_request().unwrap();
        let wait = session.mode_tick(generation).await.unwrap();
        assert_eq!(wait, Some(Duration::from_secs(60)));

        session.cancel();
        assert_eq!(session.take_tick_request(), Some(generation));
        assert_eq!(session.mode_tick(generation).await.unwrap(), None);
        assert!(session.run_state().is_none());
        assert_eq!(session.modes().active(), RunningMode::Scout);
    }

    #[tokio::test]
    async fn test_close_leaves_every_mode() {
        let dir = TempDir::new().unwrap();
        let (mut session, _scope) = start(&dir).await;
        session.start_acquire().unwrap();
        session.close().await.unwrap();
        assert_eq!(session.modes().active(), RunningMode::Idle);
        assert!(session.run_state().is_none());
    }

    #[tokio::test]
    async fn test_operator_input_refused_during_run() {
        let dir = TempDir::new().unwrap();
        let (mut session, _scope) = start(&dir).await;
        session.start_acquire().unwrap();
        let err = session.edit_settings(SettingsEdit::WidthPx(200)).unwrap_err();
        assert!(matches!(
            err,
            DaqError::RunActive {
                active: RunningMode::Acquire
            }
        ));
        assert!(session.toggle_live().is_err());
    }

    #[tokio::test]
    async fn test_grid_preview_requires_located_grid() {
        let dir = TempDir::new().unwrap();
        let (mut session, _scope) = start(&dir).await;
        assert!(matches!(
            session.start_grid_preview(),
            Err(DaqError::GridNotSet)
        ));
        assert_eq!(session.modes().active(), RunningMode::Scout);
    }

    #[tokio::test]
    async fn test_snoutfocus_skipped_during_run() {
        let dir = TempDir::new().unwrap();
        let (mut session, scope) = start(&dir).await;
        session.snoutfocus_tick().await.unwrap();
        session.start_acquire().unwrap();
        session.snoutfocus_tick().await.unwrap();
        let count = scope
            .calls()
            .await
            .iter()
            .filter(|c| matches!(c, MockCall::Snoutfocus { .. }))
            .count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_stale_mode_tick_is_dropped() {
        let dir = TempDir::new().unwrap();
        let (mut session, _scope) = start(&dir).await;
        session.toggle_live().unwrap();
        let generation = session.take_tick_request().unwrap();
        session.toggle_live().unwrap();
        assert_eq!(session.mode_tick(generation).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_options_are_clamped() {
        let dir = TempDir::new().unwrap();
        let (mut session, _scope) = start(&dir).await;
        session
            .set_run_options(RunOptions {
                acquire_number: 0,
                delay_s: 7200.0,
                autofocus_rate: 0,
                ..RunOptions::default()
            })
            .unwrap();
        assert_eq!(session.run_options().acquire_number, 1);
        assert_eq!(session.run_options().delay_s, 3600.0);
        assert_eq!(session.run_options().autofocus_rate, 1);
        session
            .set_run_options(RunOptions {
                autofocus_rate: 50,
                ..RunOptions::default()
            })
            .unwrap();
        assert_eq!(session.run_options().autofocus_rate, MAX_AUTOFOCUS_RATE);
        assert!(session
            .set_run_options(RunOptions {
                grid_tile_rc: 12,
                ..RunOptions::default()
            })
            .is_err());
    }
}
