//! Session actor.
//!
//! A single task owns the [`Session`] and serves two event sources: the
//! command channel and a [`TimerQueue`]. All state mutation happens here, so
//! operator requests and timer work never interleave inside one operation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::Session;
use crate::config::ScopeConfig;
use crate::error::AppResult;
use crate::hardware::Microscope;
use crate::messages::{SessionCommand, SessionHandle, SessionRequest};
use crate::timers::{TimerKind, TimerQueue};

/// Pending commands before senders wait.
const COMMAND_CAPACITY: usize = 32;

/// Start a session and its actor task.
pub async fn spawn_session(
    config: ScopeConfig,
    microscope: Arc<dyn Microscope>,
) -> AppResult<(SessionHandle, JoinHandle<()>)> {
    let session = Session::start(config, microscope).await?;
    let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
    let task = tokio::spawn(SessionActor::new(session).run(rx));
    Ok((SessionHandle::new(tx), task))
}

/// Actor that owns the session
pub struct SessionActor {
    session: Session,
    timers: TimerQueue,
}

impl SessionActor {
    /// Wrap a started session. Call `run` to drive it.
    pub fn new(session: Session) -> Self {
        Self {
            session,
            timers: TimerQueue::new(),
        }
    }

    /// Runs the actor event loop until shutdown or until every handle is gone
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<SessionCommand>) {
        info!(folder = %self.session.folder().display(), "session actor started");
        self.timers.schedule_in(Duration::ZERO, TimerKind::CheckSettings);
        self.timers.schedule_in(Duration::ZERO, TimerKind::Snoutfocus);

        loop {
            self.schedule_requested_tick();
            let deadline = self.timers.next_deadline();
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(SessionCommand::Shutdown { response }) => {
                        let result = self.session.close().await;
                        let _ = response.send(result);
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("all session handles dropped");
                        if let Err(e) = self.session.close().await {
                            error!(error = %e, "session close failed");
                        }
                        break;
                    }
                },
                _ = wait_for(deadline) => self.fire_due_timers().await,
            }
        }

        info!("session actor stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Request { request, response } => {
                let result = self.handle_request(request).await;
                if let Err(e) = &result {
                    warn!(error = %e, "request failed");
                }
                let _ = response.send(result);
            }

            SessionCommand::GetStatus { response } => {
                let _ = response.send(self.session.status());
            }

            SessionCommand::SubscribeMode { response } => {
                let _ = response.send(self.session.modes().subscribe());
            }

            // Handled by the event loop.
            SessionCommand::Shutdown { .. } => {}
        }
    }

    async fn handle_request(&mut self, request: SessionRequest) -> AppResult<()> {
        let session = &mut self.session;
        debug!(?request, "operator request");
        match request {
            SessionRequest::EditSettings(edit) => session.edit_settings(edit),
            SessionRequest::RestoreMetadata { path } => session.restore_metadata(&path),
            SessionRequest::SetRunOptions(options) => session.set_run_options(options),

            SessionRequest::NudgeFocus(nudge) => session.nudge_focus(nudge).await,
            SessionRequest::SetFocus { z_um } => session.set_focus(z_um).await,
            SessionRequest::MoveXy {
                direction,
                step_pct,
            } => session.move_xy(direction, step_pct).await,
            SessionRequest::SetXy { xy_mm } => session.set_xy(xy_mm).await,

            SessionRequest::Snap => {
                session.ensure_no_run()?;
                session.snap().await
            }
            SessionRequest::SaveVolumeAndPosition => session.save_volume_and_position().await,
            SessionRequest::ToggleLive => session.toggle_live().map(drop),
            SessionRequest::ToggleScout => session.toggle_scout().await.map(drop),

            SessionRequest::NavigatePositions(direction) => {
                session.navigate_positions(direction).await
            }
            SessionRequest::LoadPositions { folder } => session.load_positions(&folder).map(drop),
            SessionRequest::DeleteCurrentPosition => session.delete_current_position(),
            SessionRequest::DeleteAllPositions => session.delete_all_positions(),

            SessionRequest::CreateGrid(spec) => session.create_grid(spec),
            SessionRequest::LoadGridParameters { path } => {
                session.load_grid_parameters(&path).map(drop)
            }
            SessionRequest::LocateGrid { cell } => session.locate_grid(cell),
            SessionRequest::MoveToGridCell { cell } => session.move_to_grid_cell(cell).await,
            SessionRequest::CreateTiles { size } => session.create_tiles(size),
            SessionRequest::MoveToTile { index } => session.move_to_tile(index).await,

            SessionRequest::StartAcquire => session.start_acquire(),
            SessionRequest::StartGridPreview => session.start_grid_preview(),
            SessionRequest::StartTilePreview { size } => session.start_tile_preview(size),
            SessionRequest::Cancel => {
                session.cancel();
                Ok(())
            }
        }
    }

    /// A mode that just started wants its first tick now.
    fn schedule_requested_tick(&mut self) {
        if let Some(generation) = self.session.take_tick_request() {
            self.timers.cancel_mode_ticks();
            self.timers
                .schedule_in(Duration::ZERO, TimerKind::ModeTick { generation });
        }
    }

    async fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(kind) = self.timers.pop_due(now) {
            match kind {
                TimerKind::CheckSettings => {
                    if let Err(e) = self.session.check_settings_tick().await {
                        warn!(error = %e, "settings check failed");
                    }
                    self.timers
                        .schedule_in(self.session.ui_refresh(), TimerKind::CheckSettings);
                }
                TimerKind::Snoutfocus => {
                    if let Err(e) = self.session.snoutfocus_tick().await {
                        warn!(error = %e, "snoutfocus failed");
                    }
                    self.timers
                        .schedule_in(self.session.snoutfocus_period(), TimerKind::Snoutfocus);
                }
                TimerKind::ModeTick { generation } => {
                    match self.session.mode_tick(generation).await {
                        Ok(Some(wait)) => self
                            .timers
                            .schedule_in(wait, TimerKind::ModeTick { generation }),
                        Ok(None) => {}
                        Err(e) => error!(error = %e, generation, "mode tick failed"),
                    }
                }
            }
        }
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
