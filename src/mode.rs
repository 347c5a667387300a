//! Running-mode state machine.
//!
//! Exactly one of [`RunningMode`]'s non-idle states is active at a time.
//! Live and Scout toggle freely between each other; the three run modes
//! (Acquire, GridPreview, TilePreview) hold the instrument until they finish
//! or are cancelled, and refuse to be displaced by another mode.
//!
//! Every transition bumps a generation counter. Mode ticks scheduled under an
//! older generation are stale and must be dropped by the event loop.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::error::{AppResult, DaqError};
use crate::observable::Observable;

/// What the session is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunningMode {
    /// Nothing captures.
    #[default]
    Idle,
    /// Capture continuously.
    Live,
    /// Capture after every move.
    Scout,
    /// Survey the grid cells.
    GridPreview,
    /// Survey the tile grid.
    TilePreview,
    /// Saved acquisition run.
    Acquire,
}

impl RunningMode {
    /// Modes driven by the acquisition scheduler. They arm cancellation.
    pub fn is_run(self) -> bool {
        matches!(
            self,
            RunningMode::Acquire | RunningMode::GridPreview | RunningMode::TilePreview
        )
    }

    /// Modes that always capture exactly one volume.
    pub fn forces_single_volume(self) -> bool {
        matches!(
            self,
            RunningMode::Live
                | RunningMode::Scout
                | RunningMode::GridPreview
                | RunningMode::TilePreview
        )
    }
}

impl fmt::Display for RunningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunningMode::Idle => "idle",
            RunningMode::Live => "live",
            RunningMode::Scout => "scout",
            RunningMode::GridPreview => "grid preview",
            RunningMode::TilePreview => "tile preview",
            RunningMode::Acquire => "acquire",
        })
    }
}

/// Published mode state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ModeState {
    /// Active mode
    pub mode: RunningMode,
    /// Bumped on every transition
    pub generation: u64,
    /// A cancel affordance is shown while a run is active
    pub cancel_armed: bool,
    /// Cancel pressed, run not yet stopped
    pub cancel_requested: bool,
}

/// Exclusive running-mode controller.
#[derive(Debug)]
pub struct ModeController {
    active: RunningMode,
    scout_restore: bool,
    generation: u64,
    cancel_requested: bool,
    state: Observable<ModeState>,
}

impl Default for ModeController {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeController {
    /// Idle, generation 0.
    pub fn new() -> Self {
        Self {
            active: RunningMode::Idle,
            scout_restore: false,
            generation: 0,
            cancel_requested: false,
            state: Observable::new("running_mode", ModeState::default()),
        }
    }

    /// Current mode.
    pub fn active(&self) -> RunningMode {
        self.active
    }

    /// Generation of the current mode.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether an acquisition or survey holds the instrument.
    pub fn is_run_active(&self) -> bool {
        self.active.is_run()
    }

    /// Whether the active run was asked to stop.
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Whether commits right now must force a single volume.
    pub fn single_volume_override(&self) -> bool {
        self.active.forces_single_volume()
    }

    /// Watch published mode state.
    pub fn subscribe(&self) -> watch::Receiver<ModeState> {
        self.state.subscribe()
    }

    /// Make `mode` the only active mode and return the new generation.
    ///
    /// Whether scout was on is remembered so returning to idle restores it.
    /// A running acquisition or survey must be cancelled first.
    pub fn enter(&mut self, mode: RunningMode) -> AppResult<u64> {
        if mode == RunningMode::Idle {
            self.set_idle();
            return Ok(self.generation);
        }
        if self.active.is_run() {
            return Err(DaqError::ModeBusy {
                requested: mode,
                active: self.active,
            });
        }
        if mode != RunningMode::Scout {
            self.scout_restore = self.active == RunningMode::Scout;
        }
        self.transition(mode);
        Ok(self.generation)
    }

    /// Leave the active mode. Scout comes back if it was on before.
    pub fn set_idle(&mut self) -> RunningMode {
        let next = if self.scout_restore && self.active != RunningMode::Scout {
            RunningMode::Scout
        } else {
            RunningMode::Idle
        };
        self.scout_restore = false;
        self.transition(next);
        next
    }

    /// Leave every mode without restoring scout.
    pub fn stop(&mut self) {
        self.scout_restore = false;
        if self.active != RunningMode::Idle {
            self.transition(RunningMode::Idle);
        }
    }

    /// Live on if it is off, off if it is on.
    pub fn toggle_live(&mut self) -> AppResult<RunningMode> {
        self.toggle(RunningMode::Live)
    }

    /// Scout on if it is off, off if it is on.
    pub fn toggle_scout(&mut self) -> AppResult<RunningMode> {
        self.toggle(RunningMode::Scout)
    }

    fn toggle(&mut self, mode: RunningMode) -> AppResult<RunningMode> {
        if self.active == mode {
            Ok(self.set_idle())
        } else {
            self.enter(mode)?;
            Ok(mode)
        }
    }

    /// Ask the active run to stop at its next step. Returns whether a run
    /// was active.
    pub fn request_cancel(&mut self) -> bool {
        if !self.active.is_run() {
            return false;
        }
        info!(mode = %self.active, "cancel requested");
        self.cancel_requested = true;
        self.publish();
        true
    }

    fn transition(&mut self, mode: RunningMode) {
        let previous = self.active;
        self.active = mode;
        self.generation += 1;
        self.cancel_requested = false;
        info!(from = %previous, to = %mode, generation = self.generation, "running mode changed");
        self.publish();
    }

    fn publish(&self) {
        self.state.set(ModeState {
            mode: self.active,
            generation: self.generation,
            cancel_armed: self.active.is_run(),
            cancel_requested: self.cancel_requested,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modes_are_exclusive() {
        let mut modes = ModeController::new();
        modes.enter(RunningMode::Live).unwrap();
        modes.enter(RunningMode::Scout).unwrap();
        assert_eq!(modes.active(), RunningMode::Scout);
        modes.enter(RunningMode::Acquire).unwrap();
        assert_eq!(modes.active(), RunningMode::Acquire);
    }

    #[test]
    fn test_run_refuses_other_modes() {
        let mut modes = ModeController::new();
        modes.enter(RunningMode::Acquire).unwrap();
        let err = modes.enter(RunningMode::GridPreview).unwrap_err();
        assert!(matches!(
            err,
            DaqError::ModeBusy {
                requested: RunningMode::GridPreview,
                active: RunningMode::Acquire
            }
        ));
        assert!(modes.toggle_live().is_err());
    }

    #[test]
    fn test_scout_restored_after_run() {
        let mut modes = ModeController::new();
        modes.toggle_scout().unwrap();
        modes.enter(RunningMode::TilePreview).unwrap();
        assert_eq!(modes.active(), RunningMode::TilePreview);
        assert_eq!(modes.set_idle(), RunningMode::Scout);
    }

    #[test]
    fn test_stop_skips_scout_restore() {
        let mut modes = ModeController::new();
        modes.toggle_scout().unwrap();
        modes.enter(RunningMode::Acquire).unwrap();
        modes.stop();
        assert_eq!(modes.active(), RunningMode::Idle);
        let generation = modes.generation();
        modes.stop();
        assert_eq!(modes.generation(), generation);
    }

    #[test]
    fn test_toggling_scout_off_does_not_restore_it() {
        let mut modes = ModeController::new();
        modes.toggle_scout().unwrap();
        assert_eq!(modes.toggle_scout().unwrap(), RunningMode::Idle);
        modes.toggle_live().unwrap();
        assert_eq!(modes.toggle_live().unwrap(), RunningMode::Idle);
    }

    #[test]
    fn test_live_then_scout_restore() {
        let mut modes = ModeController::new();
        modes.toggle_scout().unwrap();
        modes.toggle_live().unwrap();
        assert_eq!(modes.toggle_live().unwrap(), RunningMode::Scout);
    }

    #[test]
    fn test_cancel_only_arms_for_runs() {
        let mut modes = ModeController::new();
        modes.enter(RunningMode::Live).unwrap();
        assert!(!modes.request_cancel());
        modes.set_idle();
        modes.enter(RunningMode::Acquire).unwrap();
        assert!(modes.request_cancel());
        assert!(modes.cancel_requested());
        modes.set_idle();
        assert!(!modes.cancel_requested());
    }

    #[test]
    fn test_generation_bumps_on_every_transition() {
        let mut modes = ModeController::new();
        let g1 = modes.enter(RunningMode::Live).unwrap();
        modes.set_idle();
        let g2 = modes.enter(RunningMode::Live).unwrap();
        assert_eq!(g2, g1 + 2);
        assert_eq!(modes.generation(), g2);
    }

    #[test]
    fn test_single_volume_override() {
        assert!(RunningMode::GridPreview.forces_single_volume());
        assert!(RunningMode::Live.forces_single_volume());
        assert!(!RunningMode::Acquire.forces_single_volume());
        assert!(!RunningMode::Idle.forces_single_volume());
    }

    #[tokio::test]
    async fn test_state_is_published() {
        let mut modes = ModeController::new();
        let mut rx = modes.subscribe();
        modes.enter(RunningMode::Acquire).unwrap();
        rx.changed().await.unwrap();
        let state = *rx.borrow();
        assert_eq!(state.mode, RunningMode::Acquire);
        assert!(state.cancel_armed);
    }
}
