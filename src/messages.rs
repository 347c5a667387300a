//! Message types for actor-based communication
//!
//! Operator surfaces never touch the [`Session`](crate::session::Session)
//! directly. They hold a cloneable [`SessionHandle`] and send
//! [`SessionCommand`]s to the session actor, which owns all state and answers
//! over a oneshot channel.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{AppResult, DaqError};
use crate::hardware::XyDirection;
use crate::mode::ModeState;
use crate::navigation::{GridSpec, NavigateDirection};
use crate::session::{FocusNudge, RunOptions, SessionStatus};
use crate::settings::SettingsEdit;

/// One operator action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRequest {
    /// Change one desired setting.
    EditSettings(SettingsEdit),
    /// Load settings from a saved metadata file.
    RestoreMetadata { path: PathBuf },
    /// Options for the next run.
    SetRunOptions(RunOptions),

    /// Focus button press.
    NudgeFocus(FocusNudge),
    /// Absolute focus target.
    SetFocus { z_um: f64 },
    /// Step by a percentage of the FOV; `None` uses the configured step
    MoveXy {
        direction: XyDirection,
        step_pct: Option<f64>,
    },
    /// Absolute stage target.
    SetXy { xy_mm: (f64, f64) },

    /// Capture one volume for display.
    Snap,
    /// Append the current position and save one volume.
    SaveVolumeAndPosition,
    /// Live mode on or off.
    ToggleLive,
    /// Scout mode on or off.
    ToggleScout,

    /// Move the position-list cursor and go there.
    NavigatePositions(NavigateDirection),
    /// Append the position logs of an earlier session.
    LoadPositions { folder: PathBuf },
    /// Remove the entry under the cursor.
    DeleteCurrentPosition,
    /// Empty the position list.
    DeleteAllPositions,

    /// Replace the grid; it must be located again.
    CreateGrid(GridSpec),
    /// Replace the grid from a saved parameter file.
    LoadGridParameters { path: PathBuf },
    /// Declare the current stage position to be this cell
    LocateGrid { cell: usize },
    /// Go to a cell of the located grid.
    MoveToGridCell { cell: usize },
    /// Tile grid of `size × size` at the current position.
    CreateTiles { size: usize },
    /// Go to a tile.
    MoveToTile { index: usize },

    /// Run an acquisition with the current options.
    StartAcquire,
    /// Survey every grid cell.
    StartGridPreview,
    /// Create tiles here and survey them.
    StartTilePreview { size: usize },
    /// Stop the active run.
    Cancel,
}

/// Commands that can be sent to the session actor
#[derive(Debug)]
pub enum SessionCommand {
    /// Perform an operator action
    Request {
        request: SessionRequest,
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Snapshot of everything an operator surface displays
    GetStatus {
        response: oneshot::Sender<SessionStatus>,
    },

    /// Subscribe to running-mode changes
    SubscribeMode {
        response: oneshot::Sender<watch::Receiver<ModeState>>,
    },

    /// Close the session and stop the actor
    Shutdown {
        response: oneshot::Sender<AppResult<()>>,
    },
}

impl SessionCommand {
    /// Helper to create a Request command
    pub fn request(request: SessionRequest) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Request {
                request,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a GetStatus command
    pub fn get_status() -> (Self, oneshot::Receiver<SessionStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetStatus { response: tx }, rx)
    }

    /// Helper to create a SubscribeMode command
    pub fn subscribe_mode() -> (Self, oneshot::Receiver<watch::Receiver<ModeState>>) {
        let (tx, rx) = oneshot::channel();
        (Self::SubscribeMode { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// Cloneable sender side of the session actor.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Wrap the actor's command sender.
    pub fn new(tx: mpsc::Sender<SessionCommand>) -> Self {
        Self { tx }
    }

    async fn send<T>(&self, command: SessionCommand, rx: oneshot::Receiver<T>) -> AppResult<T> {
        self.tx
            .send(command)
            .await
            .map_err(|_| DaqError::SessionClosed)?;
        rx.await.map_err(|_| DaqError::SessionClosed)
    }

    /// Perform an operator action and wait for its result.
    pub async fn request(&self, request: SessionRequest) -> AppResult<()> {
        let (command, rx) = SessionCommand::request(request);
        self.send(command, rx).await?
    }

    /// Snapshot of the session.
    pub async fn status(&self) -> AppResult<SessionStatus> {
        let (command, rx) = SessionCommand::get_status();
        self.send(command, rx).await
    }

    /// Watch running-mode changes.
    pub async fn subscribe_mode(&self) -> AppResult<watch::Receiver<ModeState>> {
        let (command, rx) = SessionCommand::subscribe_mode();
        self.send(command, rx).await
    }

    /// Shorthand for [`SessionRequest::StartAcquire`].
    pub async fn start_acquire(&self) -> AppResult<()> {
        self.request(SessionRequest::StartAcquire).await
    }

    /// Shorthand for [`SessionRequest::Cancel`].
    pub async fn cancel(&self) -> AppResult<()> {
        self.request(SessionRequest::Cancel).await
    }

    /// Close the session. The actor exits afterwards.
    pub async fn shutdown(&self) -> AppResult<()> {
        let (command, rx) = SessionCommand::shutdown();
        self.send(command, rx).await?
    }
}
