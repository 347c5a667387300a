//! Custom error types for the acquisition core.
//!
//! This module defines the primary error type, `DaqError`, used by every part of
//! the session: configuration loading, the persisted navigation logs, the
//! hardware collaborator and the acquisition scheduler.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps `figment` errors raised while reading the TOML file or
//!   environment overrides.
//! - **`Configuration`**: Semantic errors in a configuration that parsed fine
//!   (inverted bounds, unknown log level, defaults outside their bounds).
//! - **`Io`**: Wraps `std::io::Error` for the session folder and position logs.
//! - **`Instrument`** / **`TaskFailed`**: Failures reported by the hardware
//!   collaborator or by one of its background tasks.
//! - **`Parse`** / **`PositionListMismatch`**: Malformed persisted files. These
//!   are hard errors; nothing is recovered from a partially valid file.
//! - **`ModeBusy`** / **`RunActive`**: An acquisition or survey holds the
//!   instrument until it finishes or is cancelled.
//! - **`PreviewTimeout`** / **`GeometryMismatch`**: The bounded preview wait ran
//!   out, or a preview frame did not match the geometry that produced it.
//!
//! Navigation boundary violations and an empty channel selection are *not*
//! errors; they are clamped or repaired where they occur.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::mode::RunningMode;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or directory I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reported by the microscope driver.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// A background collaborator task panicked or was aborted.
    #[error("Background task '{0}' failed: {1}")]
    TaskFailed(String, String),

    /// A session, grid or metadata file could not be read.
    #[error("Failed to parse {path}:{line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// The focus and XY logs of a session disagree.
    #[error("Position lists differ in length: {focus} focus entries, {xy} XY entries")]
    PositionListMismatch { focus: usize, xy: usize },

    /// A position-list operation needs at least one entry.
    #[error("Position list is empty")]
    NoPositions,

    /// Grid operations need a located grid.
    #[error("Grid location has not been set")]
    GridNotSet,

    /// Grid dimensions or spacing out of range.
    #[error("Invalid grid: {0}")]
    InvalidGrid(String),

    /// Tile grid size out of range.
    #[error("Invalid tile grid: {0}")]
    InvalidTile(String),

    /// Another mode was requested while a run holds the instrument.
    #[error("Cannot start {requested}: {active} is running")]
    ModeBusy {
        requested: RunningMode,
        active: RunningMode,
    },

    /// Operator input refused while a run is active.
    #[error("{active} is running; cancel it first")]
    RunActive { active: RunningMode },

    /// A survey or autofocus preview never appeared.
    #[error("Preview {path} did not appear within {waited:?}")]
    PreviewTimeout { path: PathBuf, waited: Duration },

    /// A preview frame does not match the expected geometry.
    #[error("Preview frame is {frame_height}x{frame_width} but geometry expects {height}x{width}")]
    GeometryMismatch {
        frame_height: usize,
        frame_width: usize,
        height: usize,
        width: usize,
    },

    /// The session actor has stopped.
    #[error("Session is closed")]
    SessionClosed,
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}
