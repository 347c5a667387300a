//! Position list with persisted logs.
//!
//! Every entry is written to two session files as it is appended:
//!
//! ```text
//! focus_piezo_position_list.txt     XY_stage_position_list.txt
//! # 2024-03-01_10-12-44_scope_session   # 2024-03-01_10-12-44_scope_session
//! 48.0,                             [-0.412, 3.1],
//! 52.5,                             [-0.9, 3.1],
//! ```
//!
//! The first line is a header naming the session. Deleting entries rewrites
//! both files in full. The cursor is 1-based; 0 means the list is empty.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{AppResult, DaqError};
use crate::observable::Observable;

/// Focus log file name.
pub const FOCUS_LOG_FILE: &str = "focus_piezo_position_list.txt";
/// XY log file name.
pub const XY_LOG_FILE: &str = "XY_stage_position_list.txt";

/// One saved position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionListEntry {
    /// Absolute focus
    pub focus_z_um: f64,
    /// Absolute stage position
    pub xy_mm: (f64, f64),
}

/// Position-list navigation buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NavigateDirection {
    /// First entry.
    Start,
    /// Previous entry, stopping at the first.
    Back,
    /// Next entry, stopping at the last.
    Forward,
    /// Last entry.
    End,
}

/// Current (1-based) and total position counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PositionCursor {
    /// 1-based; 0 when empty
    pub current: usize,
    /// Number of entries
    pub total: usize,
}

/// Operator position list backed by the two session logs.
#[derive(Debug)]
pub struct PositionList {
    entries: Vec<PositionListEntry>,
    current: usize,
    header: String,
    focus_log: PathBuf,
    xy_log: PathBuf,
    cursor: Observable<PositionCursor>,
}

impl PositionList {
    /// Create an empty list whose logs live in `dir`.
    ///
    /// Both logs are (re)created with a header line carrying `session_tag`.
    pub fn create(dir: &Path, session_tag: &str) -> AppResult<Self> {
        let list = Self {
            entries: Vec::new(),
            current: 0,
            header: format!("# {}", session_tag),
            focus_log: dir.join(FOCUS_LOG_FILE),
            xy_log: dir.join(XY_LOG_FILE),
            cursor: Observable::new("position_cursor", PositionCursor::default()),
        };
        list.rewrite_logs()?;
        Ok(list)
    }

    /// Every entry in order.
    pub fn entries(&self) -> &[PositionListEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 1-based cursor; 0 when empty.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Entry at a 0-based index.
    pub fn get(&self, index: usize) -> Option<PositionListEntry> {
        self.entries.get(index).copied()
    }

    /// Watch the cursor.
    pub fn subscribe(&self) -> watch::Receiver<PositionCursor> {
        self.cursor.subscribe()
    }

    /// Append an entry to the list and both logs; the cursor moves to it.
    pub fn append(&mut self, entry: PositionListEntry) -> AppResult<()> {
        append_line(&self.focus_log, &format_focus(entry.focus_z_um))?;
        append_line(&self.xy_log, &format_xy(entry.xy_mm))?;
        self.entries.push(entry);
        self.current = self.entries.len();
        debug!(position = self.current, ?entry, "position appended");
        self.publish();
        Ok(())
    }

    /// Remove the entry at a 1-based index and rewrite both logs.
    ///
    /// The cursor moves to the previous entry (or the new first one).
    pub fn delete_at(&mut self, position: usize) -> AppResult<PositionListEntry> {
        if position == 0 || position > self.entries.len() {
            return Err(DaqError::NoPositions);
        }
        let removed = self.entries.remove(position - 1);
        self.current = if self.entries.is_empty() {
            0
        } else {
            (position - 1).max(1)
        };
        self.rewrite_logs()?;
        info!(position, "position deleted");
        self.publish();
        Ok(removed)
    }

    /// Remove the entry under the cursor, if any.
    pub fn delete_current(&mut self) -> AppResult<Option<PositionListEntry>> {
        if self.current == 0 {
            return Ok(None);
        }
        self.delete_at(self.current).map(Some)
    }

    /// Remove every entry; the logs keep only their headers.
    pub fn delete_all(&mut self) -> AppResult<()> {
        self.entries.clear();
        self.current = 0;
        self.rewrite_logs()?;
        info!("position list cleared");
        self.publish();
        Ok(())
    }

    /// Move the cursor, clamping at both ends.
    ///
    /// Returns the entry under the cursor even when it did not move, so the
    /// caller can visit it again; `None` only for an empty list.
    pub fn navigate(&mut self, direction: NavigateDirection) -> Option<PositionListEntry> {
        let total = self.entries.len();
        if total == 0 {
            return None;
        }
        self.current = match direction {
            NavigateDirection::Start => 1,
            NavigateDirection::Back => self.current.saturating_sub(1).max(1),
            NavigateDirection::Forward => (self.current + 1).min(total),
            NavigateDirection::End => total,
        };
        self.publish();
        self.get(self.current - 1)
    }

    /// Point the cursor at a 1-based position without moving anything.
    pub fn set_current(&mut self, position: usize) {
        self.current = position.min(self.entries.len());
        self.publish();
    }

    /// Overwrite the stored focus of a 0-based entry.
    ///
    /// Only the in-memory list changes; the logs record what the operator saved.
    pub fn set_focus(&mut self, index: usize, focus_z_um: f64) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.focus_z_um = focus_z_um;
        }
    }

    /// Append every entry from the logs of a previous session folder.
    pub fn load_from_folder(&mut self, folder: &Path) -> AppResult<usize> {
        let loaded = read_position_logs(&folder.join(FOCUS_LOG_FILE), &folder.join(XY_LOG_FILE))?;
        for entry in &loaded {
            self.append(*entry)?;
        }
        info!(count = loaded.len(), folder = %folder.display(), "positions loaded");
        Ok(loaded.len())
    }

    fn rewrite_logs(&self) -> AppResult<()> {
        let mut focus = format!("{}\n", self.header);
        let mut xy = format!("{}\n", self.header);
        for entry in &self.entries {
            focus.push_str(&format_focus(entry.focus_z_um));
            focus.push('\n');
            xy.push_str(&format_xy(entry.xy_mm));
            xy.push('\n');
        }
        fs::write(&self.focus_log, focus)?;
        fs::write(&self.xy_log, xy)?;
        Ok(())
    }

    fn publish(&self) {
        self.cursor.set_if_changed(PositionCursor {
            current: self.current,
            total: self.entries.len(),
        });
    }
}

fn append_line(path: &Path, line: &str) -> AppResult<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

fn format_focus(z_um: f64) -> String {
    format!("{:?},", z_um)
}

fn format_xy((x, y): (f64, f64)) -> String {
    format!("[{:?}, {:?}],", x, y)
}

/// Value lines of a log: header and blank lines skipped, trailing comma removed.
fn value_lines(path: &Path) -> AppResult<Vec<(usize, String)>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(n, line)| (n, line.strip_suffix(',').unwrap_or(line).trim().to_string()))
        .collect())
}

fn parse_error(path: &Path, line: usize, reason: impl Into<String>) -> DaqError {
    DaqError::Parse {
        path: path.to_path_buf(),
        line,
        reason: reason.into(),
    }
}

/// Read a focus log and an XY log that must describe the same positions.
pub fn read_position_logs(focus_path: &Path, xy_path: &Path) -> AppResult<Vec<PositionListEntry>> {
    let focus_lines = value_lines(focus_path)?;
    let xy_lines = value_lines(xy_path)?;
    if focus_lines.len() != xy_lines.len() {
        return Err(DaqError::PositionListMismatch {
            focus: focus_lines.len(),
            xy: xy_lines.len(),
        });
    }

    focus_lines
        .iter()
        .zip(&xy_lines)
        .map(|((focus_line, focus), (xy_line, xy))| {
            let focus_z_um: f64 = focus
                .parse()
                .map_err(|_| parse_error(focus_path, *focus_line, format!("invalid focus '{}'", focus)))?;
            let coords: Vec<&str> = xy
                .trim_start_matches('[')
                .trim_end_matches(']')
                .split(',')
                .map(str::trim)
                .collect();
            let xy_mm = match coords.as_slice() {
                [x, y] => x.parse::<f64>().ok().zip(y.parse::<f64>().ok()),
                _ => None,
            }
            .ok_or_else(|| parse_error(xy_path, *xy_line, format!("invalid XY '{}'", xy)))?;
            Ok(PositionListEntry { focus_z_um, xy_mm })
        })
        .collect()
}
