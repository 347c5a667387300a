//! Grid navigator.
//!
//! A grid is `rows × cols` cells `spacing_um` apart, named like a plate:
//! `A1` is the top-left cell, rows are letters and columns are 1-based
//! numbers. Columns step towards negative X and rows towards positive Y.
//! Cell positions exist only once the grid has been located by declaring the
//! current stage position to be one of its cells.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AppResult, DaqError};

/// Grid parameter file name.
pub const GRID_PARAMS_FILE: &str = "grid_navigator_parameters.txt";

const MAX_ROWS: usize = 16;
const MAX_COLS: usize = 24;
const MAX_SPACING_UM: u32 = 20_000;

/// Grid dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSpec {
    /// Rows, named `A`, `B`, ...
    pub rows: usize,
    /// Columns, numbered from 1
    pub cols: usize,
    /// Cell pitch in both axes
    pub spacing_um: u32,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            rows: 2,
            cols: 4,
            spacing_um: 100,
        }
    }
}

impl GridSpec {
    /// Validated grid dimensions.
    pub fn new(rows: usize, cols: usize, spacing_um: u32) -> AppResult<Self> {
        if !(1..=MAX_ROWS).contains(&rows) {
            return Err(DaqError::InvalidGrid(format!("rows must be 1..={}, got {}", MAX_ROWS, rows)));
        }
        if !(1..=MAX_COLS).contains(&cols) {
            return Err(DaqError::InvalidGrid(format!("columns must be 1..={}, got {}", MAX_COLS, cols)));
        }
        if !(1..=MAX_SPACING_UM).contains(&spacing_um) {
            return Err(DaqError::InvalidGrid(format!(
                "spacing must be 1..={} um, got {}",
                MAX_SPACING_UM, spacing_um
            )));
        }
        Ok(Self {
            rows,
            cols,
            spacing_um,
        })
    }

    /// Cell pitch in stage units.
    pub fn spacing_mm(&self) -> f64 {
        1e-3 * f64::from(self.spacing_um)
    }

    /// Number of cells.
    pub fn cell_count(&self) -> usize {
        self.rows * self.cols
    }

    /// `(row, col)` of a row-major cell index.
    pub fn cell_rc(&self, cell: usize) -> (usize, usize) {
        (cell / self.cols, cell % self.cols)
    }

    /// Serialise as the three-line parameter file.
    pub fn to_file_text(&self) -> String {
        format!(
            "rows:{}\ncolumns:{}\nspacing_um:{}\n",
            self.rows, self.cols, self.spacing_um
        )
    }

    /// Parse the three-line parameter file.
    pub fn parse_file_text(path: &Path, text: &str) -> AppResult<Self> {
        let mut values = text.lines().filter(|l| !l.trim().is_empty()).enumerate().map(|(i, line)| {
            let value = line.split_once(':').map(|(_, v)| v.trim()).unwrap_or("");
            value.parse::<u32>().map_err(|_| DaqError::Parse {
                path: path.to_path_buf(),
                line: i + 1,
                reason: format!("expected '<name>:<integer>', got '{}'", line),
            })
        });
        let mut next = |name: &str| {
            values.next().unwrap_or_else(|| {
                Err(DaqError::Parse {
                    path: path.to_path_buf(),
                    line: 0,
                    reason: format!("missing {}", name),
                })
            })
        };
        let rows = next("rows")?;
        let cols = next("columns")?;
        let spacing_um = next("spacing_um")?;
        Self::new(rows as usize, cols as usize, spacing_um)
    }
}

/// Plate-style cell name: row letter then 1-based column.
pub fn cell_name(row: usize, col: usize) -> String {
    let letter = char::from(b'A' + (row % 26) as u8);
    format!("{}{}", letter, col + 1)
}

/// `position[r][c] = (origin_x - c·spacing, origin_y + r·spacing)` in mm.
pub fn generate_grid(spec: &GridSpec, origin_xy: (f64, f64)) -> Vec<Vec<(f64, f64)>> {
    let s = spec.spacing_mm();
    (0..spec.rows)
        .map(|r| {
            (0..spec.cols)
                .map(|c| (origin_xy.0 - c as f64 * s, origin_xy.1 + r as f64 * s))
                .collect()
        })
        .collect()
}

/// One located grid cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridCell {
    /// 0-based row
    pub row: usize,
    /// 0-based column
    pub col: usize,
    /// `A1` style name
    pub name: String,
    /// Stage position of the cell
    pub xy_mm: (f64, f64),
}

/// Grid state for the session.
#[derive(Debug)]
pub struct GridNavigator {
    spec: GridSpec,
    origin_rc: Option<(usize, usize)>,
    positions: Option<Vec<Vec<(f64, f64)>>>,
    location: Option<usize>,
    params_path: PathBuf,
}

impl GridNavigator {
    /// Default grid whose parameter file lives in `dir`.
    pub fn new(dir: &Path) -> Self {
        Self {
            spec: GridSpec::default(),
            origin_rc: None,
            positions: None,
            location: None,
            params_path: dir.join(GRID_PARAMS_FILE),
        }
    }

    /// Current dimensions.
    pub fn spec(&self) -> GridSpec {
        self.spec
    }

    /// Whether cell positions are known.
    pub fn is_located(&self) -> bool {
        self.positions.is_some()
    }

    /// Cell the operator declared or last moved to.
    pub fn location(&self) -> Option<usize> {
        self.location
    }

    /// Cell chosen as the reference when the grid was located.
    pub fn origin_rc(&self) -> Option<(usize, usize)> {
        self.origin_rc
    }

    /// Replace the dimensions and save them. Previous positions are dropped.
    pub fn create(&mut self, spec: GridSpec) -> AppResult<()> {
        let spec = GridSpec::new(spec.rows, spec.cols, spec.spacing_um)?;
        fs::write(&self.params_path, spec.to_file_text())?;
        self.spec = spec;
        self.origin_rc = None;
        self.positions = None;
        self.location = None;
        info!(rows = spec.rows, cols = spec.cols, spacing_um = spec.spacing_um, "grid created");
        Ok(())
    }

    /// Read dimensions from a parameter file and adopt them.
    pub fn load_parameters(&mut self, path: &Path) -> AppResult<GridSpec> {
        let text = fs::read_to_string(path)?;
        let spec = GridSpec::parse_file_text(path, &text)?;
        self.create(spec)?;
        Ok(spec)
    }

    /// Declare that `current_xy` is cell `cell`, which positions every cell.
    pub fn locate(&mut self, cell: usize, current_xy: (f64, f64)) -> AppResult<()> {
        if cell >= self.spec.cell_count() {
            return Err(DaqError::InvalidGrid(format!(
                "cell {} outside a {}x{} grid",
                cell, self.spec.rows, self.spec.cols
            )));
        }
        let (row, col) = self.spec.cell_rc(cell);
        let s = self.spec.spacing_mm();
        let a1 = (current_xy.0 + col as f64 * s, current_xy.1 - row as f64 * s);
        self.positions = Some(generate_grid(&self.spec, a1));
        self.origin_rc = Some((row, col));
        self.location = Some(cell);
        info!(cell = %cell_name(row, col), "grid located");
        Ok(())
    }

    /// Position of a row-major cell.
    pub fn position(&self, cell: usize) -> AppResult<(f64, f64)> {
        let positions = self.positions.as_ref().ok_or(DaqError::GridNotSet)?;
        let (row, col) = self.spec.cell_rc(cell);
        positions
            .get(row)
            .and_then(|r| r.get(col))
            .copied()
            .ok_or_else(|| DaqError::InvalidGrid(format!("no cell {}", cell)))
    }

    /// Remember `cell` as the current location and return its position.
    pub fn move_to(&mut self, cell: usize) -> AppResult<(f64, f64)> {
        let xy = self.position(cell)?;
        self.location = Some(cell);
        Ok(xy)
    }

    /// Every cell in row-major order.
    pub fn cells(&self) -> AppResult<Vec<GridCell>> {
        let positions = self.positions.as_ref().ok_or(DaqError::GridNotSet)?;
        Ok(positions
            .iter()
            .enumerate()
            .flat_map(|(row, cols)| {
                cols.iter().enumerate().map(move |(col, &xy_mm)| GridCell {
                    row,
                    col,
                    name: cell_name(row, col),
                    xy_mm,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn close(a: (f64, f64), b: (f64, f64)) -> bool {
        (a.0 - b.0).abs() < 1e-9 && (a.1 - b.1).abs() < 1e-9
    }

    #[test]
    fn test_grid_formula() {
        let spec = GridSpec::new(2, 4, 1000).unwrap();
        let grid = generate_grid(&spec, (0.0, 0.0));
        assert!(close(grid[0][0], (0.0, 0.0)));
        assert!(close(grid[0][3], (-3.0, 0.0)));
        assert!(close(grid[1][0], (0.0, 1.0)));
    }

    #[test]
    fn test_bounds() {
        assert!(GridSpec::new(0, 4, 100).is_err());
        assert!(GridSpec::new(17, 4, 100).is_err());
        assert!(GridSpec::new(2, 25, 100).is_err());
        assert!(GridSpec::new(2, 4, 20_001).is_err());
        assert!(GridSpec::new(16, 24, 20_000).is_ok());
    }

    #[test]
    fn test_cell_names() {
        assert_eq!(cell_name(0, 0), "A1");
        assert_eq!(cell_name(1, 3), "B4");
        assert_eq!(cell_name(15, 23), "P24");
    }

    #[test]
    fn test_moves_disabled_until_located() {
        let dir = TempDir::new().unwrap();
        let grid = GridNavigator::new(dir.path());
        assert!(matches!(grid.position(0), Err(DaqError::GridNotSet)));
        assert!(grid.cells().is_err());
    }

    #[test]
    fn test_locate_from_any_cell() {
        let dir = TempDir::new().unwrap();
        let mut grid = GridNavigator::new(dir.path());
        grid.create(GridSpec::new(2, 3, 500).unwrap()).unwrap();

        // Standing on B2 (row 1, col 1) at (10, 20).
        grid.locate(4, (10.0, 20.0)).unwrap();
        assert!(close(grid.position(4).unwrap(), (10.0, 20.0)));
        assert!(close(grid.position(0).unwrap(), (10.5, 19.5)));
        assert_eq!(grid.origin_rc(), Some((1, 1)));

        let cells = grid.cells().unwrap();
        assert_eq!(cells.len(), 6);
        assert_eq!(cells[5].name, "B3");
    }

    #[test]
    fn test_create_invalidates_positions() {
        let dir = TempDir::new().unwrap();
        let mut grid = GridNavigator::new(dir.path());
        grid.locate(0, (0.0, 0.0)).unwrap();
        grid.create(GridSpec::new(3, 3, 100).unwrap()).unwrap();
        assert!(!grid.is_located());
        assert_eq!(grid.location(), None);
    }

    #[test]
    fn test_params_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut grid = GridNavigator::new(dir.path());
        grid.create(GridSpec::new(5, 7, 2500).unwrap()).unwrap();
        let text = fs::read_to_string(dir.path().join(GRID_PARAMS_FILE)).unwrap();
        assert_eq!(text, "rows:5\ncolumns:7\nspacing_um:2500\n");

        let other = TempDir::new().unwrap();
        let mut loaded = GridNavigator::new(other.path());
        let spec = loaded.load_parameters(&dir.path().join(GRID_PARAMS_FILE)).unwrap();
        assert_eq!(spec, grid.spec());
    }

    #[test]
    fn test_params_file_rejects_garbage() {
        let err = GridSpec::parse_file_text(Path::new("g.txt"), "rows:2\ncolumns:x\nspacing_um:5\n")
            .unwrap_err();
        assert!(matches!(err, DaqError::Parse { line: 2, .. }));
    }
}
