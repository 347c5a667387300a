//! Tile navigator.
//!
//! A tile grid is `size × size` fields of view laid edge to edge, anchored at
//! the stage position current when it was created. It uses the same sign
//! convention as the grid: columns towards negative X, rows towards
//! positive Y.

use serde::Serialize;
use tracing::info;

use super::grid::GridCell;
use crate::error::{AppResult, DaqError};

const MIN_SIZE: usize = 2;
const MAX_SIZE: usize = 9;

/// Physical size of one field of view in mm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FieldOfView {
    /// Along X
    pub width_mm: f64,
    /// Along Y, the scan direction
    pub height_mm: f64,
}

impl FieldOfView {
    /// FOV of a camera `width_px` wide scanning `scan_range_um`.
    pub fn from_settings(width_px: u32, scan_range_um: u32, sample_px_um: f64) -> Self {
        Self {
            width_mm: 1e-3 * f64::from(width_px) * sample_px_um,
            height_mm: 1e-3 * f64::from(scan_range_um),
        }
    }
}

/// `position[r][c] = (anchor_x - c·fov_w, anchor_y + r·fov_h)` in mm.
pub fn generate_tile_grid(size: usize, fov: FieldOfView, anchor_xy: (f64, f64)) -> Vec<Vec<(f64, f64)>> {
    (0..size)
        .map(|r| {
            (0..size)
                .map(|c| {
                    (
                        anchor_xy.0 - c as f64 * fov.width_mm,
                        anchor_xy.1 + r as f64 * fov.height_mm,
                    )
                })
                .collect()
        })
        .collect()
}

/// `r0c0`-style tile name.
pub fn tile_name(row: usize, col: usize) -> String {
    format!("r{}c{}", row, col)
}

/// Reject tile sizes outside `2..=9`.
pub fn check_tile_size(size: usize) -> AppResult<usize> {
    if (MIN_SIZE..=MAX_SIZE).contains(&size) {
        Ok(size)
    } else {
        Err(DaqError::InvalidTile(format!(
            "tile size must be {}..={}, got {}",
            MIN_SIZE, MAX_SIZE, size
        )))
    }
}

/// Split every grid cell into `size × size` tiles, named `A1_r0c0`.
///
/// `size` 1 keeps each cell as a single tile under its plain grid name.
pub fn tile_grid_cells(cells: &[GridCell], size: usize, fov: FieldOfView) -> Vec<GridCell> {
    if size <= 1 {
        return cells.to_vec();
    }
    cells
        .iter()
        .flat_map(|cell| {
            let tiles = generate_tile_grid(size, fov, cell.xy_mm);
            tiles
                .into_iter()
                .enumerate()
                .flat_map(move |(tr, row)| {
                    row.into_iter().enumerate().map(move |(tc, xy_mm)| GridCell {
                        row: cell.row,
                        col: cell.col,
                        name: format!("{}_{}", cell.name, tile_name(tr, tc)),
                        xy_mm,
                    })
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// One tile of the current tile grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tile {
    /// 0-based row
    pub row: usize,
    /// 0-based column
    pub col: usize,
    /// `r0c0` style name
    pub name: String,
    /// Stage position of the tile
    pub xy_mm: (f64, f64),
}

/// Tile state for the session.
#[derive(Debug, Default)]
pub struct TileNavigator {
    size: usize,
    positions: Option<Vec<Vec<(f64, f64)>>>,
    location: Option<usize>,
}

impl TileNavigator {
    /// No tile grid yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tiles per edge of the last grid; 0 before one is created.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether a tile grid exists.
    pub fn is_created(&self) -> bool {
        self.positions.is_some()
    }

    /// Tile last moved to.
    pub fn location(&self) -> Option<usize> {
        self.location
    }

    /// Build a `size × size` grid anchored at `anchor_xy`; the anchor is tile 0.
    pub fn create(&mut self, size: usize, fov: FieldOfView, anchor_xy: (f64, f64)) -> AppResult<()> {
        let size = check_tile_size(size)?;
        self.positions = Some(generate_tile_grid(size, fov, anchor_xy));
        self.size = size;
        self.location = Some(0);
        info!(size, ?anchor_xy, fov_w_mm = fov.width_mm, fov_h_mm = fov.height_mm, "tile grid created");
        Ok(())
    }

    /// Position of a row-major tile index.
    pub fn position(&self, index: usize) -> AppResult<(f64, f64)> {
        let positions = self
            .positions
            .as_ref()
            .ok_or_else(|| DaqError::InvalidTile("no tile grid created".into()))?;
        positions
            .get(index / self.size.max(1))
            .and_then(|row| row.get(index % self.size.max(1)))
            .copied()
            .ok_or_else(|| DaqError::InvalidTile(format!("no tile {}", index)))
    }

    /// Remember `index` as the current tile and return its position.
    pub fn move_to(&mut self, index: usize) -> AppResult<(f64, f64)> {
        let xy = self.position(index)?;
        self.location = Some(index);
        Ok(xy)
    }

    /// Every tile in row-major order.
    pub fn tiles(&self) -> Vec<Tile> {
        let Some(positions) = &self.positions else {
            return Vec::new();
        };
        positions
            .iter()
            .enumerate()
            .flat_map(|(row, cols)| {
                cols.iter().enumerate().map(move |(col, &xy_mm)| Tile {
                    row,
                    col,
                    name: tile_name(row, col),
                    xy_mm,
                })
            })
            .collect()
    }
}
