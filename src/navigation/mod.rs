//! Navigation state owned by the session: the operator position list, the
//! plate-style grid and the FOV tile grid.

pub mod grid;
pub mod position_list;
pub mod tile;

use std::path::Path;

use crate::error::AppResult;

pub use grid::{cell_name, generate_grid, GridCell, GridNavigator, GridSpec, GRID_PARAMS_FILE};
pub use position_list::{
    read_position_logs, NavigateDirection, PositionCursor, PositionList, PositionListEntry,
    FOCUS_LOG_FILE, XY_LOG_FILE,
};
pub use tile::{
    check_tile_size, generate_tile_grid, tile_grid_cells, tile_name, FieldOfView, Tile,
    TileNavigator,
};

/// Everything the session navigates with. Outlives any single mode.
#[derive(Debug)]
pub struct NavigationStore {
    /// Operator position list
    pub positions: PositionList,
    /// Well-plate style grid
    pub grid: GridNavigator,
    /// Tile grid around one position
    pub tiles: TileNavigator,
}

impl NavigationStore {
    /// Empty navigation state persisted under the session folder `dir`.
    pub fn create(dir: &Path, session_tag: &str) -> AppResult<Self> {
        Ok(Self {
            positions: PositionList::create(dir, session_tag)?,
            grid: GridNavigator::new(dir),
            tiles: TileNavigator::new(),
        })
    }
}
