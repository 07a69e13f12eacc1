use std::ops::Range;

use rkyv::{Archive, Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::Error;

pub mod kernel;
pub mod partition;

pub const DEAD: u8 = 0;
pub const ALIVE: u8 = 255;

/// Returns true if `row` is `width` cells, each DEAD or ALIVE.
pub fn is_valid_row(row: &[u8], width: usize) -> bool {
    row.len() == width && row.iter().all(|&c| c == DEAD || c == ALIVE)
}

/// Generation counter. Turn 0 is the loaded grid.
pub type Turn = u32;

/// Run parameters. Fixed for the lifetime of one run.
#[derive(
    Archive, Serialize, Deserialize, TypedBuilder, Clone, Copy, Debug, PartialEq, Eq,
)]
#[archive(check_bytes)]
pub struct Params {
    /// Total generations to compute.
    pub turns: Turn,
    /// Number of bands to split the grid into, capped by the worker count.
    #[builder(default = 1)]
    pub concurrency: usize,
    pub width: usize,
    pub height: usize,
}

impl Params {
    pub fn validate(&self) -> Result<(), Error> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::invalid(format!(
                "grid must be non-empty, got {}x{}",
                self.width, self.height
            )));
        }
        if self.concurrency == 0 {
            return Err(Error::invalid("concurrency must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub struct Cell {
    pub row: usize,
    pub col: usize,
}

/// A cell that flipped state while computing `turn`.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct CellChange {
    pub row: usize,
    pub col: usize,
    pub turn: Turn,
}

/// A row-major matrix of cells, each exactly [`DEAD`] or [`ALIVE`].
///
/// Grids arriving over the wire bypass the constructors, so receivers call
/// [`Grid::validate`] before trusting one.
#[derive(Archive, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Grid {
    width: usize,
    height: usize,
    cells: Vec<u8>,
}

impl Grid {
    /// Creates an all-dead grid.
    pub fn new(width: usize, height: usize) -> Result<Self, Error> {
        let area = width.checked_mul(height).ok_or_else(|| {
            Error::invalid(format!("{}x{} grid is too large", width, height))
        })?;
        Self::from_cells(width, height, vec![DEAD; area])
    }

    pub fn from_cells(
        width: usize,
        height: usize,
        cells: Vec<u8>,
    ) -> Result<Self, Error> {
        let grid = Self {
            width,
            height,
            cells,
        };
        grid.validate()?;
        Ok(grid)
    }

    /// Builds a grid from a list of live `(row, col)` coordinates.
    pub fn from_alive(
        width: usize,
        height: usize,
        alive: &[(usize, usize)],
    ) -> Result<Self, Error> {
        let mut grid = Self::new(width, height)?;
        for &(row, col) in alive {
            if row >= height || col >= width {
                return Err(Error::invalid(format!(
                    "cell ({}, {}) lies outside a {}x{} grid",
                    row, col, width, height
                )));
            }
            grid.set(row, col, true);
        }
        Ok(grid)
    }

    /// Builds a grid by stacking equally sized rows.
    pub fn from_rows<R: AsRef<[u8]>>(rows: &[R]) -> Result<Self, Error> {
        let width = rows.first().map_or(0, |r| r.as_ref().len());
        let mut cells = Vec::with_capacity(width * rows.len());
        for row in rows {
            if row.as_ref().len() != width {
                return Err(Error::invalid("rows have different widths"));
            }
            cells.extend_from_slice(row.as_ref());
        }
        Self::from_cells(width, rows.len(), cells)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::invalid(format!(
                "grid must be non-empty, got {}x{}",
                self.width, self.height
            )));
        }
        let Some(area) = self.width.checked_mul(self.height) else {
            return Err(Error::invalid(format!(
                "{}x{} grid is too large",
                self.width, self.height
            )));
        };
        if self.cells.len() != area {
            return Err(Error::invalid(format!(
                "{} cells do not fill a {}x{} grid",
                self.cells.len(),
                self.width,
                self.height
            )));
        }
        if let Some(bad) = self.cells.iter().find(|&&c| c != DEAD && c != ALIVE)
        {
            return Err(Error::invalid(format!("invalid cell value {}", bad)));
        }
        Ok(())
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, row: usize, col: usize) -> u8 {
        self.cells[row * self.width + col]
    }

    pub fn is_alive(&self, row: usize, col: usize) -> bool {
        self.get(row, col) == ALIVE
    }

    pub fn set(&mut self, row: usize, col: usize, alive: bool) {
        self.cells[row * self.width + col] = if alive { ALIVE } else { DEAD };
    }

    pub fn row(&self, row: usize) -> &[u8] {
        &self.cells[row * self.width..(row + 1) * self.width]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u8]> {
        self.cells.chunks_exact(self.width)
    }

    pub fn cells(&self) -> &[u8] {
        &self.cells
    }

    /// Copies rows `range` into a new grid.
    pub fn slice_rows(&self, range: Range<usize>) -> Result<Grid, Error> {
        if range.start >= range.end || range.end > self.height {
            return Err(Error::invalid(format!(
                "row range {:?} is empty or outside 0..{}",
                range, self.height
            )));
        }
        Ok(Grid {
            width: self.width,
            height: range.len(),
            cells: self.cells[range.start * self.width..range.end * self.width]
                .to_vec(),
        })
    }

    /// Overwrites rows starting at `start_row` with the rows of `band`.
    pub fn write_rows(&mut self, start_row: usize, band: &Grid) -> Result<(), Error> {
        if band.width != self.width || start_row + band.height > self.height {
            return Err(Error::invalid(format!(
                "{}x{} band does not fit at row {} of a {}x{} grid",
                band.width, band.height, start_row, self.width, self.height
            )));
        }
        let offset = start_row * self.width;
        self.cells[offset..offset + band.cells.len()].copy_from_slice(&band.cells);
        Ok(())
    }

    pub fn alive_count(&self) -> usize {
        self.cells.iter().filter(|&&c| c == ALIVE).count()
    }

    pub fn alive_cells(&self) -> Vec<Cell> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, &c)| c == ALIVE)
            .map(|(i, _)| Cell {
                row: i / self.width,
                col: i % self.width,
            })
            .collect()
    }

    /// A blake3 digest of the dimensions and cells, for logging and cheap
    /// equality checks across processes.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.width as u64).to_le_bytes());
        hasher.update(&(self.height as u64).to_le_bytes());
        hasher.update(&self.cells);
        *hasher.finalize().as_bytes()
    }
}

impl std::fmt::Debug for Grid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Grid {}x{}", self.width, self.height)?;
        for row in self.rows() {
            for &cell in row {
                f.write_str(if cell == ALIVE { "#" } else { "." })?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_values_other_than_dead_and_alive() {
        assert!(Grid::from_cells(2, 1, vec![0, 255]).is_ok());
        assert!(matches!(
            Grid::from_cells(2, 1, vec![0, 1]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn rejects_empty_grids() {
        assert!(matches!(Grid::new(0, 4), Err(Error::InvalidInput(_))));
        assert!(matches!(Grid::new(4, 0), Err(Error::InvalidInput(_))));
        let empty: [Vec<u8>; 0] = [];
        assert!(Grid::from_rows(&empty).is_err());
    }

    #[test]
    fn oversized_dimensions_are_rejected() {
        assert!(matches!(
            Grid::from_cells(usize::MAX, 2, vec![DEAD; 4]),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            Grid::new(usize::MAX / 2 + 1, 2),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn slices_and_writes_rows() {
        let grid = Grid::from_alive(3, 4, &[(1, 0), (2, 2)]).unwrap();
        let band = grid.slice_rows(1..3).unwrap();
        assert_eq!(band.height(), 2);
        assert!(band.is_alive(0, 0));
        assert!(band.is_alive(1, 2));

        let mut blank = Grid::new(3, 4).unwrap();
        blank.write_rows(1, &band).unwrap();
        assert_eq!(blank, grid);
        assert!(blank.write_rows(3, &band).is_err());
        assert!(grid.slice_rows(2..2).is_err());
    }

    #[test]
    fn digest_tracks_contents() {
        let a = Grid::from_alive(4, 4, &[(0, 0)]).unwrap();
        let b = Grid::from_alive(4, 4, &[(0, 1)]).unwrap();
        assert_eq!(a.digest(), a.clone().digest());
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.alive_cells(), vec![Cell { row: 0, col: 0 }]);
    }

    #[test]
    fn params_need_a_grid_and_a_band() {
        let params = Params::builder().turns(1).width(8).height(8).build();
        assert!(params.validate().is_ok());
        assert_eq!(params.concurrency, 1);
        let zero = Params::builder().turns(1).concurrency(0).width(8).height(8).build();
        assert!(zero.validate().is_err());
    }
}
