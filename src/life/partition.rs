//! Splits a grid into row bands, one per worker.
//!
//! Every partition call site goes through [`compute_band`], so the owned
//! ranges and halo rows are derived in exactly one place.

use std::ops::Range;

use rkyv::{Archive, Deserialize, Serialize};

use super::{is_valid_row, Grid};
use crate::Error;

/// Where a band sits in the full grid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BandPlan {
    pub index: usize,
    /// Rows this band computes and reports.
    pub owned: Range<usize>,
    /// The row directly above `owned.start`, wrapping to `height - 1`.
    pub halo_above: usize,
    /// The row directly below `owned.end - 1`, wrapping to `0`.
    pub halo_below: usize,
}

impl BandPlan {
    pub fn len(&self) -> usize {
        self.owned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owned.is_empty()
    }
}

/// Computes band `index` of `partitions` over a grid `height` rows tall.
///
/// Band `i` owns `[i*H/P, (i+1)*H/P)` except the last band, which runs to
/// `H` and so absorbs the `H mod P` remainder rows.
pub fn compute_band(
    height: usize,
    partitions: usize,
    index: usize,
) -> Result<BandPlan, Error> {
    if partitions == 0 || partitions > height {
        return Err(Error::invalid(format!(
            "cannot split {} rows into {} bands",
            height, partitions
        )));
    }
    if index >= partitions {
        return Err(Error::invalid(format!(
            "band {} does not exist among {}",
            index, partitions
        )));
    }
    let base = height / partitions;
    let start = index * base;
    let end = if index == partitions - 1 {
        height
    } else {
        start + base
    };
    Ok(BandPlan {
        index,
        owned: start..end,
        halo_above: (start + height - 1) % height,
        halo_below: end % height,
    })
}

/// Plans every band of a `partitions`-way split, in row order.
pub fn plan(height: usize, partitions: usize) -> Result<Vec<BandPlan>, Error> {
    (0..partitions)
        .map(|index| compute_band(height, partitions, index))
        .collect()
}

/// The rows one worker computes, plus the neighbouring rows needed for its
/// next generation.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Band {
    pub start_row: usize,
    pub end_row: usize,
    pub rows: Grid,
    pub halo_above: Vec<u8>,
    pub halo_below: Vec<u8>,
}

impl Band {
    /// Cuts the band described by `plan` out of `grid`.
    pub fn cut(grid: &Grid, plan: &BandPlan) -> Result<Self, Error> {
        Ok(Self {
            start_row: plan.owned.start,
            end_row: plan.owned.end,
            rows: grid.slice_rows(plan.owned.clone())?,
            halo_above: grid.row(plan.halo_above).to_vec(),
            halo_below: grid.row(plan.halo_below).to_vec(),
        })
    }

    /// Checks the band is internally consistent and fits a grid of the given
    /// dimensions.
    pub fn validate(&self, width: usize, height: usize) -> Result<(), Error> {
        self.rows.validate()?;
        if self.start_row >= self.end_row || self.end_row > height {
            return Err(Error::invalid(format!(
                "band rows {}..{} are empty or outside 0..{}",
                self.start_row, self.end_row, height
            )));
        }
        if self.rows.height() != self.end_row - self.start_row {
            return Err(Error::invalid(format!(
                "band {}..{} carries {} rows",
                self.start_row,
                self.end_row,
                self.rows.height()
            )));
        }
        if self.rows.width() != width {
            return Err(Error::invalid(format!(
                "band is {} wide, grid is {} wide",
                self.rows.width(),
                width
            )));
        }
        for halo in [&self.halo_above, &self.halo_below] {
            if !is_valid_row(halo, width) {
                return Err(Error::invalid("malformed halo row"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_cover_every_row_exactly_once() {
        for height in 1..=40 {
            for partitions in 1..=height {
                let bands = plan(height, partitions).unwrap();
                let mut owner = vec![0usize; height];
                for band in &bands {
                    assert!(!band.is_empty());
                    for row in band.owned.clone() {
                        owner[row] += 1;
                    }
                }
                assert!(
                    owner.iter().all(|&n| n == 1),
                    "H={} P={} gives {:?}",
                    height,
                    partitions,
                    owner
                );
                // contiguous and in order
                for pair in bands.windows(2) {
                    assert_eq!(pair[0].owned.end, pair[1].owned.start);
                }
            }
        }
    }

    #[test]
    fn last_band_absorbs_the_remainder() {
        let bands = plan(10, 3).unwrap();
        let sizes: Vec<_> = bands.iter().map(BandPlan::len).collect();
        assert_eq!(sizes, vec![3, 3, 4]);
        assert_eq!(bands[2].owned, 6..10);
    }

    #[test]
    fn halos_wrap_around_the_grid() {
        let bands = plan(8, 2).unwrap();
        assert_eq!(bands[0].owned, 0..4);
        assert_eq!(bands[0].halo_above, 7);
        assert_eq!(bands[0].halo_below, 4);
        assert_eq!(bands[1].owned, 4..8);
        assert_eq!(bands[1].halo_above, 3);
        assert_eq!(bands[1].halo_below, 0);

        let single = compute_band(5, 1, 0).unwrap();
        assert_eq!((single.halo_above, single.halo_below), (4, 0));
    }

    #[test]
    fn rejects_impossible_splits() {
        assert!(compute_band(4, 0, 0).is_err());
        assert!(compute_band(4, 5, 0).is_err());
        assert!(compute_band(4, 2, 2).is_err());
    }

    #[test]
    fn cut_carries_halo_rows() {
        let grid = Grid::from_alive(3, 6, &[(0, 0), (2, 1), (5, 2)]).unwrap();
        let plan = compute_band(6, 2, 0).unwrap();
        let band = Band::cut(&grid, &plan).unwrap();
        assert_eq!((band.start_row, band.end_row), (0, 3));
        assert_eq!(band.halo_above, grid.row(5));
        assert_eq!(band.halo_below, grid.row(3));
        assert!(band.validate(3, 6).is_ok());
        assert!(band.validate(4, 6).is_err());
    }
}
