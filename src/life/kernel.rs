//! The Game of Life rule (B3/S23) on a torus.
//!
//! Everything here is pure: the worker decides which halo rows to feed in,
//! the kernel only counts neighbours and applies the rule.

use super::{CellChange, Grid, Turn, ALIVE, DEAD};

#[inline]
fn next_state(current: u8, alive_neighbours: u8) -> u8 {
    match (current == ALIVE, alive_neighbours) {
        (true, 2) | (true, 3) => ALIVE,
        (false, 3) => ALIVE,
        _ => DEAD,
    }
}

/// Counts the live neighbours of `(row, col)`, wrapping both axes.
pub fn alive_neighbours(grid: &Grid, row: usize, col: usize) -> u8 {
    let (h, w) = (grid.height(), grid.width());
    let mut count = 0;
    for (i, dr) in [h - 1, 0, 1].into_iter().enumerate() {
        for (j, dc) in [w - 1, 0, 1].into_iter().enumerate() {
            // skip by position, on a one-wide axis `h - 1` is also 0
            if i == 1 && j == 1 {
                continue;
            }
            if grid.get((row + dr) % h, (col + dc) % w) == ALIVE {
                count += 1;
            }
        }
    }
    count
}

/// Advances a whole grid by one generation.
pub fn step(grid: &Grid) -> Grid {
    let last = grid.height() - 1;
    let (next, _) = step_band(grid, grid.row(last), grid.row(0), 0, 0);
    next
}

/// Row `r` of the band extended by one halo row on each side: row -1 is
/// `above`, row `height` is `below`.
fn line<'a>(rows: &'a Grid, above: &'a [u8], below: &'a [u8], r: isize) -> &'a [u8] {
    if r < 0 {
        above
    } else if r as usize >= rows.height() {
        below
    } else {
        rows.row(r as usize)
    }
}

/// Advances a band of rows by one generation.
///
/// `above` and `below` are the rows adjacent to the band's first and last
/// row. Columns wrap within the band's width. `first_row` is the absolute
/// index of the band's first row, used to report changes in grid
/// coordinates; `turn` is the generation being computed.
pub fn step_band(
    rows: &Grid,
    above: &[u8],
    below: &[u8],
    first_row: usize,
    turn: Turn,
) -> (Grid, Vec<CellChange>) {
    let (h, w) = (rows.height(), rows.width());
    debug_assert_eq!(above.len(), w);
    debug_assert_eq!(below.len(), w);

    let mut cells = Vec::with_capacity(w * h);
    let mut changes = Vec::new();
    for r in 0..h {
        let window = [
            line(rows, above, below, r as isize - 1),
            rows.row(r),
            line(rows, above, below, r as isize + 1),
        ];
        for c in 0..w {
            let left = (c + w - 1) % w;
            let right = (c + 1) % w;
            let mut count = 0u8;
            for (i, neighbours) in window.iter().enumerate() {
                count += (neighbours[left] == ALIVE) as u8;
                count += (neighbours[right] == ALIVE) as u8;
                if i != 1 {
                    count += (neighbours[c] == ALIVE) as u8;
                }
            }
            let current = window[1][c];
            let next = next_state(current, count);
            if next != current {
                changes.push(CellChange {
                    row: first_row + r,
                    col: c,
                    turn,
                });
            }
            cells.push(next);
        }
    }

    // every cell came from next_state, so only DEAD or ALIVE were written
    let next = Grid::from_cells(w, h, cells)
        .expect("kernel output has the dimensions of its input");
    (next, changes)
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn random_grid(rng: &mut StdRng, width: usize, height: usize) -> Grid {
        let cells = (0..width * height)
            .map(|_| if rng.gen_bool(0.4) { ALIVE } else { DEAD })
            .collect();
        Grid::from_cells(width, height, cells).unwrap()
    }

    fn explicit_count(grid: &Grid, row: usize, col: usize) -> u8 {
        let (h, w) = (grid.height() as isize, grid.width() as isize);
        let mut count = 0;
        for (dr, dc) in [
            (-1, -1),
            (-1, 0),
            (-1, 1),
            (0, -1),
            (0, 1),
            (1, -1),
            (1, 0),
            (1, 1),
        ] {
            let r = (row as isize + dr).rem_euclid(h) as usize;
            let c = (col as isize + dc).rem_euclid(w) as usize;
            if grid.is_alive(r, c) {
                count += 1;
            }
        }
        count
    }

    #[test]
    fn neighbour_count_matches_wrapped_enumeration() {
        let mut rng = StdRng::seed_from_u64(7);
        for (w, h) in [(1, 1), (2, 3), (3, 3), (5, 8), (16, 9)] {
            let grid = random_grid(&mut rng, w, h);
            for row in 0..h {
                for col in 0..w {
                    assert_eq!(
                        alive_neighbours(&grid, row, col),
                        explicit_count(&grid, row, col),
                        "({}, {}) on {}x{}",
                        row,
                        col,
                        w,
                        h
                    );
                }
            }
        }
    }

    #[test]
    fn step_agrees_with_neighbour_count() {
        let mut rng = StdRng::seed_from_u64(11);
        let grid = random_grid(&mut rng, 12, 10);
        let next = step(&grid);
        for row in 0..grid.height() {
            for col in 0..grid.width() {
                let expected =
                    next_state(grid.get(row, col), explicit_count(&grid, row, col));
                assert_eq!(next.get(row, col), expected);
            }
        }
    }

    #[test]
    fn blinker_has_period_two() {
        let horizontal = Grid::from_alive(5, 5, &[(2, 1), (2, 2), (2, 3)]).unwrap();
        let vertical = Grid::from_alive(5, 5, &[(1, 2), (2, 2), (3, 2)]).unwrap();
        let once = step(&horizontal);
        assert_eq!(once, vertical);
        assert_eq!(step(&once), horizontal);
    }

    #[test]
    fn glider_translates_diagonally_every_four_generations() {
        let glider = [(0, 1), (1, 2), (2, 0), (2, 1), (2, 2)];
        let start = Grid::from_alive(8, 8, &glider).unwrap();
        let moved: Vec<_> = glider.iter().map(|&(r, c)| (r + 1, c + 1)).collect();
        let expected = Grid::from_alive(8, 8, &moved).unwrap();

        let mut grid = start;
        for _ in 0..4 {
            grid = step(&grid);
        }
        assert_eq!(grid, expected);
    }

    #[test]
    fn band_step_matches_monolithic_rows() {
        let mut rng = StdRng::seed_from_u64(3);
        let grid = random_grid(&mut rng, 10, 10);
        let whole = step(&grid);

        let band = grid.slice_rows(3..7).unwrap();
        let (next, changes) = step_band(&band, grid.row(2), grid.row(7), 3, 0);
        assert_eq!(next, whole.slice_rows(3..7).unwrap());
        for change in &changes {
            assert!((3..7).contains(&change.row));
            assert_ne!(grid.get(change.row, change.col), whole.get(change.row, change.col));
        }
    }

    #[test]
    fn changes_report_absolute_coordinates_and_turn() {
        let grid = Grid::from_alive(5, 5, &[(2, 1), (2, 2), (2, 3)]).unwrap();
        let (_, mut changes) = step_band(&grid, grid.row(4), grid.row(0), 0, 6);
        changes.sort_by_key(|c| (c.row, c.col));
        let flipped: Vec<_> = changes.iter().map(|c| (c.row, c.col)).collect();
        assert_eq!(flipped, vec![(1, 2), (2, 1), (2, 3), (3, 2)]);
        assert!(changes.iter().all(|c| c.turn == 6));
    }
}
