use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

use crate::{
    life::{partition::BandPlan, Grid, Turn},
    worker::BandSnapshot,
    Error,
};

/// Something a merge noticed but did not hide.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Inconsistency {
    /// Band `band` reported a different turn from the first responder.
    TurnMismatch {
        band: usize,
        expected: Turn,
        found: Turn,
    },
    /// No usable response covered these rows; they keep their prior value.
    MissingRows { start_row: usize, end_row: usize },
    /// Band `band` answered with rows that do not fit its plan.
    RejectedBand { band: usize, reason: String },
    /// The run stopped at turn `reached` short of its `target`.
    IncompleteRun { reached: Turn, target: Turn },
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inconsistency::TurnMismatch {
                band,
                expected,
                found,
            } => write!(
                f,
                "band {} is at turn {}, expected {}",
                band, found, expected
            ),
            Inconsistency::MissingRows { start_row, end_row } => {
                write!(f, "rows {}..{} not covered", start_row, end_row)
            }
            Inconsistency::RejectedBand { band, reason } => {
                write!(f, "band {} rejected: {}", band, reason)
            }
            Inconsistency::IncompleteRun { reached, target } => {
                write!(f, "run stopped at turn {} of {}", reached, target)
            }
        }
    }
}

/// The whole grid as reassembled from the workers' bands.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct AggregatedState {
    pub grid: Grid,
    pub turn: Turn,
    pub issues: Vec<Inconsistency>,
}

impl AggregatedState {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }

    /// Flags the state if it stopped short of `target`.
    pub fn require_turn(&mut self, target: Turn) {
        if self.turn != target {
            self.issues.push(Inconsistency::IncompleteRun {
                reached: self.turn,
                target,
            });
        }
    }

    /// Fails with `InconsistentAggregation` if the merge reported anything.
    pub fn into_consistent(self) -> Result<Self, Error> {
        if self.issues.is_empty() {
            Ok(self)
        } else {
            Err(Error::InconsistentAggregation(self.issues))
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct AliveCount {
    pub turn: Turn,
    pub alive: usize,
    pub issues: Vec<Inconsistency>,
}

/// Tracks the turn of the first responder and flags every other band that
/// disagrees with it.
struct TurnTracker {
    turn: Option<Turn>,
}

impl TurnTracker {
    fn observe(&mut self, band: usize, found: Turn, issues: &mut Vec<Inconsistency>) {
        match self.turn {
            None => self.turn = Some(found),
            Some(expected) if expected != found => {
                issues.push(Inconsistency::TurnMismatch {
                    band,
                    expected,
                    found,
                })
            }
            Some(_) => {}
        }
    }
}

fn missing(plan: &BandPlan) -> Inconsistency {
    Inconsistency::MissingRows {
        start_row: plan.owned.start,
        end_row: plan.owned.end,
    }
}

fn check(prior: &Grid, plan: &BandPlan, snap: &BandSnapshot) -> Result<(), String> {
    if snap.start_row != plan.owned.start || snap.end_row != plan.owned.end {
        return Err(format!(
            "covers rows {}..{}, planned {}..{}",
            snap.start_row, snap.end_row, plan.owned.start, plan.owned.end
        ));
    }
    if snap.rows.width() != prior.width() || snap.rows.height() != plan.len() {
        return Err(format!(
            "{}x{} rows, planned {}x{}",
            snap.rows.width(),
            snap.rows.height(),
            prior.width(),
            plan.len()
        ));
    }
    snap.rows.validate().map_err(|e| e.to_string())
}

/// Writes each response's rows over `prior` at the rows its plan owns.
///
/// `responses[i]` answers `plans[i]`; a `None` is a worker that did not
/// answer. Rows without a usable response keep their prior value. The turn
/// is that of the first usable response, or `prior_turn` if there is none.
pub fn merge(
    prior: &Grid,
    prior_turn: Turn,
    plans: &[BandPlan],
    responses: &[Option<BandSnapshot>],
) -> AggregatedState {
    let mut grid = prior.clone();
    let mut issues = Vec::new();
    let mut turns = TurnTracker { turn: None };

    for plan in plans {
        let Some(snap) = responses.get(plan.index).and_then(Option::as_ref) else {
            issues.push(missing(plan));
            continue;
        };
        if let Err(reason) = check(prior, plan, snap) {
            issues.push(Inconsistency::RejectedBand {
                band: plan.index,
                reason,
            });
            issues.push(missing(plan));
            continue;
        }
        turns.observe(plan.index, snap.turn, &mut issues);
        if let Err(e) = grid.write_rows(plan.owned.start, &snap.rows) {
            issues.push(Inconsistency::RejectedBand {
                band: plan.index,
                reason: e.to_string(),
            });
        }
    }

    AggregatedState {
        grid,
        turn: turns.turn.unwrap_or(prior_turn),
        issues,
    }
}

/// Sums per-band alive counts, `(alive, turn)` per plan, under the same turn
/// policy as [`merge`].
pub fn count_alive(
    plans: &[BandPlan],
    counts: &[Option<(usize, Turn)>],
    prior_turn: Turn,
) -> AliveCount {
    let mut alive = 0;
    let mut issues = Vec::new();
    let mut turns = TurnTracker { turn: None };
    for plan in plans {
        match counts.get(plan.index).copied().flatten() {
            Some((n, turn)) => {
                turns.observe(plan.index, turn, &mut issues);
                alive += n;
            }
            None => issues.push(missing(plan)),
        }
    }
    AliveCount {
        turn: turns.turn.unwrap_or(prior_turn),
        alive,
        issues,
    }
}
