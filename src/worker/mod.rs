//! One worker's band and the generation loop that drives it.
//!
//! A worker process holds exactly one [`WorkerSession`]. Its state is
//! mutated only by the session's own generation loop and by control calls
//! aimed at it; nothing is shared with other workers.

use rkyv::{Archive, Deserialize, Serialize};
use tokio::{
    select,
    sync::{watch, RwLock},
    task,
};
use tracing::{debug, info, trace, warn};

use crate::{
    life::{is_valid_row, kernel, partition::Band, CellChange, Grid, Params, Turn},
    Error,
};

pub mod server;

/// Cell changes kept between two `take_changes` calls. Changes beyond this
/// are counted and dropped.
const MAX_PENDING_CHANGES: usize = 1 << 20;

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Phase {
    Idle,
    Loaded,
    Running,
    Paused,
    Done,
    ShuttingDown,
}

/// Point-in-time copy of a band.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct BandSnapshot {
    pub start_row: usize,
    pub end_row: usize,
    pub turn: Turn,
    pub rows: Grid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub phase: Phase,
    pub start_row: usize,
    pub end_row: usize,
    pub turn: Turn,
    pub alive: usize,
}

/// New edge rows after one exchange-mode generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepOutcome {
    pub turn: Turn,
    pub top: Vec<u8>,
    pub bottom: Vec<u8>,
}

struct WorkerState {
    phase: Phase,
    band: Option<Band>,
    params: Option<Params>,
    turn: Turn,
    /// Set while `run` or `step` owns the band.
    in_flight: bool,
    /// True until the halos captured at load time have been used once.
    halos_fresh: bool,
    changes: Vec<CellChange>,
    dropped_changes: usize,
}

impl WorkerState {
    fn record(&mut self, changes: Vec<CellChange>) {
        let room = MAX_PENDING_CHANGES.saturating_sub(self.changes.len());
        if changes.len() > room {
            self.dropped_changes += changes.len() - room;
        }
        self.changes.extend(changes.into_iter().take(room));
    }

    fn snapshot(&self) -> Result<BandSnapshot, Error> {
        let band = self.band.as_ref().ok_or(Error::NotLoaded)?;
        Ok(BandSnapshot {
            start_row: band.start_row,
            end_row: band.end_row,
            turn: self.turn,
            rows: band.rows.clone(),
        })
    }
}

pub struct WorkerSession {
    state: RwLock<WorkerState>,
    paused: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

impl Default for WorkerSession {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSession {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(WorkerState {
                phase: Phase::Idle,
                band: None,
                params: None,
                turn: 0,
                in_flight: false,
                halos_fresh: false,
                changes: Vec::new(),
                dropped_changes: 0,
            }),
            paused: watch::channel(false).0,
            shutdown: watch::channel(false).0,
        }
    }

    /// Replaces the session's band and resets its turn to 0.
    pub async fn load(&self, band: Band, params: Params) -> Result<(), Error> {
        params.validate()?;
        band.validate(params.width, params.height)?;

        let mut state = self.state.write().await;
        if state.phase == Phase::ShuttingDown {
            return Err(Error::ShuttingDown);
        }
        if state.in_flight {
            return Err(Error::SessionBusy);
        }
        info!(
            start_row = band.start_row,
            end_row = band.end_row,
            turns = params.turns,
            "band loaded"
        );
        state.band = Some(band);
        state.params = Some(params);
        state.turn = 0;
        state.halos_fresh = true;
        state.changes.clear();
        state.dropped_changes = 0;
        state.phase = Phase::Loaded;
        Ok(())
    }

    /// Runs the band to `params.turns` with the isolated halo policy: the
    /// first generation uses the halos captured at load, every later one
    /// wraps within the band.
    pub async fn run(&self) -> Result<BandSnapshot, Error> {
        {
            let mut state = self.state.write().await;
            match state.phase {
                Phase::Idle => return Err(Error::NotLoaded),
                Phase::ShuttingDown => return Err(Error::ShuttingDown),
                Phase::Done => return state.snapshot(),
                Phase::Loaded | Phase::Running | Phase::Paused => {}
            }
            if state.in_flight {
                return Err(Error::SessionBusy);
            }
            state.in_flight = true;
            state.phase = Phase::Running;
        }

        let outcome = self.run_to_target().await;

        let mut state = self.state.write().await;
        state.in_flight = false;
        outcome?;
        state.phase = Phase::Done;
        info!(turn = state.turn, "band complete");
        state.snapshot()
    }

    async fn run_to_target(&self) -> Result<(), Error> {
        loop {
            let (rows, above, below, start_row, turn) = {
                let state = self.state.read().await;
                let target = state.params.map_or(0, |p| p.turns);
                if state.turn >= target {
                    return Ok(());
                }
                let band = state.band.as_ref().ok_or(Error::NotLoaded)?;
                let (above, below) = if state.halos_fresh {
                    (band.halo_above.clone(), band.halo_below.clone())
                } else {
                    let last = band.rows.height() - 1;
                    (band.rows.row(last).to_vec(), band.rows.row(0).to_vec())
                };
                (band.rows.clone(), above, below, band.start_row, state.turn)
            };
            self.generation(rows, above, below, start_row, turn).await?;
        }
    }

    /// Advances one generation using halo rows supplied by the neighbouring
    /// bands, and returns the band's new edge rows for them.
    pub async fn step(
        &self,
        halo_above: Vec<u8>,
        halo_below: Vec<u8>,
    ) -> Result<StepOutcome, Error> {
        let (rows, start_row, turn, target) = {
            let mut state = self.state.write().await;
            match state.phase {
                Phase::Idle => return Err(Error::NotLoaded),
                Phase::ShuttingDown => return Err(Error::ShuttingDown),
                _ => {}
            }
            if state.in_flight {
                return Err(Error::SessionBusy);
            }
            let band = state.band.as_ref().ok_or(Error::NotLoaded)?;
            let width = band.rows.width();
            if !is_valid_row(&halo_above, width) || !is_valid_row(&halo_below, width)
            {
                return Err(Error::invalid(format!(
                    "halo rows must be {} valid cells",
                    width
                )));
            }
            let (rows, start_row) = (band.rows.clone(), band.start_row);
            let target = state.params.map_or(0, |p| p.turns);
            if state.turn < target {
                state.in_flight = true;
                state.phase = Phase::Running;
            }
            (rows, start_row, state.turn, target)
        };

        let outcome = if turn < target {
            self.generation(rows, halo_above, halo_below, start_row, turn)
                .await
        } else {
            Ok(())
        };

        let mut state = self.state.write().await;
        if turn < target {
            state.in_flight = false;
        }
        outcome?;
        if state.turn >= target {
            state.phase = Phase::Done;
        }
        let band = state.band.as_ref().ok_or(Error::NotLoaded)?;
        Ok(StepOutcome {
            turn: state.turn,
            top: band.rows.row(0).to_vec(),
            bottom: band.rows.row(band.rows.height() - 1).to_vec(),
        })
    }

    /// Computes generation `turn + 1` at a generation boundary: waits out a
    /// pause first, then runs the kernel off the async threads.
    async fn generation(
        &self,
        rows: Grid,
        above: Vec<u8>,
        below: Vec<u8>,
        start_row: usize,
        turn: Turn,
    ) -> Result<(), Error> {
        self.wait_until_resumed().await?;

        let (next, changes) = task::spawn_blocking(move || {
            kernel::step_band(&rows, &above, &below, start_row, turn + 1)
        })
        .await
        .map_err(|e| Error::Remote(format!("kernel task failed: {}", e)))?;

        let mut state = self.state.write().await;
        if state.phase == Phase::ShuttingDown {
            return Err(Error::ShuttingDown);
        }
        let band = state.band.as_mut().ok_or(Error::NotLoaded)?;
        band.rows = next;
        state.halos_fresh = false;
        state.turn = turn + 1;
        state.record(changes);
        trace!(turn = state.turn, "generation computed");
        Ok(())
    }

    /// Blocks while the session is paused. Returns early with
    /// `ShuttingDown` if shutdown is requested in the meantime.
    async fn wait_until_resumed(&self) -> Result<(), Error> {
        let mut paused = self.paused.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(Error::ShuttingDown);
        }
        if *paused.borrow() {
            debug!("generation loop paused");
        }
        select! {
            _ = paused.wait_for(|paused| !*paused) => {}
            _ = shutdown.wait_for(|shutting_down| *shutting_down) => {
                return Err(Error::ShuttingDown);
            }
        }
        Ok(())
    }

    /// Holds the generation loop at its next boundary.
    pub fn pause(&self) {
        self.paused.send_replace(true);
        info!("paused");
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
        info!("resumed");
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Marks the session as shutting down. Any in-flight generation loop
    /// stops at its next boundary; the owning process then exits.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let mut state = self.state.write().await;
        state.phase = Phase::ShuttingDown;
        warn!(turn = state.turn, "session shutting down");
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Band range, turn and live cell count. Only ever waits for a state
    /// write, never for a generation to finish.
    pub async fn status(&self) -> Result<Status, Error> {
        let state = self.state.read().await;
        let band = state.band.as_ref().ok_or(Error::NotLoaded)?;
        Ok(Status {
            phase: self.effective_phase(state.phase),
            start_row: band.start_row,
            end_row: band.end_row,
            turn: state.turn,
            alive: band.rows.alive_count(),
        })
    }

    pub async fn snapshot(&self) -> Result<BandSnapshot, Error> {
        self.state.read().await.snapshot()
    }

    /// Drains the cell changes recorded since the last call.
    pub async fn take_changes(&self) -> (Turn, Vec<CellChange>) {
        let mut state = self.state.write().await;
        if state.dropped_changes > 0 {
            warn!(
                dropped = state.dropped_changes,
                "cell changes dropped since the last drain"
            );
            state.dropped_changes = 0;
        }
        (state.turn, std::mem::take(&mut state.changes))
    }

    pub async fn phase(&self) -> Phase {
        let phase = self.state.read().await.phase;
        self.effective_phase(phase)
    }

    /// A running session reports `Paused` while the pause flag is set.
    fn effective_phase(&self, phase: Phase) -> Phase {
        if phase == Phase::Running && self.is_paused() {
            Phase::Paused
        } else {
            phase
        }
    }
}
