//! The client side of a run: loads the initial grid, hands it to the
//! broker, reports progress as [`Event`]s and reacts to key presses.

use std::time::Duration;

use tokio::{
    select,
    sync::mpsc,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::{
    broker::aggregate::AggregatedState,
    life::{Cell, Grid, Params, Turn},
    Error,
};

pub mod client;

use client::BrokerClient;

/// Where the initial grid comes from.
pub trait GridSource {
    fn load(&mut self, width: usize, height: usize) -> Result<Grid, Error>;
}

/// Where snapshots and the final grid go.
pub trait GridSink {
    fn save(&mut self, grid: &Grid, label: &str) -> Result<(), Error>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Executing,
    Paused,
    Quitting,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    AliveCellsCount { turn: Turn, count: usize },
    CellFlipped { turn: Turn, cell: Cell },
    TurnComplete { turn: Turn },
    StateChange { turn: Turn, state: State },
    ImageOutputComplete { turn: Turn, label: String },
    FinalTurnComplete { turn: Turn, alive: Vec<Cell> },
}

/// How [`Controller::run`] ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Every turn was computed; holds the final world.
    Completed(AggregatedState),
    /// `q` was pressed. The cluster keeps going without us.
    Detached { turn: Turn },
    /// `k` was pressed and the cluster was shut down.
    Shutdown { turn: Turn },
}

#[derive(TypedBuilder, Clone, Debug)]
pub struct ControllerConfig {
    pub params: Params,
    /// How often alive counts and cell flips are polled.
    #[builder(default = Duration::from_secs(2))]
    pub tick: Duration,
}

pub struct Controller {
    config: ControllerConfig,
    client: BrokerClient,
}

impl Controller {
    pub fn new(config: ControllerConfig, client: BrokerClient) -> Self {
        Self { config, client }
    }

    fn label(&self, turn: Turn) -> String {
        let p = &self.config.params;
        format!("{}x{}x{}", p.width, p.height, turn)
    }

    /// Drives one run to completion, or until a key ends it early.
    ///
    /// Keys: `s` saves a snapshot, `p` toggles pause, `q` detaches from the
    /// cluster and `k` saves a snapshot and shuts the cluster down. Events
    /// are dropped silently once the receiver is gone.
    pub async fn run<S, K>(
        &self,
        source: &mut S,
        sink: &mut K,
        events: mpsc::Sender<Event>,
        mut keys: mpsc::Receiver<char>,
    ) -> Result<Outcome, Error>
    where
        S: GridSource,
        K: GridSink,
    {
        let params = self.config.params;
        params.validate()?;
        if self.config.tick.is_zero() {
            return Err(Error::InvalidInput("tick must be non-zero".into()));
        }
        let grid = source.load(params.width, params.height)?;
        for cell in grid.alive_cells() {
            emit(&events, Event::CellFlipped { turn: 0, cell }).await;
        }
        self.client.load_world(grid, params).await?;
        info!(turns = params.turns, bands = params.concurrency, "run started");

        let process = self.client.process_world(None, params);
        tokio::pin!(process);

        let mut ticker = interval_at(Instant::now() + self.config.tick, self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut paused = false;
        let mut turn: Turn = 0;

        loop {
            select! {
                result = &mut process => {
                    let state = result?;
                    return self.finish(state, sink, &events).await;
                }
                _ = ticker.tick(), if !paused => {
                    if let Err(e) = self.report_progress(&events, &mut turn).await {
                        warn!(error = %e, "progress poll failed");
                    }
                }
                Some(key) = keys.recv() => match key {
                    's' => {
                        self.snapshot(sink, &events).await?;
                    }
                    'p' => {
                        if paused {
                            self.client.resume_all().await?;
                            emit(&events, Event::StateChange { turn, state: State::Executing }).await;
                        } else {
                            self.client.pause_all().await?;
                            turn = self.client.alive_cells().await.map_or(turn, |c| c.turn);
                            emit(&events, Event::StateChange { turn, state: State::Paused }).await;
                            info!(turn, "paused, press p again to resume");
                        }
                        paused = !paused;
                    }
                    'q' => {
                        if paused {
                            self.client.resume_all().await?;
                        }
                        self.client.disconnect_all().await?;
                        emit(&events, Event::StateChange { turn, state: State::Quitting }).await;
                        self.client.close();
                        return Ok(Outcome::Detached { turn });
                    }
                    'k' => {
                        let turn = self.snapshot(sink, &events).await?;
                        let report = self.client.shutdown_all().await?;
                        if !report.all_acknowledged() {
                            warn!(failed = ?report.failed, "some workers did not acknowledge shutdown");
                        }
                        emit(&events, Event::StateChange { turn, state: State::Quitting }).await;
                        return Ok(Outcome::Shutdown { turn });
                    }
                    other => debug!(key = %other, "ignoring key"),
                },
            }
        }
    }

    async fn report_progress(
        &self,
        events: &mpsc::Sender<Event>,
        turn: &mut Turn,
    ) -> Result<(), Error> {
        let count = self.client.alive_cells().await?;
        emit(
            events,
            Event::AliveCellsCount {
                turn: count.turn,
                count: count.alive,
            },
        )
        .await;
        let (flips_turn, changes) = self.client.cell_flips().await?;
        for change in changes {
            emit(
                events,
                Event::CellFlipped {
                    turn: change.turn,
                    cell: Cell {
                        row: change.row,
                        col: change.col,
                    },
                },
            )
            .await;
        }
        *turn = flips_turn.max(count.turn);
        emit(events, Event::TurnComplete { turn: *turn }).await;
        Ok(())
    }

    /// Saves the world as the workers have it now and returns its turn.
    async fn snapshot<K: GridSink>(
        &self,
        sink: &mut K,
        events: &mpsc::Sender<Event>,
    ) -> Result<Turn, Error> {
        let state = self.client.current_state().await?;
        for issue in &state.issues {
            warn!(%issue, "snapshot is inconsistent");
        }
        let label = self.label(state.turn);
        sink.save(&state.grid, &label)?;
        info!(turn = state.turn, %label, "snapshot saved");
        emit(
            events,
            Event::ImageOutputComplete {
                turn: state.turn,
                label,
            },
        )
        .await;
        Ok(state.turn)
    }

    async fn finish<K: GridSink>(
        &self,
        state: AggregatedState,
        sink: &mut K,
        events: &mpsc::Sender<Event>,
    ) -> Result<Outcome, Error> {
        let turn = state.turn;
        let label = self.label(turn);
        sink.save(&state.grid, &label)?;
        emit(events, Event::ImageOutputComplete { turn, label }).await;
        emit(
            events,
            Event::StateChange {
                turn,
                state: State::Quitting,
            },
        )
        .await;
        emit(
            events,
            Event::FinalTurnComplete {
                turn,
                alive: state.grid.alive_cells(),
            },
        )
        .await;
        info!(turn, alive = state.grid.alive_count(), "run complete");
        Ok(Outcome::Completed(state))
    }
}

async fn emit(events: &mpsc::Sender<Event>, event: Event) {
    if events.send(event).await.is_err() {
        debug!("event receiver dropped");
    }
}
