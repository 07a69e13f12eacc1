//! The broker: partitions a world across the workers, drives the run and
//! reassembles the result.
//!
//! With [`HaloPolicy::Exchange`] the broker steps every band in lockstep
//! and hands each band its neighbours' edge rows before every generation, so
//! the result is identical to a single-process run. [`HaloPolicy::Isolated`]
//! lets each worker run to the target on its own and is only exact for the
//! first generation.

use std::{net::SocketAddr, time::Duration};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::{
    hex::HexDisplayExt,
    life::{
        partition::{plan, Band, BandPlan},
        CellChange, Grid, Params, Turn,
    },
    net::wire::{Load, WorkerRequest, WorkerResponse},
    worker::BandSnapshot,
    Error,
};

pub mod aggregate;
pub mod control;
pub mod dispatch;
pub mod server;

use aggregate::{count_alive, merge, AggregatedState, AliveCount};
use control::{ControlPlane, ControlReport};
use dispatch::Dispatcher;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HaloPolicy {
    /// Refresh halos from the neighbouring bands before every generation.
    #[default]
    Exchange,
    /// Use the halos captured at load for the first generation only.
    Isolated,
}

#[derive(TypedBuilder, Clone, Debug)]
pub struct BrokerConfig {
    /// Worker addresses. Band `i` always goes to worker `i`.
    pub workers: Vec<SocketAddr>,
    #[builder(default)]
    pub halo_policy: HaloPolicy,
    /// Bound on each worker call, dial included. Unbounded if unset.
    #[builder(default, setter(strip_option))]
    pub call_timeout: Option<Duration>,
}

#[derive(Default)]
struct BrokerState {
    /// Last world loaded or computed.
    world: Option<Grid>,
    turn: Turn,
    params: Option<Params>,
    plans: Vec<BandPlan>,
    /// Whether band `i` acknowledged the last load. A band that did not
    /// still holds whatever its worker had before and is never asked for it.
    loaded: Vec<bool>,
    /// Changes returned by isolated runs, waiting for the next `cell_flips`.
    changes: Vec<CellChange>,
    processing: bool,
}

pub struct Broker {
    config: BrokerConfig,
    dispatcher: Dispatcher,
    control: ControlPlane,
    state: Mutex<BrokerState>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Result<Self, Error> {
        if config.workers.is_empty() {
            return Err(Error::invalid("a broker needs at least one worker"));
        }
        let dispatcher =
            Dispatcher::new(config.workers.clone(), config.call_timeout)?;
        Ok(Self {
            control: ControlPlane::new(dispatcher.clone()),
            dispatcher,
            config,
            state: Mutex::new(BrokerState::default()),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Number of bands for a run: never more than there are workers or rows.
    fn partitions(&self, params: &Params) -> usize {
        params
            .concurrency
            .min(self.config.workers.len())
            .min(params.height)
    }

    /// Splits `grid` into bands and loads one onto each worker, resetting
    /// the turn to 0. Workers that cannot be reached are logged and will
    /// show up as missing rows when the world is next collected.
    pub async fn load_world(&self, grid: Grid, params: Params) -> Result<(), Error> {
        params.validate()?;
        grid.validate()?;
        if grid.width() != params.width || grid.height() != params.height {
            return Err(Error::invalid(format!(
                "{}x{} grid does not match {}x{} params",
                grid.width(),
                grid.height(),
                params.width,
                params.height
            )));
        }
        let plans = plan(grid.height(), self.partitions(&params))?;
        let bands = plans
            .iter()
            .map(|p| Band::cut(&grid, p))
            .collect::<Result<Vec<_>, _>>()?;

        let replies = self
            .dispatcher
            .broadcast(plans.len(), |i| {
                Some(WorkerRequest::LoadWorld(Load {
                    band: bands[i].clone(),
                    params,
                }))
            })
            .await;
        let loaded: Vec<bool> = replies
            .iter()
            .map(|r| matches!(r, Some(WorkerResponse::Ack)))
            .collect();
        let missing: Vec<usize> = (0..plans.len()).filter(|&i| !loaded[i]).collect();
        if !missing.is_empty() {
            warn!(?missing, bands = plans.len(), "not every band was loaded");
        }
        let digest = grid.digest();
        info!(
            width = grid.width(),
            height = grid.height(),
            bands = plans.len(),
            turns = params.turns,
            digest = %format_args!("{:#}", digest.hex()),
            "world loaded"
        );

        let mut state = self.state.lock().await;
        state.world = Some(grid);
        state.turn = 0;
        state.params = Some(params);
        state.plans = plans;
        state.loaded = loaded;
        state.changes.clear();
        Ok(())
    }

    /// Computes `params.turns` generations and returns the merged world.
    ///
    /// With a grid, it is loaded first. Without one, the world from the
    /// last `load_world` is used as loaded, or reloaded from the broker's
    /// latest world if it has already been run, `params` changed or a band
    /// missed the load. The result is flagged if it stops short of
    /// `params.turns`.
    pub async fn process_world(
        &self,
        grid: Option<Grid>,
        params: Params,
    ) -> Result<AggregatedState, Error> {
        {
            let mut state = self.state.lock().await;
            if state.processing {
                return Err(Error::SessionBusy);
            }
            state.processing = true;
        }
        let result = self.process(grid, params).await;
        self.state.lock().await.processing = false;
        result
    }

    async fn process(
        &self,
        grid: Option<Grid>,
        params: Params,
    ) -> Result<AggregatedState, Error> {
        let reload = match grid {
            Some(grid) => Some(grid),
            None => {
                let state = self.state.lock().await;
                let world = state.world.clone().ok_or(Error::NotLoaded)?;
                let intact = state.loaded.iter().all(|&ok| ok);
                if state.params == Some(params) && state.turn == 0 && intact {
                    None
                } else {
                    Some(world)
                }
            }
        };
        if let Some(grid) = reload {
            self.load_world(grid, params).await?;
        }

        let (world, _, plans, loaded) = self.loaded().await?;

        let snapshots = match self.config.halo_policy {
            HaloPolicy::Exchange => {
                self.exchange(&world, &plans, &loaded, params.turns).await;
                self.collect(&plans, &loaded).await
            }
            HaloPolicy::Isolated => self.isolated(&plans, &loaded).await,
        };

        let mut merged = merge(&world, 0, &plans, &snapshots);
        merged.require_turn(params.turns);
        for issue in &merged.issues {
            warn!(%issue, "aggregation issue");
        }
        let digest = merged.grid.digest();
        info!(
            turn = merged.turn,
            alive = merged.grid.alive_count(),
            digest = %format_args!("{:#}", digest.hex()),
            "world processed"
        );

        let mut state = self.state.lock().await;
        state.world = Some(merged.grid.clone());
        state.turn = merged.turn;
        Ok(merged)
    }

    /// Steps every loaded band `turns` times, passing edge rows between
    /// neighbours after each generation. Gives up early if a whole round
    /// goes unanswered; the merge then reports the turn it got to.
    async fn exchange(
        &self,
        world: &Grid,
        plans: &[BandPlan],
        loaded: &[bool],
        turns: Turn,
    ) {
        let bands = plans.len();
        // first and last owned row of every band
        let mut edges: Vec<(Vec<u8>, Vec<u8>)> = plans
            .iter()
            .map(|p| {
                (
                    world.row(p.owned.start).to_vec(),
                    world.row(p.owned.end - 1).to_vec(),
                )
            })
            .collect();

        for generation in 0..turns {
            let replies = self
                .dispatcher
                .broadcast(bands, |i| {
                    loaded[i].then(|| WorkerRequest::Step {
                        halo_above: edges[(i + bands - 1) % bands].1.clone(),
                        halo_below: edges[(i + 1) % bands].0.clone(),
                    })
                })
                .await;

            let mut answered = 0;
            for (i, reply) in replies.into_iter().enumerate() {
                match reply {
                    Some(WorkerResponse::Stepped { top, bottom, .. }) => {
                        edges[i] = (top, bottom);
                        answered += 1;
                    }
                    Some(other) => {
                        warn!(band = i, reply = ?other, "unexpected reply to Step")
                    }
                    None if loaded[i] => {
                        warn!(band = i, generation, "band missed a step")
                    }
                    None => {}
                }
            }
            if answered == 0 {
                warn!(generation, "no band answered, abandoning the run");
                return;
            }
            debug!(generation = generation + 1, "generation exchanged");
        }
    }

    /// Runs every loaded band to the target independently.
    async fn isolated(
        &self,
        plans: &[BandPlan],
        loaded: &[bool],
    ) -> Vec<Option<BandSnapshot>> {
        let replies = self
            .dispatcher
            .broadcast(plans.len(), |i| {
                loaded[i].then_some(WorkerRequest::Update { reload: None })
            })
            .await;
        let mut snapshots = Vec::with_capacity(replies.len());
        let mut changes = Vec::new();
        for reply in replies {
            match reply {
                Some(WorkerResponse::Band {
                    snapshot,
                    changes: band_changes,
                }) => {
                    changes.extend(band_changes);
                    snapshots.push(Some(snapshot));
                }
                _ => snapshots.push(None),
            }
        }
        self.state.lock().await.changes.extend(changes);
        snapshots
    }

    async fn collect(
        &self,
        plans: &[BandPlan],
        loaded: &[bool],
    ) -> Vec<Option<BandSnapshot>> {
        self.dispatcher
            .broadcast(plans.len(), |i| {
                loaded[i].then_some(WorkerRequest::SendCurrentState)
            })
            .await
            .into_iter()
            .map(|reply| match reply {
                Some(WorkerResponse::State(snapshot)) => Some(snapshot),
                _ => None,
            })
            .collect()
    }

    /// Copies of the last world, its band plans and which bands took the
    /// load, without holding the lock across the calls that follow.
    async fn loaded(&self) -> Result<(Grid, Turn, Vec<BandPlan>, Vec<bool>), Error> {
        let state = self.state.lock().await;
        let world = state.world.clone().ok_or(Error::NotLoaded)?;
        Ok((
            world,
            state.turn,
            state.plans.clone(),
            state.loaded.clone(),
        ))
    }

    /// Live cell count summed over every band, as the workers have it now.
    pub async fn alive_cells(&self) -> Result<AliveCount, Error> {
        let (_, turn, plans, loaded) = self.loaded().await?;
        let counts: Vec<_> = self
            .dispatcher
            .broadcast(plans.len(), |i| {
                loaded[i].then_some(WorkerRequest::SendCellNumber)
            })
            .await
            .into_iter()
            .map(|reply| match reply {
                Some(WorkerResponse::CellNumber { alive, turn }) => Some((alive, turn)),
                _ => None,
            })
            .collect();
        Ok(count_alive(&plans, &counts, turn))
    }

    /// The world as the workers have it now, which may be mid-run.
    pub async fn current_state(&self) -> Result<AggregatedState, Error> {
        let (world, turn, plans, loaded) = self.loaded().await?;
        let snapshots = self.collect(&plans, &loaded).await;
        Ok(merge(&world, turn, &plans, &snapshots))
    }

    /// Drains the cell changes recorded since the last call, ordered by
    /// turn.
    pub async fn cell_flips(&self) -> Result<(Turn, Vec<CellChange>), Error> {
        let (_, mut turn, plans, loaded) = self.loaded().await?;
        let mut changes = std::mem::take(&mut self.state.lock().await.changes);
        let replies = self
            .dispatcher
            .broadcast(plans.len(), |i| {
                loaded[i].then_some(WorkerRequest::SendCellFlip)
            })
            .await;
        let mut first = true;
        for reply in replies {
            if let Some(WorkerResponse::Flips {
                turn: band_turn,
                changes: band_changes,
            }) = reply
            {
                if first {
                    turn = band_turn;
                    first = false;
                }
                changes.extend(band_changes);
            }
        }
        changes.sort_by_key(|c| c.turn);
        Ok((turn, changes))
    }

    pub async fn pause(&self) -> ControlReport {
        self.control.pause().await
    }

    pub async fn resume(&self) -> ControlReport {
        self.control.resume().await
    }

    pub async fn disconnect(&self) -> ControlReport {
        self.control.disconnect().await
    }

    pub async fn shutdown(&self) -> ControlReport {
        self.control.shutdown().await
    }
}
