use std::{net::SocketAddr, sync::Arc, time::Duration};

use gridcast::{
    broker::{
        aggregate::Inconsistency, server::BrokerServer, Broker, BrokerConfig,
        HaloPolicy,
    },
    controller::{
        client::BrokerClient, Controller, ControllerConfig, Event, GridSink,
        GridSource, Outcome, State,
    },
    life::{kernel, Grid, Params, ALIVE, DEAD},
    net::serve::ServeExit,
    worker::server::WorkerServer,
    Error,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, timeout},
};

fn localhost() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn spawn_workers(
    n: usize,
) -> (Vec<SocketAddr>, Vec<JoinHandle<Result<ServeExit, Error>>>) {
    let mut addrs = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..n {
        let server = WorkerServer::bind(localhost()).unwrap();
        addrs.push(server.local_addr().unwrap());
        handles.push(tokio::spawn(async move { server.serve().await }));
    }
    (addrs, handles)
}

fn broker(workers: Vec<SocketAddr>, policy: HaloPolicy) -> Broker {
    Broker::new(
        BrokerConfig::builder()
            .workers(workers)
            .halo_policy(policy)
            .build(),
    )
    .unwrap()
}

fn params(turns: u32, concurrency: usize, width: usize, height: usize) -> Params {
    Params::builder()
        .turns(turns)
        .concurrency(concurrency)
        .width(width)
        .height(height)
        .build()
}

fn blinker() -> Grid {
    Grid::from_alive(8, 8, &[(3, 3), (3, 4), (3, 5)]).unwrap()
}

fn glider(width: usize, height: usize) -> Grid {
    Grid::from_alive(width, height, &[(0, 1), (1, 2), (2, 0), (2, 1), (2, 2)])
        .unwrap()
}

fn random_grid(seed: u64, width: usize, height: usize) -> Grid {
    let mut rng = StdRng::seed_from_u64(seed);
    let cells = (0..width * height)
        .map(|_| if rng.gen_bool(0.35) { ALIVE } else { DEAD })
        .collect();
    Grid::from_cells(width, height, cells).unwrap()
}

fn evolve(grid: &Grid, turns: u32) -> Grid {
    (0..turns).fold(grid.clone(), |g, _| kernel::step(&g))
}

#[tokio::test(flavor = "multi_thread")]
async fn blinker_on_two_bands_matches_one_band() {
    let (workers, _handles) = spawn_workers(2);
    let broker = broker(workers, HaloPolicy::Exchange);

    let split = broker
        .process_world(Some(blinker()), params(4, 2, 8, 8))
        .await
        .unwrap()
        .into_consistent()
        .unwrap();
    assert_eq!(split.turn, 4);
    assert_eq!(split.grid, blinker());

    let whole = broker
        .process_world(Some(blinker()), params(4, 1, 8, 8))
        .await
        .unwrap()
        .into_consistent()
        .unwrap();
    assert_eq!(whole, split);

    let count = broker.alive_cells().await.unwrap();
    assert_eq!(count.alive, 3);
    assert_eq!(count.turn, 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn exchange_matches_a_monolithic_run() {
    let (workers, _handles) = spawn_workers(3);
    let broker = broker(workers, HaloPolicy::Exchange);

    let state = broker
        .process_world(Some(glider(10, 9)), params(8, 3, 10, 9))
        .await
        .unwrap()
        .into_consistent()
        .unwrap();
    assert_eq!(state.turn, 8);
    assert_eq!(state.grid, evolve(&glider(10, 9), 8));
    // a glider moves one cell down and right every four generations
    assert_eq!(
        state.grid,
        Grid::from_alive(10, 9, &[(2, 3), (3, 4), (4, 2), (4, 3), (4, 4)]).unwrap()
    );

    let noise = random_grid(11, 17, 13);
    let state = broker
        .process_world(Some(noise.clone()), params(12, 3, 17, 13))
        .await
        .unwrap();
    assert!(state.is_consistent());
    assert_eq!(state.grid, evolve(&noise, 12));
}

#[tokio::test(flavor = "multi_thread")]
async fn isolated_single_band_is_exact() {
    let (workers, _handles) = spawn_workers(1);
    let broker = broker(workers, HaloPolicy::Isolated);
    let noise = random_grid(3, 12, 12);

    let state = broker
        .process_world(Some(noise.clone()), params(6, 4, 12, 12))
        .await
        .unwrap()
        .into_consistent()
        .unwrap();
    assert_eq!(state.turn, 6);
    assert_eq!(state.grid, evolve(&noise, 6));

    let (turn, changes) = broker.cell_flips().await.unwrap();
    assert_eq!(turn, 6);
    assert!(!changes.is_empty());
    assert!(changes.iter().all(|c| (1..=6).contains(&c.turn)));
    assert!(broker.cell_flips().await.unwrap().1.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_worker_leaves_its_rows_unchanged() {
    let (mut workers, _handles) = spawn_workers(1);
    let dead = {
        let server = WorkerServer::bind(localhost()).unwrap();
        let addr = server.local_addr().unwrap();
        server.close();
        addr
    };
    workers.push(dead);
    let broker = Broker::new(
        BrokerConfig::builder()
            .workers(workers)
            .call_timeout(Duration::from_millis(300))
            .build(),
    )
    .unwrap();

    let world = random_grid(5, 8, 8);
    let state = broker
        .process_world(Some(world.clone()), params(2, 2, 8, 8))
        .await
        .unwrap();
    assert_eq!(state.turn, 2);
    assert!(state.issues.contains(&Inconsistency::MissingRows {
        start_row: 4,
        end_row: 8
    }));
    for row in 4..8 {
        assert_eq!(state.grid.row(row), world.row(row));
    }
    assert!(matches!(
        state.into_consistent(),
        Err(Error::InconsistentAggregation(_))
    ));

    let report = broker.pause().await;
    assert_eq!(report.acknowledged, vec![0]);
    assert_eq!(report.failed, vec![1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_and_resume_keep_the_final_turn() {
    let (workers, _handles) = spawn_workers(2);
    let broker = Arc::new(broker(workers, HaloPolicy::Exchange));
    let world = random_grid(9, 16, 16);

    let report = broker.pause().await;
    assert!(report.all_acknowledged());
    let runner = {
        let broker = broker.clone();
        let world = world.clone();
        tokio::spawn(async move {
            broker.process_world(Some(world), params(20, 2, 16, 16)).await
        })
    };

    sleep(Duration::from_millis(200)).await;
    assert!(!runner.is_finished());
    let held = broker.current_state().await.unwrap();
    assert_eq!(held.turn, 0);
    assert_eq!(held.grid, world);
    assert!(matches!(
        broker.process_world(None, params(20, 2, 16, 16)).await,
        Err(Error::SessionBusy)
    ));

    assert!(broker.resume().await.all_acknowledged());
    let state = runner.await.unwrap().unwrap().into_consistent().unwrap();
    assert_eq!(state.turn, 20);
    assert_eq!(state.grid, evolve(&world, 20));
}

struct Fixed(Grid);

impl GridSource for Fixed {
    fn load(&mut self, _width: usize, _height: usize) -> Result<Grid, Error> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct Saved(Vec<(String, Grid)>);

impl GridSink for Saved {
    fn save(&mut self, grid: &Grid, label: &str) -> Result<(), Error> {
        self.0.push((label.to_string(), grid.clone()));
        Ok(())
    }
}

async fn spawn_broker(
    workers: Vec<SocketAddr>,
) -> (BrokerClient, Arc<Broker>, JoinHandle<Result<ServeExit, Error>>) {
    let server =
        BrokerServer::bind(localhost(), broker(workers, HaloPolicy::Exchange))
            .unwrap();
    let addr = server.local_addr().unwrap();
    let broker = server.broker();
    let handle = tokio::spawn(async move { server.serve().await });
    (BrokerClient::connect(addr).await.unwrap(), broker, handle)
}

fn drain(mut rx: mpsc::Receiver<Event>) -> JoinHandle<Vec<Event>> {
    tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn controller_runs_a_world_end_to_end() {
    let (workers, _handles) = spawn_workers(2);
    let (client, _, _server) = spawn_broker(workers).await;
    let controller = Controller::new(
        ControllerConfig::builder()
            .params(params(4, 2, 8, 8))
            .tick(Duration::from_millis(10))
            .build(),
        client,
    );

    let (events_tx, events_rx) = mpsc::channel(1024);
    let collected = drain(events_rx);
    let (_keys_tx, keys_rx) = mpsc::channel(4);
    let mut saved = Saved::default();

    let outcome = controller
        .run(&mut Fixed(blinker()), &mut saved, events_tx, keys_rx)
        .await
        .unwrap();
    let state = match outcome {
        Outcome::Completed(state) => state,
        other => panic!("run did not complete: {:?}", other),
    };
    assert_eq!(state.turn, 4);
    assert_eq!(state.grid, blinker());
    assert_eq!(saved.0, vec![("8x8x4".to_string(), blinker())]);

    let events = collected.await.unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::CellFlipped { turn: 0, .. }))
            .count(),
        3
    );
    assert_eq!(
        events.last(),
        Some(&Event::FinalTurnComplete {
            turn: 4,
            alive: blinker().alive_cells(),
        })
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn kill_key_snapshots_and_shuts_the_cluster_down() {
    let (workers, worker_handles) = spawn_workers(2);
    let (client, _, broker_handle) = spawn_broker(workers).await;
    let controller = Controller::new(
        ControllerConfig::builder()
            .params(params(1_000_000, 2, 8, 8))
            .build(),
        client,
    );

    let (events_tx, events_rx) = mpsc::channel(1024);
    let collected = drain(events_rx);
    let (keys_tx, keys_rx) = mpsc::channel(4);
    keys_tx.send('k').await.unwrap();
    let mut saved = Saved::default();

    let outcome = controller
        .run(&mut Fixed(blinker()), &mut saved, events_tx, keys_rx)
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Shutdown { .. }));
    assert_eq!(saved.0.len(), 1);

    let exit = timeout(Duration::from_secs(5), broker_handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(exit, ServeExit::Shutdown);
    for handle in worker_handles {
        let exit = timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, ServeExit::Shutdown);
    }

    let events = collected.await.unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::ImageOutputComplete { .. })));
    assert!(matches!(
        events.last(),
        Some(Event::StateChange {
            state: State::Quitting,
            ..
        })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_mid_run_lets_the_run_finish() {
    let (workers, _handles) = spawn_workers(2);
    let broker = Arc::new(broker(workers, HaloPolicy::Exchange));
    let world = random_grid(13, 32, 32);

    let runner = {
        let broker = broker.clone();
        let world = world.clone();
        tokio::spawn(async move {
            broker.process_world(Some(world), params(300, 2, 32, 32)).await
        })
    };
    sleep(Duration::from_millis(100)).await;
    assert!(broker.disconnect().await.all_acknowledged());

    let state = runner.await.unwrap().unwrap().into_consistent().unwrap();
    assert_eq!(state.turn, 300);
    assert_eq!(state.grid, evolve(&world, 300));
}

#[tokio::test(flavor = "multi_thread")]
async fn abandoned_run_reports_how_far_it_got() {
    let (workers, _handles) = spawn_workers(2);
    let broker = Arc::new(
        Broker::new(
            BrokerConfig::builder()
                .workers(workers)
                .call_timeout(Duration::from_millis(500))
                .build(),
        )
        .unwrap(),
    );

    let runner = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .process_world(Some(random_grid(17, 8, 8)), params(1_000_000, 2, 8, 8))
                .await
        })
    };
    sleep(Duration::from_millis(100)).await;
    broker.shutdown().await;

    let state = timeout(Duration::from_secs(10), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(state.turn < 1_000_000);
    assert!(state.issues.contains(&Inconsistency::IncompleteRun {
        reached: state.turn,
        target: 1_000_000,
    }));
    assert!(matches!(
        state.into_consistent(),
        Err(Error::InconsistentAggregation(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn band_that_missed_a_load_is_not_merged() {
    let servers: Vec<_> = (0..2)
        .map(|_| WorkerServer::bind(localhost()).unwrap())
        .collect();
    let addrs = servers.iter().map(|s| s.local_addr().unwrap()).collect();
    let held = servers[1].session();
    for server in servers {
        tokio::spawn(async move { server.serve().await });
    }
    let broker = broker(addrs, HaloPolicy::Exchange);
    let p = params(5, 2, 8, 8);
    let first = random_grid(21, 8, 8);
    let second = random_grid(22, 8, 8);

    // keep worker 1 busy on the first world while the second is loaded
    broker.load_world(first, p).await.unwrap();
    held.pause();
    let stale = {
        let held = held.clone();
        tokio::spawn(async move { held.run().await })
    };
    sleep(Duration::from_millis(20)).await;
    broker.load_world(second.clone(), p).await.unwrap();
    held.resume();
    assert_eq!(stale.await.unwrap().unwrap().turn, 5);

    let now = broker.current_state().await.unwrap();
    assert_eq!(
        now.issues,
        vec![Inconsistency::MissingRows {
            start_row: 4,
            end_row: 8
        }]
    );
    assert_eq!(now.grid, second);

    // processing reloads the band that missed out
    let state = broker
        .process_world(None, p)
        .await
        .unwrap()
        .into_consistent()
        .unwrap();
    assert_eq!(state.turn, 5);
    assert_eq!(state.grid, evolve(&second, 5));
}

fn press_after(keys: mpsc::Sender<char>, presses: Vec<(u64, char)>) {
    tokio::spawn(async move {
        for (delay, key) in presses {
            sleep(Duration::from_millis(delay)).await;
            if keys.send(key).await.is_err() {
                return;
            }
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn quit_key_detaches_and_the_run_carries_on() {
    let (workers, _handles) = spawn_workers(2);
    let (client, broker, _server) = spawn_broker(workers).await;
    let world = random_grid(31, 16, 16);
    let turns = 5_000;
    let controller = Controller::new(
        ControllerConfig::builder()
            .params(params(turns, 2, 16, 16))
            .build(),
        client,
    );

    let (events_tx, events_rx) = mpsc::channel(1024);
    let collected = drain(events_rx);
    let (keys_tx, keys_rx) = mpsc::channel(4);
    press_after(keys_tx, vec![(50, 'q')]);
    let mut saved = Saved::default();

    let outcome = controller
        .run(&mut Fixed(world.clone()), &mut saved, events_tx, keys_rx)
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Detached { .. }));
    assert!(saved.0.is_empty());
    let events = collected.await.unwrap();
    assert!(matches!(
        events.last(),
        Some(Event::StateChange {
            state: State::Quitting,
            ..
        })
    ));

    let finished = timeout(Duration::from_secs(60), async {
        loop {
            let state = broker.current_state().await.unwrap();
            if state.turn == turns && state.is_consistent() {
                return state;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(finished.grid, evolve(&world, turns));
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_key_holds_and_releases_the_run() {
    let (workers, _handles) = spawn_workers(2);
    let (client, _, _server) = spawn_broker(workers).await;
    let world = random_grid(37, 16, 16);
    let turns = 5_000;
    let controller = Controller::new(
        ControllerConfig::builder()
            .params(params(turns, 2, 16, 16))
            .build(),
        client,
    );

    let (events_tx, events_rx) = mpsc::channel(1024);
    let collected = drain(events_rx);
    let (keys_tx, keys_rx) = mpsc::channel(4);
    press_after(keys_tx, vec![(50, 'p'), (200, 'p')]);
    let mut saved = Saved::default();

    let outcome = controller
        .run(&mut Fixed(world.clone()), &mut saved, events_tx, keys_rx)
        .await
        .unwrap();
    let state = match outcome {
        Outcome::Completed(state) => state.into_consistent().unwrap(),
        other => panic!("run did not complete: {:?}", other),
    };
    assert_eq!(state.turn, turns);
    assert_eq!(state.grid, evolve(&world, turns));

    let changes: Vec<State> = collected
        .await
        .unwrap()
        .into_iter()
        .filter_map(|e| match e {
            Event::StateChange { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        changes,
        vec![State::Paused, State::Executing, State::Quitting]
    );
}
