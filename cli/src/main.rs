use std::{
    fs,
    io::{self, BufRead, BufReader, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    process, thread,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueEnum};
use gridcast::{
    broker::{server::BrokerServer, Broker, BrokerConfig, HaloPolicy},
    controller::{
        client::BrokerClient, Controller, ControllerConfig, Event, GridSink,
        GridSource, Outcome,
    },
    hex::HexDisplayExt,
    life::{Grid, Params, ALIVE, DEAD},
    net::{listen_addr, serve::ServeExit, DEFAULT_BROKER_PORT, DEFAULT_WORKER_PORT},
    worker::server::WorkerServer,
    Error,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "gridcast",
    about = "Distributed Game of Life over QUIC",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve one band of the grid
    Worker(WorkerArgs),
    /// Split worlds across workers and reassemble them
    Broker(BrokerArgs),
    /// Load a world, run it on a broker and save the result
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct WorkerArgs {
    #[arg(long, default_value_t = DEFAULT_WORKER_PORT, help = "UDP port to listen on")]
    port: u16,
}

#[derive(Args, Debug)]
struct BrokerArgs {
    #[arg(long, default_value_t = DEFAULT_BROKER_PORT, help = "UDP port to listen on")]
    port: u16,

    #[arg(
        long = "worker",
        value_name = "ADDR",
        required = true,
        help = "Worker address; repeat once per worker, in band order"
    )]
    workers: Vec<SocketAddr>,

    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Skip halo exchange; faster but only exact for one generation"
    )]
    isolated: bool,

    #[arg(long = "timeout-ms", value_name = "MS", help = "Bound on each worker call")]
    timeout_ms: Option<u64>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_BROKER_PORT)))]
    broker: SocketAddr,

    #[arg(long, default_value_t = 512)]
    width: usize,

    #[arg(long, default_value_t = 512)]
    height: usize,

    #[arg(long, default_value_t = 100)]
    turns: u32,

    #[arg(long, default_value_t = 8, help = "Number of bands to split the grid into")]
    threads: usize,

    #[arg(long, conflicts_with_all = ["pattern", "input"], help = "Seed for a random initial grid")]
    seed: Option<u64>,

    #[arg(long, value_enum, conflicts_with = "input")]
    pattern: Option<Pattern>,

    #[arg(long, value_name = "DIR", help = "Read the initial grid from DIR/<width>x<height>.pgm")]
    input: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Write snapshots as PGM images into DIR")]
    out: Option<PathBuf>,

    #[arg(long = "tick-ms", default_value_t = 2000, help = "Progress poll interval")]
    tick_ms: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Pattern {
    Blinker,
    Glider,
    Acorn,
}

impl Pattern {
    /// Live cells relative to the pattern's top left corner.
    fn cells(self) -> &'static [(usize, usize)] {
        match self {
            Pattern::Blinker => &[(0, 0), (0, 1), (0, 2)],
            Pattern::Glider => &[(0, 1), (1, 2), (2, 0), (2, 1), (2, 2)],
            Pattern::Acorn => &[(0, 1), (1, 3), (2, 0), (2, 1), (2, 4), (2, 5), (2, 6)],
        }
    }
}

/// Where `run` takes its initial grid from.
enum Source {
    Random(u64),
    Pattern(Pattern),
    Pgm(PathBuf),
}

impl GridSource for Source {
    fn load(&mut self, width: usize, height: usize) -> Result<Grid, Error> {
        match self {
            Source::Random(seed) => {
                let mut rng = StdRng::seed_from_u64(*seed);
                let cells = (0..width * height)
                    .map(|_| if rng.gen_bool(0.25) { ALIVE } else { DEAD })
                    .collect();
                Grid::from_cells(width, height, cells)
            }
            Source::Pattern(pattern) => {
                let (top, left) = (height / 2, width / 2);
                let alive: Vec<_> = pattern
                    .cells()
                    .iter()
                    .map(|&(r, c)| ((top + r) % height, (left + c) % width))
                    .collect();
                Grid::from_alive(width, height, &alive)
            }
            Source::Pgm(dir) => {
                read_pgm(&dir.join(format!("{}x{}.pgm", width, height)), width, height)
            }
        }
    }
}

/// Logs every snapshot and, given a directory, writes it there as a PGM.
struct Sink {
    out: Option<PathBuf>,
}

impl GridSink for Sink {
    fn save(&mut self, grid: &Grid, label: &str) -> Result<(), Error> {
        let digest = grid.digest();
        info!(
            %label,
            alive = grid.alive_count(),
            digest = %digest.hex(),
            "snapshot"
        );
        if let Some(dir) = &self.out {
            fs::create_dir_all(dir)?;
            write_pgm(&dir.join(format!("{}.pgm", label)), grid)?;
        }
        Ok(())
    }
}

fn read_pgm(path: &Path, width: usize, height: usize) -> Result<Grid, Error> {
    let bytes = fs::read(path)?;
    // header: "P5" <ws> width <ws> height <ws> maxval <single ws> pixels
    let mut fields = Vec::with_capacity(4);
    let mut pos = 0;
    while fields.len() < 4 {
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        let start = pos;
        while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if start == pos {
            return Err(Error::InvalidInput(format!(
                "{} has a truncated header",
                path.display()
            )));
        }
        fields.push(String::from_utf8_lossy(&bytes[start..pos]).into_owned());
    }
    let expected = ["P5".to_string(), width.to_string(), height.to_string(), "255".to_string()];
    if fields != expected {
        return Err(Error::InvalidInput(format!(
            "{} is not a {}x{} binary PGM",
            path.display(),
            width,
            height
        )));
    }
    let pixels = bytes.get(pos + 1..).unwrap_or_default();
    Grid::from_cells(width, height, pixels.to_vec())
}

fn write_pgm(path: &Path, grid: &Grid) -> Result<(), Error> {
    let mut file = fs::File::create(path)?;
    write!(file, "P5\n{} {}\n255\n", grid.width(), grid.height())?;
    file.write_all(grid.cells())?;
    Ok(())
}

/// Forwards every non-blank character typed on `input` as a key press.
///
/// Reads on a plain thread, so a pending read never keeps the runtime from
/// exiting.
fn read_keys<R: BufRead + Send + 'static>(input: R) -> mpsc::Receiver<char> {
    let (keys_tx, keys_rx) = mpsc::channel(16);
    thread::spawn(move || {
        for line in input.lines() {
            let Ok(line) = line else { return };
            for key in line.chars().filter(|c| !c.is_whitespace()) {
                if keys_tx.blocking_send(key).is_err() {
                    return;
                }
            }
        }
    });
    keys_rx
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Worker(args) => worker(args).await,
        Command::Broker(args) => broker(args).await,
        Command::Run(args) => run(args).await,
    };
    match result {
        Ok(ServeExit::Shutdown) => {
            info!("shut down by request");
            process::exit(0);
        }
        Ok(ServeExit::Closed) => {}
        Err(e) => {
            error!(error = %e, "exiting");
            process::exit(1);
        }
    }
}

async fn worker(args: WorkerArgs) -> Result<ServeExit, Error> {
    let server = WorkerServer::bind(listen_addr(args.port))?;
    server.serve().await
}

async fn broker(args: BrokerArgs) -> Result<ServeExit, Error> {
    let policy = if args.isolated {
        HaloPolicy::Isolated
    } else {
        HaloPolicy::Exchange
    };
    let config = match args.timeout_ms {
        Some(ms) => BrokerConfig::builder()
            .workers(args.workers)
            .halo_policy(policy)
            .call_timeout(Duration::from_millis(ms))
            .build(),
        None => BrokerConfig::builder()
            .workers(args.workers)
            .halo_policy(policy)
            .build(),
    };
    let server = BrokerServer::bind(listen_addr(args.port), Broker::new(config)?)?;
    server.serve().await
}

async fn run(args: RunArgs) -> Result<ServeExit, Error> {
    let params = Params::builder()
        .turns(args.turns)
        .concurrency(args.threads)
        .width(args.width)
        .height(args.height)
        .build();
    let config = ControllerConfig::builder()
        .params(params)
        .tick(Duration::from_millis(args.tick_ms))
        .build();
    let mut source = match (args.input, args.pattern, args.seed) {
        (Some(dir), _, _) => Source::Pgm(dir),
        (None, Some(pattern), _) => Source::Pattern(pattern),
        (None, None, seed) => Source::Random(seed.unwrap_or_else(rand::random)),
    };
    let mut sink = Sink { out: args.out };

    let client = BrokerClient::connect(args.broker).await?;
    let controller = Controller::new(config, client);

    let (events_tx, mut events_rx) = mpsc::channel(1024);
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                Event::CellFlipped { .. } => {}
                Event::AliveCellsCount { turn, count } => {
                    info!(turn, alive = count, "progress")
                }
                Event::StateChange { turn, state } => info!(turn, ?state, "state"),
                Event::ImageOutputComplete { turn, label } => {
                    debug!(turn, %label, "image written")
                }
                Event::TurnComplete { turn } => debug!(turn, "turn complete"),
                Event::FinalTurnComplete { turn, alive } => {
                    info!(turn, alive = alive.len(), "final turn complete")
                }
            }
        }
    });

    let keys_rx = read_keys(BufReader::new(io::stdin()));

    let outcome = controller
        .run(&mut source, &mut sink, events_tx, keys_rx)
        .await?;
    if let Err(e) = printer.await {
        warn!(error = %e, "event printer failed");
    }
    match outcome {
        Outcome::Completed(state) => {
            for issue in &state.issues {
                warn!(%issue, "final world is inconsistent");
            }
            Ok(ServeExit::Closed)
        }
        Outcome::Detached { turn } => {
            info!(turn, "detached from the cluster");
            Ok(ServeExit::Closed)
        }
        Outcome::Shutdown { turn } => {
            info!(turn, "cluster shut down");
            Ok(ServeExit::Shutdown)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn keys_are_forwarded_until_input_ends() {
        let mut keys = read_keys(Cursor::new("p\n  q k \n\ns\n"));
        let mut pressed = Vec::new();
        while let Some(key) = keys.recv().await {
            pressed.push(key);
        }
        assert_eq!(pressed, vec!['p', 'q', 'k', 's']);
    }
}
