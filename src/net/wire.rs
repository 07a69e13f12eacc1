use byteorder::{ByteOrder, LittleEndian};
use chrono::Utc;
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};

use super::MAX_FRAME_LEN;
use crate::{
    broker::{
        aggregate::{AggregatedState, AliveCount},
        control::ControlReport,
    },
    life::{partition::Band, CellChange, Grid, Params, Turn},
    worker::BandSnapshot,
    Error,
};

/// Zstd level for frame payloads. Grids are mostly runs of dead cells, so
/// the cheapest level already shrinks them well.
const ZSTD_LEVEL: i32 = 1;

/// `sent_at` (i64 micros) followed by the payload length (u32).
pub const HEADER_LEN: usize = 8 + 4;

/// A band together with the parameters of the run it belongs to.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct Load {
    pub band: Band,
    pub params: Params,
}

/// Requests a broker sends to a worker. One request per stream.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub enum WorkerRequest {
    /// (Re)initialise the worker's band and reset its turn to 0.
    LoadWorld(Load),
    /// Optionally reload, then run the band to `params.turns` with the
    /// isolated halo policy.
    Update { reload: Option<Load> },
    /// Advance one generation using halo rows from the neighbouring bands.
    Step {
        halo_above: Vec<u8>,
        halo_below: Vec<u8>,
    },
    SendCellNumber,
    SendCurrentState,
    SendCellFlip,
    Pause,
    UnPause,
    DisconnectClient,
    ShutDown,
}

impl WorkerRequest {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerRequest::LoadWorld(_) => "LoadWorld",
            WorkerRequest::Update { .. } => "Update",
            WorkerRequest::Step { .. } => "Step",
            WorkerRequest::SendCellNumber => "SendCellNumber",
            WorkerRequest::SendCurrentState => "SendCurrentState",
            WorkerRequest::SendCellFlip => "SendCellFlip",
            WorkerRequest::Pause => "Pause",
            WorkerRequest::UnPause => "UnPause",
            WorkerRequest::DisconnectClient => "DisconnectClient",
            WorkerRequest::ShutDown => "ShutDown",
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub enum WorkerResponse {
    Ack,
    /// Final band state of an `Update`, with the cells that flipped on the
    /// way there.
    Band {
        snapshot: BandSnapshot,
        changes: Vec<CellChange>,
    },
    /// New turn and edge rows after a `Step`.
    Stepped {
        turn: Turn,
        top: Vec<u8>,
        bottom: Vec<u8>,
    },
    CellNumber {
        alive: usize,
        turn: Turn,
    },
    State(BandSnapshot),
    Flips {
        turn: Turn,
        changes: Vec<CellChange>,
    },
    /// The worker understood the request but could not carry it out.
    Failed(String),
}

/// Requests a controller sends to the broker.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub enum BrokerRequest {
    LoadWorld { grid: Grid, params: Params },
    /// Compute `params.turns` generations. Without a grid the last loaded
    /// world is used.
    ProcessWorld { grid: Option<Grid>, params: Params },
    AliveCells,
    CurrentState,
    CellFlips,
    PauseAll,
    ResumeAll,
    DisconnectAll,
    ShutdownAll,
}

impl BrokerRequest {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerRequest::LoadWorld { .. } => "LoadWorld",
            BrokerRequest::ProcessWorld { .. } => "ProcessWorld",
            BrokerRequest::AliveCells => "AliveCells",
            BrokerRequest::CurrentState => "CurrentState",
            BrokerRequest::CellFlips => "CellFlips",
            BrokerRequest::PauseAll => "PauseAll",
            BrokerRequest::ResumeAll => "ResumeAll",
            BrokerRequest::DisconnectAll => "DisconnectAll",
            BrokerRequest::ShutdownAll => "ShutdownAll",
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub enum BrokerResponse {
    Ack,
    Processed(AggregatedState),
    AliveCells(AliveCount),
    State(AggregatedState),
    Flips {
        turn: Turn,
        changes: Vec<CellChange>,
    },
    Control(ControlReport),
    Failed(String),
}

/// A message that can be archived into a frame payload.
pub trait Message: Sized {
    fn encode(&self) -> Result<AlignedVec, Error>;
    fn decode(bytes: &[u8]) -> Result<Self, Error>;
}

macro_rules! impl_message {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Message for $ty {
                fn encode(&self) -> Result<AlignedVec, Error> {
                    rkyv::to_bytes::<_, 4096>(self)
                        .map_err(|e| Error::Encode(format!("{:?}", e)))
                }

                fn decode(bytes: &[u8]) -> Result<Self, Error> {
                    // archives must be read from an aligned buffer
                    let mut aligned = AlignedVec::with_capacity(bytes.len());
                    aligned.extend_from_slice(bytes);
                    rkyv::from_bytes::<$ty>(&aligned)
                        .map_err(|e| Error::Decode(format!("{:?}", e)))
                }
            }
        )*
    };
}

impl_message!(WorkerRequest, WorkerResponse, BrokerRequest, BrokerResponse);

/// The fixed-size prefix of every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Microseconds since the epoch when the frame was built.
    pub sent_at: i64,
    /// Length of the compressed payload that follows.
    pub len: usize,
}

impl FrameHeader {
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Result<Self, Error> {
        let sent_at = LittleEndian::read_i64(&buf[0..8]);
        let len = LittleEndian::read_u32(&buf[8..12]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(len));
        }
        Ok(Self { sent_at, len })
    }

    /// Microseconds between `sent_at` and now, for latency traces.
    pub fn age_micros(&self) -> i64 {
        Utc::now().timestamp_micros() - self.sent_at
    }
}

/// Builds a `sent_at | len | zstd(archive)` frame.
pub fn encode_frame<M: Message>(msg: &M) -> Result<Vec<u8>, Error> {
    let archive = msg.encode()?;
    let payload = zstd::encode_all(archive.as_slice(), ZSTD_LEVEL)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&Utc::now().timestamp_micros().to_le_bytes()); // 8 bytes
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes()); // 4 bytes
    buf.extend_from_slice(&payload); // len bytes
    Ok(buf)
}

/// Decodes the payload part of a frame.
pub fn decode_payload<M: Message>(payload: &[u8]) -> Result<M, Error> {
    let archive = zstd::decode_all(payload)?;
    M::decode(&archive)
}
