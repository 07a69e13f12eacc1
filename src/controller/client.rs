use std::net::SocketAddr;

use crate::{
    broker::{
        aggregate::{AggregatedState, AliveCount},
        control::ControlReport,
    },
    life::{CellChange, Grid, Params, Turn},
    net::{
        endpoint::Endpoint,
        link::Link,
        wire::{BrokerRequest, BrokerResponse},
    },
    Error,
};

/// Typed calls against a broker's RPC surface.
///
/// Can be cloned to obtain another handle to the same link; calls from
/// different handles run concurrently.
#[derive(Clone)]
pub struct BrokerClient {
    // keeps the endpoint driving the link alive
    _endpoint: Endpoint,
    link: Link,
}

impl BrokerClient {
    pub async fn connect(broker: SocketAddr) -> Result<Self, Error> {
        let endpoint = Endpoint::client()?;
        let link = endpoint.connect(broker).await?;
        Ok(Self {
            _endpoint: endpoint,
            link,
        })
    }

    async fn call(&self, req: BrokerRequest) -> Result<BrokerResponse, Error> {
        match self.link.call::<_, BrokerResponse>(&req).await? {
            BrokerResponse::Failed(reason) => Err(Error::Remote(reason)),
            resp => Ok(resp),
        }
    }

    async fn control(&self, req: BrokerRequest) -> Result<ControlReport, Error> {
        match self.call(req).await? {
            BrokerResponse::Control(report) => Ok(report),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub async fn load_world(&self, grid: Grid, params: Params) -> Result<(), Error> {
        match self.call(BrokerRequest::LoadWorld { grid, params }).await? {
            BrokerResponse::Ack => Ok(()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub async fn process_world(
        &self,
        grid: Option<Grid>,
        params: Params,
    ) -> Result<AggregatedState, Error> {
        match self
            .call(BrokerRequest::ProcessWorld { grid, params })
            .await?
        {
            BrokerResponse::Processed(state) => Ok(state),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub async fn alive_cells(&self) -> Result<AliveCount, Error> {
        match self.call(BrokerRequest::AliveCells).await? {
            BrokerResponse::AliveCells(count) => Ok(count),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub async fn current_state(&self) -> Result<AggregatedState, Error> {
        match self.call(BrokerRequest::CurrentState).await? {
            BrokerResponse::State(state) => Ok(state),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub async fn cell_flips(&self) -> Result<(Turn, Vec<CellChange>), Error> {
        match self.call(BrokerRequest::CellFlips).await? {
            BrokerResponse::Flips { turn, changes } => Ok((turn, changes)),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub async fn pause_all(&self) -> Result<ControlReport, Error> {
        self.control(BrokerRequest::PauseAll).await
    }

    pub async fn resume_all(&self) -> Result<ControlReport, Error> {
        self.control(BrokerRequest::ResumeAll).await
    }

    pub async fn disconnect_all(&self) -> Result<ControlReport, Error> {
        self.control(BrokerRequest::DisconnectAll).await
    }

    pub async fn shutdown_all(&self) -> Result<ControlReport, Error> {
        self.control(BrokerRequest::ShutdownAll).await
    }

    pub fn close(&self) {
        self.link.close();
    }
}
