use std::{net::SocketAddr, sync::Arc};

use tracing::{debug, info, warn};

use super::Broker;
use crate::{
    net::{
        endpoint::Endpoint,
        serve::{serve, Reply, ServeExit},
        wire::{BrokerRequest, BrokerResponse},
    },
    Error,
};

/// Serves the broker RPC surface to controllers.
pub struct BrokerServer {
    endpoint: Endpoint,
    broker: Arc<Broker>,
}

impl BrokerServer {
    pub fn bind(addr: SocketAddr, broker: Broker) -> Result<Self, Error> {
        let endpoint = Endpoint::server(addr)?;
        info!(
            addr = %endpoint.local_addr()?,
            workers = broker.config().workers.len(),
            policy = ?broker.config().halo_policy,
            "broker listening"
        );
        Ok(Self {
            endpoint,
            broker: Arc::new(broker),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.endpoint.local_addr()
    }

    pub fn broker(&self) -> Arc<Broker> {
        self.broker.clone()
    }

    pub fn close(&self) {
        self.endpoint.close();
    }

    /// Answers calls until the endpoint closes or a `ShutdownAll` has been
    /// carried out.
    pub async fn serve(&self) -> Result<ServeExit, Error> {
        let broker = self.broker.clone();
        serve(&self.endpoint, move |req: BrokerRequest| {
            let broker = broker.clone();
            async move { handle(&broker, req).await }
        })
        .await
    }
}

async fn handle(broker: &Broker, req: BrokerRequest) -> Reply<BrokerResponse> {
    let kind = req.kind();
    debug!(kind, "call");
    let exit = matches!(req, BrokerRequest::ShutdownAll);
    match respond(broker, req).await {
        Ok(resp) if exit => Reply::then_exit(resp),
        Ok(resp) => Reply::new(resp),
        Err(e) => {
            warn!(kind, error = %e, "call failed");
            Reply::new(BrokerResponse::Failed(e.to_string()))
        }
    }
}

async fn respond(broker: &Broker, req: BrokerRequest) -> Result<BrokerResponse, Error> {
    let resp = match req {
        BrokerRequest::LoadWorld { grid, params } => {
            broker.load_world(grid, params).await?;
            BrokerResponse::Ack
        }
        BrokerRequest::ProcessWorld { grid, params } => {
            BrokerResponse::Processed(broker.process_world(grid, params).await?)
        }
        BrokerRequest::AliveCells => {
            BrokerResponse::AliveCells(broker.alive_cells().await?)
        }
        BrokerRequest::CurrentState => {
            BrokerResponse::State(broker.current_state().await?)
        }
        BrokerRequest::CellFlips => {
            let (turn, changes) = broker.cell_flips().await?;
            BrokerResponse::Flips { turn, changes }
        }
        BrokerRequest::PauseAll => BrokerResponse::Control(broker.pause().await),
        BrokerRequest::ResumeAll => BrokerResponse::Control(broker.resume().await),
        BrokerRequest::DisconnectAll => {
            BrokerResponse::Control(broker.disconnect().await)
        }
        BrokerRequest::ShutdownAll => {
            BrokerResponse::Control(broker.shutdown().await)
        }
    };
    Ok(resp)
}
