use std::{net::SocketAddr, sync::Arc};

use tracing::{debug, info, warn};

use super::WorkerSession;
use crate::{
    net::{
        endpoint::Endpoint,
        serve::{serve, Reply, ServeExit},
        wire::{Load, WorkerRequest, WorkerResponse},
    },
    Error,
};

/// Serves the worker RPC surface for one process-wide [`WorkerSession`].
pub struct WorkerServer {
    endpoint: Endpoint,
    session: Arc<WorkerSession>,
}

impl WorkerServer {
    pub fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let endpoint = Endpoint::server(addr)?;
        info!(addr = %endpoint.local_addr()?, "worker listening");
        Ok(Self {
            endpoint,
            session: Arc::new(WorkerSession::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.endpoint.local_addr()
    }

    pub fn session(&self) -> Arc<WorkerSession> {
        self.session.clone()
    }

    /// Stops accepting links and drops the open ones.
    pub fn close(&self) {
        self.endpoint.close();
    }

    /// Answers calls until the endpoint closes or a `ShutDown` arrives.
    pub async fn serve(&self) -> Result<ServeExit, Error> {
        let session = self.session.clone();
        serve(&self.endpoint, move |req: WorkerRequest| {
            let session = session.clone();
            async move { handle(&session, req).await }
        })
        .await
    }
}

async fn handle(session: &WorkerSession, req: WorkerRequest) -> Reply<WorkerResponse> {
    let kind = req.kind();
    debug!(kind, "call");
    let exit = matches!(req, WorkerRequest::ShutDown);
    match respond(session, req).await {
        Ok(resp) if exit => Reply::then_exit(resp),
        Ok(resp) => Reply::new(resp),
        Err(e) => {
            warn!(kind, error = %e, "call failed");
            Reply::new(WorkerResponse::Failed(e.to_string()))
        }
    }
}

async fn respond(
    session: &WorkerSession,
    req: WorkerRequest,
) -> Result<WorkerResponse, Error> {
    let resp = match req {
        WorkerRequest::LoadWorld(Load { band, params }) => {
            session.load(band, params).await?;
            WorkerResponse::Ack
        }
        WorkerRequest::Update { reload } => {
            if let Some(Load { band, params }) = reload {
                session.load(band, params).await?;
            }
            let snapshot = session.run().await?;
            let (_, changes) = session.take_changes().await;
            WorkerResponse::Band { snapshot, changes }
        }
        WorkerRequest::Step {
            halo_above,
            halo_below,
        } => {
            let out = session.step(halo_above, halo_below).await?;
            WorkerResponse::Stepped {
                turn: out.turn,
                top: out.top,
                bottom: out.bottom,
            }
        }
        WorkerRequest::SendCellNumber => {
            let status = session.status().await?;
            WorkerResponse::CellNumber {
                alive: status.alive,
                turn: status.turn,
            }
        }
        WorkerRequest::SendCurrentState => {
            WorkerResponse::State(session.snapshot().await?)
        }
        WorkerRequest::SendCellFlip => {
            let (turn, changes) = session.take_changes().await;
            WorkerResponse::Flips { turn, changes }
        }
        WorkerRequest::Pause => {
            session.pause();
            WorkerResponse::Ack
        }
        WorkerRequest::UnPause => {
            session.resume();
            WorkerResponse::Ack
        }
        WorkerRequest::DisconnectClient => {
            info!("controller detached from the broker");
            WorkerResponse::Ack
        }
        WorkerRequest::ShutDown => {
            session.shutdown().await;
            WorkerResponse::Ack
        }
    };
    Ok(resp)
}
