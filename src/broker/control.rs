use rkyv::{Archive, Deserialize, Serialize};
use tracing::{info, warn};

use super::dispatch::Dispatcher;
use crate::net::wire::{WorkerRequest, WorkerResponse};

/// Which workers acknowledged a cluster-wide control call, by position.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct ControlReport {
    pub acknowledged: Vec<usize>,
    pub failed: Vec<usize>,
}

impl ControlReport {
    fn from_replies(replies: Vec<Option<WorkerResponse>>) -> Self {
        let mut report = Self::default();
        for (index, reply) in replies.into_iter().enumerate() {
            match reply {
                Some(WorkerResponse::Ack) => report.acknowledged.push(index),
                _ => report.failed.push(index),
            }
        }
        report
    }

    pub fn all_acknowledged(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Pause, resume, disconnect and shutdown across every worker.
///
/// These go out on their own streams, so they reach a worker even while a
/// `Step` or `Update` is running there.
#[derive(Clone)]
pub struct ControlPlane {
    dispatcher: Dispatcher,
}

impl ControlPlane {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    async fn broadcast(&self, req: WorkerRequest) -> ControlReport {
        let kind = req.kind();
        let report =
            ControlReport::from_replies(self.dispatcher.broadcast_all(req).await);
        if report.all_acknowledged() {
            info!(kind, workers = report.acknowledged.len(), "control call acknowledged");
        } else {
            warn!(kind, failed = ?report.failed, "control call not acknowledged by every worker");
        }
        report
    }

    pub async fn pause(&self) -> ControlReport {
        self.broadcast(WorkerRequest::Pause).await
    }

    pub async fn resume(&self) -> ControlReport {
        self.broadcast(WorkerRequest::UnPause).await
    }

    /// Tells every worker the controller has gone away. Nothing else
    /// changes: links stay open and a run in progress carries on.
    pub async fn disconnect(&self) -> ControlReport {
        self.broadcast(WorkerRequest::DisconnectClient).await
    }

    /// Asks every worker to terminate and waits for each to answer or fail.
    /// The caller is expected to exit afterwards.
    pub async fn shutdown(&self) -> ControlReport {
        let report = self.broadcast(WorkerRequest::ShutDown).await;
        self.dispatcher.close().await;
        report
    }
}
