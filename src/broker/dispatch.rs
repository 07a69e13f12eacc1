use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::future::join_all;
use hashbrown::HashMap;
use tokio::{sync::Mutex, time};
use tracing::{debug, warn};

use crate::{
    net::{
        endpoint::Endpoint,
        link::Link,
        wire::{WorkerRequest, WorkerResponse},
    },
    Error,
};

/// Fans requests out to the workers and collects their replies by worker
/// position.
///
/// Keeps one link per worker and redials after any connectivity failure.
/// There is no retry: a worker that fails a call leaves a hole in that
/// round's results.
#[derive(Clone)]
pub struct Dispatcher {
    endpoint: Endpoint,
    workers: Arc<[SocketAddr]>,
    links: Arc<Mutex<HashMap<SocketAddr, Link>>>,
    timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        workers: Vec<SocketAddr>,
        timeout: Option<Duration>,
    ) -> Result<Self, Error> {
        Ok(Self {
            endpoint: Endpoint::client()?,
            workers: workers.into(),
            links: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        })
    }

    pub fn workers(&self) -> &[SocketAddr] {
        &self.workers
    }

    async fn link(&self, addr: SocketAddr) -> Result<Link, Error> {
        if let Some(link) = self.links.lock().await.get(&addr) {
            return Ok(link.clone());
        }
        let link = self.endpoint.connect(addr).await?;
        self.links.lock().await.insert(addr, link.clone());
        Ok(link)
    }

    async fn forget(&self, addr: SocketAddr) {
        if let Some(link) = self.links.lock().await.remove(&addr) {
            debug!(addr = %addr, "dropping link");
            link.close();
        }
    }

    /// Sends `req` to worker `index`. A `Failed` reply comes back as
    /// `Error::Remote`.
    pub async fn call(
        &self,
        index: usize,
        req: &WorkerRequest,
    ) -> Result<WorkerResponse, Error> {
        let addr = *self.workers.get(index).ok_or_else(|| {
            Error::invalid(format!("no worker at position {}", index))
        })?;
        let exchange = async {
            let link = self.link(addr).await?;
            link.call::<_, WorkerResponse>(req).await
        };
        let result = match self.timeout {
            Some(limit) => time::timeout(limit, exchange)
                .await
                .unwrap_or(Err(Error::Timeout(limit))),
            None => exchange.await,
        };
        match result {
            Ok(WorkerResponse::Failed(reason)) => Err(Error::Remote(reason)),
            Ok(resp) => Ok(resp),
            Err(e) => {
                if e.is_connectivity() {
                    self.forget(addr).await;
                }
                Err(e)
            }
        }
    }

    /// Calls the first `targets` workers concurrently, one task each.
    ///
    /// `build(i)` makes worker `i`'s request, or `None` to skip it this
    /// round. Slot `i` of the result holds worker `i`'s reply, or `None` if
    /// it was skipped or failed.
    pub async fn broadcast<F>(
        &self,
        targets: usize,
        build: F,
    ) -> Vec<Option<WorkerResponse>>
    where
        F: Fn(usize) -> Option<WorkerRequest>,
    {
        let calls = (0..targets.min(self.workers.len())).map(|index| {
            let req = build(index);
            let this = self.clone();
            tokio::spawn(async move {
                let Some(req) = req else {
                    return None;
                };
                match this.call(index, &req).await {
                    Ok(resp) => Some(resp),
                    Err(e) => {
                        warn!(
                            worker = index,
                            addr = %this.workers[index],
                            kind = req.kind(),
                            error = %e,
                            "worker call failed"
                        );
                        None
                    }
                }
            })
        });
        join_all(calls)
            .await
            .into_iter()
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    warn!(error = %e, "dispatch task failed");
                    None
                })
            })
            .collect()
    }

    /// Broadcasts `req` unchanged to every worker.
    pub async fn broadcast_all(
        &self,
        req: WorkerRequest,
    ) -> Vec<Option<WorkerResponse>> {
        self.broadcast(self.workers.len(), |_| Some(req.clone())).await
    }

    /// Closes every cached link.
    pub async fn close(&self) {
        for (_, link) in self.links.lock().await.drain() {
            link.close();
        }
    }
}
