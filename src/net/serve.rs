use std::{future::Future, sync::Arc};

use tokio::{select, sync::watch};
use tracing::{debug, debug_span, warn, Instrument};

use super::{endpoint::Endpoint, link::Link, wire::Message};
use crate::Error;

/// Why a server loop returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServeExit {
    /// The endpoint was closed locally.
    Closed,
    /// A peer asked the process to terminate. The reply has already been
    /// delivered.
    Shutdown,
}

/// A handler's answer to one call.
pub struct Reply<R> {
    pub response: R,
    /// Stop serving once `response` has been delivered.
    pub exit: bool,
}

impl<R> Reply<R> {
    pub fn new(response: R) -> Self {
        Self {
            response,
            exit: false,
        }
    }

    pub fn then_exit(response: R) -> Self {
        Self {
            response,
            exit: true,
        }
    }
}

/// Accepts links on `endpoint` and answers every call with `handler`.
///
/// Each incoming link gets its own task and each call stream on it another,
/// so a slow call never holds up the rest.
pub async fn serve<Req, Resp, H, Fut>(
    endpoint: &Endpoint,
    handler: H,
) -> Result<ServeExit, Error>
where
    Req: Message + Send + 'static,
    Resp: Message + Send + Sync + 'static,
    H: Fn(Req) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Reply<Resp>> + Send + 'static,
{
    let (exit_tx, mut exit_rx) = watch::channel(false);
    let exit_tx = Arc::new(exit_tx);
    loop {
        select! {
            incoming = endpoint.accept() => {
                let Some(connecting) = incoming else {
                    debug!("endpoint closed");
                    return Ok(ServeExit::Closed);
                };
                tokio::spawn(serve_link(connecting, handler.clone(), exit_tx.clone()));
            }
            _ = exit_rx.wait_for(|exit| *exit) => {
                endpoint.close();
                return Ok(ServeExit::Shutdown);
            }
        }
    }
}

async fn serve_link<Req, Resp, H, Fut>(
    connecting: quinn::Connecting,
    handler: H,
    exit: Arc<watch::Sender<bool>>,
) where
    Req: Message + Send + 'static,
    Resp: Message + Send + Sync + 'static,
    H: Fn(Req) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Reply<Resp>> + Send + 'static,
{
    let link = match Link::accept(connecting).await {
        Ok(link) => link,
        Err(e) => {
            warn!(error = %e, "failed to accept link");
            return;
        }
    };
    let span = debug_span!("peer", remote = %link.remote_addr(), id = link.id());
    async move {
        loop {
            let (mut tx, mut rx) = match link.next_call().await {
                Ok(streams) => streams,
                Err(e) => {
                    debug!(reason = %e, "link closed");
                    return;
                }
            };
            let handler = handler.clone();
            let exit = exit.clone();
            tokio::spawn(
                async move {
                    let req: Req = match rx.receive().await {
                        Ok(req) => req,
                        Err(e) => {
                            warn!(error = %e, "unreadable call");
                            return;
                        }
                    };
                    let reply = handler(req).await;
                    if let Err(e) = tx.send(&reply.response).await {
                        warn!(error = %e, "failed to send reply");
                        return;
                    }
                    if let Err(e) = tx.finish().await {
                        debug!(error = %e, "reply stream not acknowledged");
                    }
                    if reply.exit {
                        exit.send_replace(true);
                    }
                }
                .in_current_span(),
            );
        }
    }
    .instrument(span)
    .await
}
