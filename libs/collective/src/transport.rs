//! Async request/response seam to peer ranks.
//!
//! The engine needs exactly one outbound operation: send this rank's
//! collected fragments to its parent and await the combined reply,
//! with no timeout (a caller-level timeout, if wanted, belongs in the
//! host transport). Inbound child requests are delivered by the host
//! to [`Exchange::handle_child_request`]; [`serve`] is the loopback
//! host's version of that registration.
//!
//! [`LocalRouter`] wires N ranks together in one process over
//! unbounded channels with oneshot replies. It exists for integration
//! tests and demos; dropping a rank's request receiver turns that rank
//! into a dead hop, which is the failure-injection knob the tests use.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::exchange::Exchange;
use crate::{CollectiveError, CollectiveResult};

/// Outbound half of the exchange wire protocol.
#[async_trait(?Send)]
pub trait ExchangeTransport {
    /// Send `fragments` to `parent` and wait for the combined result.
    /// Waits forever; a transport failure is the only way out early.
    async fn exchange(&self, parent: u32, fragments: Vec<Bytes>) -> CollectiveResult<Vec<Bytes>>;
}

/// One inbound child request as carried by the loopback router.
pub struct PeerRequest {
    pub from: u32,
    pub fragments: Vec<Bytes>,
    pub reply: oneshot::Sender<CollectiveResult<Vec<Bytes>>>,
}

/// In-process wiring for a whole job's worth of ranks.
pub struct LocalRouter {
    inboxes: Vec<mpsc::UnboundedSender<PeerRequest>>,
}

impl LocalRouter {
    /// Create routes for `size` ranks. The returned receivers are the
    /// per-rank inbound request queues, index == rank; each rank's
    /// host is expected to [`serve`] its own.
    pub fn new(size: u32) -> (Self, Vec<mpsc::UnboundedReceiver<PeerRequest>>) {
        let (inboxes, queues) = (0..size).map(|_| mpsc::unbounded_channel()).unzip();
        (Self { inboxes }, queues)
    }

    /// Outbound transport handle for one rank.
    pub fn transport(&self, rank: u32) -> LocalTransport {
        LocalTransport {
            rank,
            inboxes: self.inboxes.clone(),
        }
    }
}

/// Loopback [`ExchangeTransport`] for one rank.
#[derive(Clone)]
pub struct LocalTransport {
    rank: u32,
    inboxes: Vec<mpsc::UnboundedSender<PeerRequest>>,
}

#[async_trait(?Send)]
impl ExchangeTransport for LocalTransport {
    async fn exchange(&self, parent: u32, fragments: Vec<Bytes>) -> CollectiveResult<Vec<Bytes>> {
        let (reply, response) = oneshot::channel();
        let inbox = self.inboxes.get(parent as usize).ok_or_else(|| {
            CollectiveError::transport(format!("no route to rank {parent}"))
        })?;
        inbox
            .send(PeerRequest {
                from: self.rank,
                fragments,
                reply,
            })
            .map_err(|_| CollectiveError::transport(format!("rank {parent} unreachable")))?;
        response
            .await
            .map_err(|_| CollectiveError::transport(format!("rank {parent} dropped exchange request")))?
    }
}

/// Feed one rank's inbound request queue into its engine. Runs until
/// the router side hangs up; meant to be `spawn_local`ed next to the
/// rank's event loop.
pub async fn serve(exchange: Exchange, mut requests: mpsc::UnboundedReceiver<PeerRequest>) {
    while let Some(request) = requests.recv().await {
        trace!(from = request.from, "inbound exchange request");
        exchange.handle_child_request(request.fragments, request.reply);
    }
}
