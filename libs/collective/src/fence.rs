//! # Fence Orchestrator - Foreign Callback onto One Exchange
//!
//! ## Purpose
//! Adapts one externally-triggered collective call into one exchange
//! session. The trigger arrives on a foreign worker thread that must
//! not block and cannot touch engine state, so the call crosses into
//! the event loop as an opaque mailbox message and its completion is
//! parked in a pending-call table until the round resolves.
//!
//! ## Flow
//!
//! ```text
//! foreign thread: FenceClient::fence(data, collect, on_done)
//!   ├─ completion stored under fresh call_id        (DashMap)
//!   └─ FenceUpcall{call_id, collect, data} ──────▶  mailbox "fence.upcall"
//! event loop: FenceService handler
//!   ├─ decode upcall, look up call_id
//!   ├─ Exchange::enter(fragment, continuation)
//!   └─ continuation: translate {bytes, ok} -> (FenceStatus, Bytes),
//!      fire the stored completion exactly once
//! ```
//!
//! The pending-call table is the explicit context object standing in
//! for a process-wide singleton: foreign callbacks only ever hold a
//! [`FenceClient`], never a pointer into event-loop state.
//!
//! A call with `collect = false` still enters the exchange with an
//! empty fragment, so the tree accounting and completion contract are
//! identical on every code path; the concatenated result simply omits
//! that participant's bytes.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use mailbox::{Mailbox, MailboxResult, MailboxSender, Message};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::exchange::Exchange;
use crate::CollectiveResult;

/// Mailbox topic carrying fence upcalls from the foreign thread.
pub const FENCE_TOPIC: &str = "fence.upcall";

/// Status handed to a fence call's completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Success,
    Failed,
}

/// Completion supplied by the foreign caller. Fired exactly once, on
/// the event loop thread, with the combined result bytes on success.
pub type FenceCompletion = Box<dyn FnOnce(FenceStatus, Bytes) + Send + Sync>;

/// Wire form of one upcall as it crosses the mailbox.
#[derive(Debug, Serialize, Deserialize)]
struct FenceUpcall {
    call_id: u64,
    collect: bool,
    data: Vec<u8>,
}

#[derive(Default)]
struct PendingCalls {
    next_id: AtomicU64,
    map: DashMap<u64, FenceCompletion>,
}

/// Event-loop side of the orchestrator: owns the upcall handler and
/// the pending-call table. One service per mailbox/engine pair.
pub struct FenceService {
    sender: MailboxSender,
    pending: Arc<PendingCalls>,
}

impl FenceService {
    /// Register the [`FENCE_TOPIC`] handler on the mailbox.
    pub fn register(mailbox: &mut Mailbox, exchange: Exchange) -> MailboxResult<Self> {
        let pending = Arc::new(PendingCalls::default());
        let table = Arc::clone(&pending);
        mailbox.register(FENCE_TOPIC, move |msg| {
            handle_upcall(&exchange, &table, msg);
        })?;
        Ok(Self {
            sender: mailbox.sender(),
            pending,
        })
    }

    /// Handle for foreign threads to trigger fence calls with.
    pub fn client(&self) -> FenceClient {
        FenceClient {
            sender: self.sender.clone(),
            pending: Arc::clone(&self.pending),
        }
    }
}

/// Foreign-thread handle: assigns call ids, parks completions, and
/// hands the call to the event loop via the mailbox. `Clone + Send +
/// Sync`, never blocks.
#[derive(Clone)]
pub struct FenceClient {
    sender: MailboxSender,
    pending: Arc<PendingCalls>,
}

impl FenceClient {
    /// Trigger one fence call.
    ///
    /// On error the completion is reclaimed and never fires; the
    /// immediate caller owns reporting the failure, exactly as it owns
    /// it when the mailbox is already gone.
    pub fn fence<F>(&self, data: Bytes, collect: bool, on_done: F) -> CollectiveResult<()>
    where
        F: FnOnce(FenceStatus, Bytes) + Send + Sync + 'static,
    {
        let call_id = self.pending.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.map.insert(call_id, Box::new(on_done));

        let upcall = FenceUpcall {
            call_id,
            collect,
            data: data.to_vec(),
        };
        let result = serde_json::to_vec(&upcall)
            .map_err(|e| crate::CollectiveError::transport(format!("fence upcall encode: {e}")))
            .and_then(|payload| {
                self.sender
                    .send(FENCE_TOPIC, Bytes::from(payload))
                    .map_err(Into::into)
            });
        if result.is_err() {
            self.pending.map.remove(&call_id);
        }
        result
    }
}

fn handle_upcall(exchange: &Exchange, pending: &Arc<PendingCalls>, msg: Message) {
    let upcall: FenceUpcall = match serde_json::from_slice(&msg.payload) {
        Ok(upcall) => upcall,
        Err(e) => {
            warn!(error = %e, "error unpacking fence upcall message, dropped");
            return;
        }
    };
    let Some((_, on_done)) = pending.map.remove(&upcall.call_id) else {
        warn!(call = upcall.call_id, "fence upcall with unknown call id, dropped");
        return;
    };

    let data = if upcall.collect {
        Bytes::from(upcall.data)
    } else {
        Bytes::new()
    };
    let call_id = upcall.call_id;
    trace!(call = call_id, size = data.len(), "starting fence exchange");

    // The completion must fire exactly once whether the round resolves
    // or entry is rejected outright, so it sits in a shared slot both
    // paths drain from.
    let slot = Rc::new(RefCell::new(Some(on_done)));
    let on_exchange_done = Rc::clone(&slot);
    let entered = exchange.enter(data, move |outcome| {
        let (status, result) = if outcome.is_ok() {
            (FenceStatus::Success, outcome.concat())
        } else {
            (FenceStatus::Failed, Bytes::new())
        };
        trace!(call = call_id, size = result.len(), ?status, "completed fence exchange");
        if let Some(on_done) = on_exchange_done.borrow_mut().take() {
            on_done(status, result);
        }
    });
    if let Err(e) = entered {
        warn!(call = call_id, error = %e, "error initiating fence exchange");
        if let Some(on_done) = slot.borrow_mut().take() {
            on_done(FenceStatus::Failed, Bytes::new());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ExchangeTransport;
    use crate::{CollectiveConfig, CollectiveResult};
    use async_trait::async_trait;

    struct NoRoute;

    #[async_trait(?Send)]
    impl ExchangeTransport for NoRoute {
        async fn exchange(&self, _: u32, _: Vec<Bytes>) -> CollectiveResult<Vec<Bytes>> {
            panic!("singleton never sends to a parent");
        }
    }

    fn singleton() -> (Mailbox, FenceService) {
        let mut mailbox = Mailbox::new();
        let exchange =
            Exchange::new(&CollectiveConfig::new(0, 1, 2), Rc::new(NoRoute)).unwrap();
        let service = FenceService::register(&mut mailbox, exchange).unwrap();
        (mailbox, service)
    }

    #[tokio::test]
    async fn fence_from_foreign_thread_completes() {
        let (mut mailbox, service) = singleton();
        let client = service.client();
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        std::thread::spawn(move || {
            client
                .fence(Bytes::from_static(b"payload"), true, move |status, data| {
                    done_tx.send((status, data)).unwrap();
                })
                .unwrap();
        })
        .join()
        .unwrap();

        assert_eq!(mailbox.dispatch().await, 1);
        let (status, data) = done_rx.recv().unwrap();
        assert_eq!(status, FenceStatus::Success);
        assert_eq!(data, Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn non_collect_fence_contributes_nothing() {
        let (mut mailbox, service) = singleton();
        let client = service.client();
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        client
            .fence(Bytes::from_static(b"ignored"), false, move |status, data| {
                done_tx.send((status, data)).unwrap();
            })
            .unwrap();
        mailbox.dispatch().await;

        let (status, data) = done_rx.recv().unwrap();
        assert_eq!(status, FenceStatus::Success);
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn malformed_upcall_is_dropped_without_firing() {
        let (mut mailbox, service) = singleton();
        let client = service.client();
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        // A pending call followed by a stray message on the fence
        // topic: the garbage is dropped, the real call still resolves.
        client
            .fence(Bytes::from_static(b"real"), true, move |status, _| {
                done_tx.send(status).unwrap();
            })
            .unwrap();
        mailbox
            .sender()
            .send(FENCE_TOPIC, Bytes::from_static(b"not json"))
            .unwrap();

        assert_eq!(mailbox.dispatch().await, 2);
        assert_eq!(done_rx.recv().unwrap(), FenceStatus::Success);
    }

    #[tokio::test]
    async fn second_fence_while_round_open_fails_fast() {
        // Root of 2 waits on one child, so the first fence call leaves
        // the round open and the second must be rejected as Failed
        // without disturbing the first.
        let mut mailbox = Mailbox::new();
        let exchange =
            Exchange::new(&CollectiveConfig::new(0, 2, 2), Rc::new(NoRoute)).unwrap();
        let service = FenceService::register(&mut mailbox, exchange).unwrap();
        let client = service.client();

        let (first_tx, first_rx) = std::sync::mpsc::channel();
        client
            .fence(Bytes::from_static(b"a"), true, move |status, _| {
                first_tx.send(status).unwrap();
            })
            .unwrap();
        let (second_tx, second_rx) = std::sync::mpsc::channel();
        client
            .fence(Bytes::from_static(b"b"), true, move |status, _| {
                second_tx.send(status).unwrap();
            })
            .unwrap();

        assert_eq!(mailbox.dispatch().await, 2);
        assert_eq!(second_rx.recv().unwrap(), FenceStatus::Failed);
        // First call is still waiting on its child, untouched.
        assert!(first_rx.try_recv().is_err());
    }

    #[test]
    fn fence_after_mailbox_drop_reclaims_completion() {
        let (mailbox, service) = singleton();
        let client = service.client();
        drop(mailbox);
        let err = client
            .fence(Bytes::new(), true, |_, _| panic!("must never fire"))
            .unwrap_err();
        assert!(matches!(err, crate::CollectiveError::Transport(_)));
        assert!(client.pending.map.is_empty());
    }
}
