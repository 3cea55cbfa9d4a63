//! # Exchange Engine - One Active Round Per Handle
//!
//! ## Purpose
//! Owns the tree [`Topology`] and at most one live [`Session`],
//! creating it on the first local entry or child request of a round
//! and retiring it the instant its continuation fires. Exposes the two
//! entry points of the protocol: [`Exchange::enter`] for the local
//! participant and [`Exchange::handle_child_request`] for the host's
//! inbound request service.
//!
//! ## Threading
//! The engine is strictly event-loop state: it lives behind
//! `Rc<RefCell<..>>` and must be driven from a tokio current-thread
//! runtime inside a `LocalSet` (the parent request is issued with
//! `spawn_local`). Foreign threads reach it only through the mailbox.
//!
//! A monotonically increasing sequence number tags each round in trace
//! output; it has no effect on correctness.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::kary::Topology;
use crate::session::{DoneCallback, ExchangeOutcome, Session};
use crate::transport::ExchangeTransport;
use crate::{CollectiveConfig, CollectiveError, CollectiveResult};

struct Inner {
    topology: Topology,
    transport: Rc<dyn ExchangeTransport>,
    session: Option<Session>,
    /// Diagnostic round counter, traced but never load-bearing.
    next_seq: u64,
}

impl Inner {
    /// Lazily create the round's session. Seq advances only when a
    /// new session is actually created.
    fn current_session(&mut self) -> &mut Session {
        let seq = self.next_seq;
        let created = self.session.is_none();
        let session = self.session.get_or_insert_with(|| Session::new(seq));
        if created {
            self.next_seq += 1;
        }
        session
    }
}

/// Handle to the exchange engine. Clones share one engine.
#[derive(Clone)]
pub struct Exchange {
    inner: Rc<RefCell<Inner>>,
}

impl Exchange {
    /// Build an engine from validated host configuration and an
    /// outbound transport. Fails only on configuration errors.
    pub fn new(
        config: &CollectiveConfig,
        transport: Rc<dyn ExchangeTransport>,
    ) -> CollectiveResult<Self> {
        let topology = Topology::new(config)?;
        Ok(Self {
            inner: Rc::new(RefCell::new(Inner {
                topology,
                transport,
                session: None,
                next_seq: 0,
            })),
        })
    }

    /// This rank's view of the tree.
    pub fn topology(&self) -> Topology {
        self.inner.borrow().topology.clone()
    }

    /// Whether the local participant has already entered the current
    /// round.
    pub fn local_entered(&self) -> bool {
        self.inner
            .borrow()
            .session
            .as_ref()
            .map(Session::local_entered)
            .unwrap_or(false)
    }

    /// Enter the current round with this participant's fragment.
    ///
    /// `on_done` fires exactly once, on this thread, when the combined
    /// result (or a failure) is known. A second call before that is a
    /// protocol error and leaves the first call's round untouched.
    pub fn enter<F>(&self, data: Bytes, on_done: F) -> CollectiveResult<()>
    where
        F: FnOnce(ExchangeOutcome) + 'static,
    {
        self.enter_boxed(data, Box::new(on_done))
    }

    fn enter_boxed(&self, data: Bytes, on_done: DoneCallback) -> CollectiveResult<()> {
        {
            let mut inner = self.inner.borrow_mut();
            let session = inner.current_session();
            session.record_local(data, on_done)?;
            trace!(seq = session.seq(), "exchange entered locally");
        }
        process(&self.inner);
        Ok(())
    }

    /// Handler body for one inbound child request: `fragments` is the
    /// child's collected batch, `responder` the reply handle it blocks
    /// on. Registration with the host transport is the caller's job.
    ///
    /// A request beyond this rank's child count is answered with a
    /// protocol error and does not alter the session.
    pub fn handle_child_request(
        &self,
        fragments: Vec<Bytes>,
        responder: oneshot::Sender<CollectiveResult<Vec<Bytes>>>,
    ) {
        let full = {
            let inner = self.inner.borrow();
            let pending = inner
                .session
                .as_ref()
                .map(Session::child_requests)
                .unwrap_or(0);
            pending >= inner.topology.child_count()
        };
        if full {
            warn!("exchange received too many child requests");
            let _ = responder.send(Err(CollectiveError::protocol(
                "exchange received too many child requests",
            )));
            return;
        }
        {
            let mut inner = self.inner.borrow_mut();
            let session = inner.current_session();
            session.record_child(fragments, responder);
            trace!(
                seq = session.seq(),
                pending = session.child_requests(),
                "child request queued"
            );
        }
        process(&self.inner);
    }
}

/// Drive the state machine as far as current input allows. Called
/// after every event that can unblock the round: local entry, a child
/// request, the parent's reply.
fn process(inner_rc: &Rc<RefCell<Inner>>) {
    enum Step {
        Wait,
        SendParent {
            parent: u32,
            fragments: Vec<Bytes>,
            seq: u64,
        },
        Finish,
    }

    let step = {
        let mut inner = inner_rc.borrow_mut();
        let child_count = inner.topology.child_count();
        let parent = inner.topology.parent();
        match inner.session.as_mut() {
            None => Step::Wait,
            Some(session) => {
                if session.has_error() {
                    Step::Finish
                } else if !session.fan_in_complete(child_count) {
                    // Awaiting self or child input.
                    Step::Wait
                } else {
                    match parent {
                        Some(parent_rank) if !session.parent_sent() => {
                            session.mark_parent_sent();
                            Step::SendParent {
                                parent: parent_rank,
                                fragments: session.fragments().to_vec(),
                                seq: session.seq(),
                            }
                        }
                        // Parent request in flight; its completion
                        // re-enters process().
                        Some(_) if !session.has_combined() => Step::Wait,
                        Some(_) => Step::Finish,
                        None => {
                            // Root: local collection is the result.
                            if !session.has_combined() {
                                session.combine_in_place();
                            }
                            Step::Finish
                        }
                    }
                }
            }
        }
    };

    match step {
        Step::Wait => {}
        Step::Finish => {
            // Retire the session before running replies and the
            // continuation, so either may start the next round.
            let session = inner_rc.borrow_mut().session.take();
            if let Some(session) = session {
                session.finish();
            }
        }
        Step::SendParent {
            parent,
            fragments,
            seq,
        } => {
            trace!(seq, parent, count = fragments.len(), "sending exchange request to parent");
            let transport = Rc::clone(&inner_rc.borrow().transport);
            let inner_task = Rc::clone(inner_rc);
            tokio::task::spawn_local(async move {
                let result = transport.exchange(parent, fragments).await;
                {
                    let mut inner = inner_task.borrow_mut();
                    if let Some(session) = inner.session.as_mut() {
                        match result {
                            Ok(combined) => session.set_combined(combined),
                            Err(e) => {
                                warn!(seq, error = %e, "exchange request to parent failed");
                                session.set_error();
                            }
                        }
                    }
                }
                process(&inner_task);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::cell::Cell;

    /// Transport stub for ranks whose round never leaves the node.
    struct NoRoute;

    #[async_trait(?Send)]
    impl ExchangeTransport for NoRoute {
        async fn exchange(&self, _: u32, _: Vec<Bytes>) -> CollectiveResult<Vec<Bytes>> {
            panic!("unexpected parent request");
        }
    }

    /// Transport stub that fails every parent request.
    struct DeadParent;

    #[async_trait(?Send)]
    impl ExchangeTransport for DeadParent {
        async fn exchange(&self, _: u32, _: Vec<Bytes>) -> CollectiveResult<Vec<Bytes>> {
            Err(CollectiveError::transport("injected failure"))
        }
    }

    fn engine(rank: u32, size: u32, transport: Rc<dyn ExchangeTransport>) -> Exchange {
        Exchange::new(&CollectiveConfig::new(rank, size, 2), transport).unwrap()
    }

    #[tokio::test]
    async fn singleton_round_completes_immediately() {
        let xcg = engine(0, 1, Rc::new(NoRoute));
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        xcg.enter(Bytes::from_static(b"only"), move |outcome| {
            assert!(outcome.is_ok());
            assert_eq!(outcome.concat(), Bytes::from_static(b"only"));
            flag.set(true);
        })
        .unwrap();
        assert!(fired.get());
        // Session retired; the next round is free to start.
        assert!(!xcg.local_entered());
    }

    #[tokio::test]
    async fn double_enter_is_a_protocol_error() {
        // Root of 3 still waits on two children, so the session stays
        // open across both calls.
        let xcg = engine(0, 3, Rc::new(NoRoute));
        xcg.enter(Bytes::from_static(b"first"), |_| {}).unwrap();
        let err = xcg.enter(Bytes::from_static(b"second"), |_| {}).unwrap_err();
        assert!(matches!(err, CollectiveError::Protocol(_)));
        assert!(xcg.local_entered());
    }

    #[tokio::test]
    async fn leaf_rejects_any_child_request() {
        let xcg = engine(2, 3, Rc::new(NoRoute));
        let (tx, mut rx) = oneshot::channel();
        xcg.handle_child_request(vec![Bytes::from_static(b"x")], tx);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(CollectiveError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn excess_child_request_leaves_collected_fragments_intact() {
        let xcg = engine(0, 3, Rc::new(NoRoute));
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        xcg.handle_child_request(vec![Bytes::from_static(b"c1")], tx1);
        xcg.handle_child_request(vec![Bytes::from_static(b"c2")], tx2);

        let (tx3, mut rx3) = oneshot::channel();
        xcg.handle_child_request(vec![Bytes::from_static(b"c3")], tx3);
        assert!(rx3.try_recv().unwrap().is_err());

        // The rejected request must not have extended the round: local
        // entry still completes with exactly own + two child fragments.
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        xcg.enter(Bytes::from_static(b"me"), move |outcome| {
            assert_eq!(outcome.fragments().len(), 3);
            flag.set(true);
        })
        .unwrap();
        assert!(fired.get());
    }

    #[tokio::test]
    async fn failed_parent_hop_still_fires_continuation() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                // Rank 1 of 2 is a leaf with rank 0 as parent.
                let xcg = engine(1, 2, Rc::new(DeadParent));
                let (done_tx, done_rx) = oneshot::channel();
                xcg.enter(Bytes::from_static(b"frag"), move |outcome| {
                    done_tx.send(outcome.is_ok()).unwrap();
                })
                .unwrap();
                assert!(!done_rx.await.unwrap());
            })
            .await;
    }
}
