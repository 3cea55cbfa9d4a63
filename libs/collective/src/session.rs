//! # Exchange Session - One Round's State Machine
//!
//! ## Purpose
//! Tracks everything one participant accumulates during a single
//! collective round: its own fragment, each child's batch, the reply
//! handles those children are waiting on, the at-most-once parent
//! request, the combined result once known, and the completion
//! continuation that must fire exactly once.
//!
//! ## State Machine
//!
//! ```text
//! COLLECTING ──(local entry AND child requests == child_count)──┐
//!     │                                                         │
//!     │  root: combine own + child fragments in place           │
//!     │  non-root: send batch to parent, await combined reply   │
//!     ▼                                                         ▼
//! RESPONDING: reply to every queued child, fire continuation
//!     ▼
//! COMPLETE: session retired, engine handle cleared
//! ```
//!
//! The single synchronization point is the fan-in check: nothing moves
//! until the local participant has entered and exactly `child_count`
//! child requests have arrived. Arrival order of fragments is
//! preserved but deliberately unspecified to callers; the combined
//! result is a multiset.
//!
//! ## Error Path
//!
//! Any transport failure sets the error flag, abandons further input,
//! replies an error status to every queued child, and still fires the
//! continuation exactly once. A failed hop degrades the round for
//! everyone, but no participant hangs.
//!
//! ## Invariants
//!
//! - At most one local entry per session; a second is rejected without
//!   touching state.
//! - Queued child requests never exceed the topology's child count;
//!   excess requests are rejected at the call site.
//! - The parent request is sent at most once, only after fan-in.
//! - The continuation fires exactly once, then the session is retired.

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::trace;

use crate::{CollectiveError, CollectiveResult};

/// Reply handle for one queued child request.
pub(crate) type ChildResponder = oneshot::Sender<CollectiveResult<Vec<Bytes>>>;

pub(crate) type DoneCallback = Box<dyn FnOnce(ExchangeOutcome)>;

/// Result of one exchange round, handed to the completion
/// continuation. Owned by the callee; the session it came from is
/// already retired by the time the continuation runs.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    fragments: Vec<Bytes>,
    ok: bool,
}

impl ExchangeOutcome {
    pub(crate) fn new(fragments: Vec<Bytes>, ok: bool) -> Self {
        Self { fragments, ok }
    }

    /// Whether the round completed without error.
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// The collected fragments, one per contributing participant, in
    /// arrival order. Callers must not depend on the ordering.
    pub fn fragments(&self) -> &[Bytes] {
        &self.fragments
    }

    /// The combined result as one contiguous blob: the fragments
    /// concatenated in arrival order.
    pub fn concat(&self) -> Bytes {
        let total = self.fragments.iter().map(|f| f.len()).sum();
        let mut buf = Vec::with_capacity(total);
        for fragment in &self.fragments {
            buf.extend_from_slice(fragment);
        }
        Bytes::from(buf)
    }
}

/// Mutable state for one in-progress round. Lives on the owning event
/// loop only; created on the first local entry or child request,
/// destroyed immediately after the continuation fires.
pub(crate) struct Session {
    seq: u64,
    /// Collected input fragments: our own plus every child's batch.
    fragments: Vec<Bytes>,
    /// Reply handles for child requests queued until the combined
    /// result is available.
    responders: Vec<ChildResponder>,
    /// Set once the parent request has been issued.
    parent_sent: bool,
    /// The combined result, absent until the root combines in place or
    /// the parent's reply arrives.
    combined: Option<Vec<Bytes>>,
    local: bool,
    has_error: bool,
    on_done: Option<DoneCallback>,
}

impl Session {
    pub(crate) fn new(seq: u64) -> Self {
        trace!(seq, "exchange session created");
        Self {
            seq,
            fragments: Vec::new(),
            responders: Vec::new(),
            parent_sent: false,
            combined: None,
            local: false,
            has_error: false,
            on_done: None,
        }
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    /// Record the local participant's entry. At most one per session.
    pub(crate) fn record_local(&mut self, data: Bytes, on_done: DoneCallback) -> CollectiveResult<()> {
        if self.local {
            return Err(CollectiveError::protocol(
                "exchange already entered for this round",
            ));
        }
        self.local = true;
        self.on_done = Some(on_done);
        self.fragments.push(data);
        Ok(())
    }

    /// Append one child's batch and queue its reply handle. The caller
    /// enforces the child-count ceiling before calling.
    pub(crate) fn record_child(&mut self, fragments: Vec<Bytes>, responder: ChildResponder) {
        self.fragments.extend(fragments);
        self.responders.push(responder);
    }

    pub(crate) fn child_requests(&self) -> usize {
        self.responders.len()
    }

    /// Fan-in check: the one gate between collecting and moving the
    /// round forward.
    pub(crate) fn fan_in_complete(&self, child_count: usize) -> bool {
        self.local && self.responders.len() == child_count
    }

    pub(crate) fn parent_sent(&self) -> bool {
        self.parent_sent
    }

    pub(crate) fn mark_parent_sent(&mut self) {
        self.parent_sent = true;
    }

    pub(crate) fn fragments(&self) -> &[Bytes] {
        &self.fragments
    }

    pub(crate) fn set_combined(&mut self, combined: Vec<Bytes>) {
        self.combined = Some(combined);
    }

    /// Root shortcut: the local collection is already the combined
    /// result.
    pub(crate) fn combine_in_place(&mut self) {
        self.combined = Some(self.fragments.clone());
    }

    pub(crate) fn has_combined(&self) -> bool {
        self.combined.is_some()
    }

    pub(crate) fn set_error(&mut self) {
        self.has_error = true;
    }

    pub(crate) fn has_error(&self) -> bool {
        self.has_error
    }

    pub(crate) fn local_entered(&self) -> bool {
        self.local
    }

    /// Respond to every queued child and fire the continuation, then
    /// drop the session. Consumes `self`: a session finishes once.
    pub(crate) fn finish(mut self) {
        let ok = !self.has_error && self.combined.is_some();
        let combined = self.combined.take().unwrap_or_default();
        for responder in self.responders.drain(..) {
            let reply = if ok {
                Ok(combined.clone())
            } else {
                Err(CollectiveError::transport("exchange failed upstream"))
            };
            // A child that gave up waiting is its own round's problem.
            if responder.send(reply).is_err() {
                trace!(seq = self.seq, "child request abandoned before reply");
            }
        }
        trace!(seq = self.seq, ok, "exchange session complete");
        if let Some(on_done) = self.on_done.take() {
            on_done(ExchangeOutcome::new(combined, ok));
        }
    }
}
