//! # Collective Exchange - Tree-Structured Allgather
//!
//! One exchange round aggregates one opaque fragment per participant
//! into a combined result delivered back to every participant, over a
//! k-ary tree: each rank collects its own fragment plus its children's,
//! forwards the batch to its parent, and relays the parent's combined
//! reply back down. Rank 0 is the root and combines in place.
//!
//! ## Components
//!
//! - [`kary`]: closed-form parent/child arithmetic for the tree, plus
//!   the per-process [`Topology`] derived once from configuration.
//! - [`session`]: the per-round state machine tracking collected
//!   fragments, queued child requests, the at-most-once parent request,
//!   and the exactly-once completion continuation.
//! - [`exchange`]: the engine owning the topology and the single active
//!   session; entry point for the local participant and handler body
//!   for inbound child requests.
//! - [`transport`]: the async request/response seam to peer ranks, with
//!   an in-process loopback router for tests and demos.
//! - [`fence`]: the orchestrator adapting one externally-triggered
//!   fence call (completion supplied by a foreign thread, delivered via
//!   the mailbox) onto one exchange session.
//!
//! ## Concurrency Model
//!
//! All engine state lives on a single-threaded event loop (a tokio
//! current-thread runtime with a `LocalSet`); nothing here takes a lock
//! around it. The only suspension point is the parent request await,
//! serviced cooperatively. Work originating on foreign threads enters
//! through the `mailbox` crate, never by touching engine state.
//!
//! Only one round may be in flight per engine at a time; the session is
//! retired the moment its continuation fires, which is what permits the
//! next round to start.

pub mod config;
pub mod exchange;
pub mod fence;
pub mod kary;
pub mod session;
pub mod transport;

pub use config::CollectiveConfig;
pub use exchange::Exchange;
pub use fence::{FenceClient, FenceService, FenceStatus, FENCE_TOPIC};
pub use kary::Topology;
pub use session::ExchangeOutcome;
pub use transport::{ExchangeTransport, LocalRouter, LocalTransport, PeerRequest};

/// Collective-specific errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollectiveError {
    /// Invalid rank/size/fanout at startup; fatal to initialization.
    #[error("configuration error: {0}")]
    Config(String),

    /// Double local entry, excess child request, malformed inbound
    /// request. Rejected at the call site; session state is untouched.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A tree hop failed. Marks the session's error flag and unblocks
    /// every waiter with a failed result instead of hanging.
    #[error("transport error: {0}")]
    Transport(String),
}

impl CollectiveError {
    pub fn config(msg: impl Into<String>) -> Self {
        CollectiveError::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        CollectiveError::Protocol(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        CollectiveError::Transport(msg.into())
    }
}

impl From<mailbox::MailboxError> for CollectiveError {
    fn from(err: mailbox::MailboxError) -> Self {
        CollectiveError::Transport(err.to_string())
    }
}

/// Result type for collective operations
pub type CollectiveResult<T> = std::result::Result<T, CollectiveError>;
