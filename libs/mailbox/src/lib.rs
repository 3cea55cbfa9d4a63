//! # Topic Mailbox - Foreign Thread to Event Loop Handoff
//!
//! ## Purpose
//! Thread-safe, topic-addressed message channel between two concurrency
//! domains: any foreign thread (typically a worker thread owned by an
//! external library that must never block) and the single-threaded event
//! loop that owns all subsystem state. The foreign side enqueues, the
//! owning side drains and dispatches to registered per-topic handlers.
//!
//! ## Architecture Role
//!
//! ```text
//! foreign worker thread          owning event loop
//!   MailboxSender::send  ─────▶  Mailbox::dispatch
//!        (any thread)    queue      │ topic lookup
//!                                   ▼
//!                            registered handler
//!                          (payload ownership moves)
//! ```
//!
//! ## Threading Model
//!
//! - [`MailboxSender`] is `Clone + Send + Sync` and may be called from any
//!   number of threads concurrently. `send` never blocks on the dispatch
//!   side: it takes the queue lock only long enough to push.
//! - [`Mailbox`] itself is owned by the event loop and is not `Sync`.
//!   Handlers run synchronously on the owning thread during a drain, with
//!   exclusive ownership of each message payload.
//! - The internal queue is the only locked state; the lock is held only
//!   around enqueue/dequeue, never across a handler invocation.
//!
//! ## Ordering Guarantees
//!
//! Delivery is exactly once, in the total order messages were enqueued.
//! Messages from one sending call sequence keep their relative order;
//! interleaving between concurrent senders is whatever order their pushes
//! won the queue lock.
//!
//! ## Shutdown
//!
//! The queue is unbounded, so a misbehaving foreign thread can grow it
//! without backpressure; hosts are expected to quiesce the foreign
//! library before dropping the mailbox. Once the [`Mailbox`] is dropped,
//! outstanding senders fail cleanly with [`MailboxError::Closed`] rather
//! than touching freed state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Fixed ceiling on the number of registered topics.
///
/// The handler table is bounded so a buggy host cannot grow it without
/// limit; exceeding the ceiling is a capacity error, not a panic.
pub const MAX_HANDLERS: usize = 32;

/// Mailbox-specific errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum MailboxError {
    #[error("handler table full: limit of {MAX_HANDLERS} topics reached")]
    HandlerTableFull,

    #[error("mailbox closed, message to topic {0} dropped")]
    Closed(String),
}

/// Result type for mailbox operations
pub type MailboxResult<T> = std::result::Result<T, MailboxError>;

/// One queued message: a topic plus an opaque payload.
///
/// The mailbox owns the message from `send` until dispatch, at which
/// point ownership transfers to the matching handler.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

/// State shared between senders and the owning mailbox.
struct Shared {
    queue: Mutex<VecDeque<Message>>,
    /// Edge-triggered readiness signal for the draining side.
    ready: Notify,
    closed: AtomicBool,
}

/// Cloneable sending handle, safe to use from any thread.
#[derive(Clone)]
pub struct MailboxSender {
    shared: Arc<Shared>,
}

impl MailboxSender {
    /// Enqueue a message for the owning event loop.
    ///
    /// Never blocks on the dispatch side and never waits for queue
    /// capacity (the queue is unbounded). Fails only once the owning
    /// [`Mailbox`] has been dropped.
    pub fn send(&self, topic: impl Into<String>, payload: Bytes) -> MailboxResult<()> {
        let topic = topic.into();
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(MailboxError::Closed(topic));
        }
        trace!(topic = %topic, bytes = payload.len(), "mailbox send");
        self.shared.queue.lock().push_back(Message { topic, payload });
        self.shared.ready.notify_one();
        Ok(())
    }
}

type Handler = Box<dyn FnMut(Message)>;

/// Receiving half, owned and drained by the event loop.
pub struct Mailbox {
    shared: Arc<Shared>,
    /// Registration-ordered handler table; first matching topic wins.
    handlers: Vec<(String, Handler)>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                ready: Notify::new(),
                closed: AtomicBool::new(false),
            }),
            handlers: Vec::new(),
        }
    }

    /// Create a sending handle for hand-off to a foreign thread.
    pub fn sender(&self) -> MailboxSender {
        MailboxSender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Register a handler for one topic.
    ///
    /// Handlers run synchronously on the owning thread during a drain
    /// and receive exclusive ownership of each message. The table is
    /// bounded by [`MAX_HANDLERS`].
    pub fn register<F>(&mut self, topic: impl Into<String>, handler: F) -> MailboxResult<()>
    where
        F: FnMut(Message) + 'static,
    {
        if self.handlers.len() == MAX_HANDLERS {
            return Err(MailboxError::HandlerTableFull);
        }
        let topic = topic.into();
        debug!(topic = %topic, "mailbox handler registered");
        self.handlers.push((topic, Box::new(handler)));
        Ok(())
    }

    /// Pop and dispatch queued messages until the queue is empty.
    ///
    /// Returns the number of messages dispatched (dropped messages for
    /// unregistered topics count too). The queue lock is released before
    /// each handler runs, so handlers and concurrent senders never
    /// contend with the drain itself.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        loop {
            let msg = match self.shared.queue.lock().pop_front() {
                Some(msg) => msg,
                None => break,
            };
            count += 1;
            match self
                .handlers
                .iter_mut()
                .find(|(topic, _)| *topic == msg.topic)
            {
                Some((_, handler)) => handler(msg),
                None => warn!(topic = %msg.topic, "unhandled mailbox topic, message dropped"),
            }
        }
        count
    }

    /// Wait for the readiness signal, then drain the queue.
    ///
    /// The signal is edge-triggered with a stored permit: a send that
    /// lands while a drain is in progress leaves the permit set, so the
    /// next call returns immediately instead of losing the wakeup.
    pub async fn dispatch(&mut self) -> usize {
        self.shared.ready.notified().await;
        self.drain()
    }

    /// Serve the mailbox forever. Intended to be one branch of the
    /// owning event loop's `select!`.
    pub async fn run(&mut self) {
        loop {
            self.dispatch().await;
        }
    }

    /// Number of messages currently queued.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        // Senders that outlive us start failing instead of queueing into
        // a mailbox nobody will ever drain.
        self.shared.closed.store(true, Ordering::Release);
    }
}
