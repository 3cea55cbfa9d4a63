//! Run a whole job's worth of ranks in one process and drive one fence
//! round end to end: foreign threads trigger the fence, mailboxes carry
//! the upcalls onto the event loop, the tree exchange combines every
//! payload, and each completion prints what it received.
//!
//! ```bash
//! RUST_LOG=collective=trace,mailbox=debug cargo run --example fence_demo
//! ```

use std::rc::Rc;

use anyhow::Result;
use bytes::Bytes;
use collective::{transport, CollectiveConfig, Exchange, FenceService, FenceStatus, LocalRouter};
use mailbox::Mailbox;
use tracing::info;

const SIZE: u32 = 5;
const FANOUT: u32 = 2;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(run()))
}

async fn run() -> Result<()> {
    let (router, queues) = LocalRouter::new(SIZE);
    let mut mailboxes = Vec::new();
    let mut clients = Vec::new();
    for (rank, queue) in queues.into_iter().enumerate() {
        let rank = rank as u32;
        let config = CollectiveConfig::new(rank, SIZE, FANOUT);
        let engine = Exchange::new(&config, Rc::new(router.transport(rank)))?;
        tokio::task::spawn_local(transport::serve(engine.clone(), queue));

        let mut mailbox = Mailbox::new();
        let service = FenceService::register(&mut mailbox, engine)?;
        clients.push(service.client());
        mailboxes.push(mailbox);
    }

    // One foreign worker thread per rank, each contributing one line.
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    for (rank, client) in clients.into_iter().enumerate() {
        let done = done_tx.clone();
        let payload = Bytes::from(format!("[rank {rank}]"));
        std::thread::spawn(move || {
            client
                .fence(payload, true, move |status, data| {
                    done.send((rank, status, data)).unwrap();
                })
                .unwrap();
        })
        .join()
        .unwrap();
    }
    drop(done_tx);

    for mailbox in &mut mailboxes {
        mailbox.dispatch().await;
    }

    let mut completed = 0;
    while completed < SIZE {
        while let Ok((rank, status, data)) = done_rx.try_recv() {
            anyhow::ensure!(status == FenceStatus::Success, "rank {rank} fence failed");
            info!(rank, result = %String::from_utf8_lossy(&data), "fence complete");
            completed += 1;
        }
        tokio::task::yield_now().await;
    }
    Ok(())
}
