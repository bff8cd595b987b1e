//! Per-motor latest-wins command coalescing (spec §4.5, C5).
//!
//! Every discovered motor gets one mailbox of capacity 1 and one worker
//! task. Producers (DMX ingest, HTTP) call [`Coalescer::offer`], which
//! atomically overwrites any undelivered intent; the worker drains the
//! newest intent and dispatches it through the command API. At 44 Hz DMX
//! ingest this is what keeps the serial bus from falling behind: instead of
//! queueing every frame's intent, only the latest one for each motor
//! survives to be sent.
//!
//! Per spec §9 ("the clearest model is an atomic slot with a wake signal,
//! not a general queue"), the mailbox is a `tokio::sync::watch` channel of
//! capacity 1: exactly one writer slot, one reader cursor, no queueing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mcp_commands::{MotionCommands, MoveMode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

/// What a motor should do next (spec §3 "motor intent").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorIntent {
    Stop,
    RotateRight(i32),
    RotateLeft(i32),
    MoveTo(i32),
}

/// An intent plus a monotonically increasing sequence number, used only for
/// observability (spec §3) — never for ordering decisions, which the
/// mailbox's overwrite semantics already guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedIntent {
    pub seq: u64,
    pub intent: MotorIntent,
}

struct Mailbox {
    tx: watch::Sender<Option<TaggedIntent>>,
    next_seq: AtomicU64,
    worker: JoinHandle<()>,
}

/// Owns one mailbox + worker per known motor address. Share via `Arc`; all
/// operations take `&self`.
pub struct Coalescer<S> {
    commands: Arc<MotionCommands<S>>,
    mailboxes: Mutex<HashMap<u8, Mailbox>>,
}

impl<S> Coalescer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(commands: Arc<MotionCommands<S>>) -> Self {
        Self {
            commands,
            mailboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile the set of live mailboxes with `addrs` (typically the
    /// registry's address set after a rescan): spawn a worker for every new
    /// address, and cancel+drain the worker for every address no longer
    /// present.
    pub async fn reconcile(&self, addrs: &[u8]) {
        let mut mailboxes = self.mailboxes.lock().await;

        let stale: Vec<u8> = mailboxes
            .keys()
            .copied()
            .filter(|addr| !addrs.contains(addr))
            .collect();
        for addr in stale {
            if let Some(mailbox) = mailboxes.remove(&addr) {
                // Dropping `tx` lets the worker observe channel closure once
                // it has drained whatever intent was last offered.
                drop(mailbox.tx);
                let _ = mailbox.worker.await;
            }
        }

        for &addr in addrs {
            mailboxes.entry(addr).or_insert_with(|| {
                let (tx, rx) = watch::channel(None);
                let commands = self.commands.clone();
                let worker = tokio::spawn(run_worker(addr, rx, commands));
                Mailbox {
                    tx,
                    next_seq: AtomicU64::new(0),
                    worker,
                }
            });
        }
    }

    /// Overwrite the mailbox for `addr` with a new intent. Returns `false`
    /// if `addr` has no worker (motor not currently known), in which case
    /// the offer is silently dropped.
    pub async fn offer(&self, addr: u8, intent: MotorIntent) -> bool {
        let mailboxes = self.mailboxes.lock().await;
        match mailboxes.get(&addr) {
            Some(mailbox) => {
                let seq = mailbox.next_seq.fetch_add(1, Ordering::Relaxed);
                // `watch::Sender::send` always overwrites the current value;
                // this is the atomic-replace half of latest-wins.
                let _ = mailbox.tx.send(Some(TaggedIntent { seq, intent }));
                true
            }
            None => false,
        }
    }

    /// Stop accepting new offers and drain+join every worker. Each worker
    /// finishes dispatching whatever intent it already holds, then exits.
    pub async fn shutdown(&self) {
        let mut mailboxes = self.mailboxes.lock().await;
        let drained: Vec<Mailbox> = mailboxes.drain().map(|(_, m)| m).collect();
        for mailbox in drained {
            drop(mailbox.tx);
            let _ = mailbox.worker.await;
        }
    }

    pub async fn known_addrs(&self) -> Vec<u8> {
        self.mailboxes.lock().await.keys().copied().collect()
    }
}

async fn run_worker<S>(
    addr: u8,
    mut rx: watch::Receiver<Option<TaggedIntent>>,
    commands: Arc<MotionCommands<S>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        match rx.changed().await {
            Ok(()) => {
                let tagged = *rx.borrow_and_update();
                if let Some(tagged) = tagged {
                    dispatch(&commands, addr, tagged).await;
                }
            }
            Err(_closed) => return,
        }
    }
}

async fn dispatch<S>(commands: &MotionCommands<S>, addr: u8, tagged: TaggedIntent)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let result = match tagged.intent {
        MotorIntent::Stop => commands.stop(addr).await.map(drop),
        MotorIntent::RotateRight(speed) => commands.rotate_right(addr, speed).await.map(drop),
        MotorIntent::RotateLeft(speed) => commands.rotate_left(addr, speed).await.map(drop),
        MotorIntent::MoveTo(pos) => commands
            .move_to(addr, MoveMode::Absolute, 0, pos)
            .await
            .map(drop),
    };
    // One motor's failures must not affect others (spec §7): log and move on.
    if let Err(err) = result {
        warn!(addr, seq = tagged.seq, %err, "coalescer dispatch failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_protocol::{encode_request, STATUS_OK};
    use mcp_transport::BusTransport;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn harness() -> (Arc<Coalescer<DuplexStream>>, DuplexStream) {
        let (a, b) = duplex(4096);
        let commands = Arc::new(MotionCommands::new(Arc::new(BusTransport::from_stream(a))));
        (Arc::new(Coalescer::new(commands)), b)
    }

    async fn serve_replies(mut device: DuplexStream, n: usize) -> Vec<[u8; 9]> {
        let mut reqs = Vec::new();
        for _ in 0..n {
            let mut req = [0u8; 9];
            device.read_exact(&mut req).await.unwrap();
            let value = i32::from_be_bytes([req[4], req[5], req[6], req[7]]);
            let reply = encode_request(0xFF, req[0], STATUS_OK, req[1], value);
            device.write_all(&reply).await.unwrap();
            reqs.push(req);
        }
        reqs
    }

    #[tokio::test]
    async fn offer_to_unknown_motor_is_rejected() {
        let (coalescer, _device) = harness().await;
        assert!(!coalescer.offer(7, MotorIntent::Stop).await);
    }

    #[tokio::test]
    async fn reconcile_spawns_a_worker_that_accepts_offers() {
        let (coalescer, device) = harness().await;
        coalescer.reconcile(&[5]).await;

        let serve = tokio::spawn(serve_replies(device, 1));
        assert!(coalescer.offer(5, MotorIntent::Stop).await);
        let reqs = serve.await.unwrap();
        assert_eq!(reqs[0][0], 5);
        assert_eq!(reqs[0][1], 3); // opcode 3 = stop
    }

    #[tokio::test]
    async fn latest_wins_only_the_final_intent_is_dispatched() {
        let (coalescer, device) = harness().await;
        coalescer.reconcile(&[9]).await;

        // Offer three intents before the worker has a chance to run.
        coalescer.offer(9, MotorIntent::RotateLeft(111)).await;
        coalescer.offer(9, MotorIntent::RotateLeft(222)).await;
        coalescer.offer(9, MotorIntent::RotateRight(333)).await;

        let serve = tokio::spawn(serve_replies(device, 1));
        let reqs = serve.await.unwrap();
        assert_eq!(reqs.len(), 1, "only one command should reach the wire");
        assert_eq!(reqs[0][1], 1); // opcode 1 = rotate_right, the last offer
        let value = i32::from_be_bytes([reqs[0][4], reqs[0][5], reqs[0][6], reqs[0][7]]);
        assert_eq!(value, 333);
    }

    #[tokio::test]
    async fn reconcile_removes_workers_for_addresses_no_longer_present() {
        let (coalescer, _device) = harness().await;
        coalescer.reconcile(&[1, 2]).await;
        coalescer.reconcile(&[2]).await;

        let mut addrs = coalescer.known_addrs().await;
        addrs.sort();
        assert_eq!(addrs, vec![2]);
        assert!(!coalescer.offer(1, MotorIntent::Stop).await);
    }

    #[tokio::test]
    async fn shutdown_drains_a_pending_intent_before_exiting() {
        let (coalescer, device) = harness().await;
        coalescer.reconcile(&[4]).await;
        coalescer.offer(4, MotorIntent::Stop).await;

        let serve = tokio::spawn(serve_replies(device, 1));
        coalescer.shutdown().await;
        let reqs = tokio::time::timeout(Duration::from_secs(1), serve)
            .await
            .expect("serve task should finish")
            .unwrap();
        assert_eq!(reqs[0][0], 4);

        assert!(!coalescer.offer(4, MotorIntent::Stop).await);
    }
}
