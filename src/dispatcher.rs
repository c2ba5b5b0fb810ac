//! # Worker Pool Dispatcher
//!
//! The dispatcher owns a fixed set of worker slots and load-balances
//! envelopes across them. It runs as an actor:
//!
//! ```text
//! Dispatcher (handle) ──Command──▶ DispatcherActor ──Envelope──▶ slot 0..N
//!                                        ▲                          │
//!                                        └────(slot, reply)─────────┘
//!                                        │
//!                                        └──reply──▶ reply channel (session router)
//! ```
//!
//! ## Discipline
//!
//! - Pending envelopes are served in arrival order.
//! - Idle slots are used in the order they became idle.
//! - A slot holds at most one envelope at a time.
//!
//! ## Backpressure
//!
//! The pending queue is bounded by `max_pending`. An envelope arriving at a
//! full queue is answered right away with an error-shaped reply, so every
//! accepted envelope still produces exactly one reply.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::BrokerError;
use crate::messages::{Envelope, WorkerReply};
use crate::protocols::Worker;
use crate::worker::{SlotId, run_slot};

/// Default bound on queued envelopes.
pub const DEFAULT_MAX_PENDING: usize = 10_000;

const COMMAND_CHANNEL_SIZE: usize = 1024;

/// Point-in-time view of the pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatcherTelemetry {
    pub workers: usize,
    pub idle: usize,
    pub pending: usize,
    pub submitted: u64,
    pub completed: u64,
    pub overloaded: u64,
    /// How long the longest-running current invocation has been busy.
    pub longest_busy: Option<Duration>,
}

enum Command {
    Submit(Envelope),
    Telemetry(oneshot::Sender<DispatcherTelemetry>),
    Quit,
}

/// Handle to the dispatcher actor. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    cmd_tx: mpsc::Sender<Command>,
}

impl Dispatcher {
    /// Start one slot per worker and the dispatcher actor.
    ///
    /// Replies are delivered on `replies` in completion order.
    ///
    /// # Errors
    /// [`BrokerError::Configuration`] if `workers` is empty or `max_pending`
    /// is zero.
    pub fn spawn<W: Worker>(
        workers: Vec<W>,
        max_pending: usize,
        replies: mpsc::Sender<Envelope>,
    ) -> Result<Self, BrokerError> {
        if workers.is_empty() {
            return Err(BrokerError::Configuration(
                "worker pool must have at least one worker".into(),
            ));
        }
        if max_pending == 0 {
            return Err(BrokerError::Configuration(
                "max_pending must be non-zero".into(),
            ));
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (done_tx, done_rx) = mpsc::channel(workers.len());

        let slots: Vec<SlotState> = workers
            .into_iter()
            .enumerate()
            .map(|(id, worker)| {
                let (inbox_tx, inbox_rx) = mpsc::channel(1);
                let handle = tokio::spawn(run_slot(id, Arc::new(worker), inbox_rx, done_tx.clone()));
                SlotState {
                    inbox: inbox_tx,
                    busy_since: None,
                    handle,
                }
            })
            .collect();

        info!(workers = slots.len(), max_pending, "dispatcher started");

        let actor = DispatcherActor {
            idle: (0..slots.len()).collect(),
            slots,
            pending: VecDeque::new(),
            max_pending,
            replies,
            submitted: 0,
            completed: 0,
            overloaded: 0,
        };
        tokio::spawn(actor.run(cmd_rx, done_rx));

        Ok(Self { cmd_tx })
    }

    /// Hand an envelope to the pool.
    ///
    /// Waits only for room in the command channel; the reply arrives later on
    /// the reply channel.
    pub async fn submit(&self, envelope: Envelope) -> Result<(), BrokerError> {
        self.cmd_tx
            .send(Command::Submit(envelope))
            .await
            .map_err(|_| BrokerError::Shutdown)
    }

    pub async fn telemetry(&self) -> Result<DispatcherTelemetry, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Telemetry(tx))
            .await
            .map_err(|_| BrokerError::Shutdown)?;
        rx.await.map_err(|_| BrokerError::Shutdown)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

struct SlotState {
    inbox: mpsc::Sender<Envelope>,
    busy_since: Option<Instant>,
    handle: JoinHandle<()>,
}

struct DispatcherActor {
    slots: Vec<SlotState>,
    idle: VecDeque<SlotId>,
    pending: VecDeque<Envelope>,
    max_pending: usize,
    replies: mpsc::Sender<Envelope>,
    submitted: u64,
    completed: u64,
    overloaded: u64,
}

impl DispatcherActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut done_rx: mpsc::Receiver<(SlotId, Envelope)>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Submit(envelope)) => self.submit(envelope).await,
                    Some(Command::Telemetry(reply)) => {
                        let _ = reply.send(self.telemetry());
                    }
                    Some(Command::Quit) | None => break,
                },
                Some((slot, reply)) = done_rx.recv() => {
                    self.complete(slot, reply).await;
                }
            }
        }

        for slot in &self.slots {
            slot.handle.abort();
        }
        debug!(
            pending = self.pending.len(),
            completed = self.completed,
            "dispatcher stopped"
        );
    }

    async fn submit(&mut self, envelope: Envelope) {
        self.submitted += 1;

        if self.pending.len() >= self.max_pending {
            self.overloaded += 1;
            warn!(
                session = %envelope.session,
                pending = self.pending.len(),
                "dispatcher overloaded, rejecting request"
            );
            let reply = envelope.with_payload(
                WorkerReply::error(None, "dispatcher overloaded").to_bytes(),
            );
            self.forward(reply).await;
            return;
        }

        self.pending.push_back(envelope);
        self.assign();
    }

    async fn complete(&mut self, slot: SlotId, reply: Envelope) {
        self.completed += 1;
        if let Some(state) = self.slots.get_mut(slot) {
            state.busy_since = None;
        }
        self.idle.push_back(slot);
        trace!(slot, session = %reply.session, seq = reply.seq, "worker finished");

        self.forward(reply).await;
        self.assign();
    }

    /// Pair idle slots with pending envelopes, oldest first on both sides.
    fn assign(&mut self) {
        while !self.pending.is_empty() {
            let Some(slot) = self.idle.pop_front() else {
                break;
            };
            let Some(envelope) = self.pending.pop_front() else {
                self.idle.push_front(slot);
                break;
            };

            let state = &mut self.slots[slot];
            match state.inbox.try_send(envelope) {
                Ok(()) => {
                    state.busy_since = Some(Instant::now());
                    trace!(slot, "envelope assigned");
                }
                Err(mpsc::error::TrySendError::Full(envelope))
                | Err(mpsc::error::TrySendError::Closed(envelope)) => {
                    // The slot is gone or not idle after all; keep the
                    // envelope at the head and retire the slot.
                    warn!(slot, "worker slot unavailable, removing from rotation");
                    self.pending.push_front(envelope);
                }
            }
        }
    }

    async fn forward(&self, reply: Envelope) {
        if self.replies.send(reply).await.is_err() {
            debug!("reply channel closed, dropping reply");
        }
    }

    fn telemetry(&self) -> DispatcherTelemetry {
        let now = Instant::now();
        DispatcherTelemetry {
            workers: self.slots.len(),
            idle: self.idle.len(),
            pending: self.pending.len(),
            submitted: self.submitted,
            completed: self.completed,
            overloaded: self.overloaded,
            longest_busy: self
                .slots
                .iter()
                .filter_map(|s| s.busy_since.map(|since| now.duration_since(since)))
                .max(),
        }
    }
}
