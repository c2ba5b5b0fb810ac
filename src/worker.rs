//! # Worker Slots
//!
//! A worker slot is one long-lived task of the pool, bound 1:1 to a
//! [`Worker`] implementation for the pool's lifetime. The slot receives one
//! envelope at a time from the dispatcher and hands back exactly one reply
//! envelope, whatever the worker does:
//!
//! | Outcome of `handle` | Reply payload |
//! |---------------------|---------------|
//! | `Ok(bytes)` | `bytes` |
//! | `Err(e)` | `WorkerReply::Error { worker: Some(slot), .. }` |
//! | panic | `WorkerReply::Error { worker: Some(slot), error: "worker panicked" }` |
//!
//! Each invocation runs in its own task so that a panic unwinds that task
//! only and surfaces here as a `JoinError`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::identity::SessionId;
use crate::messages::{Envelope, LocateRequest, WorkerReply};
use crate::protocols::{Worker, WorkerError};

pub type SlotId = usize;

/// Run one invocation and turn every outcome into a reply envelope.
pub(crate) async fn invoke<W: Worker>(slot: SlotId, worker: &Arc<W>, envelope: Envelope) -> Envelope {
    let Envelope {
        session,
        binding,
        seq,
        payload,
    } = envelope;

    let task = {
        let worker = Arc::clone(worker);
        let session = session.clone();
        tokio::spawn(async move { worker.handle(&session, &payload).await })
    };

    let reply = match task.await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            debug!(slot, session = %session, error = %e, "worker reported failure");
            WorkerReply::error(Some(slot), e.to_string()).to_bytes()
        }
        Err(join) if join.is_panic() => {
            warn!(slot, session = %session, "worker panicked");
            WorkerReply::error(Some(slot), "worker panicked").to_bytes()
        }
        Err(_) => WorkerReply::error(Some(slot), "worker cancelled").to_bytes(),
    };

    Envelope {
        session,
        binding,
        seq,
        payload: reply,
    }
}

/// Slot loop: take an envelope, invoke, report the reply, repeat.
///
/// Exits when the dispatcher drops the inbox or stops listening for
/// completions.
pub(crate) async fn run_slot<W: Worker>(
    slot: SlotId,
    worker: Arc<W>,
    mut inbox: mpsc::Receiver<Envelope>,
    completions: mpsc::Sender<(SlotId, Envelope)>,
) {
    trace!(slot, "worker slot started");
    while let Some(envelope) = inbox.recv().await {
        let reply = invoke(slot, &worker, envelope).await;
        if completions.send((slot, reply)).await.is_err() {
            break;
        }
    }
    trace!(slot, "worker slot stopped");
}

/// Reference worker: acknowledges a [`LocateRequest`] with the serving
/// slot, the request counter and the session it came from.
#[derive(Clone, Debug)]
pub struct LocateWorker {
    slot: SlotId,
    max_delay: Duration,
}

impl LocateWorker {
    pub fn new(slot: SlotId) -> Self {
        Self {
            slot,
            max_delay: Duration::ZERO,
        }
    }

    /// Simulate processing time with a random delay up to `max_delay`.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn pool(size: usize, max_delay: Duration) -> Vec<LocateWorker> {
        (0..size)
            .map(|slot| LocateWorker::new(slot).with_max_delay(max_delay))
            .collect()
    }
}

#[async_trait]
impl Worker for LocateWorker {
    async fn handle(&self, session: &SessionId, request: &[u8]) -> Result<Vec<u8>, WorkerError> {
        let request = LocateRequest::parse(request)
            .map_err(|e| WorkerError::MalformedRequest(e.to_string()))?;
        debug!(
            worker = self.slot,
            session = %session,
            req = request.req,
            id = %request.id,
            "locate request received"
        );

        if !self.max_delay.is_zero() {
            let millis = self.max_delay.as_millis() as u64;
            let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=millis));
            tokio::time::sleep(delay).await;
        }

        Ok(WorkerReply::Served {
            worker: self.slot,
            req: request.req,
            session: session.to_string(),
        }
        .to_bytes())
    }
}

/// Worker backed by a synchronous closure.
pub struct FnWorker<F>(F);

impl<F> FnWorker<F>
where
    F: Fn(&SessionId, &[u8]) -> Result<Vec<u8>, WorkerError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Worker for FnWorker<F>
where
    F: Fn(&SessionId, &[u8]) -> Result<Vec<u8>, WorkerError> + Send + Sync + 'static,
{
    async fn handle(&self, session: &SessionId, request: &[u8]) -> Result<Vec<u8>, WorkerError> {
        (self.0)(session, request)
    }
}
