//! # Session-Routed Broker
//!
//! The broker terminates client connections on one QUIC endpoint and proxies
//! between them and the worker pool:
//!
//! ```text
//! client ──Request{seq}──▶ connection task ──Envelope──▶ Dispatcher ──▶ slots
//! client ◀──Reply{seq}─── writer task ◀── SessionRouter ◀──reply envelopes──┘
//! ```
//!
//! ## Connection lifecycle
//!
//! `Connecting → Authenticated → Active → Closed`, with `Connecting → Closed`
//! as the rejection path. A connection becomes `Active` once its `Hello`
//! has bound a session identity in the [`SessionRouter`].
//!
//! ## Return addressing
//!
//! Every envelope carries the session identity and the `binding` (a
//! per-connection counter) captured at ingress. The router delivers a reply
//! only while the same session is still bound to the same connection; other
//! replies are discarded as undeliverable. The payload is never inspected.
//!
//! ## Shutdown
//!
//! A `watch` channel stops the accept loop, every session reader and the
//! reload ticker; the dispatcher and router actors receive `Quit`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use quinn::{Endpoint, Incoming, RecvStream, SendStream};
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::auth::{Authenticator, reload_periodically};
use crate::config::BrokerConfig;
use crate::crypto::ALPN_BROKER;
use crate::dispatcher::{Dispatcher, DispatcherTelemetry};
use crate::error::BrokerError;
use crate::identity::{PublicKey, SessionId};
use crate::keystore::KeyPair;
use crate::messages::{
    ClientFrame, Envelope, PROTOCOL_VERSION, RejectReason, ServerFrame, read_frame, write_frame,
};
use crate::negotiator::{self, AuthenticatedPeer};
use crate::protocols::Worker;
use crate::worker::LocateWorker;

/// Requests one session may have queued or in progress at once.
pub const MAX_IN_FLIGHT_PER_SESSION: usize = 32;

/// Retired session identities remembered to flag reuse.
pub const RETIRED_SESSION_MEMORY: usize = 4096;

/// Time a new connection has to open its stream and send `Hello`.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Time given to the peer to read a `Rejected` frame before closing.
const REJECT_LINGER: Duration = Duration::from_secs(1);

/// Time the writer gets to flush after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const REPLY_CHANNEL_SIZE: usize = 1024;
const ROUTER_CHANNEL_SIZE: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Connecting, Closed)
                | (Authenticated, Active)
                | (Authenticated, Closed)
                | (Active, Closed)
        )
    }
}

struct ConnectionTracker {
    binding: u64,
    remote: SocketAddr,
    state: ConnectionState,
}

impl ConnectionTracker {
    fn new(binding: u64, remote: SocketAddr) -> Self {
        Self {
            binding,
            remote,
            state: ConnectionState::Connecting,
        }
    }

    fn advance(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(next) {
            warn!(binding = self.binding, from = ?self.state, to = ?next, "invalid connection transition");
            return;
        }
        trace!(binding = self.binding, peer = %self.remote, from = ?self.state, to = ?next, "connection state");
        self.state = next;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouterTelemetry {
    pub sessions: usize,
    pub delivered: u64,
    pub undeliverable: u64,
    pub reused: u64,
}

enum RouterCommand {
    Register {
        session: SessionId,
        binding: u64,
        outbox: mpsc::Sender<Envelope>,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    Unregister {
        session: SessionId,
        binding: u64,
    },
    Telemetry(oneshot::Sender<RouterTelemetry>),
    Quit,
}

/// Handle to the session table actor.
#[derive(Clone, Debug)]
pub struct SessionRouter {
    cmd_tx: mpsc::Sender<RouterCommand>,
}

impl SessionRouter {
    /// Start the router, consuming reply envelopes from `replies`.
    pub fn spawn(replies: mpsc::Receiver<Envelope>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(ROUTER_CHANNEL_SIZE);
        let actor = SessionRouterActor {
            routes: HashMap::new(),
            retired: LruCache::new(
                NonZeroUsize::new(RETIRED_SESSION_MEMORY).unwrap_or(NonZeroUsize::MIN),
            ),
            delivered: 0,
            undeliverable: 0,
            reused: 0,
        };
        tokio::spawn(actor.run(cmd_rx, replies));
        Self { cmd_tx }
    }

    /// Bind `session` to connection `binding`; replies go to `outbox`.
    ///
    /// # Errors
    /// [`BrokerError::SessionInUse`] if another live connection holds it.
    pub async fn register(
        &self,
        session: SessionId,
        binding: u64,
        outbox: mpsc::Sender<Envelope>,
    ) -> Result<(), BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(RouterCommand::Register {
                session,
                binding,
                outbox,
                reply: tx,
            })
            .await
            .map_err(|_| BrokerError::Shutdown)?;
        rx.await.map_err(|_| BrokerError::Shutdown)?
    }

    pub async fn unregister(&self, session: SessionId, binding: u64) {
        let _ = self
            .cmd_tx
            .send(RouterCommand::Unregister { session, binding })
            .await;
    }

    pub async fn telemetry(&self) -> Result<RouterTelemetry, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(RouterCommand::Telemetry(tx))
            .await
            .map_err(|_| BrokerError::Shutdown)?;
        rx.await.map_err(|_| BrokerError::Shutdown)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RouterCommand::Quit).await;
    }
}

struct Route {
    binding: u64,
    outbox: mpsc::Sender<Envelope>,
}

struct SessionRouterActor {
    routes: HashMap<SessionId, Route>,
    retired: LruCache<SessionId, Instant>,
    delivered: u64,
    undeliverable: u64,
    reused: u64,
}

impl SessionRouterActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<RouterCommand>,
        mut replies: mpsc::Receiver<Envelope>,
    ) {
        loop {
            tokio::select! {
                // Table changes go first so a reply never overtakes the
                // unregister that preceded it.
                biased;

                cmd = cmd_rx.recv() => match cmd {
                    Some(RouterCommand::Register { session, binding, outbox, reply }) => {
                        let _ = reply.send(self.register(session, binding, outbox));
                    }
                    Some(RouterCommand::Unregister { session, binding }) => {
                        self.unregister(session, binding);
                    }
                    Some(RouterCommand::Telemetry(reply)) => {
                        let _ = reply.send(self.telemetry());
                    }
                    Some(RouterCommand::Quit) | None => break,
                },
                Some(envelope) = replies.recv() => self.route(envelope),
            }
        }
        debug!(sessions = self.routes.len(), "session router stopped");
    }

    fn register(
        &mut self,
        session: SessionId,
        binding: u64,
        outbox: mpsc::Sender<Envelope>,
    ) -> Result<(), BrokerError> {
        if let Some(existing) = self.routes.get(&session) {
            if !existing.outbox.is_closed() {
                warn!(session = %session, binding, held_by = existing.binding, "session identity already bound");
                return Err(BrokerError::SessionInUse);
            }
            debug!(session = %session, stale = existing.binding, "replacing stale binding");
        }

        if let Some(retired_at) = self.retired.pop(&session) {
            self.reused += 1;
            warn!(
                session = %session,
                binding,
                retired_secs = retired_at.elapsed().as_secs(),
                "session identity reused after disconnect"
            );
        }

        self.routes.insert(session, Route { binding, outbox });
        Ok(())
    }

    fn unregister(&mut self, session: SessionId, binding: u64) {
        // A stale unregister must not remove a newer binding.
        if self.routes.get(&session).is_some_and(|r| r.binding == binding) {
            self.routes.remove(&session);
            self.retired.put(session, Instant::now());
        }
    }

    fn route(&mut self, envelope: Envelope) {
        let Some(route) = self
            .routes
            .get(&envelope.session)
            .filter(|r| r.binding == envelope.binding)
        else {
            self.undeliverable += 1;
            debug!(
                session = %envelope.session,
                seq = envelope.seq,
                "discarding reply for departed session"
            );
            return;
        };

        match route.outbox.try_send(envelope) {
            Ok(()) => self.delivered += 1,
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                // In-flight accounting keeps this rare; don't stall the router.
                self.delivered += 1;
                let outbox = route.outbox.clone();
                tokio::spawn(async move {
                    let _ = outbox.send(envelope).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(envelope)) => {
                self.undeliverable += 1;
                debug!(session = %envelope.session, seq = envelope.seq, "session writer gone, reply discarded");
            }
        }
    }

    fn telemetry(&self) -> RouterTelemetry {
        RouterTelemetry {
            sessions: self.routes.len(),
            delivered: self.delivered,
            undeliverable: self.undeliverable,
            reused: self.reused,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BrokerTelemetry {
    pub accepted_connections: u64,
    pub rejected_connections: u64,
    pub router: RouterTelemetry,
    pub dispatcher: DispatcherTelemetry,
}

#[derive(Default)]
struct FrontendStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
}

/// State shared by the accept loop and every connection task.
struct Frontend {
    authenticator: Arc<Authenticator>,
    dispatcher: Dispatcher,
    router: SessionRouter,
    next_binding: AtomicU64,
    stats: FrontendStats,
}

pub struct Broker {
    endpoint: Endpoint,
    public_key: PublicKey,
    frontend: Arc<Frontend>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Broker {
    /// Bind the frontend with a pool of [`LocateWorker`]s.
    pub async fn bind(config: BrokerConfig, pair: KeyPair) -> Result<Self, BrokerError> {
        let workers = LocateWorker::pool(config.workers, config.processing_delay);
        Self::bind_with_workers(config, pair, workers).await
    }

    /// Bind the frontend with caller-supplied workers, one slot each.
    ///
    /// # Errors
    /// [`BrokerError::Configuration`] for a missing key directory, an empty
    /// worker pool or a TLS setup failure; [`BrokerError::Io`] if the address
    /// cannot be bound.
    pub async fn bind_with_workers<W: Worker>(
        config: BrokerConfig,
        pair: KeyPair,
        workers: Vec<W>,
    ) -> Result<Self, BrokerError> {
        let authorization = &config.authorization;
        let authenticator = Arc::new(Authenticator::new(
            authorization.origins.clone(),
            authorization.keys.clone(),
        )?);

        let worker_count = workers.len();
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_CHANNEL_SIZE);
        let dispatcher = Dispatcher::spawn(workers, config.max_pending, reply_tx)?;
        let router = SessionRouter::spawn(reply_rx);

        let endpoint = match negotiator::server_endpoint(
            config.bind_addr,
            &pair,
            authenticator.clone(),
            ALPN_BROKER,
        ) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                dispatcher.quit().await;
                router.quit().await;
                return Err(e);
            }
        };
        let local_addr = endpoint.local_addr()?;

        let frontend = Arc::new(Frontend {
            authenticator: authenticator.clone(),
            dispatcher,
            router,
            next_binding: AtomicU64::new(1),
            stats: FrontendStats::default(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![tokio::spawn(accept_loop(
            endpoint.clone(),
            frontend.clone(),
            shutdown_rx.clone(),
        ))];
        if let Some(period) = authorization.reload_interval {
            tasks.push(tokio::spawn(reload_periodically(authenticator, period, shutdown_rx)));
        }

        info!(
            addr = %local_addr,
            key = %pair.public_key(),
            workers = worker_count,
            "broker listening"
        );

        Ok(Self {
            endpoint,
            public_key: pair.public_key(),
            frontend,
            shutdown_tx,
            tasks,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BrokerError> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.frontend.authenticator
    }

    /// Re-read the allowed-key directory. Returns the number of allowed keys.
    pub fn reload_authorization(&self) -> Result<usize, BrokerError> {
        let count = self.frontend.authenticator.reload()?;
        info!(allowed = count, "authorization reloaded");
        Ok(count)
    }

    pub async fn telemetry(&self) -> Result<BrokerTelemetry, BrokerError> {
        Ok(BrokerTelemetry {
            accepted_connections: self.frontend.stats.accepted.load(Ordering::Relaxed),
            rejected_connections: self.frontend.stats.rejected.load(Ordering::Relaxed),
            router: self.frontend.router.telemetry().await?,
            dispatcher: self.frontend.dispatcher.telemetry().await?,
        })
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.endpoint.close(0u32.into(), b"shutdown");
        self.frontend.dispatcher.quit().await;
        self.frontend.router.quit().await;
        for task in &self.tasks {
            task.abort();
        }
        info!("broker stopped");
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn accept_loop(endpoint: Endpoint, frontend: Arc<Frontend>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let incoming = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };
        tokio::spawn(serve_connection(frontend.clone(), incoming, shutdown.clone()));
    }
    debug!("accept loop stopped");
}

async fn serve_connection(frontend: Arc<Frontend>, incoming: Incoming, mut shutdown: watch::Receiver<bool>) {
    let binding = frontend.next_binding.fetch_add(1, Ordering::Relaxed);
    let mut tracker = ConnectionTracker::new(binding, incoming.remote_address());

    let peer = match negotiator::accept(incoming, &frontend.authenticator).await {
        Ok(peer) => peer,
        Err(e) => {
            frontend.stats.rejected.fetch_add(1, Ordering::Relaxed);
            tracker.advance(ConnectionState::Closed);
            debug!(binding, error = %e, "connection attempt ended");
            return;
        }
    };
    frontend.stats.accepted.fetch_add(1, Ordering::Relaxed);
    tracker.advance(ConnectionState::Authenticated);

    if let Err(e) = run_session(&frontend, &peer, &mut tracker, &mut shutdown).await {
        debug!(binding, peer = %peer.remote, error = %e, "session ended with error");
    }

    tracker.advance(ConnectionState::Closed);
    peer.connection.close(0u32.into(), b"");
}

async fn run_session(
    frontend: &Frontend,
    peer: &AuthenticatedPeer,
    tracker: &mut ConnectionTracker,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), BrokerError> {
    let binding = tracker.binding;

    let (mut send, mut recv) = timeout(HELLO_TIMEOUT, peer.connection.accept_bi())
        .await
        .map_err(|_| BrokerError::Protocol("no session stream opened".into()))?
        .map_err(|e| BrokerError::Transport(e.to_string()))?;

    let hello = timeout(HELLO_TIMEOUT, read_frame::<_, ClientFrame>(&mut recv))
        .await
        .map_err(|_| BrokerError::Protocol("no hello received".into()))??;

    let session = match hello {
        Some(ClientFrame::Hello { version, session }) => {
            if version != PROTOCOL_VERSION {
                reject(&mut send, RejectReason::UnsupportedVersion).await;
                return Err(BrokerError::Protocol(format!("unsupported version {version}")));
            }
            if !session.is_valid() {
                reject(&mut send, RejectReason::InvalidSession).await;
                return Err(BrokerError::Protocol("invalid session identity".into()));
            }
            session
        }
        Some(_) => return Err(BrokerError::Protocol("expected hello".into())),
        None => return Ok(()),
    };

    let (outbox_tx, outbox_rx) = mpsc::channel(MAX_IN_FLIGHT_PER_SESSION);
    if let Err(e) = frontend
        .router
        .register(session.clone(), binding, outbox_tx)
        .await
    {
        if matches!(e, BrokerError::SessionInUse) {
            reject(&mut send, RejectReason::SessionInUse).await;
        }
        return Err(e);
    }

    if let Err(e) = write_frame(
        &mut send,
        &ServerFrame::Welcome {
            session: session.clone(),
        },
    )
    .await
    {
        frontend.router.unregister(session, binding).await;
        return Err(e);
    }

    tracker.advance(ConnectionState::Active);
    info!(
        session = %session,
        peer = %peer.remote,
        key = %peer.public_key.short(),
        binding,
        "session active"
    );

    let in_flight = Arc::new(Semaphore::new(MAX_IN_FLIGHT_PER_SESSION));
    let writer = tokio::spawn(write_replies(send, outbox_rx, in_flight.clone()));

    let result = read_requests(frontend, &session, binding, &mut recv, &in_flight, shutdown).await;

    // Dropping the route closes the outbox, which lets the writer finish.
    frontend.router.unregister(session.clone(), binding).await;
    let _ = timeout(WRITER_DRAIN_TIMEOUT, writer).await;
    info!(session = %session, binding, "session closed");
    result
}

async fn read_requests(
    frontend: &Frontend,
    session: &SessionId,
    binding: u64,
    recv: &mut RecvStream,
    in_flight: &Semaphore,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), BrokerError> {
    loop {
        let frame = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
            frame = read_frame::<_, ClientFrame>(recv) => frame?,
        };

        match frame {
            Some(ClientFrame::Request { seq, payload }) => {
                in_flight
                    .acquire()
                    .await
                    .map_err(|_| BrokerError::ConnectionClosed)?
                    .forget();
                trace!(session = %session, seq, len = payload.len(), "request received");
                frontend
                    .dispatcher
                    .submit(Envelope {
                        session: session.clone(),
                        binding,
                        seq,
                        payload,
                    })
                    .await?;
            }
            Some(ClientFrame::Goodbye) | None => return Ok(()),
            Some(ClientFrame::Hello { .. }) => {
                return Err(BrokerError::Protocol("duplicate hello".into()));
            }
        }
    }
}

async fn write_replies(
    mut send: SendStream,
    mut outbox: mpsc::Receiver<Envelope>,
    in_flight: Arc<Semaphore>,
) {
    while let Some(envelope) = outbox.recv().await {
        let frame = ServerFrame::Reply {
            session: envelope.session,
            seq: envelope.seq,
            payload: envelope.payload,
        };
        let result = write_frame(&mut send, &frame).await;
        in_flight.add_permits(1);
        if let Err(e) = result {
            debug!(error = %e, "reply write failed");
            break;
        }
    }
    // Wakes a reader waiting for a permit after a write failure.
    in_flight.close();
    let _ = send.finish();
}

async fn reject(send: &mut SendStream, reason: RejectReason) {
    debug!(?reason, "rejecting session");
    if write_frame(send, &ServerFrame::Rejected { reason }).await.is_ok() {
        let _ = send.finish();
        let _ = timeout(REJECT_LINGER, send.stopped()).await;
    }
}
