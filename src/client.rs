//! # Session Client
//!
//! The client role of the broker protocol. A [`SessionClient`] owns one
//! connection and one session identity, and keeps at most one request
//! outstanding at a time.
//!
//! Replies are read by a background task and handed over through a channel,
//! so [`SessionClient::poll`] can time out without losing a half-read frame.
//! A poll timeout is a liveness signal: the caller decides whether to poll
//! again. [`SessionClient::request`] polls up to `max_polls` times and then
//! gives up on that one request; a reply that arrives later carries a stale
//! sequence number and is discarded.

use std::time::Duration;

use quinn::{Connection, Endpoint, RecvStream, SendStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::crypto::ALPN_BROKER;
use crate::error::BrokerError;
use crate::identity::{PublicKey, SessionId};
use crate::keystore::KeyPair;
use crate::messages::{
    ClientFrame, LocateRequest, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION, RejectReason, ServerFrame,
    WorkerReply, read_frame, write_frame,
};
use crate::negotiator;

const INBOUND_CHANNEL_SIZE: usize = 16;

/// A reply matched to the outstanding request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub seq: u64,
    pub payload: Vec<u8>,
}

pub struct SessionClient {
    config: ClientConfig,
    endpoint: Endpoint,
    connection: Connection,
    session: SessionId,
    send: SendStream,
    inbound: mpsc::Receiver<ServerFrame>,
    reader: JoinHandle<()>,
    next_seq: u64,
    outstanding: Option<u64>,
}

impl SessionClient {
    /// Connect, authenticate and bind `session` at the broker.
    ///
    /// # Errors
    /// - [`BrokerError::AuthenticationFailure`] if either side rejects the
    ///   other's key, or the connection is closed before `Welcome`
    /// - [`BrokerError::SessionInUse`] if the identity is bound elsewhere
    /// - [`BrokerError::Transport`] if setup exceeds `handshake_timeout`
    pub async fn connect(
        config: ClientConfig,
        pair: &KeyPair,
        server_key: PublicKey,
        session: SessionId,
    ) -> Result<Self, BrokerError> {
        let endpoint = negotiator::client_endpoint(config.server_addr)?;

        let establish = establish(&endpoint, &config, pair, &server_key, &session);
        let (connection, send, recv) = match timeout(config.handshake_timeout, establish).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => {
                endpoint.close(0u32.into(), b"");
                return Err(e);
            }
            Err(_) => {
                endpoint.close(0u32.into(), b"");
                return Err(BrokerError::Transport("session setup timed out".into()));
            }
        };

        let (inbound_tx, inbound) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let reader = tokio::spawn(read_replies(recv, inbound_tx));

        info!(session = %session, server = %config.server_addr, "session established");
        Ok(Self {
            config,
            endpoint,
            connection,
            session,
            send,
            inbound,
            reader,
            next_seq: 0,
            outstanding: None,
        })
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn outstanding(&self) -> Option<u64> {
        self.outstanding
    }

    /// Send a request. Only one request may be outstanding.
    pub async fn send(&mut self, payload: Vec<u8>) -> Result<u64, BrokerError> {
        if let Some(seq) = self.outstanding {
            return Err(BrokerError::Protocol(format!(
                "request {seq} is still outstanding"
            )));
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(BrokerError::MalformedFrame(format!(
                "payload too large: {} bytes (max {MAX_PAYLOAD_SIZE})",
                payload.len()
            )));
        }

        let seq = self.next_seq;
        write_frame(&mut self.send, &ClientFrame::Request { seq, payload }).await?;
        self.next_seq += 1;
        self.outstanding = Some(seq);
        trace!(session = %self.session, seq, "request sent");
        Ok(seq)
    }

    /// Wait up to `wait` for the reply to the outstanding request.
    ///
    /// Returns `Ok(None)` on timeout. Replies for earlier, abandoned requests
    /// are skipped.
    pub async fn poll(&mut self, wait: Duration) -> Result<Option<Reply>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            let frame = match timeout_at(deadline, self.inbound.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(BrokerError::ConnectionClosed),
                Ok(Some(frame)) => frame,
            };

            match frame {
                ServerFrame::Reply {
                    session,
                    seq,
                    payload,
                } => {
                    if session != self.session {
                        warn!(expected = %self.session, got = %session, "reply addressed to another session");
                        return Err(BrokerError::Protocol(
                            "reply addressed to another session".into(),
                        ));
                    }
                    if self.outstanding == Some(seq) {
                        self.outstanding = None;
                        return Ok(Some(Reply { seq, payload }));
                    }
                    debug!(session = %self.session, seq, "discarding stale reply");
                }
                other => {
                    return Err(BrokerError::Protocol(format!(
                        "unexpected frame in session: {other:?}"
                    )));
                }
            }
        }
    }

    /// Send `payload` and poll for its reply up to `max_polls` times.
    ///
    /// # Errors
    /// [`BrokerError::ReplyTimeout`] if no reply arrived; the request is
    /// abandoned and the client can send the next one.
    pub async fn request(&mut self, payload: Vec<u8>) -> Result<Reply, BrokerError> {
        let seq = self.send(payload).await?;
        for attempt in 1..=self.config.max_polls {
            if let Some(reply) = self.poll(self.config.poll_timeout).await? {
                return Ok(reply);
            }
            debug!(session = %self.session, seq, attempt, "no reply yet");
        }
        self.outstanding = None;
        Err(BrokerError::ReplyTimeout(
            self.config.poll_timeout * self.config.max_polls,
        ))
    }

    /// End the session politely and close the connection.
    pub async fn close(mut self) {
        let _ = write_frame(&mut self.send, &ClientFrame::Goodbye).await;
        let _ = self.send.finish();
        self.reader.abort();
        self.connection.close(0u32.into(), b"bye");
        self.endpoint.close(0u32.into(), b"");
        debug!(session = %self.session, "session closed");
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn establish(
    endpoint: &Endpoint,
    config: &ClientConfig,
    pair: &KeyPair,
    server_key: &PublicKey,
    session: &SessionId,
) -> Result<(Connection, SendStream, RecvStream), BrokerError> {
    let connection = negotiator::connect(
        endpoint,
        pair,
        server_key,
        config.server_addr,
        ALPN_BROKER,
    )
    .await?;

    // A TLS 1.3 client can finish its handshake before the server has
    // checked the client certificate. Until Welcome arrives, a closed
    // connection means the server did not admit us.
    let not_admitted = |e: BrokerError| {
        debug!(error = %e, "connection lost before welcome");
        BrokerError::AuthenticationFailure
    };

    let (mut send, mut recv) = connection
        .open_bi()
        .await
        .map_err(|e| not_admitted(BrokerError::Transport(e.to_string())))?;

    write_frame(
        &mut send,
        &ClientFrame::Hello {
            version: PROTOCOL_VERSION,
            session: session.clone(),
        },
    )
    .await
    .map_err(not_admitted)?;

    match read_frame::<_, ServerFrame>(&mut recv).await {
        Ok(Some(ServerFrame::Welcome { session: echoed })) if echoed == *session => {
            Ok((connection, send, recv))
        }
        Ok(Some(ServerFrame::Rejected {
            reason: RejectReason::SessionInUse,
        })) => Err(BrokerError::SessionInUse),
        Ok(Some(ServerFrame::Rejected { reason })) => Err(BrokerError::Protocol(format!(
            "session rejected: {reason:?}"
        ))),
        Ok(Some(other)) => Err(BrokerError::Protocol(format!(
            "unexpected frame before welcome: {other:?}"
        ))),
        Ok(None) => Err(BrokerError::AuthenticationFailure),
        Err(e) => Err(not_admitted(e)),
    }
}

async fn read_replies(mut recv: RecvStream, inbound: mpsc::Sender<ServerFrame>) {
    loop {
        match read_frame::<_, ServerFrame>(&mut recv).await {
            Ok(Some(frame)) => {
                if inbound.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "reply stream ended");
                break;
            }
        }
    }
}

/// Counters from one run of [`run_locate_session`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocateStats {
    pub sent: u64,
    pub served: u64,
    pub errors: u64,
    pub timeouts: u64,
}

/// Demo client loop: send `{"req#": n, "id": <session>}` requests one after
/// another and log each reply.
///
/// Stops after `limit` requests (unbounded when `None`), when `shutdown`
/// turns true, or on a connection-level error. Reply timeouts are logged and
/// counted, never fatal.
pub async fn run_locate_session(
    client: &mut SessionClient,
    limit: Option<u64>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<LocateStats, BrokerError> {
    let mut stats = LocateStats::default();
    let id = client.session().to_string();

    while limit.is_none_or(|limit| stats.sent < limit) {
        if *shutdown.borrow() {
            break;
        }

        let request = LocateRequest {
            req: stats.sent,
            id: id.clone(),
        };
        stats.sent += 1;

        let outcome = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            outcome = client.request(request.to_bytes()) => outcome,
        };

        match outcome {
            Ok(reply) => match WorkerReply::parse(&reply.payload) {
                Ok(WorkerReply::Served { worker, req, .. }) => {
                    stats.served += 1;
                    info!(session = %id, worker, req, "reply received");
                }
                Ok(WorkerReply::Error { worker, error }) => {
                    stats.errors += 1;
                    warn!(session = %id, ?worker, %error, "request failed");
                }
                Err(e) => {
                    stats.errors += 1;
                    warn!(session = %id, error = %e, "unreadable reply");
                }
            },
            Err(BrokerError::ReplyTimeout(waited)) => {
                stats.timeouts += 1;
                warn!(session = %id, req = request.req, ?waited, "no reply, moving on");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(stats)
}

/// Run `sessions` concurrent locate sessions, each on its own connection
/// with a fresh random session identity, all presenting `pair`.
///
/// Returns the per-session stats in completion order. The first connection
/// or session error aborts the remaining sessions.
pub async fn run_locate_sessions(
    config: ClientConfig,
    pair: &KeyPair,
    server_key: PublicKey,
    sessions: usize,
    limit: Option<u64>,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<LocateStats>, BrokerError> {
    let mut tasks = JoinSet::new();
    for _ in 0..sessions {
        let config = config.clone();
        let pair = pair.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let mut client =
                SessionClient::connect(config, &pair, server_key, SessionId::random()).await?;
            let stats = run_locate_session(&mut client, limit, shutdown).await;
            client.close().await;
            stats
        });
    }

    let mut all = Vec::with_capacity(sessions);
    while let Some(joined) = tasks.join_next().await {
        let stats = joined.map_err(|e| BrokerError::Protocol(format!("session task failed: {e}")))??;
        all.push(stats);
    }
    Ok(all)
}
