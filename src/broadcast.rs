//! # Secure Broadcast Channel
//!
//! One publisher, any number of authorized subscribers, no acknowledgments.
//!
//! ## Publisher
//!
//! [`BroadcastPublisher`] binds an endpoint gated by the same
//! [`Authenticator`] rules as the broker. Each subscriber connection is
//! registered with a publisher actor that signs and fans out messages:
//!
//! ```text
//! publish() ──▶ PublisherActor ──sign──▶ per-subscriber queue ──▶ stream
//! ```
//!
//! Queues are bounded. A subscriber that cannot keep up loses messages; the
//! publisher never waits for it.
//!
//! ## Delivery
//!
//! - Only messages published after a subscriber is registered reach it.
//! - A message reaches a subscriber iff `topic.starts_with(prefix)`.
//! - Every message carries a domain-separated Ed25519 signature by the
//!   publisher; [`BroadcastSubscriber::recv`] verifies it before yielding.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{Connection, Endpoint, Incoming, RecvStream, SendStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::auth::{Authenticator, reload_periodically};
use crate::config::{BroadcastConfig, SubscriberConfig};
use crate::crypto::{ALPN_BROADCAST, BROADCAST_SIGNATURE_DOMAIN, sign_with_domain, verify_with_domain};
use crate::error::BrokerError;
use crate::identity::{KeyMaterial, PublicKey};
use crate::keystore::KeyPair;
use crate::messages::{
    BroadcastMessage, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION, PublisherFrame, RejectReason,
    SubscriberFrame, is_valid_topic, read_frame, write_frame,
};
use crate::negotiator;

/// Messages queued per subscriber before new ones are dropped for it.
pub const MAX_OUTBOUND_PER_SUBSCRIBER: usize = 256;

/// Upper bound on concurrently registered subscribers.
pub const MAX_SUBSCRIBERS: usize = 1024;

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_CHANNEL_SIZE: usize = 256;
const INBOUND_CHANNEL_SIZE: usize = 64;

/// Outcome of one [`BroadcastPublisher::publish`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishReceipt {
    pub seqno: u64,
    /// Subscribers the message was queued for.
    pub queued: usize,
    /// Matching subscribers whose queue was full.
    pub dropped: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublisherTelemetry {
    pub subscribers: usize,
    pub published: u64,
    pub dropped: u64,
}

enum Command {
    Register {
        prefix: String,
        outbox: mpsc::Sender<BroadcastMessage>,
        reply: oneshot::Sender<Result<u64, BrokerError>>,
    },
    Unregister(u64),
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<PublishReceipt>,
    },
    Telemetry(oneshot::Sender<PublisherTelemetry>),
    Quit,
}

struct Subscription {
    prefix: String,
    outbox: mpsc::Sender<BroadcastMessage>,
}

struct PublisherActor {
    material: KeyMaterial,
    subscribers: HashMap<u64, Subscription>,
    next_id: u64,
    next_seqno: u64,
    dropped: u64,
}

impl PublisherActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Register {
                    prefix,
                    outbox,
                    reply,
                } => {
                    let _ = reply.send(self.register(prefix, outbox));
                }
                Command::Unregister(id) => {
                    if self.subscribers.remove(&id).is_some() {
                        debug!(subscriber = id, "subscriber removed");
                    }
                }
                Command::Publish { topic, data, reply } => {
                    let _ = reply.send(self.publish(topic, data));
                }
                Command::Telemetry(reply) => {
                    let _ = reply.send(PublisherTelemetry {
                        subscribers: self.subscribers.len(),
                        published: self.next_seqno,
                        dropped: self.dropped,
                    });
                }
                Command::Quit => break,
            }
        }
        debug!("publisher actor stopped");
    }

    fn register(
        &mut self,
        prefix: String,
        outbox: mpsc::Sender<BroadcastMessage>,
    ) -> Result<u64, BrokerError> {
        self.subscribers.retain(|_, s| !s.outbox.is_closed());
        if self.subscribers.len() >= MAX_SUBSCRIBERS {
            return Err(BrokerError::Protocol("subscriber limit reached".into()));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(id, Subscription { prefix, outbox });
        Ok(id)
    }

    fn publish(&mut self, topic: String, data: Vec<u8>) -> PublishReceipt {
        let seqno = self.next_seqno;
        self.next_seqno += 1;

        let signature = sign_with_domain(
            &self.material,
            BROADCAST_SIGNATURE_DOMAIN,
            &BroadcastMessage::signed_bytes(&topic, seqno, &data),
        );
        let message = BroadcastMessage {
            topic,
            seqno,
            data,
            signature,
        };

        let mut receipt = PublishReceipt {
            seqno,
            queued: 0,
            dropped: 0,
        };
        for (id, sub) in &self.subscribers {
            if !message.topic.starts_with(&sub.prefix) {
                continue;
            }
            match sub.outbox.try_send(message.clone()) {
                Ok(()) => receipt.queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    receipt.dropped += 1;
                    trace!(subscriber = id, seqno, "subscriber queue full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        self.dropped += receipt.dropped as u64;
        receipt
    }
}

/// State shared with the subscriber connection tasks.
struct PublisherContext {
    authenticator: Arc<Authenticator>,
    cmd_tx: mpsc::Sender<Command>,
}

pub struct BroadcastPublisher {
    endpoint: Endpoint,
    public_key: PublicKey,
    authenticator: Arc<Authenticator>,
    cmd_tx: mpsc::Sender<Command>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl BroadcastPublisher {
    /// Bind the broadcast endpoint.
    ///
    /// # Errors
    /// [`BrokerError::Configuration`] for a missing key directory or TLS
    /// setup failure; [`BrokerError::Io`] if the address cannot be bound.
    pub async fn bind(config: BroadcastConfig, pair: KeyPair) -> Result<Self, BrokerError> {
        let authenticator = Arc::new(Authenticator::new(
            config.authorization.origins.clone(),
            config.authorization.keys.clone(),
        )?);
        let endpoint = negotiator::server_endpoint(
            config.bind_addr,
            &pair,
            authenticator.clone(),
            ALPN_BROADCAST,
        )?;
        let local_addr = endpoint.local_addr()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let actor = PublisherActor {
            material: pair.material().clone(),
            subscribers: HashMap::new(),
            next_id: 0,
            next_seqno: 0,
            dropped: 0,
        };
        tokio::spawn(actor.run(cmd_rx));

        let context = Arc::new(PublisherContext {
            authenticator: authenticator.clone(),
            cmd_tx: cmd_tx.clone(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(endpoint.clone(), context, shutdown_rx.clone()));
        if let Some(period) = config.authorization.reload_interval {
            tokio::spawn(reload_periodically(authenticator.clone(), period, shutdown_rx));
        }

        info!(addr = %local_addr, key = %pair.public_key(), "broadcast publisher listening");
        Ok(Self {
            endpoint,
            public_key: pair.public_key(),
            authenticator,
            cmd_tx,
            shutdown_tx,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BrokerError> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Re-read the allowed-key directory. Returns the number of allowed keys.
    pub fn reload_authorization(&self) -> Result<usize, BrokerError> {
        self.authenticator.reload()
    }

    /// Sign and fan out one message to every matching subscriber.
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<PublishReceipt, BrokerError> {
        if !is_valid_topic(topic) {
            return Err(BrokerError::Protocol(format!("invalid topic {topic:?}")));
        }
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(BrokerError::MalformedFrame(format!(
                "message too large: {} bytes (max {MAX_PAYLOAD_SIZE})",
                data.len()
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish {
                topic: topic.to_string(),
                data,
                reply: tx,
            })
            .await
            .map_err(|_| BrokerError::Shutdown)?;
        rx.await.map_err(|_| BrokerError::Shutdown)
    }

    pub async fn telemetry(&self) -> Result<PublisherTelemetry, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Telemetry(tx))
            .await
            .map_err(|_| BrokerError::Shutdown)?;
        rx.await.map_err(|_| BrokerError::Shutdown)
    }

    pub async fn subscriber_count(&self) -> Result<usize, BrokerError> {
        Ok(self.telemetry().await?.subscribers)
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.accept_task.abort();
        self.endpoint.close(0u32.into(), b"shutdown");
        let _ = self.cmd_tx.send(Command::Quit).await;
        info!("broadcast publisher stopped");
    }
}

impl Drop for BroadcastPublisher {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.accept_task.abort();
    }
}

/// Publish `producer(n)` on `topic` every `period` until `limit` messages
/// have gone out or `shutdown` turns true. Returns the number published.
pub async fn publish_periodically<F>(
    publisher: &BroadcastPublisher,
    topic: &str,
    period: Duration,
    limit: Option<u64>,
    mut shutdown: watch::Receiver<bool>,
    mut producer: F,
) -> Result<u64, BrokerError>
where
    F: FnMut(u64) -> Vec<u8>,
{
    let mut ticker = tokio::time::interval(period);
    let mut published = 0u64;
    while limit.is_none_or(|limit| published < limit) {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            _ = ticker.tick() => {}
        }
        let receipt = publisher.publish(topic, producer(published)).await?;
        debug!(topic, seqno = receipt.seqno, queued = receipt.queued, "published");
        published += 1;
    }
    Ok(published)
}

async fn accept_loop(
    endpoint: Endpoint,
    context: Arc<PublisherContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let incoming = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };
        tokio::spawn(serve_subscriber(context.clone(), incoming, shutdown.clone()));
    }
    debug!("broadcast accept loop stopped");
}

async fn serve_subscriber(
    context: Arc<PublisherContext>,
    incoming: Incoming,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = match negotiator::accept(incoming, &context.authenticator).await {
        Ok(peer) => peer,
        Err(e) => {
            debug!(error = %e, "subscriber not admitted");
            return;
        }
    };

    if let Err(e) = run_subscription(&context, &peer.connection, &mut shutdown).await {
        debug!(peer = %peer.remote, error = %e, "subscription ended with error");
    }
    peer.connection.close(0u32.into(), b"");
}

async fn run_subscription(
    context: &PublisherContext,
    connection: &Connection,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), BrokerError> {
    let (mut send, mut recv) = timeout(SUBSCRIBE_TIMEOUT, connection.accept_bi())
        .await
        .map_err(|_| BrokerError::Protocol("no subscription stream opened".into()))?
        .map_err(|e| BrokerError::Transport(e.to_string()))?;

    let frame = timeout(SUBSCRIBE_TIMEOUT, read_frame::<_, SubscriberFrame>(&mut recv))
        .await
        .map_err(|_| BrokerError::Protocol("no subscribe received".into()))??;

    let prefix = match frame {
        Some(SubscriberFrame::Subscribe { version, prefix }) => {
            if version != PROTOCOL_VERSION {
                reject(&mut send, RejectReason::UnsupportedVersion).await;
                return Err(BrokerError::Protocol(format!("unsupported version {version}")));
            }
            if !is_valid_topic(&prefix) {
                reject(&mut send, RejectReason::InvalidPrefix).await;
                return Err(BrokerError::Protocol("invalid prefix".into()));
            }
            prefix
        }
        None => return Ok(()),
    };

    let (outbox_tx, mut outbox_rx) = mpsc::channel(MAX_OUTBOUND_PER_SUBSCRIBER);
    let (tx, rx) = oneshot::channel();
    context
        .cmd_tx
        .send(Command::Register {
            prefix: prefix.clone(),
            outbox: outbox_tx,
            reply: tx,
        })
        .await
        .map_err(|_| BrokerError::Shutdown)?;
    let id = rx.await.map_err(|_| BrokerError::Shutdown)??;

    let result = async {
        write_frame(&mut send, &PublisherFrame::Subscribed).await?;
        info!(subscriber = id, prefix = %prefix, "subscriber registered");

        loop {
            // The select only yields the message; holding a `watch::Ref`
            // across the write would make the task non-Send.
            let message = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = connection.closed() => break,
                message = outbox_rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            write_frame(&mut send, &PublisherFrame::Message(message)).await?;
        }
        Ok::<(), BrokerError>(())
    }
    .await;

    let _ = context.cmd_tx.send(Command::Unregister(id)).await;
    debug!(subscriber = id, "subscriber left");
    result
}

async fn reject(send: &mut SendStream, reason: RejectReason) {
    if write_frame(send, &PublisherFrame::Rejected { reason }).await.is_ok() {
        let _ = send.finish();
        let _ = timeout(Duration::from_secs(1), send.stopped()).await;
    }
}

pub struct BroadcastSubscriber {
    endpoint: Endpoint,
    connection: Connection,
    publisher: PublicKey,
    inbound: mpsc::Receiver<PublisherFrame>,
    reader: JoinHandle<()>,
    last_seqno: Option<u64>,
    // Keeps the subscription stream open.
    _send: SendStream,
}

impl BroadcastSubscriber {
    /// Connect to a publisher whose key must be `publisher` and subscribe to
    /// `config.prefix`. Returns once the publisher has registered us.
    pub async fn connect(
        config: SubscriberConfig,
        pair: &KeyPair,
        publisher: PublicKey,
    ) -> Result<Self, BrokerError> {
        if !is_valid_topic(&config.prefix) {
            return Err(BrokerError::Protocol(format!(
                "invalid prefix {:?}",
                config.prefix
            )));
        }
        let endpoint = negotiator::client_endpoint(config.publisher_addr)?;

        let subscribe = subscribe(&endpoint, &config, pair, &publisher);
        let (connection, send, recv) = match timeout(config.handshake_timeout, subscribe).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => {
                endpoint.close(0u32.into(), b"");
                return Err(e);
            }
            Err(_) => {
                endpoint.close(0u32.into(), b"");
                return Err(BrokerError::Transport("subscription setup timed out".into()));
            }
        };

        let (inbound_tx, inbound) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let reader = tokio::spawn(read_messages(recv, inbound_tx));

        info!(publisher = %config.publisher_addr, prefix = %config.prefix, "subscribed");
        Ok(Self {
            endpoint,
            connection,
            publisher,
            inbound,
            reader,
            last_seqno: None,
            _send: send,
        })
    }

    /// Next verified message.
    ///
    /// # Errors
    /// [`BrokerError::ConnectionClosed`] once the publisher is gone;
    /// [`BrokerError::Protocol`] for a message with a bad signature or a
    /// sequence number that went backwards.
    pub async fn recv(&mut self) -> Result<BroadcastMessage, BrokerError> {
        let message = match self.inbound.recv().await {
            Some(PublisherFrame::Message(message)) => message,
            Some(other) => {
                return Err(BrokerError::Protocol(format!(
                    "unexpected frame in subscription: {other:?}"
                )));
            }
            None => return Err(BrokerError::ConnectionClosed),
        };

        verify_with_domain(
            &self.publisher,
            BROADCAST_SIGNATURE_DOMAIN,
            &BroadcastMessage::signed_bytes(&message.topic, message.seqno, &message.data),
            &message.signature,
        )
        .map_err(|e| {
            warn!(seqno = message.seqno, error = %e, "dropping broadcast with bad signature");
            BrokerError::Protocol(format!("broadcast signature: {e}"))
        })?;

        if self.last_seqno.is_some_and(|last| message.seqno <= last) {
            return Err(BrokerError::Protocol(format!(
                "sequence number went backwards: {}",
                message.seqno
            )));
        }
        self.last_seqno = Some(message.seqno);
        Ok(message)
    }

    /// [`recv`](Self::recv) with a deadline. `Ok(None)` on timeout.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Result<Option<BroadcastMessage>, BrokerError> {
        match timeout(wait, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub async fn close(self) {
        self.connection.close(0u32.into(), b"bye");
        self.endpoint.close(0u32.into(), b"");
    }
}

impl Drop for BroadcastSubscriber {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn subscribe(
    endpoint: &Endpoint,
    config: &SubscriberConfig,
    pair: &KeyPair,
    publisher: &PublicKey,
) -> Result<(Connection, SendStream, RecvStream), BrokerError> {
    let connection = negotiator::connect(
        endpoint,
        pair,
        publisher,
        config.publisher_addr,
        ALPN_BROADCAST,
    )
    .await?;

    // As with the broker, losing the connection before the answer means the
    // publisher did not admit us.
    let not_admitted = |e: BrokerError| {
        debug!(error = %e, "connection lost before subscription");
        BrokerError::AuthenticationFailure
    };

    let (mut send, mut recv) = connection
        .open_bi()
        .await
        .map_err(|e| not_admitted(BrokerError::Transport(e.to_string())))?;

    write_frame(
        &mut send,
        &SubscriberFrame::Subscribe {
            version: PROTOCOL_VERSION,
            prefix: config.prefix.clone(),
        },
    )
    .await
    .map_err(not_admitted)?;

    match read_frame::<_, PublisherFrame>(&mut recv).await {
        Ok(Some(PublisherFrame::Subscribed)) => Ok((connection, send, recv)),
        Ok(Some(PublisherFrame::Rejected { reason })) => Err(BrokerError::Protocol(format!(
            "subscription rejected: {reason:?}"
        ))),
        Ok(Some(other)) => Err(BrokerError::Protocol(format!(
            "unexpected frame before subscription: {other:?}"
        ))),
        Ok(None) => Err(BrokerError::AuthenticationFailure),
        Err(e) => Err(not_admitted(e)),
    }
}

async fn read_messages(mut recv: RecvStream, inbound: mpsc::Sender<PublisherFrame>) {
    loop {
        match read_frame::<_, PublisherFrame>(&mut recv).await {
            Ok(Some(frame)) => {
                if inbound.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "broadcast stream ended");
                break;
            }
        }
    }
}
