//! # Bruno - Session-Routed Secure Request Broker
//!
//! Bruno load-balances requests from many independent client sessions over a
//! fixed pool of workers and routes every reply back to the session that
//! asked for it. Every connection is mutually authenticated with Ed25519 key
//! pairs before any application data flows, and a companion broadcast
//! channel fans signed updates out to authorized subscribers.
//!
//! ## Architecture
//!
//! ```text
//! SessionClient ──QUIC/mTLS──▶ Broker ──▶ Dispatcher ──▶ worker slots
//!      ▲                         │                           │
//!      └──────── Reply ──── SessionRouter ◀──── replies ─────┘
//!
//! BroadcastPublisher ──signed messages──▶ BroadcastSubscriber (prefix filter)
//! ```
//!
//! Stateful components follow the actor pattern: a cheap-to-clone handle
//! sends commands over a channel to a private actor that owns the state.
//!
//! ## Security Model
//!
//! - Participant = public key; certificates are self-signed and carry it
//! - Servers admit a peer only if both its origin and its key are allowed
//! - Clients pin the server key they expect
//! - Authorization snapshots are immutable; a rejected peer changes nothing
//! - All frames are length-prefixed and size-bounded
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Key material, public keys, session identities |
//! | `keystore` | Per-participant key pair persistence |
//! | `auth` | Origin filter and allowed-key snapshot |
//! | `crypto` | Certificates, TLS verifiers, QUIC configs, signatures |
//! | `negotiator` | Authenticated accept/connect |
//! | `messages` | Wire frames, framing, request/reply schema |
//! | `protocols` | The `Worker` capability trait |
//! | `worker` | Worker slots and the reference `LocateWorker` |
//! | `dispatcher` | Worker pool load balancer |
//! | `broker` | Client-facing frontend and session router |
//! | `client` | Session client with bounded polling |
//! | `broadcast` | Signed one-to-many publish/subscribe |
//! | `config` | Role configuration and defaults |
//! | `error` | Error taxonomy |

mod auth;
mod broadcast;
mod broker;
mod client;
mod config;
mod crypto;
mod dispatcher;
mod error;
mod identity;
mod keystore;
mod messages;
mod negotiator;
mod protocols;
mod worker;

pub use auth::{Authenticator, KeyPolicy, OriginFilter};
pub use broadcast::{
    BroadcastPublisher, BroadcastSubscriber, MAX_OUTBOUND_PER_SUBSCRIBER, PublishReceipt,
    PublisherTelemetry, publish_periodically,
};
pub use broker::{
    Broker, BrokerTelemetry, ConnectionState, MAX_IN_FLIGHT_PER_SESSION, RouterTelemetry,
};
pub use client::{LocateStats, Reply, SessionClient, run_locate_session, run_locate_sessions};
pub use config::{
    AuthorizationConfig, BroadcastConfig, BrokerConfig, ClientConfig, DEFAULT_BROADCAST_PORT,
    DEFAULT_FRONTEND_PORT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_POLLS, DEFAULT_POLL_TIMEOUT,
    DEFAULT_PUBLISH_INTERVAL, DEFAULT_STORE_DIR, DEFAULT_WORKERS, PUBLISHER_IDENTITY,
    SERVER_IDENTITY, SubscriberConfig,
};
pub use dispatcher::{DEFAULT_MAX_PENDING, Dispatcher, DispatcherTelemetry};
pub use error::{BrokerError, Result};
pub use identity::{KeyMaterial, PublicKey, SessionId};
pub use keystore::{KeyPair, KeyStore};
pub use messages::{BroadcastMessage, Envelope, LocateRequest, PROTOCOL_VERSION, WorkerReply};
pub use protocols::{Worker, WorkerError};
pub use worker::{FnWorker, LocateWorker};
