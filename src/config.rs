//! Configuration for every bruno role.
//!
//! Each struct has a `Default` matching the stock deployment: broker on
//! `127.0.0.1:5792`, broadcast on `127.0.0.1:9000`, five workers, loopback
//! origins only, and keys under `secure-locate-certs/`.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{KeyPolicy, OriginFilter};
use crate::dispatcher::DEFAULT_MAX_PENDING;
use crate::keystore::PUBLIC_KEYS_DIR;

pub const DEFAULT_FRONTEND_PORT: u16 = 5792;
pub const DEFAULT_BROADCAST_PORT: u16 = 9000;
pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_STORE_DIR: &str = "secure-locate-certs";

/// How long a client waits on one poll before re-evaluating.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Polls per request before the client gives up on that request.
pub const DEFAULT_MAX_POLLS: u32 = 5;

/// Upper bound on connection setup (TLS handshake + Hello/Welcome).
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of the demo publisher.
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// Participant names used by the demo roles.
pub const SERVER_IDENTITY: &str = "bruno";
pub const PUBLISHER_IDENTITY: &str = "bruno-broadcast";

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizationConfig {
    pub origins: OriginFilter,
    pub keys: KeyPolicy,
    /// Re-read the key directory on this interval. `None` disables reloads.
    pub reload_interval: Option<Duration>,
}

impl AuthorizationConfig {
    /// Loopback origins, keys from `dir`.
    pub fn directory(dir: impl Into<PathBuf>) -> Self {
        Self {
            origins: OriginFilter::loopback(),
            keys: KeyPolicy::Directory(dir.into()),
            reload_interval: None,
        }
    }

    /// Origin check only.
    pub fn allow_any_key() -> Self {
        Self {
            origins: OriginFilter::loopback(),
            keys: KeyPolicy::AllowAny,
            reload_interval: None,
        }
    }
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self::directory(PathBuf::from(DEFAULT_STORE_DIR).join(PUBLIC_KEYS_DIR))
    }
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub bind_addr: SocketAddr,
    pub workers: usize,
    pub max_pending: usize,
    /// Upper bound of the reference worker's simulated processing time.
    pub processing_delay: Duration,
    pub authorization: AuthorizationConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: loopback(DEFAULT_FRONTEND_PORT),
            workers: DEFAULT_WORKERS,
            max_pending: DEFAULT_MAX_PENDING,
            processing_delay: Duration::ZERO,
            authorization: AuthorizationConfig::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    pub poll_timeout: Duration,
    pub max_polls: u32,
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: loopback(DEFAULT_FRONTEND_PORT),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            max_polls: DEFAULT_MAX_POLLS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    pub bind_addr: SocketAddr,
    pub authorization: AuthorizationConfig,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            bind_addr: loopback(DEFAULT_BROADCAST_PORT),
            authorization: AuthorizationConfig::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SubscriberConfig {
    pub publisher_addr: SocketAddr,
    /// Topic prefix filter; empty receives everything.
    pub prefix: String,
    pub handshake_timeout: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            publisher_addr: loopback(DEFAULT_BROADCAST_PORT),
            prefix: String::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}
