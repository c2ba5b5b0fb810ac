//! # Authorization Set
//!
//! An [`Authenticator`] answers two questions for every connection attempt:
//! is the network origin allowed, and is the presented public key allowed.
//! A peer is admitted only if both pass.
//!
//! The allowed keys live in an immutable [`Arc`] snapshot. Verification only
//! reads the snapshot, so a peer with a missing or wrong key cannot change
//! what later peers see. [`Authenticator::reload`] builds a complete new
//! snapshot from the public-key directory and swaps it in one step.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::error::BrokerError;
use crate::identity::PublicKey;
use crate::keystore::read_public_directory;

/// Network origins a server accepts connection attempts from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OriginFilter {
    Any,
    Allow(Vec<IpAddr>),
}

impl OriginFilter {
    pub fn loopback() -> Self {
        OriginFilter::Allow(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
    }

    pub fn admits(&self, ip: IpAddr) -> bool {
        match self {
            OriginFilter::Any => true,
            // Dual-stack sockets report IPv4 peers as ::ffff:a.b.c.d.
            OriginFilter::Allow(list) => list.contains(&ip.to_canonical()),
        }
    }
}

/// Where the set of admissible client keys comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Any peer that completes the TLS handshake (origin-only policy).
    AllowAny,
    /// Only keys found in this public-key directory.
    Directory(PathBuf),
    /// A fixed set supplied by the embedding program.
    Fixed(Vec<PublicKey>),
}

#[derive(Debug)]
enum AllowSet {
    Any,
    Keys(HashSet<PublicKey>),
}

#[derive(Debug)]
pub struct Authenticator {
    origins: OriginFilter,
    policy: KeyPolicy,
    snapshot: RwLock<Arc<AllowSet>>,
}

impl Authenticator {
    /// Build an authenticator and load its first snapshot.
    ///
    /// # Errors
    /// Returns [`BrokerError::Configuration`] if the key directory is missing
    /// or unreadable.
    pub fn new(origins: OriginFilter, policy: KeyPolicy) -> Result<Self, BrokerError> {
        let set = load_allow_set(&policy)?;
        if let AllowSet::Keys(keys) = &set {
            info!(allowed = keys.len(), origins = ?origins, "authorization set loaded");
        } else {
            info!(origins = ?origins, "authorization accepts any key");
        }
        Ok(Self {
            origins,
            policy,
            snapshot: RwLock::new(Arc::new(set)),
        })
    }

    /// Authenticator over a fixed key set.
    pub fn from_keys(origins: OriginFilter, keys: impl IntoIterator<Item = PublicKey>) -> Self {
        let keys: Vec<PublicKey> = keys.into_iter().collect();
        Self {
            origins,
            snapshot: RwLock::new(Arc::new(AllowSet::Keys(keys.iter().copied().collect()))),
            policy: KeyPolicy::Fixed(keys),
        }
    }

    pub fn origins(&self) -> &OriginFilter {
        &self.origins
    }

    pub fn policy(&self) -> &KeyPolicy {
        &self.policy
    }

    fn current(&self) -> Arc<AllowSet> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Re-read the key source and replace the snapshot.
    ///
    /// Returns the number of allowed keys (0 for [`KeyPolicy::AllowAny`]).
    /// On error the previous snapshot stays in effect.
    pub fn reload(&self) -> Result<usize, BrokerError> {
        let set = load_allow_set(&self.policy)?;
        let count = match &set {
            AllowSet::Any => 0,
            AllowSet::Keys(keys) => keys.len(),
        };
        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(set);
        debug!(allowed = count, "authorization set reloaded");
        Ok(count)
    }

    pub fn allowed_keys(&self) -> usize {
        match &*self.current() {
            AllowSet::Any => 0,
            AllowSet::Keys(keys) => keys.len(),
        }
    }

    pub fn admits_origin(&self, addr: SocketAddr) -> bool {
        self.origins.admits(addr.ip())
    }

    pub fn admits_key(&self, key: &PublicKey) -> bool {
        if !key.is_valid() {
            return false;
        }
        match &*self.current() {
            AllowSet::Any => true,
            AllowSet::Keys(keys) => keys.contains(key),
        }
    }

    /// Combined check. The error carries no detail about which half failed.
    pub fn authorize(&self, addr: SocketAddr, key: &PublicKey) -> Result<(), BrokerError> {
        if !self.admits_origin(addr) {
            warn!(peer = %addr, "origin not allowed");
            return Err(BrokerError::AuthenticationFailure);
        }
        if !self.admits_key(key) {
            warn!(peer = %addr, key = %key.short(), "public key not allowed");
            return Err(BrokerError::AuthenticationFailure);
        }
        Ok(())
    }
}

/// Reload `authenticator` every `period` until `shutdown` turns true.
///
/// A failed reload is logged and the previous snapshot stays in effect.
pub async fn reload_periodically(
    authenticator: Arc<Authenticator>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            _ = ticker.tick() => match authenticator.reload() {
                Ok(count) => trace!(allowed = count, "periodic authorization reload"),
                Err(e) => warn!(error = %e, "authorization reload failed, keeping previous set"),
            },
        }
    }
}

fn load_allow_set(policy: &KeyPolicy) -> Result<AllowSet, BrokerError> {
    match policy {
        KeyPolicy::AllowAny => Ok(AllowSet::Any),
        KeyPolicy::Fixed(keys) => Ok(AllowSet::Keys(keys.iter().copied().collect())),
        KeyPolicy::Directory(dir) => {
            let keys = read_public_directory(dir)?
                .into_iter()
                .map(|(_, key)| key)
                .filter(|key| {
                    let valid = key.is_valid();
                    if !valid {
                        warn!(key = %key.short(), "ignoring invalid public key");
                    }
                    valid
                })
                .collect();
            Ok(AllowSet::Keys(keys))
        }
    }
}
