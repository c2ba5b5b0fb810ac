//! # Error Taxonomy
//!
//! Every component boundary in bruno reports failures through [`BrokerError`].
//! The variants split into three groups:
//!
//! | Group | Variants | Scope |
//! |-------|----------|-------|
//! | Provisioning | `Configuration`, `NotFound`, `Generation`, `AlreadyProvisioned`, `InvalidIdentity` | fatal to the requesting operation |
//! | Admission | `AuthenticationFailure`, `SessionInUse` | fatal to one connection attempt only |
//! | Session | `MalformedFrame`, `Protocol`, `ReplyTimeout`, `ConnectionClosed`, `Shutdown`, `Transport`, `Io` | fatal to one session |
//!
//! Worker-local processing failures never appear here: they are turned into
//! an error-shaped reply payload by the worker slot.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Missing or invalid local key material, stores, or TLS setup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The peer was not admitted. Carries no detail on purpose.
    #[error("authentication failed")]
    AuthenticationFailure,

    /// No key record exists for the named participant.
    #[error("no key record for `{0}`")]
    NotFound(String),

    /// Key material could not be produced.
    #[error("key generation failed: {0}")]
    Generation(String),

    /// A key pair for this participant already exists and will not be replaced.
    #[error("key pair for `{0}` already exists")]
    AlreadyProvisioned(String),

    /// The participant identity cannot be used as a store record name.
    #[error("invalid participant identity `{0}`")]
    InvalidIdentity(String),

    /// Another live connection is bound to the same session identity.
    #[error("session identity is bound to another live connection")]
    SessionInUse,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("no reply within {0:?}")]
    ReplyTimeout(Duration),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("component is shut down")]
    Shutdown,

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// True for errors that end a single connection attempt but leave the
    /// accepting component healthy.
    pub fn is_per_connection(&self) -> bool {
        matches!(
            self,
            BrokerError::AuthenticationFailure
                | BrokerError::SessionInUse
                | BrokerError::MalformedFrame(_)
                | BrokerError::Protocol(_)
                | BrokerError::ConnectionClosed
                | BrokerError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
