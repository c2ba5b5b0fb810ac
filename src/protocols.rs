//! Capability traits for bruno's pluggable parts.
//!
//! The broker and dispatcher never look inside a payload. Everything that
//! does is behind the [`Worker`] trait, so the reference [`LocateWorker`]
//! can be swapped for any other request handler.
//!
//! | Trait | Implemented by | Purpose |
//! |-------|----------------|---------|
//! | [`Worker`] | [`LocateWorker`], [`FnWorker`] | turn one request payload into one reply payload |
//!
//! [`LocateWorker`]: crate::worker::LocateWorker
//! [`FnWorker`]: crate::worker::FnWorker

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::identity::SessionId;

/// Failure of a single invocation. The worker slot converts it into an
/// error-shaped reply; it never reaches the broker as a fault.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("processing failed: {0}")]
    Failed(String),
}

/// Request processing for one worker slot.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Process one request for `session` and produce its reply payload.
    ///
    /// Must complete in bounded time. The session identity is informational;
    /// implementations must not rely on it for routing.
    async fn handle(&self, session: &SessionId, request: &[u8]) -> Result<Vec<u8>, WorkerError>;
}

#[async_trait]
impl<W: Worker> Worker for Arc<W> {
    async fn handle(&self, session: &SessionId, request: &[u8]) -> Result<Vec<u8>, WorkerError> {
        (**self).handle(session, request).await
    }
}
