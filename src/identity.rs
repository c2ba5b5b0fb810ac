//! # Identities and Key Material
//!
//! This module defines the identity types used throughout bruno:
//!
//! - [`KeyMaterial`]: Ed25519 signing key (secret + public half)
//! - [`PublicKey`]: 32-byte Ed25519 public key, the authenticated identity of a peer
//! - [`SessionId`]: opaque client-chosen routing token used to address replies
//!
//! ## Identity Model
//!
//! A participant is authenticated by its public key: the TLS certificate a
//! peer presents carries exactly this key, and the authorization set is a set
//! of these keys. The human-readable participant name ("bruno", a client UUID)
//! only exists in the key store as the record file name.
//!
//! Session identities are a separate concept. They are not authenticated and
//! are only used as return addresses inside the broker.
//!
//! ## Invariants
//!
//! - `PublicKey::from_bytes(bytes).as_bytes() == bytes`
//! - Only valid Ed25519 points are accepted as peer keys
//! - A `SessionId` is 1..=255 bytes and never starts with a zero byte

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// Maximum length of a session identity in bytes.
pub const MAX_SESSION_ID_LEN: usize = 255;

#[derive(Clone)]
pub struct KeyMaterial {
    signing_key: SigningKey,
}

impl KeyMaterial {
    /// Generate fresh key material from the operating system RNG.
    ///
    /// # Errors
    /// Returns [`BrokerError::Generation`] if the OS randomness source fails.
    pub fn generate() -> Result<Self, BrokerError> {
        let mut secret = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut secret)
            .map_err(|e| BrokerError::Generation(format!("OS randomness unavailable: {e}")))?;
        Ok(Self::from_secret_key_bytes(&secret))
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_bytes(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("public_key", &self.public_key().to_hex())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Short hex prefix for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Check that the key is a usable Ed25519 point.
    ///
    /// All-zero and all-0xFF keys are rejected up front.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        if self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Opaque return address of one client session.
///
/// The broker never interprets the bytes; it only compares them. A leading
/// zero byte is reserved and rejected, matching the identity rules of the
/// router sockets this broker replaces.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Vec<u8>);

impl SessionId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, BrokerError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(BrokerError::Protocol("session identity is empty".into()));
        }
        if bytes.len() > MAX_SESSION_ID_LEN {
            return Err(BrokerError::Protocol(format!(
                "session identity is {} bytes (max {})",
                bytes.len(),
                MAX_SESSION_ID_LEN
            )));
        }
        if bytes[0] == 0 {
            return Err(BrokerError::Protocol(
                "session identity must not start with a zero byte".into(),
            ));
        }
        Ok(Self(bytes))
    }

    /// Fresh random session identity (32 lowercase hex characters).
    pub fn random() -> Self {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        Self(hex::encode(raw).into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Structural validity check for values that arrived off the wire.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.len() <= MAX_SESSION_ID_LEN && self.0[0] != 0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => write!(f, "{s}"),
            _ => write!(f, "0x{}", hex::encode(&self.0)),
        }
    }
}

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionId({self})")
    }
}

impl TryFrom<&str> for SessionId {
    type Error = BrokerError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.as_bytes().to_vec())
    }
}
