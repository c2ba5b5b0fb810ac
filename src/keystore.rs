//! # Identity & Certificate Store
//!
//! Persists one Ed25519 key pair per participant and answers lookups for
//! the negotiator (own key pair) and the authenticator (allowed public keys).
//!
//! ## Layout
//!
//! ```text
//! <base>/
//! ├── public_keys/
//! │   └── <identity>.key          {"identity": "...", "public_key": "<hex>"}
//! └── private_keys/               (0700 on Unix)
//!     └── <identity>.key_secret   {"identity": "...", "public_key": "<hex>", "secret_key": "<hex>"}
//! ```
//!
//! The `public_keys/` directory doubles as the authenticator's
//! allow-directory (see [`crate::auth`]).
//!
//! ## Invariants
//!
//! - Secret key material is only ever read from `private_keys/`. Public
//!   records are parsed with unknown fields denied, so a secret record
//!   dropped into `public_keys/` is refused rather than silently accepted.
//! - Writes go to a temporary file and are persisted into place. The
//!   private record is persisted without clobbering, so of two concurrent
//!   `generate` calls for one identity exactly one succeeds.
//! - Steady-state traffic only reads the store.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::identity::{KeyMaterial, PublicKey};

pub const PUBLIC_KEYS_DIR: &str = "public_keys";
pub const PRIVATE_KEYS_DIR: &str = "private_keys";
pub const PUBLIC_KEY_EXT: &str = "key";
pub const SECRET_KEY_EXT: &str = "key_secret";

/// Maximum participant identity length (it becomes a file name).
pub const MAX_IDENTITY_LEN: usize = 128;

/// A named participant's key pair as held by the store.
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub identity: String,
    material: KeyMaterial,
}

impl KeyPair {
    pub fn new(identity: impl Into<String>, material: KeyMaterial) -> Self {
        Self { identity: identity.into(), material }
    }

    pub fn public_key(&self) -> PublicKey {
        self.material.public_key()
    }

    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PublicKeyRecord {
    identity: String,
    public_key: String,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SecretKeyRecord {
    identity: String,
    public_key: String,
    secret_key: String,
}

/// Returns `Ok(())` if `identity` is usable as a record name.
pub fn validate_identity(identity: &str) -> Result<(), BrokerError> {
    let ok = !identity.is_empty()
        && identity.len() <= MAX_IDENTITY_LEN
        && !identity.starts_with('.')
        && identity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(BrokerError::InvalidIdentity(identity.to_string()))
    }
}

#[derive(Clone, Debug)]
pub struct KeyStore {
    base: PathBuf,
}

impl KeyStore {
    /// Open (creating if needed) a store rooted at `base`.
    ///
    /// Directory creation is idempotent.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, BrokerError> {
        let store = Self { base: base.into() };
        store.ensure_layout()?;
        Ok(store)
    }

    fn ensure_layout(&self) -> Result<(), BrokerError> {
        let public = self.public_dir();
        let private = self.private_dir();
        fs::create_dir_all(&public).map_err(|e| {
            BrokerError::Configuration(format!("cannot create {}: {e}", public.display()))
        })?;
        fs::create_dir_all(&private).map_err(|e| {
            BrokerError::Configuration(format!("cannot create {}: {e}", private.display()))
        })?;
        restrict_dir(&private)?;
        Ok(())
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn public_dir(&self) -> PathBuf {
        self.base.join(PUBLIC_KEYS_DIR)
    }

    pub fn private_dir(&self) -> PathBuf {
        self.base.join(PRIVATE_KEYS_DIR)
    }

    fn public_path(&self, identity: &str) -> PathBuf {
        self.public_dir().join(format!("{identity}.{PUBLIC_KEY_EXT}"))
    }

    fn private_path(&self, identity: &str) -> PathBuf {
        self.private_dir().join(format!("{identity}.{SECRET_KEY_EXT}"))
    }

    /// Generate and persist a fresh key pair for `identity`.
    ///
    /// # Errors
    /// - [`BrokerError::InvalidIdentity`] for names that cannot be file names
    /// - [`BrokerError::AlreadyProvisioned`] if a private record already exists
    /// - [`BrokerError::Generation`] if randomness is unavailable
    pub fn generate(&self, identity: &str) -> Result<KeyPair, BrokerError> {
        validate_identity(identity)?;
        // Fast path only; the no-clobber persist below is the real guard.
        if self.private_path(identity).exists() {
            return Err(BrokerError::AlreadyProvisioned(identity.to_string()));
        }

        let material = KeyMaterial::generate()?;
        let public_hex = material.public_key().to_hex();

        let secret = SecretKeyRecord {
            identity: identity.to_string(),
            public_key: public_hex.clone(),
            secret_key: hex::encode(material.secret_key_bytes()),
        };
        let public = PublicKeyRecord {
            identity: identity.to_string(),
            public_key: public_hex,
        };

        // Private half first: a crash between the two writes leaves an
        // identity that can be re-exported, never an orphan public key.
        let private_path = self.private_path(identity);
        match write_atomic(&private_path, &to_json(&secret)?, Persist::SecretNoClobber) {
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(BrokerError::AlreadyProvisioned(identity.to_string()));
            }
            result => result.map_err(|e| write_error(&private_path, e))?,
        }
        let public_path = self.public_path(identity);
        write_atomic(&public_path, &to_json(&public)?, Persist::Public)
            .map_err(|e| write_error(&public_path, e))?;

        info!(
            identity = %identity,
            public_key = %material.public_key().short(),
            "provisioned key pair"
        );
        Ok(KeyPair::new(identity, material))
    }

    /// Load `identity`'s key pair, generating it first if absent.
    pub fn load_or_generate(&self, identity: &str) -> Result<KeyPair, BrokerError> {
        match self.load_private(identity) {
            Ok(pair) => Ok(pair),
            Err(BrokerError::NotFound(_)) => self.generate(identity),
            Err(e) => Err(e),
        }
    }

    /// Load a participant's own key pair from the private store.
    pub fn load_private(&self, identity: &str) -> Result<KeyPair, BrokerError> {
        validate_identity(identity)?;
        let path = self.private_path(identity);
        let raw = read_record(&path, identity)?;
        let record: SecretKeyRecord = serde_json::from_slice(&raw).map_err(|e| {
            BrokerError::Configuration(format!("malformed secret record {}: {e}", path.display()))
        })?;
        if record.identity != identity {
            return Err(BrokerError::Configuration(format!(
                "secret record {} names `{}`",
                path.display(),
                record.identity
            )));
        }

        let secret = decode_key(&record.secret_key).ok_or_else(|| {
            BrokerError::Configuration(format!("bad secret key in {}", path.display()))
        })?;
        let material = KeyMaterial::from_secret_key_bytes(&secret);
        if material.public_key().to_hex() != record.public_key.to_ascii_lowercase() {
            return Err(BrokerError::Configuration(format!(
                "public key in {} does not match its secret key",
                path.display()
            )));
        }
        Ok(KeyPair::new(identity, material))
    }

    /// Load a participant's public key from the public store.
    pub fn load_public(&self, identity: &str) -> Result<PublicKey, BrokerError> {
        validate_identity(identity)?;
        let path = self.public_path(identity);
        let raw = read_record(&path, identity)?;
        let (named, key) = parse_public_record(&raw).map_err(|reason| {
            BrokerError::Configuration(format!("{}: {reason}", path.display()))
        })?;
        if named != identity {
            return Err(BrokerError::Configuration(format!(
                "public record {} names `{named}`",
                path.display()
            )));
        }
        Ok(key)
    }

    /// Enumerate every public key in this store's public directory.
    pub fn list_public(&self) -> Result<Vec<(String, PublicKey)>, BrokerError> {
        read_public_directory(&self.public_dir())
    }
}

/// Read every `*.key` record in `dir`.
///
/// Malformed records are skipped with a warning; a missing or unreadable
/// directory is a configuration error. Results are sorted by identity.
pub fn read_public_directory(dir: &Path) -> Result<Vec<(String, PublicKey)>, BrokerError> {
    let entries = fs::read_dir(dir).map_err(|e| {
        BrokerError::Configuration(format!("cannot read key directory {}: {e}", dir.display()))
    })?;

    let mut keys = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            BrokerError::Configuration(format!("cannot read key directory {}: {e}", dir.display()))
        })?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(PUBLIC_KEY_EXT) {
            continue;
        }
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable public key record");
                continue;
            }
        };
        match parse_public_record(&raw) {
            Ok(pair) => keys.push(pair),
            Err(reason) => {
                warn!(path = %path.display(), reason = %reason, "skipping malformed public key record");
            }
        }
    }
    keys.sort_by(|a, b| a.0.cmp(&b.0));
    debug!(dir = %dir.display(), count = keys.len(), "read public key directory");
    Ok(keys)
}

fn parse_public_record(raw: &[u8]) -> Result<(String, PublicKey), String> {
    let record: PublicKeyRecord =
        serde_json::from_slice(raw).map_err(|e| format!("not a public key record: {e}"))?;
    let bytes = decode_key(&record.public_key).ok_or("public key is not 32 hex bytes")?;
    let key = PublicKey::from_bytes(bytes);
    if !key.is_valid() {
        return Err("public key is not a valid Ed25519 point".into());
    }
    Ok((record.identity, key))
}

fn decode_key(hex_str: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_str).ok()?;
    bytes.try_into().ok()
}

fn read_record(path: &Path, identity: &str) -> Result<Vec<u8>, BrokerError> {
    match fs::read(path) {
        Ok(raw) => Ok(raw),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(BrokerError::NotFound(identity.to_string()))
        }
        Err(e) => Err(BrokerError::Configuration(format!(
            "cannot read {}: {e}",
            path.display()
        ))),
    }
}

fn to_json<T: Serialize>(record: &T) -> Result<Vec<u8>, BrokerError> {
    let mut out = serde_json::to_vec_pretty(record)
        .map_err(|e| BrokerError::Generation(format!("cannot encode key record: {e}")))?;
    out.push(b'\n');
    Ok(out)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Persist {
    /// Public record, replaced if present.
    Public,
    /// Secret record; fails with `AlreadyExists` instead of replacing one.
    SecretNoClobber,
}

/// Write `contents` to a temporary file beside `path`, then move it into
/// place. The temporary file is removed on every error path.
fn write_atomic(path: &Path, contents: &[u8], mode: Persist) -> std::io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "record path has no parent")
    })?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    set_record_mode(tmp.as_file(), mode == Persist::SecretNoClobber)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;

    let persisted = match mode {
        Persist::Public => tmp.persist(path),
        Persist::SecretNoClobber => tmp.persist_noclobber(path),
    };
    persisted.map(drop).map_err(|e| e.error)
}

fn write_error(path: &Path, e: std::io::Error) -> BrokerError {
    BrokerError::Configuration(format!("cannot write {}: {e}", path.display()))
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> Result<(), BrokerError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|e| {
        BrokerError::Configuration(format!("cannot restrict {}: {e}", path.display()))
    })
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> Result<(), BrokerError> {
    Ok(())
}

#[cfg(unix)]
fn set_record_mode(file: &fs::File, secret: bool) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if secret { 0o600 } else { 0o644 };
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_record_mode(_file: &fs::File, _secret: bool) -> std::io::Result<()> {
    Ok(())
}
