//! # Cryptographic Infrastructure
//!
//! This module provides the cryptographic plumbing behind the secure channel:
//!
//! - **TLS**: self-signed Ed25519 certificates and the rustls verifiers that
//!   implement key-based mutual authentication
//! - **QUIC configs**: server/client configurations for quinn
//! - **Signatures**: domain-separated Ed25519 signing for broadcast messages
//!
//! ## Identity Model
//!
//! - **Peer = Public Key**: the subject public key of a peer's certificate is
//!   the key the authorization set is checked against
//! - **Self-Signed Certs**: every participant derives its certificate from its
//!   stored key pair; there is no CA
//! - **Server pinning**: a client names the server by its expected public key
//!   (encoded into the TLS server name) and accepts only that key
//!
//! ## Isolation
//!
//! Both verifiers are free of per-peer state. The server-side verifier reads
//! an immutable snapshot of the authorization set; a failed check rejects
//! that one handshake and changes nothing for later peers. Client-side
//! verifiers are built per connection.
//!
//! The `dangerous()` rustls APIs are used intentionally: verification binds
//! the certificate to a known public key instead of a CA chain.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, VerifyingKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::auth::Authenticator;
use crate::identity::{KeyMaterial, PublicKey};

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Domain separation prefix for broadcast message signatures.
pub const BROADCAST_SIGNATURE_DOMAIN: &[u8] = b"bruno-broadcast-v1:";

/// ALPN for the request/response frontend.
pub const ALPN_BROKER: &[u8] = b"bruno-broker/1";

/// ALPN for the broadcast channel.
pub const ALPN_BROADCAST: &[u8] = b"bruno-broadcast/1";

/// Idle timeout applied to every connection.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Client keep-alive, well under [`IDLE_TIMEOUT`].
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Sign data with domain separation.
///
/// Returns the 64-byte Ed25519 signature over `domain || data`.
pub fn sign_with_domain(material: &KeyMaterial, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    material.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature produced by [`sign_with_domain`].
pub fn verify_with_domain(
    signer: &PublicKey,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::try_from(signer.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Crypto provider shared by every TLS config in the process.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

pub fn generate_ed25519_cert(
    material: &KeyMaterial,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let secret_key = material.secret_key_bytes();
    let public_key = material.public_key_bytes();

    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    // PKCS#8 v1 wrapper around the raw 32-byte seed.
    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&secret_key);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to create Ed25519 key pair for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec!["bruno".to_string()])
        .context("failed to create certificate params")?;

    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(hex::encode(public_key)),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed Ed25519 certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    let cert_der = CertificateDer::from(cert.der().to_vec());

    Ok((vec![cert_der], key))
}

fn transport_config(keep_alive: bool) -> quinn::TransportConfig {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(quinn::IdleTimeout::from(quinn::VarInt::from_u32(
        IDLE_TIMEOUT.as_millis() as u32,
    ))));
    transport.max_concurrent_bidi_streams(8u32.into());
    transport.max_concurrent_uni_streams(0u32.into());
    if keep_alive {
        transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    }
    transport
}

/// Server configuration that admits only peers the authenticator accepts.
pub fn create_server_config(
    material: &KeyMaterial,
    authenticator: Arc<Authenticator>,
    alpn: &[u8],
) -> Result<quinn::ServerConfig> {
    let (certs, key) = generate_ed25519_cert(material)?;
    let client_cert_verifier = Arc::new(AuthorizingClientVerifier { authenticator });

    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unavailable in crypto provider")?
        .with_client_cert_verifier(client_cert_verifier)
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![alpn.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));
    server_config.transport_config(Arc::new(transport_config(false)));

    Ok(server_config)
}

/// Client configuration that presents `material` and accepts only the server
/// key encoded in the server name of each connection.
pub fn create_client_config(material: &KeyMaterial, alpn: &[u8]) -> Result<quinn::ClientConfig> {
    let client_crypto = client_tls_config(material, alpn)?;

    let mut client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));
    client_config.transport_config(Arc::new(transport_config(true)));

    Ok(client_config)
}

fn client_tls_config(material: &KeyMaterial, alpn: &[u8]) -> Result<rustls::ClientConfig> {
    let (certs, key) = generate_ed25519_cert(material)?;

    let mut client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unavailable in crypto provider")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config with client auth")?;
    client_crypto.alpn_protocols = vec![alpn.to_vec()];
    Ok(client_crypto)
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;

    let spki = cert.public_key();
    let key_bytes = &spki.subject_public_key.data;

    if key_bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        Some(key)
    } else {
        None
    }
}

/// Public key the peer proved possession of during the handshake.
pub fn extract_verified_key(connection: &quinn::Connection) -> Option<PublicKey> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<CertificateDer<'static>> = peer_identity.downcast_ref()?;
    let cert_der = certs.first()?.as_ref();
    let public_key = extract_public_key_from_cert(cert_der)?;
    Some(PublicKey::from_bytes(public_key))
}

/// Encode a public key as a two-label DNS name (labels are capped at 63 chars).
pub(crate) fn key_to_sni(key: &PublicKey) -> String {
    let hex = key.to_hex();
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn parse_key_from_sni(sni: &str) -> Option<PublicKey> {
    let hex_str: String = sni.split('.').collect();
    PublicKey::from_hex(&hex_str).ok()
}

#[derive(Debug)]
struct AuthorizingClientVerifier {
    authenticator: Arc<Authenticator>,
}

impl rustls::server::danger::ClientCertVerifier for AuthorizingClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        let public_key = extract_public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;

        if !self.authenticator.admits_key(&PublicKey::from_bytes(public_key)) {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct PinnedServerVerifier;

impl rustls::client::danger::ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let rustls::pki_types::ServerName::DnsName(name) = server_name else {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        };

        let expected = parse_key_from_sni(name.as_ref()).ok_or_else(|| {
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding)
        })?;

        let public_key = extract_public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;

        if PublicKey::from_bytes(public_key) != expected {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName,
            ));
        }

        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::OriginFilter;
    use rustls::client::danger::ServerCertVerifier;
    use rustls::pki_types::{ServerName, UnixTime};
    use rustls::server::danger::ClientCertVerifier;
    use std::collections::HashSet;

    fn material() -> KeyMaterial {
        KeyMaterial::generate().expect("key generation")
    }

    #[test]
    fn certificate_contains_public_key() {
        for _ in 0..20 {
            let km = material();
            let (certs, _key) = generate_ed25519_cert(&km).expect("cert generation must succeed");
            let extracted = extract_public_key_from_cert(certs[0].as_ref())
                .expect("public key extraction must succeed");
            assert_eq!(extracted, km.public_key_bytes(), "certificate key differs from key material");
        }
    }

    #[test]
    fn different_material_different_cert_keys() {
        let mut keys = HashSet::new();
        for _ in 0..50 {
            let (certs, _) = generate_ed25519_cert(&material()).expect("cert generation");
            let key = extract_public_key_from_cert(certs[0].as_ref()).expect("extract");
            assert!(keys.insert(key), "certificate key collision");
        }
    }

    #[test]
    fn sni_roundtrip() {
        let key = material().public_key();
        let sni = key_to_sni(&key);
        assert!(sni.split('.').all(|label| label.len() <= 63));
        assert_eq!(parse_key_from_sni(&sni), Some(key));
        assert_eq!(parse_key_from_sni("not.a.key"), None);
    }

    #[test]
    fn domain_signatures_verify() {
        let km = material();
        let sig = sign_with_domain(&km, BROADCAST_SIGNATURE_DOMAIN, b"payload");
        assert_eq!(
            verify_with_domain(&km.public_key(), BROADCAST_SIGNATURE_DOMAIN, b"payload", &sig),
            Ok(())
        );
        assert_eq!(
            verify_with_domain(&km.public_key(), b"other-domain:", b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            verify_with_domain(&km.public_key(), BROADCAST_SIGNATURE_DOMAIN, b"tampered", &sig),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            verify_with_domain(&material().public_key(), BROADCAST_SIGNATURE_DOMAIN, b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signatures_are_classified() {
        let key = material().public_key();
        assert_eq!(
            verify_with_domain(&key, BROADCAST_SIGNATURE_DOMAIN, b"x", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&key, BROADCAST_SIGNATURE_DOMAIN, b"x", &[0u8; 10]),
            Err(SignatureError::InvalidLength)
        );
    }

    #[test]
    fn client_verifier_checks_allow_set() {
        let allowed = material();
        let stranger = material();
        let auth = Arc::new(Authenticator::from_keys(
            OriginFilter::Any,
            [allowed.public_key()],
        ));
        let verifier = AuthorizingClientVerifier { authenticator: auth };

        let (allowed_certs, _) = generate_ed25519_cert(&allowed).expect("cert");
        let (stranger_certs, _) = generate_ed25519_cert(&stranger).expect("cert");

        assert!(verifier
            .verify_client_cert(&stranger_certs[0], &[], UnixTime::now())
            .is_err());
        // A rejection must not affect the next, authorized peer.
        assert!(verifier
            .verify_client_cert(&allowed_certs[0], &[], UnixTime::now())
            .is_ok());
        assert!(verifier
            .verify_client_cert(&stranger_certs[0], &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn server_verifier_pins_expected_key() {
        let server = material();
        let impostor = material();
        let (server_certs, _) = generate_ed25519_cert(&server).expect("cert");
        let (impostor_certs, _) = generate_ed25519_cert(&impostor).expect("cert");

        let name = ServerName::try_from(key_to_sni(&server.public_key())).expect("dns name");
        let verifier = PinnedServerVerifier;

        assert!(verifier
            .verify_server_cert(&server_certs[0], &[], &name, &[], UnixTime::now())
            .is_ok());
        assert!(verifier
            .verify_server_cert(&impostor_certs[0], &[], &name, &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn configs_build() {
        let km = material();
        let auth = Arc::new(Authenticator::from_keys(OriginFilter::Any, []));
        create_server_config(&km, auth, ALPN_BROKER).expect("server config");
        create_client_config(&km, ALPN_BROKER).expect("client config");
    }

    #[test]
    fn client_offers_tls13_only() {
        let tls = client_tls_config(&material(), ALPN_BROADCAST).expect("client tls");
        assert!(tls.supports_version(rustls::ProtocolVersion::TLSv1_3));
        assert!(!tls.supports_version(rustls::ProtocolVersion::TLSv1_2));
        assert_eq!(tls.alpn_protocols, vec![ALPN_BROADCAST.to_vec()]);
    }
}
