//! # Secure Channel Negotiator
//!
//! Every connection passes through here before any application frame flows.
//!
//! ## Server role
//!
//! 1. [`server_endpoint`] binds a QUIC endpoint whose TLS config requires a
//!    client certificate and checks it against the [`Authenticator`].
//! 2. [`accept`] refuses an `Incoming` from a disallowed origin before any
//!    handshake state exists, then drives the handshake and re-checks the
//!    verified key. The result is an [`AuthenticatedPeer`] or
//!    `AuthenticationFailure`.
//!
//! ## Client role
//!
//! [`connect`] presents the local key pair and pins the expected server key.
//! A fresh TLS config is built for every connection, so nothing learned
//! while talking to one peer is reused for another.
//!
//! A peer that fails either check sees a closed connection and nothing else.
//! The reason is logged on the server side only.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use quinn::{Connection, ConnectionError, Endpoint, Incoming};
use tracing::{debug, warn};

use crate::auth::Authenticator;
use crate::crypto::{create_client_config, create_server_config, extract_verified_key, key_to_sni};
use crate::error::BrokerError;
use crate::identity::PublicKey;
use crate::keystore::KeyPair;

/// A connection whose peer passed both the origin and the key check.
#[derive(Debug)]
pub struct AuthenticatedPeer {
    pub connection: Connection,
    pub public_key: PublicKey,
    pub remote: SocketAddr,
}

/// Bind a server endpoint that authenticates peers with `authenticator`.
///
/// # Errors
/// [`BrokerError::Configuration`] if the TLS configuration cannot be built,
/// [`BrokerError::Io`] if the address cannot be bound.
pub fn server_endpoint(
    bind_addr: SocketAddr,
    pair: &KeyPair,
    authenticator: Arc<Authenticator>,
    alpn: &[u8],
) -> Result<Endpoint, BrokerError> {
    let server_config = create_server_config(pair.material(), authenticator, alpn)
        .map_err(|e| BrokerError::Configuration(format!("{e:#}")))?;
    let endpoint = Endpoint::server(server_config, bind_addr)?;
    Ok(endpoint)
}

/// Drive one inbound connection attempt through the authorization gate.
pub async fn accept(
    incoming: Incoming,
    authenticator: &Authenticator,
) -> Result<AuthenticatedPeer, BrokerError> {
    let remote = incoming.remote_address();

    if !authenticator.admits_origin(remote) {
        warn!(peer = %remote, "refusing connection from disallowed origin");
        incoming.refuse();
        return Err(BrokerError::AuthenticationFailure);
    }

    let connection = match incoming.await {
        Ok(connection) => connection,
        Err(ConnectionError::TimedOut) => {
            debug!(peer = %remote, "handshake timed out");
            return Err(BrokerError::Transport("handshake timed out".into()));
        }
        Err(e) => {
            // The client-certificate verifier rejects unknown keys here.
            warn!(peer = %remote, error = %e, "handshake rejected");
            return Err(BrokerError::AuthenticationFailure);
        }
    };

    let Some(public_key) = extract_verified_key(&connection) else {
        warn!(peer = %remote, "rejecting connection: no verifiable peer key");
        connection.close(0u32.into(), b"");
        return Err(BrokerError::AuthenticationFailure);
    };

    // The snapshot may have been reloaded during the handshake.
    if let Err(e) = authenticator.authorize(remote, &public_key) {
        connection.close(0u32.into(), b"");
        return Err(e);
    }

    debug!(peer = %remote, key = %public_key.short(), "peer authenticated");
    Ok(AuthenticatedPeer {
        connection,
        public_key,
        remote,
    })
}

/// Client endpoint on an ephemeral port of the same address family as
/// `server_addr`.
pub fn client_endpoint(server_addr: SocketAddr) -> Result<Endpoint, BrokerError> {
    let bind: SocketAddr = if server_addr.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    Ok(Endpoint::client(bind)?)
}

/// Connect to `server_addr`, presenting `pair` and accepting only a server
/// that proves possession of `server_key`.
pub async fn connect(
    endpoint: &Endpoint,
    pair: &KeyPair,
    server_key: &PublicKey,
    server_addr: SocketAddr,
    alpn: &[u8],
) -> Result<Connection, BrokerError> {
    let client_config = create_client_config(pair.material(), alpn)
        .map_err(|e| BrokerError::Configuration(format!("{e:#}")))?;
    let sni = key_to_sni(server_key);

    let connecting = endpoint
        .connect_with(client_config, server_addr, &sni)
        .map_err(|e| BrokerError::Transport(format!("failed to initiate connection: {e}")))?;

    match connecting.await {
        Ok(connection) => Ok(connection),
        Err(ConnectionError::TimedOut) => {
            Err(BrokerError::Transport("handshake timed out".into()))
        }
        Err(
            e @ (ConnectionError::TransportError(_)
            | ConnectionError::ConnectionClosed(_)
            | ConnectionError::ApplicationClosed(_)
            | ConnectionError::Reset),
        ) => {
            debug!(server = %server_addr, error = %e, "connection not admitted");
            Err(BrokerError::AuthenticationFailure)
        }
        Err(e) => Err(BrokerError::Transport(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::OriginFilter;
    use crate::crypto::ALPN_BROKER;
    use crate::identity::KeyMaterial;
    use std::time::Duration;
    use tokio::time::timeout;

    fn pair(name: &str) -> KeyPair {
        KeyPair::new(name, KeyMaterial::generate().expect("key"))
    }

    fn loopback() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    async fn accept_one(endpoint: Endpoint, auth: Arc<Authenticator>) -> Result<AuthenticatedPeer, BrokerError> {
        let incoming = endpoint.accept().await.ok_or(BrokerError::Shutdown)?;
        accept(incoming, &auth).await
    }

    #[tokio::test]
    async fn mutual_authentication_succeeds() {
        let server = pair("bruno");
        let client = pair("client");
        let auth = Arc::new(Authenticator::from_keys(OriginFilter::loopback(), [client.public_key()]));
        let endpoint = server_endpoint(loopback(), &server, auth.clone(), ALPN_BROKER).expect("bind");
        let addr = endpoint.local_addr().expect("addr");
        let server_task = tokio::spawn(accept_one(endpoint, auth));

        let client_ep = client_endpoint(addr).expect("client endpoint");
        let connection = timeout(
            Duration::from_secs(10),
            connect(&client_ep, &client, &server.public_key(), addr, ALPN_BROKER),
        )
        .await
        .expect("no timeout")
        .expect("connect");

        let peer = server_task.await.expect("join").expect("accepted");
        assert_eq!(peer.public_key, client.public_key());
        assert_eq!(
            extract_verified_key(&connection),
            Some(server.public_key())
        );
    }

    #[tokio::test]
    async fn wrong_server_key_is_rejected_by_client() {
        let server = pair("bruno");
        let client = pair("client");
        let impostor = pair("impostor");
        let auth = Arc::new(Authenticator::from_keys(OriginFilter::Any, [client.public_key()]));
        let endpoint = server_endpoint(loopback(), &server, auth.clone(), ALPN_BROKER).expect("bind");
        let addr = endpoint.local_addr().expect("addr");
        let _server_task = tokio::spawn(accept_one(endpoint, auth));

        let client_ep = client_endpoint(addr).expect("client endpoint");
        let result = timeout(
            Duration::from_secs(10),
            connect(&client_ep, &client, &impostor.public_key(), addr, ALPN_BROKER),
        )
        .await
        .expect("no timeout");
        assert!(matches!(result, Err(BrokerError::AuthenticationFailure)));
    }

    #[tokio::test]
    async fn unknown_client_key_is_rejected_by_server() {
        let server = pair("bruno");
        let stranger = pair("stranger");
        let auth = Arc::new(Authenticator::from_keys(OriginFilter::Any, []));
        let endpoint = server_endpoint(loopback(), &server, auth.clone(), ALPN_BROKER).expect("bind");
        let addr = endpoint.local_addr().expect("addr");
        let server_task = tokio::spawn(accept_one(endpoint, auth));

        let client_ep = client_endpoint(addr).expect("client endpoint");
        let _ = timeout(
            Duration::from_secs(10),
            connect(&client_ep, &stranger, &server.public_key(), addr, ALPN_BROKER),
        )
        .await;

        let result = timeout(Duration::from_secs(10), server_task)
            .await
            .expect("no timeout")
            .expect("join");
        assert!(matches!(result, Err(BrokerError::AuthenticationFailure)));
    }

    #[tokio::test]
    async fn disallowed_origin_is_refused() {
        let server = pair("bruno");
        let client = pair("client");
        let auth = Arc::new(Authenticator::from_keys(
            OriginFilter::Allow(vec!["10.1.2.3".parse().expect("ip")]),
            [client.public_key()],
        ));
        let endpoint = server_endpoint(loopback(), &server, auth.clone(), ALPN_BROKER).expect("bind");
        let addr = endpoint.local_addr().expect("addr");
        let server_task = tokio::spawn(accept_one(endpoint, auth));

        let client_ep = client_endpoint(addr).expect("client endpoint");
        let result = timeout(
            Duration::from_secs(10),
            connect(&client_ep, &client, &server.public_key(), addr, ALPN_BROKER),
        )
        .await
        .expect("no timeout");
        assert!(result.is_err());

        let accepted = server_task.await.expect("join");
        assert!(matches!(accepted, Err(BrokerError::AuthenticationFailure)));
    }
}
