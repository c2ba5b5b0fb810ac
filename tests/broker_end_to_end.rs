//! End-to-end tests for the session-routed broker.
//!
//! Every test runs a real broker on a loopback port with its own temporary
//! key store and talks to it through `SessionClient`.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bruno::{
    AuthorizationConfig, Broker, BrokerConfig, BrokerError, ClientConfig, FnWorker, KeyMaterial,
    KeyPair, KeyStore, LocateRequest, OriginFilter, SERVER_IDENTITY, SessionClient, SessionId,
    Worker, WorkerError, WorkerReply, run_locate_session, run_locate_sessions,
};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Clients provisioned before the broker loads its authorization snapshot.
const CLIENTS: [&str; 4] = ["client-0", "client-1", "client-2", "client-3"];

struct Fixture {
    _dir: TempDir,
    store: KeyStore,
    server: KeyPair,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = KeyStore::open(dir.path()).expect("store");
        let server = store.generate(SERVER_IDENTITY).expect("server key");
        for identity in CLIENTS {
            store.generate(identity).expect("client key");
        }
        Self {
            _dir: dir,
            store,
            server,
        }
    }

    fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind_addr: "127.0.0.1:0".parse().expect("addr"),
            workers: 5,
            authorization: AuthorizationConfig::directory(self.store.public_dir()),
            ..BrokerConfig::default()
        }
    }

    async fn broker(&self) -> Broker {
        Broker::bind(self.broker_config(), self.server.clone())
            .await
            .expect("broker bind")
    }

    async fn broker_with<W: Worker>(&self, workers: Vec<W>) -> Broker {
        Broker::bind_with_workers(self.broker_config(), self.server.clone(), workers)
            .await
            .expect("broker bind")
    }

    /// Key pair of a client provisioned in [`Fixture::new`].
    fn client(&self, identity: &str) -> KeyPair {
        self.store.load_private(identity).expect("provisioned client key")
    }
}

fn client_config(broker: &Broker) -> ClientConfig {
    ClientConfig {
        server_addr: broker.local_addr().expect("local addr"),
        poll_timeout: Duration::from_millis(500),
        max_polls: 5,
        handshake_timeout: Duration::from_secs(5),
    }
}

fn session(s: &str) -> SessionId {
    SessionId::try_from(s).expect("session")
}

fn locate(req: u64, id: &str) -> Vec<u8> {
    LocateRequest {
        req,
        id: id.to_string(),
    }
    .to_bytes()
}

/// Worker that counts every invocation.
fn counting_worker(counter: Arc<AtomicUsize>) -> impl Worker {
    FnWorker::new(move |_session: &SessionId, request: &[u8]| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(request.to_vec())
    })
}

/// Worker that takes `delay` before echoing.
struct SlowEcho {
    delay: Duration,
}

#[async_trait]
impl Worker for SlowEcho {
    async fn handle(&self, _session: &SessionId, request: &[u8]) -> Result<Vec<u8>, WorkerError> {
        tokio::time::sleep(self.delay).await;
        Ok(request.to_vec())
    }
}

#[tokio::test]
async fn concurrent_sessions_get_their_own_replies_in_order() {
    let fixture = Fixture::new();
    let broker = fixture.broker().await;

    let mut tasks = Vec::new();
    for n in 0..4 {
        let pair = fixture.client(&format!("client-{n}"));
        let id = format!("4821{n}");
        let client = SessionClient::connect(
            client_config(&broker),
            &pair,
            broker.public_key(),
            session(&id),
        )
        .await
        .expect("connect");

        tasks.push(tokio::spawn(async move {
            let mut client = client;
            for req in 0..5u64 {
                let reply = client.request(locate(req, &id)).await.expect("reply");
                assert_eq!(reply.seq, req);
                match WorkerReply::parse(&reply.payload).expect("parse") {
                    WorkerReply::Served {
                        worker,
                        req: echoed,
                        session,
                    } => {
                        assert!(worker < 5);
                        assert_eq!(echoed, req, "replies arrive in request order");
                        assert_eq!(session, id, "reply leaked from another session");
                    }
                    other => panic!("unexpected reply {other:?}"),
                }
            }
            client.close().await;
        }));
    }

    for task in tasks {
        timeout(TEST_TIMEOUT, task)
            .await
            .expect("session finished in time")
            .expect("session task");
    }

    let telemetry = broker.telemetry().await.expect("telemetry");
    assert_eq!(telemetry.router.delivered, 20);
    assert_eq!(telemetry.dispatcher.completed, 20);
    assert_eq!(telemetry.accepted_connections, 4);
    broker.shutdown().await;
}

#[tokio::test]
async fn unknown_key_is_rejected_until_provisioned_and_reloaded() {
    let fixture = Fixture::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let broker = fixture
        .broker_with(vec![counting_worker(counter.clone())])
        .await;

    // Written after the broker loaded its snapshot.
    let late = fixture.store.generate("late-client").expect("late key");
    let result = SessionClient::connect(
        client_config(&broker),
        &late,
        broker.public_key(),
        session("late"),
    )
    .await;
    assert!(matches!(result, Err(BrokerError::AuthenticationFailure)));
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    assert_eq!(broker.reload_authorization().expect("reload"), CLIENTS.len() + 2);

    let mut client = SessionClient::connect(
        client_config(&broker),
        &late,
        broker.public_key(),
        session("late"),
    )
    .await
    .expect("connect after reload");
    let reply = client.request(b"ping".to_vec()).await.expect("reply");
    assert_eq!(reply.payload, b"ping");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    client.close().await;
    broker.shutdown().await;
}

#[tokio::test]
async fn stranger_key_never_reaches_a_worker() {
    let fixture = Fixture::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let broker = fixture
        .broker_with(vec![counting_worker(counter.clone())])
        .await;

    let stranger = KeyPair::new("stranger", KeyMaterial::generate().expect("key"));
    for attempt in 0..3 {
        let result = SessionClient::connect(
            client_config(&broker),
            &stranger,
            broker.public_key(),
            session(&format!("stranger-{attempt}")),
        )
        .await;
        assert!(matches!(result, Err(BrokerError::AuthenticationFailure)));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    // Rejections left the allowed set intact.
    let pair = fixture.client("client-0");
    let mut client = SessionClient::connect(
        client_config(&broker),
        &pair,
        broker.public_key(),
        session("ok"),
    )
    .await
    .expect("connect");
    client.request(b"x".to_vec()).await.expect("reply");
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let telemetry = broker.telemetry().await.expect("telemetry");
    assert_eq!(telemetry.accepted_connections, 1);
    client.close().await;
    broker.shutdown().await;
}

#[tokio::test]
async fn rejected_strangers_do_not_disturb_admitted_clients() {
    let fixture = Fixture::new();
    let broker = fixture.broker().await;
    let allowed = broker.authenticator().allowed_keys();

    for attempt in 0..5 {
        let stranger = KeyPair::new(
            format!("stranger-{attempt}"),
            KeyMaterial::generate().expect("key"),
        );
        let result = SessionClient::connect(
            client_config(&broker),
            &stranger,
            broker.public_key(),
            session(&format!("s{attempt}")),
        )
        .await;
        assert!(matches!(result, Err(BrokerError::AuthenticationFailure)));
    }
    assert_eq!(broker.authenticator().allowed_keys(), allowed);

    // No reload in between: the snapshot loaded at bind must still admit it.
    let pair = fixture.client("client-3");
    let mut client = SessionClient::connect(
        client_config(&broker),
        &pair,
        broker.public_key(),
        session("g"),
    )
    .await
    .expect("admitted client still connects");
    let reply = client.request(locate(1, "g")).await.expect("reply");
    match WorkerReply::parse(&reply.payload).expect("parse") {
        WorkerReply::Served { req, session, .. } => {
            assert_eq!(req, 1);
            assert_eq!(session, "g");
        }
        other => panic!("unexpected reply {other:?}"),
    }
    client.close().await;
    broker.shutdown().await;
}

#[tokio::test]
async fn wrong_server_key_is_refused_by_client() {
    let fixture = Fixture::new();
    let broker = fixture.broker().await;
    let pair = fixture.client("client-1");

    let impostor = KeyMaterial::generate().expect("key").public_key();
    let result = SessionClient::connect(client_config(&broker), &pair, impostor, session("s1")).await;
    assert!(matches!(result, Err(BrokerError::AuthenticationFailure)));
    broker.shutdown().await;
}

#[tokio::test]
async fn disallowed_origin_is_refused() {
    let fixture = Fixture::new();
    let pair = fixture.client("client-1");
    let mut config = fixture.broker_config();
    config.authorization.origins =
        OriginFilter::Allow(vec![IpAddr::V4(Ipv4Addr::new(10, 20, 30, 40))]);
    let broker = Broker::bind(config, fixture.server.clone())
        .await
        .expect("broker bind");

    let result = SessionClient::connect(
        client_config(&broker),
        &pair,
        broker.public_key(),
        session("s1"),
    )
    .await;
    assert!(result.is_err(), "loopback origin must be refused");

    let telemetry = broker.telemetry().await.expect("telemetry");
    assert_eq!(telemetry.accepted_connections, 0);
    broker.shutdown().await;
}

#[tokio::test]
async fn duplicate_live_session_is_rejected() {
    let fixture = Fixture::new();
    let broker = fixture.broker().await;
    let first_pair = fixture.client("client-1");
    let second_pair = fixture.client("client-2");

    let first = SessionClient::connect(
        client_config(&broker),
        &first_pair,
        broker.public_key(),
        session("shared"),
    )
    .await
    .expect("first connect");

    let second = SessionClient::connect(
        client_config(&broker),
        &second_pair,
        broker.public_key(),
        session("shared"),
    )
    .await;
    assert!(matches!(second, Err(BrokerError::SessionInUse)));

    first.close().await;

    // The identity frees up once the first connection is gone.
    let mut rebound = None;
    for _ in 0..50 {
        match SessionClient::connect(
            client_config(&broker),
            &second_pair,
            broker.public_key(),
            session("shared"),
        )
        .await
        {
            Ok(client) => {
                rebound = Some(client);
                break;
            }
            Err(BrokerError::SessionInUse) => tokio::time::sleep(Duration::from_millis(20)).await,
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    let mut client = rebound.expect("session identity was never released");
    let reply = client.request(locate(0, "shared")).await.expect("reply");
    assert!(!WorkerReply::parse(&reply.payload).expect("parse").is_error());
    client.close().await;
    broker.shutdown().await;
}

#[tokio::test]
async fn worker_failure_becomes_error_reply() {
    let fixture = Fixture::new();
    let broker = fixture
        .broker_with(vec![FnWorker::new(|_: &SessionId, request: &[u8]| {
            if request == b"boom" {
                Err(WorkerError::Failed("exploded".into()))
            } else {
                Ok(request.to_vec())
            }
        })])
        .await;
    let pair = fixture.client("client-1");
    let mut client = SessionClient::connect(
        client_config(&broker),
        &pair,
        broker.public_key(),
        session("s1"),
    )
    .await
    .expect("connect");

    let reply = client.request(b"boom".to_vec()).await.expect("reply");
    match WorkerReply::parse(&reply.payload).expect("parse") {
        WorkerReply::Error { worker, error } => {
            assert_eq!(worker, Some(0));
            assert!(error.contains("exploded"));
        }
        other => panic!("expected error reply, got {other:?}"),
    }

    // The slot is still usable.
    let reply = client.request(b"fine".to_vec()).await.expect("reply");
    assert_eq!(reply.payload, b"fine");
    client.close().await;
    broker.shutdown().await;
}

#[tokio::test]
async fn abandoned_request_reply_is_discarded() {
    let fixture = Fixture::new();
    let broker = fixture
        .broker_with(vec![SlowEcho {
            delay: Duration::from_millis(300),
        }])
        .await;
    let pair = fixture.client("client-1");
    let config = ClientConfig {
        poll_timeout: Duration::from_millis(50),
        max_polls: 2,
        ..client_config(&broker)
    };
    let mut client = SessionClient::connect(config, &pair, broker.public_key(), session("slow"))
        .await
        .expect("connect");

    let result = client.request(b"first".to_vec()).await;
    assert!(matches!(result, Err(BrokerError::ReplyTimeout(_))));
    assert_eq!(client.outstanding(), None);

    let seq = client.send(b"second".to_vec()).await.expect("send");
    assert_eq!(seq, 1);
    let reply = client
        .poll(Duration::from_secs(3))
        .await
        .expect("poll")
        .expect("reply in time");
    assert_eq!(reply.seq, 1);
    assert_eq!(reply.payload, b"second");
    client.close().await;
    broker.shutdown().await;
}

#[tokio::test]
async fn only_one_request_may_be_outstanding() {
    let fixture = Fixture::new();
    let broker = fixture.broker().await;
    let pair = fixture.client("client-1");
    let mut client = SessionClient::connect(
        client_config(&broker),
        &pair,
        broker.public_key(),
        session("s1"),
    )
    .await
    .expect("connect");

    client.send(locate(0, "s1")).await.expect("send");
    assert!(matches!(
        client.send(locate(1, "s1")).await,
        Err(BrokerError::Protocol(_))
    ));
    client.close().await;
    broker.shutdown().await;
}

#[tokio::test]
async fn locate_session_loop_counts_replies() {
    let fixture = Fixture::new();
    let broker = fixture.broker().await;
    let pair = fixture.client("client-1");
    let mut client = SessionClient::connect(
        client_config(&broker),
        &pair,
        broker.public_key(),
        SessionId::random(),
    )
    .await
    .expect("connect");

    let (_stop_tx, stop_rx) = watch::channel(false);
    let stats = timeout(TEST_TIMEOUT, run_locate_session(&mut client, Some(3), stop_rx))
        .await
        .expect("loop finished")
        .expect("loop");
    assert_eq!(stats.sent, 3);
    assert_eq!(stats.served, 3);
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.timeouts, 0);
    client.close().await;
    broker.shutdown().await;
}

#[tokio::test]
async fn concurrent_locate_sessions_share_one_key_pair() {
    let fixture = Fixture::new();
    let broker = fixture.broker().await;
    let pair = fixture.client("client-2");

    let (_stop_tx, stop_rx) = watch::channel(false);
    let all = timeout(
        TEST_TIMEOUT,
        run_locate_sessions(
            client_config(&broker),
            &pair,
            broker.public_key(),
            3,
            Some(4),
            stop_rx,
        ),
    )
    .await
    .expect("sessions finished")
    .expect("sessions");

    assert_eq!(all.len(), 3);
    for stats in &all {
        assert_eq!(stats.sent, 4);
        assert_eq!(stats.served, 4);
    }
    let telemetry = broker.telemetry().await.expect("telemetry");
    assert_eq!(telemetry.accepted_connections, 3);
    assert_eq!(telemetry.router.delivered, 12);
    broker.shutdown().await;
}
