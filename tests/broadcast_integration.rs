//! Integration tests for the signed broadcast channel.

use std::time::Duration;

use bruno::{
    AuthorizationConfig, BroadcastConfig, BroadcastPublisher, BroadcastSubscriber, BrokerError,
    KeyMaterial, KeyPair, KeyStore, PUBLISHER_IDENTITY, SubscriberConfig, publish_periodically,
};
use tempfile::TempDir;
use tokio::sync::watch;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(300);

struct Fixture {
    _dir: TempDir,
    store: KeyStore,
    publisher: BroadcastPublisher,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = KeyStore::open(dir.path()).expect("store");
        let pair = store.generate(PUBLISHER_IDENTITY).expect("publisher key");
        // Subscribers provisioned before the publisher starts.
        for n in 0..3 {
            store.generate(&format!("subscriber-{n}")).expect("subscriber key");
        }
        let config = BroadcastConfig {
            bind_addr: "127.0.0.1:0".parse().expect("addr"),
            authorization: AuthorizationConfig::directory(store.public_dir()),
        };
        let publisher = BroadcastPublisher::bind(config, pair).await.expect("bind");
        Self {
            _dir: dir,
            store,
            publisher,
        }
    }

    fn pair(&self, identity: &str) -> KeyPair {
        self.store.load_private(identity).expect("load key")
    }

    async fn subscribe(&self, identity: &str, prefix: &str) -> Result<BroadcastSubscriber, BrokerError> {
        let config = SubscriberConfig {
            publisher_addr: self.publisher.local_addr().expect("local addr"),
            prefix: prefix.to_string(),
            handshake_timeout: Duration::from_secs(5),
        };
        BroadcastSubscriber::connect(config, &self.pair(identity), self.publisher.public_key()).await
    }
}

async fn next(subscriber: &mut BroadcastSubscriber) -> (String, u64, Vec<u8>) {
    let message = subscriber
        .recv_timeout(RECV_TIMEOUT)
        .await
        .expect("recv")
        .expect("message in time");
    (message.topic, message.seqno, message.data)
}

#[tokio::test]
async fn late_subscriber_sees_only_later_messages() {
    let fixture = Fixture::new().await;
    let mut early = fixture.subscribe("subscriber-0", "").await.expect("early");

    for n in 0..3u8 {
        fixture.publisher.publish("ticks", vec![n]).await.expect("publish");
    }

    let mut late = fixture.subscribe("subscriber-1", "").await.expect("late");
    for n in 3..5u8 {
        let receipt = fixture.publisher.publish("ticks", vec![n]).await.expect("publish");
        assert_eq!(receipt.queued, 2);
    }

    for n in 0..5u64 {
        let (topic, seqno, data) = next(&mut early).await;
        assert_eq!(topic, "ticks");
        assert_eq!(seqno, n);
        assert_eq!(data, vec![n as u8]);
    }
    for n in 3..5u64 {
        let (_, seqno, _) = next(&mut late).await;
        assert_eq!(seqno, n, "late subscriber must not see earlier messages");
    }
    assert!(late.recv_timeout(QUIET_PERIOD).await.expect("recv").is_none());

    assert_eq!(fixture.publisher.subscriber_count().await.expect("count"), 2);
    early.close().await;
    late.close().await;
    fixture.publisher.shutdown().await;
}

#[tokio::test]
async fn prefix_filters_topics() {
    let fixture = Fixture::new().await;
    let mut weather = fixture
        .subscribe("subscriber-0", "weather.")
        .await
        .expect("weather");
    let mut everything = fixture.subscribe("subscriber-1", "").await.expect("all");

    fixture.publisher.publish("weather.rain", b"wet".to_vec()).await.expect("publish");
    fixture.publisher.publish("traffic.a1", b"jam".to_vec()).await.expect("publish");
    fixture.publisher.publish("weather.sun", b"dry".to_vec()).await.expect("publish");

    let (topic, _, data) = next(&mut weather).await;
    assert_eq!((topic.as_str(), data.as_slice()), ("weather.rain", &b"wet"[..]));
    let (topic, _, _) = next(&mut weather).await;
    assert_eq!(topic, "weather.sun");
    assert!(weather.recv_timeout(QUIET_PERIOD).await.expect("recv").is_none());

    let topics: Vec<String> = [
        next(&mut everything).await,
        next(&mut everything).await,
        next(&mut everything).await,
    ]
    .into_iter()
    .map(|(topic, _, _)| topic)
    .collect();
    assert_eq!(topics, ["weather.rain", "traffic.a1", "weather.sun"]);

    fixture.publisher.shutdown().await;
}

#[tokio::test]
async fn unprovisioned_subscriber_is_admitted_after_reload() {
    let fixture = Fixture::new().await;

    fixture.store.generate("newcomer").expect("newcomer key");
    let result = fixture.subscribe("newcomer", "").await;
    assert!(matches!(result, Err(BrokerError::AuthenticationFailure)));
    assert_eq!(fixture.publisher.subscriber_count().await.expect("count"), 0);

    fixture.publisher.reload_authorization().expect("reload");
    let mut subscriber = fixture.subscribe("newcomer", "").await.expect("admitted");
    fixture.publisher.publish("hello", b"world".to_vec()).await.expect("publish");
    let (topic, _, data) = next(&mut subscriber).await;
    assert_eq!(topic, "hello");
    assert_eq!(data, b"world");
    fixture.publisher.shutdown().await;
}

#[tokio::test]
async fn subscriber_refuses_wrong_publisher_key() {
    let fixture = Fixture::new().await;
    let config = SubscriberConfig {
        publisher_addr: fixture.publisher.local_addr().expect("local addr"),
        prefix: String::new(),
        handshake_timeout: Duration::from_secs(5),
    };
    let impostor = KeyMaterial::generate().expect("key").public_key();
    let result = BroadcastSubscriber::connect(config, &fixture.pair("subscriber-0"), impostor).await;
    assert!(matches!(result, Err(BrokerError::AuthenticationFailure)));
    fixture.publisher.shutdown().await;
}

#[tokio::test]
async fn stranger_subscriber_is_rejected() {
    let fixture = Fixture::new().await;
    let config = SubscriberConfig {
        publisher_addr: fixture.publisher.local_addr().expect("local addr"),
        prefix: String::new(),
        handshake_timeout: Duration::from_secs(5),
    };
    let stranger = KeyPair::new("stranger", KeyMaterial::generate().expect("key"));
    let result =
        BroadcastSubscriber::connect(config, &stranger, fixture.publisher.public_key()).await;
    assert!(matches!(result, Err(BrokerError::AuthenticationFailure)));

    // The authorized subscribers are unaffected.
    let mut subscriber = fixture.subscribe("subscriber-2", "").await.expect("subscribe");
    fixture.publisher.publish("t", b"x".to_vec()).await.expect("publish");
    assert_eq!(next(&mut subscriber).await.2, b"x");
    fixture.publisher.shutdown().await;
}

#[tokio::test]
async fn invalid_topics_are_refused() {
    let fixture = Fixture::new().await;
    let long_topic = "t".repeat(1000);
    assert!(fixture.publisher.publish(&long_topic, Vec::new()).await.is_err());
    assert!(fixture.publisher.publish("bad\ntopic", Vec::new()).await.is_err());
    assert!(matches!(
        fixture.subscribe("subscriber-0", "bad\nprefix").await,
        Err(BrokerError::Protocol(_))
    ));
    fixture.publisher.shutdown().await;
}

#[tokio::test]
async fn periodic_publisher_stops_at_limit() {
    let fixture = Fixture::new().await;
    let mut subscriber = fixture.subscribe("subscriber-0", "demo").await.expect("subscribe");

    let (_stop_tx, stop_rx) = watch::channel(false);
    let published = publish_periodically(
        &fixture.publisher,
        "demo",
        Duration::from_millis(10),
        Some(4),
        stop_rx,
        |n| format!("Hello world! #{n}").into_bytes(),
    )
    .await
    .expect("publish loop");
    assert_eq!(published, 4);

    for n in 0..4u64 {
        let (_, seqno, data) = next(&mut subscriber).await;
        assert_eq!(seqno, n);
        assert_eq!(data, format!("Hello world! #{n}").into_bytes());
    }
    let telemetry = fixture.publisher.telemetry().await.expect("telemetry");
    assert_eq!(telemetry.published, 4);
    assert_eq!(telemetry.dropped, 0);
    fixture.publisher.shutdown().await;
}
