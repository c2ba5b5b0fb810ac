use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use bruno::{
    AuthorizationConfig, BroadcastConfig, BroadcastPublisher, BroadcastSubscriber, Broker,
    BrokerConfig, ClientConfig, DEFAULT_MAX_PENDING, DEFAULT_MAX_POLLS, DEFAULT_STORE_DIR,
    DEFAULT_WORKERS, KeyPolicy, KeyStore,
    OriginFilter, PUBLISHER_IDENTITY, SERVER_IDENTITY, SessionClient, SessionId,
    SubscriberConfig, publish_periodically, run_locate_session, run_locate_sessions,
};

#[derive(Parser, Debug)]
#[command(name = "bruno")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Key store base directory.
    #[arg(short, long, global = true, default_value = DEFAULT_STORE_DIR)]
    store: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision a key pair for a participant.
    Keygen {
        identity: String,
    },
    /// Run the session-routed broker with its worker pool.
    Broker {
        #[arg(short, long, default_value = "127.0.0.1:5792")]
        bind: SocketAddr,

        #[arg(short, long, default_value_t = DEFAULT_WORKERS)]
        workers: usize,

        #[arg(long, default_value_t = DEFAULT_MAX_PENDING)]
        max_pending: usize,

        /// Upper bound of simulated processing time per request.
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,

        #[command(flatten)]
        auth: AuthArgs,

        #[arg(short, long, default_value_t = 300)]
        telemetry_interval: u64,
    },
    /// Run a client session against the broker.
    Client {
        #[arg(short = 'S', long, default_value = "127.0.0.1:5792")]
        server: SocketAddr,

        /// Participant name for this client's key pair (generated per run
        /// when omitted).
        #[arg(short, long)]
        identity: Option<String>,

        /// Run a single session under this identity.
        #[arg(long)]
        session: Option<String>,

        /// Concurrent sessions, each with a random identity.
        #[arg(long, default_value_t = 3, conflicts_with = "session")]
        sessions: usize,

        /// Stop after this many requests.
        #[arg(short = 'n', long)]
        requests: Option<u64>,

        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,

        #[arg(long, default_value_t = DEFAULT_MAX_POLLS)]
        polls: u32,
    },
    /// Run the broadcast publisher.
    Publish {
        #[arg(short, long, default_value = "127.0.0.1:9000")]
        bind: SocketAddr,

        #[arg(short = 'T', long, default_value = "")]
        topic: String,

        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,

        #[arg(short = 'n', long)]
        count: Option<u64>,

        #[command(flatten)]
        auth: AuthArgs,
    },
    /// Subscribe to the broadcast publisher.
    Subscribe {
        #[arg(short, long, default_value = "127.0.0.1:9000")]
        publisher: SocketAddr,

        #[arg(short, long)]
        identity: Option<String>,

        /// Topic prefix; empty receives everything.
        #[arg(long, default_value = "")]
        prefix: String,

        #[arg(short = 'n', long)]
        count: Option<u64>,
    },
}

#[derive(Args, Debug)]
struct AuthArgs {
    /// Allowed client origin; repeatable. Use `any` to disable the check.
    #[arg(long = "allow-origin", value_name = "IP", default_value = "127.0.0.1")]
    allow_origin: Vec<String>,

    /// Admit any key that completes the handshake (origin check only).
    #[arg(long)]
    allow_any_key: bool,

    /// Re-read the public-key directory every N seconds (0 disables).
    #[arg(long, default_value_t = 5)]
    reload_secs: u64,
}

impl AuthArgs {
    fn to_config(&self, store: &KeyStore) -> Result<AuthorizationConfig> {
        let origins = if self.allow_origin.iter().any(|o| o == "any") {
            OriginFilter::Any
        } else {
            let ips = self
                .allow_origin
                .iter()
                .map(|o| o.parse::<IpAddr>().with_context(|| format!("invalid origin {o:?}")))
                .collect::<Result<Vec<_>>>()?;
            OriginFilter::Allow(ips)
        };
        let keys = if self.allow_any_key {
            KeyPolicy::AllowAny
        } else {
            KeyPolicy::Directory(store.public_dir())
        };
        let reload_interval = (self.reload_secs > 0).then(|| Duration::from_secs(self.reload_secs));
        Ok(AuthorizationConfig {
            origins,
            keys,
            reload_interval,
        })
    }
}

fn per_run_identity(prefix: &str) -> String {
    format!("{prefix}-{}", SessionId::random())
}

fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, exiting gracefully");
            let _ = tx.send(true);
        }
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let store = KeyStore::open(&cli.store)
        .with_context(|| format!("failed to open key store at {}", cli.store.display()))?;

    match cli.command {
        Command::Keygen { identity } => {
            let pair = store.generate(&identity)?;
            println!("{}", pair.public_key());
        }

        Command::Broker {
            bind,
            workers,
            max_pending,
            delay_ms,
            auth,
            telemetry_interval,
        } => {
            let pair = store.load_or_generate(SERVER_IDENTITY)?;
            let config = BrokerConfig {
                bind_addr: bind,
                workers,
                max_pending,
                processing_delay: Duration::from_millis(delay_ms),
                authorization: auth.to_config(&store)?,
            };
            let broker = Broker::bind(config, pair).await?;
            info!("Broker key: {}", broker.public_key());

            let mut interval = time::interval(Duration::from_secs(telemetry_interval.max(1)));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received shutdown signal, exiting gracefully");
                        break;
                    }
                    _ = interval.tick() => match broker.telemetry().await {
                        Ok(snapshot) => info!(
                            accepted = snapshot.accepted_connections,
                            rejected = snapshot.rejected_connections,
                            sessions = snapshot.router.sessions,
                            delivered = snapshot.router.delivered,
                            undeliverable = snapshot.router.undeliverable,
                            pending = snapshot.dispatcher.pending,
                            idle = snapshot.dispatcher.idle,
                            overloaded = snapshot.dispatcher.overloaded,
                            longest_busy = ?snapshot.dispatcher.longest_busy,
                            "telemetry snapshot"
                        ),
                        Err(e) => warn!(error = %e, "telemetry unavailable"),
                    },
                }
            }
            broker.shutdown().await;
        }

        Command::Client {
            server,
            identity,
            session,
            sessions,
            requests,
            poll_ms,
            polls,
        } => {
            let identity = identity.unwrap_or_else(|| per_run_identity("client"));
            let pair = store.load_or_generate(&identity)?;
            let server_key = store
                .load_public(SERVER_IDENTITY)
                .context("server public key not provisioned")?;
            let config = ClientConfig {
                server_addr: server,
                poll_timeout: Duration::from_millis(poll_ms),
                max_polls: polls,
                ..ClientConfig::default()
            };

            let all = match session {
                Some(session) => {
                    let session = SessionId::try_from(session.as_str())?;
                    let mut client =
                        SessionClient::connect(config, &pair, server_key, session).await?;
                    let stats =
                        run_locate_session(&mut client, requests, shutdown_on_ctrl_c()).await?;
                    client.close().await;
                    vec![stats]
                }
                None => {
                    run_locate_sessions(
                        config,
                        &pair,
                        server_key,
                        sessions,
                        requests,
                        shutdown_on_ctrl_c(),
                    )
                    .await?
                }
            };
            for stats in all {
                info!(
                    sent = stats.sent,
                    served = stats.served,
                    errors = stats.errors,
                    timeouts = stats.timeouts,
                    "client session finished"
                );
            }
        }

        Command::Publish {
            bind,
            topic,
            interval_ms,
            count,
            auth,
        } => {
            let pair = store.load_or_generate(PUBLISHER_IDENTITY)?;
            let config = BroadcastConfig {
                bind_addr: bind,
                authorization: auth.to_config(&store)?,
            };
            let publisher = BroadcastPublisher::bind(config, pair).await?;
            info!("Publisher key: {}", publisher.public_key());

            let published = publish_periodically(
                &publisher,
                &topic,
                Duration::from_millis(interval_ms),
                count,
                shutdown_on_ctrl_c(),
                |n| format!("Hello world! #{n}").into_bytes(),
            )
            .await?;
            info!(published, "publisher finished");
            publisher.shutdown().await;
        }

        Command::Subscribe {
            publisher,
            identity,
            prefix,
            count,
        } => {
            let identity = identity.unwrap_or_else(|| per_run_identity("subscriber"));
            let pair = store.load_or_generate(&identity)?;
            let publisher_key = store
                .load_public(PUBLISHER_IDENTITY)
                .context("publisher public key not provisioned")?;
            let config = SubscriberConfig {
                publisher_addr: publisher,
                prefix,
                ..SubscriberConfig::default()
            };

            let mut subscriber = BroadcastSubscriber::connect(config, &pair, publisher_key).await?;
            let mut shutdown = shutdown_on_ctrl_c();
            let mut received = 0u64;
            while count.is_none_or(|count| received < count) {
                let message = tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => break,
                    message = subscriber.recv() => message?,
                };
                received += 1;
                info!(
                    topic = %message.topic,
                    seqno = message.seqno,
                    "{}",
                    String::from_utf8_lossy(&message.data)
                );
            }
            subscriber.close().await;
        }
    }

    Ok(())
}
