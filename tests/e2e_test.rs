//! End-to-end integration tests for tunnelthing.
//!
//! A server listens on a direct relay and announces its address into an
//! in-memory discovery directory; clients look it up and connect through the
//! same relay.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tunnelthing::{
    enter_proxy_mode, generate_in_memory, ping, Announcer, CertKeyPair, ConnectionBroker, DeviceId,
    DirectRelay, Discovery, Error, Invitation, Network, Relay, Server, ServerConfig, SessionJoiner,
    StaticDiscovery, Target, TunnelConfig,
};

const ANNOUNCE_INTERVAL: Duration = Duration::from_millis(50);

/// A running server plus what a client needs to reach it.
struct TestServer {
    id: DeviceId,
    discovery: Arc<StaticDiscovery>,
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<tunnelthing::Result<()>>,
}

impl TestServer {
    async fn start(target: Target) -> Self {
        let config = TunnelConfig {
            conn_timeout: Duration::from_secs(5),
            ..TunnelConfig::default()
        };
        let cert = generate_in_memory("e2e-server").unwrap();
        let relay = Arc::new(DirectRelay::bind("127.0.0.1:0", None, config).await.unwrap());
        let server = Server::new(
            ServerConfig {
                cert,
                target,
                tunnel: config,
            },
            relay,
        );
        let id = server.id();

        let discovery = Arc::new(StaticDiscovery::new());
        let announcer = Announcer::new(Arc::clone(&discovery), id, ANNOUNCE_INTERVAL);

        let (shutdown, _) = broadcast::channel::<()>(1);
        let rx = shutdown.subscribe();
        let handle = tokio::spawn(async move { server.run(&announcer, rx).await });

        let test_server = Self {
            id,
            discovery,
            shutdown,
            handle,
        };
        test_server.wait_announced().await;
        test_server
    }

    async fn wait_announced(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.discovery.lookup(&self.id).await.unwrap().is_empty() {
            assert!(Instant::now() < deadline, "server never announced its address");
            tokio::time::sleep(ANNOUNCE_INTERVAL).await;
        }
    }

    async fn address(&self) -> String {
        self.discovery.lookup(&self.id).await.unwrap().remove(0)
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let result = tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok(), "server failed: {:?}", result);
    }
}

fn client_config() -> TunnelConfig {
    TunnelConfig {
        conn_timeout: Duration::from_secs(5),
        ..TunnelConfig::default()
    }
}

fn unused_target() -> Target {
    Target::new(Network::Tcp, "127.0.0.1:1")
}

/// Loopback service that echoes until the client half-closes, then closes.
async fn spawn_echo() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                tokio::io::copy(&mut reader, &mut writer).await.unwrap();
                writer.shutdown().await.unwrap();
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_announced_address_is_relay_uri() {
    let server = TestServer::start(unused_target()).await;

    let address = server.address().await;
    assert!(address.starts_with("tcp://127.0.0.1:"), "address: {}", address);

    server.stop().await;
}

#[tokio::test]
async fn test_ping_through_relay() {
    let server = TestServer::start(unused_target()).await;
    let broker = ConnectionBroker::new(
        Arc::clone(&server.discovery),
        Arc::new(DirectRelay::client(client_config())),
        client_config(),
    );

    let mut channel = broker.lookup_and_connect("e2e-ping", &server.id).await.unwrap();
    assert_eq!(channel.peer_id(), &server.id);

    let mut ticker = tokio::time::interval(Duration::from_millis(1500));
    for _ in 0..3 {
        ticker.tick().await;
        ping(&mut channel, Duration::from_secs(5)).await.unwrap();
    }
    channel.close().await.unwrap();

    server.stop().await;
}

#[tokio::test]
async fn test_proxy_to_local_service() {
    let echo = spawn_echo().await;
    let server = TestServer::start(Target::new(Network::Tcp, echo)).await;
    let broker = ConnectionBroker::new(
        Arc::clone(&server.discovery),
        Arc::new(DirectRelay::client(client_config())),
        client_config(),
    );

    let channel = broker.lookup_and_connect("e2e-proxy", &server.id).await.unwrap();
    let mut raw: TcpStream = enter_proxy_mode(channel, Duration::from_secs(5)).await.unwrap();

    raw.write_all(b"hello through the tunnel").await.unwrap();
    raw.shutdown().await.unwrap();

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), raw.read_to_end(&mut received))
        .await
        .expect("echo did not close")
        .unwrap();
    assert_eq!(received, b"hello through the tunnel");

    server.stop().await;
}

#[tokio::test]
async fn test_wrong_device_is_rejected() {
    let server = TestServer::start(unused_target()).await;
    let address = server.address().await;

    // Same relay address, but the client expects a different device.
    let impostor = generate_in_memory("someone-else").unwrap().id;
    let discovery = Arc::new(StaticDiscovery::new().with_entry(impostor, vec![address]));
    let relay = Arc::new(FlakyRelay::new(0));
    let broker = ConnectionBroker::new(discovery, Arc::clone(&relay), client_config());

    let err = broker.lookup_and_connect("e2e-mismatch", &impostor).await.unwrap_err();
    assert!(err.is_authentication(), "unexpected error: {}", err);
    assert_eq!(relay.calls(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_device_has_no_address() {
    let server = TestServer::start(unused_target()).await;
    let broker = ConnectionBroker::new(
        Arc::clone(&server.discovery),
        Arc::new(DirectRelay::client(client_config())),
        client_config(),
    );

    let unknown = generate_in_memory("unknown").unwrap().id;
    let err = broker.lookup_and_connect("e2e-unknown", &unknown).await.unwrap_err();
    assert!(matches!(err, Error::NoAddressFound(id) if id == unknown));

    server.stop().await;
}

/// Direct relay whose first `failures` invitation requests fail.
struct FlakyRelay {
    inner: DirectRelay,
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyRelay {
    fn new(failures: usize) -> Self {
        Self {
            inner: DirectRelay::client(client_config()),
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionJoiner for FlakyRelay {
    async fn join_session(&self, invitation: &Invitation) -> tunnelthing::Result<TcpStream> {
        self.inner.join_session(invitation).await
    }
}

#[async_trait]
impl Relay for FlakyRelay {
    async fn get_invitation(
        &self,
        relay_uri: &str,
        target: &DeviceId,
        own: &CertKeyPair,
    ) -> tunnelthing::Result<Invitation> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(Error::Relay(format!("relay busy (call {})", call + 1)));
        }
        self.inner.get_invitation(relay_uri, target, own).await
    }
}

#[tokio::test]
async fn test_connect_succeeds_on_last_retry() {
    let server = TestServer::start(unused_target()).await;
    let relay = Arc::new(FlakyRelay::new(10));
    let broker = ConnectionBroker::new(Arc::clone(&server.discovery), Arc::clone(&relay), client_config());

    let mut channel = broker.lookup_and_connect("e2e-retry", &server.id).await.unwrap();
    assert_eq!(relay.calls(), 11);
    ping(&mut channel, Duration::from_secs(5)).await.unwrap();
    channel.close().await.unwrap();

    server.stop().await;
}

#[tokio::test]
async fn test_connect_gives_up_after_retries() {
    let server = TestServer::start(unused_target()).await;
    let relay = Arc::new(FlakyRelay::new(usize::MAX));
    let broker = ConnectionBroker::new(Arc::clone(&server.discovery), Arc::clone(&relay), client_config());

    let err = broker.lookup_and_connect("e2e-give-up", &server.id).await.unwrap_err();
    assert!(matches!(err, Error::Relay(ref msg) if msg.contains("call 11")), "unexpected error: {}", err);
    assert_eq!(relay.calls(), 11);

    server.stop().await;
}
