//! End-to-end scenarios over localhost: capture, handshake, relay.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};

use quantdog::config::QuantdogConfig;
use quantdog::crypto::KemAlgorithm;
use quantdog::engine::{PacketDevice, PacketOutcome, TunnelEngine};
use quantdog::handshake::{Dialer, HandshakeClient, HandshakeState};
use quantdog::listener::{KemResponder, Listener, ListenerConfig, ListenerHandle, PqcRelayResponder};
use quantdog::packet;
use quantdog::relay::{RelayFrame, LENGTH_PREFIX_LEN};
use quantdog::secrets::SecretStore;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Sends every handshake to a responder on localhost, whatever the peer
struct LocalDialer {
    port: u16,
}

#[async_trait]
impl Dialer for LocalDialer {
    async fn dial(&self, _peer: IpAddr, _port: u16) -> std::io::Result<TcpStream> {
        TcpStream::connect((Ipv4Addr::LOCALHOST, self.port)).await
    }
}

/// Never connects
struct BlackholeDialer;

#[async_trait]
impl Dialer for BlackholeDialer {
    async fn dial(&self, _peer: IpAddr, _port: u16) -> std::io::Result<TcpStream> {
        std::future::pending().await
    }
}

/// Packet device backed by channels
struct ChannelDevice {
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl ChannelDevice {
    fn new() -> (Self, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(16);
        let device = ChannelDevice {
            inbound: Mutex::new(in_rx),
            outbound: out_tx,
        };
        (device, in_tx, out_rx)
    }
}

#[async_trait]
impl PacketDevice for ChannelDevice {
    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(packet) => {
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            None => std::future::pending().await,
        }
    }

    async fn send(&self, packet: &[u8]) -> std::io::Result<usize> {
        self.outbound
            .send(packet.to_vec())
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))?;
        Ok(packet.len())
    }
}

async fn kem_listener(store: &Arc<SecretStore>) -> ListenerHandle {
    Listener::start(
        ListenerConfig::new("KEM", LOCALHOST, 0),
        Arc::new(KemResponder::new(Arc::clone(store), Duration::from_secs(5))),
    )
    .await
    .unwrap()
}

async fn relay_listener(store: &Arc<SecretStore>) -> ListenerHandle {
    Listener::start(
        ListenerConfig::new("PQC relay", LOCALHOST, 0),
        Arc::new(PqcRelayResponder::new(Arc::clone(store))),
    )
    .await
    .unwrap()
}

fn outbound_packet(payload: &[u8]) -> Vec<u8> {
    packet::build_tcp(
        "10.152.152.10:40000".parse().unwrap(),
        "203.0.113.5:443".parse().unwrap(),
        payload,
    )
    .unwrap()
}

#[tokio::test]
async fn test_first_packet_to_new_destination_is_tunneled() {
    let responder_store = Arc::new(SecretStore::new());
    let mut kem = kem_listener(&responder_store).await;

    let config = QuantdogConfig::default();
    let client_store = Arc::new(SecretStore::new());
    let client = Arc::new(
        HandshakeClient::new(Arc::clone(&client_store), KemAlgorithm::MlKem768, config.tunnel.kem_port)
            .with_dialer(Arc::new(LocalDialer { port: kem.local_addr().port() })),
    );
    let engine = TunnelEngine::new(&config, Arc::clone(&client));

    let (device, to_engine, mut from_engine) = ChannelDevice::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(async move { engine.run(&device, shutdown_rx).await });

    to_engine.send(outbound_packet(b"GET /")).await.unwrap();
    let rewritten = tokio::time::timeout(Duration::from_secs(10), from_engine.recv())
        .await
        .unwrap()
        .unwrap();

    let view = packet::parse(&rewritten).unwrap();
    assert_eq!(view.destination(), config.tunnel.relay_address);
    assert_eq!(view.destination_port(), Some(config.tunnel.relay_port));
    assert_eq!(view.source(), "10.152.152.10".parse::<Ipv4Addr>().unwrap());
    assert!(packet::verify_ip_checksum(&view));
    assert!(packet::verify_transport_checksum(&view));
    assert_ne!(view.payload(), b"GET /");

    let destination: IpAddr = "203.0.113.5".parse().unwrap();
    let secret = client_store.get(&destination).unwrap();
    assert_eq!(client.state(destination), HandshakeState::Complete);

    let frame = RelayFrame::open(&view.payload()[LENGTH_PREFIX_LEN..], &secret).unwrap();
    assert_eq!(frame.destination, "203.0.113.5:443".parse::<SocketAddrV4>().unwrap());
    assert_eq!(&frame.payload[..], b"GET /");

    // Responder keys the secret by the address it saw
    assert_eq!(responder_store.get(&LOCALHOST).unwrap().secret(), secret.secret());

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
    kem.stop().await;
}

#[tokio::test]
async fn test_destination_without_responder_is_not_tunneled() {
    let config = QuantdogConfig::default();
    let client = Arc::new(
        HandshakeClient::new(Arc::new(SecretStore::new()), KemAlgorithm::MlKem512, config.tunnel.kem_port)
            .with_dialer(Arc::new(BlackholeDialer))
            .with_timeouts(Duration::from_millis(200), Duration::from_millis(200)),
    );
    let engine = TunnelEngine::new(&config, Arc::clone(&client));

    let outcome = engine.process_packet(&outbound_packet(b"GET /")).await.unwrap();
    assert_eq!(outcome, PacketOutcome::Unreachable);

    let stats = engine.stats().snapshot();
    assert_eq!(stats.peer_unreachable, 1);
    assert_eq!(stats.tunneled, 0);
    assert_eq!(client.state("203.0.113.5".parse().unwrap()), HandshakeState::Failed);

    // The next packet inside the backoff window skips the handshake
    let outcome = engine.process_packet(&outbound_packet(b"GET /")).await.unwrap();
    assert_eq!(outcome, PacketOutcome::BackedOff);
}

#[tokio::test]
async fn test_unreachable_packet_emits_nothing() {
    let config = QuantdogConfig::default();
    let client = Arc::new(
        HandshakeClient::new(Arc::new(SecretStore::new()), KemAlgorithm::MlKem512, config.tunnel.kem_port)
            .with_dialer(Arc::new(BlackholeDialer))
            .with_timeouts(Duration::from_millis(100), Duration::from_millis(100)),
    );
    let engine = Arc::new(TunnelEngine::new(&config, client));

    let (device, to_engine, mut from_engine) = ChannelDevice::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run(&device, shutdown_rx).await })
    };

    to_engine.send(outbound_packet(b"GET /")).await.unwrap();
    let emitted = tokio::time::timeout(Duration::from_millis(500), from_engine.recv()).await;
    assert!(emitted.is_err());

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
    assert_eq!(engine.stats().snapshot().peer_unreachable, 1);
}

#[tokio::test]
async fn test_relay_requires_negotiated_secret() {
    let store = Arc::new(SecretStore::new());
    let mut kem = kem_listener(&store).await;
    let mut relay = relay_listener(&store).await;

    let sink = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let destination = match sink.local_addr().unwrap() {
        SocketAddr::V4(v4) => v4,
        other => panic!("unexpected {}", other),
    };
    let received = tokio::spawn(async move {
        let (mut socket, _) = sink.accept().await.unwrap();
        let mut data = Vec::new();
        socket.read_to_end(&mut data).await.unwrap();
        data
    });

    // 127.0.0.1 negotiates, 127.0.0.2 never does
    let client = HandshakeClient::new(Arc::new(SecretStore::new()), KemAlgorithm::MlKem768, kem.local_addr().port());
    let secret = client.negotiate(LOCALHOST).await.unwrap();

    let stranger = TcpSocket::new_v4().unwrap();
    stranger.bind("127.0.0.2:0".parse().unwrap()).unwrap();
    let mut stranger = stranger.connect(relay.local_addr()).await.unwrap();
    let wire = RelayFrame::new(destination, &b"early"[..]).to_wire(&secret, 65536).unwrap();
    stranger.write_all(&wire).await.unwrap();
    let mut buf = Vec::new();
    let _ = stranger.read_to_end(&mut buf).await;
    assert!(buf.is_empty());
    assert!(!store.has(&"127.0.0.2".parse().unwrap()));

    let mut peer = TcpStream::connect(relay.local_addr()).await.unwrap();
    let wire = RelayFrame::new(destination, &b"GET /"[..]).to_wire(&secret, 65536).unwrap();
    peer.write_all(&wire).await.unwrap();
    drop(peer);

    assert_eq!(received.await.unwrap(), b"GET /");

    relay.stop().await;
    kem.stop().await;
    let stats = relay.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_listener_port_reusable_after_stop() {
    let store = Arc::new(SecretStore::new());
    let mut first = kem_listener(&store).await;
    let port = first.local_addr().port();

    // Leave a connection open across the stop
    let _client = TcpStream::connect(first.local_addr()).await.unwrap();
    first.stop().await;

    let mut second = Listener::start(
        ListenerConfig::new("KEM", LOCALHOST, port),
        Arc::new(KemResponder::new(Arc::clone(&store), Duration::from_secs(5))),
    )
    .await
    .unwrap();
    assert_eq!(second.local_addr().port(), port);
    second.stop().await;
}

#[tokio::test]
async fn test_idle_listener_stops_promptly() {
    let store = Arc::new(SecretStore::new());
    let mut listener = relay_listener(&store).await;
    let port = listener.local_addr().port();

    // Accept loop is parked in accept() with nothing connected
    tokio::time::sleep(Duration::from_millis(50)).await;
    tokio::time::timeout(Duration::from_millis(500), listener.stop())
        .await
        .expect("stop should not wait for the grace period");

    let rebound = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    assert_eq!(rebound.local_addr().unwrap().port(), port);
}

#[tokio::test]
async fn test_concurrent_negotiations_share_one_handshake() {
    let responder_store = Arc::new(SecretStore::new());
    let mut kem = kem_listener(&responder_store).await;

    let client = Arc::new(HandshakeClient::new(
        Arc::new(SecretStore::new()),
        KemAlgorithm::MlKem1024,
        kem.local_addr().port(),
    ));

    let attempts = (0..8).map(|_| {
        let client = Arc::clone(&client);
        async move { client.negotiate(LOCALHOST).await.unwrap() }
    });
    let secrets = join_all(attempts).await;

    let first = secrets[0].secret().to_vec();
    assert!(secrets.iter().all(|s| s.secret() == first.as_slice()));
    assert!(secrets.iter().all(|s| s.session_id() == secrets[0].session_id()));

    kem.stop().await;
    assert_eq!(kem.stats().accepted, 1);
    assert_eq!(kem.stats().completed, 1);
}
