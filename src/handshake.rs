//! KEM Handshake
//!
//! One-shot key agreement over TCP. The initiator generates a fresh KEM
//! keypair and sends its encapsulation key; the responder encapsulates
//! against it and answers with the ciphertext. Both ends end up with the
//! same shared secret without it ever crossing the wire.
//!
//! Wire format, both directions:
//!
//! ```text
//! +------+-----------+------------+----------------+
//! | type | algorithm | length(BE) | body           |
//! | u8   | u8        | u16        | `length` bytes |
//! +------+-----------+------------+----------------+
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::config::QuantdogConfig;
use crate::crypto::{KemAlgorithm, KemKeyPair};
use crate::error::HandshakeError;
use crate::secrets::{PeerSecret, SecretStore};

/// Peers whose last handshake state is remembered
const STATE_HISTORY: NonZeroUsize = match NonZeroUsize::new(4096) {
    Some(n) => n,
    None => panic!("state history must not be empty"),
};

/// Size of the fixed message header
pub const HEADER_LEN: usize = 4;

const MSG_HELLO: u8 = 0x01;
const MSG_REPLY: u8 = 0x02;

type HandshakeResult<T> = std::result::Result<T, HandshakeError>;

/// Handshake message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Initiator -> responder, body is the encapsulation key
    Hello,
    /// Responder -> initiator, body is the KEM ciphertext
    Reply,
}

impl MessageKind {
    fn to_u8(self) -> u8 {
        match self {
            MessageKind::Hello => MSG_HELLO,
            MessageKind::Reply => MSG_REPLY,
        }
    }

    fn from_u8(b: u8) -> Option<Self> {
        match b {
            MSG_HELLO => Some(MessageKind::Hello),
            MSG_REPLY => Some(MessageKind::Reply),
            _ => None,
        }
    }

    fn body_len(self, algorithm: KemAlgorithm) -> usize {
        match self {
            MessageKind::Hello => algorithm.encapsulation_key_len(),
            MessageKind::Reply => algorithm.ciphertext_len(),
        }
    }
}

/// A framed handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KemMessage {
    pub kind: MessageKind,
    pub algorithm: KemAlgorithm,
    pub body: Vec<u8>,
}

impl KemMessage {
    pub fn hello(algorithm: KemAlgorithm, encapsulation_key: &[u8]) -> Self {
        Self {
            kind: MessageKind::Hello,
            algorithm,
            body: encapsulation_key.to_vec(),
        }
    }

    pub fn reply(algorithm: KemAlgorithm, ciphertext: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Reply,
            algorithm,
            body: ciphertext,
        }
    }

    /// Serialize header and body
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.body.len());
        buf.push(self.kind.to_u8());
        buf.push(self.algorithm.wire_id());
        buf.extend_from_slice(&(self.body.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Read one message. The body length must be exactly what the named
    /// algorithm uses for that message kind.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> HandshakeResult<Self> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let kind = MessageKind::from_u8(header[0]).ok_or_else(|| {
            HandshakeError::Protocol(format!("unknown message type 0x{:02x}", header[0]))
        })?;
        let algorithm = KemAlgorithm::from_wire_id(header[1]).ok_or_else(|| {
            HandshakeError::Protocol(format!("unsupported KEM algorithm id {}", header[1]))
        })?;
        let length = u16::from_be_bytes([header[2], header[3]]) as usize;
        let expected = kind.body_len(algorithm);
        if length != expected {
            return Err(HandshakeError::Protocol(format!(
                "{:?} for {} must carry {} bytes, header says {}",
                kind, algorithm, expected, length
            )));
        }

        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;

        Ok(Self { kind, algorithm, body })
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> HandshakeResult<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Progress of a handshake with one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    Idle,
    Connecting,
    KeyExchangeInFlight,
    Complete,
    Failed,
}

impl HandshakeState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: HandshakeState) -> bool {
        use HandshakeState::*;
        matches!(
            (self, next),
            (Idle | Complete | Failed, Connecting)
                | (Connecting, KeyExchangeInFlight)
                | (Connecting, Failed)
                | (KeyExchangeInFlight, Complete)
                | (KeyExchangeInFlight, Failed)
        )
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::Idle => write!(f, "idle"),
            HandshakeState::Connecting => write!(f, "connecting"),
            HandshakeState::KeyExchangeInFlight => write!(f, "key-exchange"),
            HandshakeState::Complete => write!(f, "complete"),
            HandshakeState::Failed => write!(f, "failed"),
        }
    }
}

/// Opens the transport connection to a peer's handshake port
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, peer: IpAddr, port: u16) -> std::io::Result<TcpStream>;
}

/// Dials the peer directly
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, peer: IpAddr, port: u16) -> std::io::Result<TcpStream> {
        TcpStream::connect(SocketAddr::new(peer, port)).await
    }
}

/// Initiating side of the KEM handshake
pub struct HandshakeClient {
    store: Arc<SecretStore>,
    algorithm: KemAlgorithm,
    port: u16,
    connect_timeout: Duration,
    exchange_timeout: Duration,
    dialer: Arc<dyn Dialer>,
    states: Mutex<LruCache<IpAddr, HandshakeState>>,
}

impl HandshakeClient {
    /// Client with 5 second connect and exchange bounds
    pub fn new(store: Arc<SecretStore>, algorithm: KemAlgorithm, port: u16) -> Self {
        Self {
            store,
            algorithm,
            port,
            connect_timeout: Duration::from_secs(5),
            exchange_timeout: Duration::from_secs(5),
            dialer: Arc::new(TcpDialer),
            states: Mutex::new(LruCache::new(STATE_HISTORY)),
        }
    }

    pub fn from_config(config: &QuantdogConfig, store: Arc<SecretStore>) -> crate::Result<Self> {
        Ok(Self::new(store, config.kem_algorithm()?, config.tunnel.kem_port)
            .with_timeouts(config.connect_timeout(), config.exchange_timeout()))
    }

    pub fn with_timeouts(mut self, connect: Duration, exchange: Duration) -> Self {
        self.connect_timeout = connect;
        self.exchange_timeout = exchange;
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn algorithm(&self) -> KemAlgorithm {
        self.algorithm
    }

    pub fn store(&self) -> &Arc<SecretStore> {
        &self.store
    }

    /// Last known handshake state for `peer`
    pub fn state(&self, peer: IpAddr) -> HandshakeState {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.peek(&peer).copied().unwrap_or_default()
    }

    /// Return the secret shared with `peer`, running a handshake if none is
    /// stored yet. Concurrent callers for the same peer share one handshake.
    pub async fn negotiate(&self, peer: IpAddr) -> HandshakeResult<Arc<PeerSecret>> {
        if let Some(secret) = self.store.get(&peer) {
            return Ok(secret);
        }

        let gate = self.store.handshake_gate(peer);
        let _guard = gate.lock().await;

        // Someone else may have finished while we waited
        if let Some(secret) = self.store.get(&peer) {
            trace!("Reusing secret negotiated concurrently with {}", peer);
            return Ok(secret);
        }

        let secret = self.exchange(peer).await?;
        Ok(self.store.put(secret))
    }

    /// Replace the secret shared with `peer` with a freshly negotiated one.
    /// Callers that queued behind an in-progress renegotiation get its result.
    pub async fn renegotiate(&self, peer: IpAddr) -> HandshakeResult<Arc<PeerSecret>> {
        let previous = self.store.get(&peer).map(|s| s.session_id());

        let gate = self.store.handshake_gate(peer);
        let _guard = gate.lock().await;

        if let Some(current) = self.store.get(&peer) {
            if Some(current.session_id()) != previous {
                return Ok(current);
            }
        }

        let secret = self.exchange(peer).await?;
        info!("Renegotiated {} secret with {}", secret.algorithm(), peer);
        Ok(self.store.put(secret))
    }

    /// Run one handshake attempt. Caller holds the peer's gate.
    async fn exchange(&self, peer: IpAddr) -> HandshakeResult<PeerSecret> {
        self.transition(peer, HandshakeState::Connecting);
        let mut attempt = Attempt { client: self, peer, settled: false };
        let result = self.run_exchange(peer).await;
        attempt.settled = true;

        match &result {
            Ok(secret) => {
                self.transition(peer, HandshakeState::Complete);
                info!(
                    "Negotiated {} secret with {} (session {})",
                    secret.algorithm(),
                    peer,
                    secret.session_id()
                );
            }
            Err(e) => {
                self.transition(peer, HandshakeState::Failed);
                if e.skips_tunnel() {
                    debug!("No KEM responder at {}: {}", peer, e);
                } else {
                    warn!("Handshake with {} failed: {}", peer, e);
                }
            }
        }

        result
    }

    async fn run_exchange(&self, peer: IpAddr) -> HandshakeResult<PeerSecret> {
        let mut stream = match timeout(self.connect_timeout, self.dialer.dial(peer, self.port)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(HandshakeError::Transport(e)),
            Err(_) => {
                return Err(HandshakeError::PeerUnreachable {
                    timeout_ms: self.connect_timeout.as_millis() as u64,
                })
            }
        };
        let _ = stream.set_nodelay(true);

        self.transition(peer, HandshakeState::KeyExchangeInFlight);

        // Fresh keypair per attempt, dropped with this future
        let keypair = KemKeyPair::generate(self.algorithm);
        let hello = KemMessage::hello(self.algorithm, keypair.public_key());

        let reply = match timeout(self.exchange_timeout, async {
            hello.write(&mut stream).await?;
            KemMessage::read(&mut stream).await
        })
        .await
        {
            Ok(reply) => reply?,
            Err(_) => {
                return Err(HandshakeError::PeerUnreachable {
                    timeout_ms: self.exchange_timeout.as_millis() as u64,
                })
            }
        };

        if reply.kind != MessageKind::Reply {
            return Err(HandshakeError::Protocol(format!(
                "expected Reply, got {:?}",
                reply.kind
            )));
        }
        if reply.algorithm != self.algorithm {
            return Err(HandshakeError::Protocol(format!(
                "responder answered with {}, asked for {}",
                reply.algorithm, self.algorithm
            )));
        }

        let shared = keypair
            .decapsulate(&reply.body)
            .map_err(|e| HandshakeError::CryptoFailure(e.to_string()))?;
        PeerSecret::new(peer, self.algorithm, shared)
            .map_err(|e| HandshakeError::CryptoFailure(e.to_string()))
    }

    fn transition(&self, peer: IpAddr, next: HandshakeState) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        // An evicted entry says nothing about the attempt in progress
        if let Some(current) = states.peek(&peer).copied() {
            debug_assert!(
                current.can_transition_to(next),
                "illegal handshake transition {} -> {}",
                current,
                next
            );
            trace!("Handshake {}: {} -> {}", peer, current, next);
        }
        states.put(peer, next);
    }
}

/// Marks an attempt failed if its future is dropped before it settles
struct Attempt<'a> {
    client: &'a HandshakeClient,
    peer: IpAddr,
    settled: bool,
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!("Handshake with {} cancelled", self.peer);
            self.client.transition(self.peer, HandshakeState::Failed);
        }
    }
}

/// Responding side: read a Hello, encapsulate against its key, answer with
/// the ciphertext and store the resulting secret for `peer`.
pub async fn respond<S>(stream: &mut S, peer: IpAddr, store: &SecretStore) -> HandshakeResult<Arc<PeerSecret>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = KemMessage::read(stream).await?;
    if hello.kind != MessageKind::Hello {
        return Err(HandshakeError::Protocol(format!(
            "expected Hello, got {:?}",
            hello.kind
        )));
    }

    let algorithm = hello.algorithm;
    let (ciphertext, shared) = algorithm
        .encapsulate(&hello.body)
        .map_err(|e| HandshakeError::CryptoFailure(e.to_string()))?;

    let secret = PeerSecret::new(peer, algorithm, shared)
        .map_err(|e| HandshakeError::CryptoFailure(e.to_string()))?;

    // Stored before the reply leaves so a relay right behind it finds it
    let secret = store.put(secret);
    KemMessage::reply(algorithm, ciphertext).write(stream).await?;
    Ok(secret)
}
