//! Outbound Tunnel Engine
//!
//! Reads packets captured by the virtual interface, negotiates a secret with
//! each new destination, seals TCP payloads into relay frames and re-injects
//! the rewritten packet towards the local relay. Packets are handled one at
//! a time in capture order.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::config::QuantdogConfig;
use crate::error::{Error, HandshakeError, Result};
use crate::handshake::HandshakeClient;
use crate::packet::{self, Mutations};
use crate::relay::RelayFrame;

/// Source and sink of raw IP packets
#[async_trait]
pub trait PacketDevice: Send + Sync {
    /// Read one packet into `buf`, returns its length
    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Write one packet
    async fn send(&self, packet: &[u8]) -> std::io::Result<usize>;
}

/// What happened to a captured packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Sealed and rewritten towards the relay
    Tunneled(Vec<u8>),
    /// Not a payload-bearing TCP packet for a remote peer
    Passthrough,
    /// Destination runs no KEM responder
    Unreachable,
    /// Destination was recently unreachable, handshake skipped
    BackedOff,
}

/// Engine counters
#[derive(Debug, Default)]
pub struct EngineStats {
    packets_read: AtomicU64,
    tunneled: AtomicU64,
    passthrough: AtomicU64,
    malformed: AtomicU64,
    peer_unreachable: AtomicU64,
    backed_off: AtomicU64,
    handshake_failures: AtomicU64,
    crypto_failures: AtomicU64,
    inject_failures: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub packets_read: u64,
    pub tunneled: u64,
    pub passthrough: u64,
    pub malformed: u64,
    pub peer_unreachable: u64,
    pub backed_off: u64,
    pub handshake_failures: u64,
    pub crypto_failures: u64,
    pub inject_failures: u64,
}

impl EngineStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            packets_read: self.packets_read.load(Ordering::Relaxed),
            tunneled: self.tunneled.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            peer_unreachable: self.peer_unreachable.load(Ordering::Relaxed),
            backed_off: self.backed_off.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            crypto_failures: self.crypto_failures.load(Ordering::Relaxed),
            inject_failures: self.inject_failures.load(Ordering::Relaxed),
        }
    }
}

/// The outbound packet loop
pub struct TunnelEngine {
    handshake: Arc<HandshakeClient>,
    relay: SocketAddrV4,
    kem_port: u16,
    max_packet_size: usize,
    max_frame_len: usize,
    unreachable_backoff: Duration,
    /// Destinations that recently failed with PeerUnreachable
    unreachable: Mutex<HashMap<Ipv4Addr, Instant>>,
    stats: Arc<EngineStats>,
}

impl TunnelEngine {
    pub fn new(config: &QuantdogConfig, handshake: Arc<HandshakeClient>) -> Self {
        Self {
            handshake,
            relay: SocketAddrV4::new(config.tunnel.relay_address, config.tunnel.relay_port),
            kem_port: config.tunnel.kem_port,
            max_packet_size: config.tunnel.max_packet_size,
            max_frame_len: config.listener.max_frame_len,
            unreachable_backoff: config.unreachable_backoff(),
            unreachable: Mutex::new(HashMap::new()),
            stats: Arc::new(EngineStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    pub fn relay_address(&self) -> SocketAddrV4 {
        self.relay
    }

    /// Run until `shutdown` flips to true (or its sender goes away) or the
    /// device fails. Per-packet failures are logged and the packet dropped.
    pub async fn run<D>(&self, device: &D, mut shutdown: watch::Receiver<bool>) -> Result<()>
    where
        D: PacketDevice + ?Sized,
    {
        info!("Tunnel engine started, relaying to {}", self.relay);
        let mut buf = vec![0u8; self.max_packet_size];

        loop {
            if *shutdown.borrow() {
                break;
            }

            let len = tokio::select! {
                result = device.recv(&mut buf) => match result {
                    Ok(len) => len,
                    Err(e) => {
                        warn!("Virtual interface read failed: {}", e);
                        return Err(Error::Io(e));
                    }
                },
                _ = shutdown_requested(&mut shutdown) => break,
            };
            if len == 0 {
                continue;
            }

            let span = tracing::debug_span!(
                "packet",
                request_id = %Uuid::new_v4(),
                src = tracing::field::Empty,
                dst = tracing::field::Empty,
                dst_port = tracing::field::Empty,
            );
            let outcome = tokio::select! {
                outcome = self.process_packet(&buf[..len]).instrument(span.clone()) => outcome,
                _ = shutdown_requested(&mut shutdown) => break,
            };

            match outcome {
                Ok(PacketOutcome::Tunneled(rewritten)) => {
                    if let Err(e) = device.send(&rewritten).instrument(span).await {
                        EngineStats::bump(&self.stats.inject_failures);
                        warn!("Failed to re-inject tunneled packet: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e @ Error::MalformedPacket(_)) => debug!(parent: &span, "Dropped packet: {}", e),
                Err(e) => warn!(parent: &span, "Dropped packet: {}", e),
            }
        }

        info!("Tunnel engine stopped");
        Ok(())
    }

    /// Process a single captured packet
    pub async fn process_packet(&self, bytes: &[u8]) -> Result<PacketOutcome> {
        EngineStats::bump(&self.stats.packets_read);

        let view = match packet::parse(bytes) {
            Ok(view) => view,
            Err(e) => {
                EngineStats::bump(&self.stats.malformed);
                return Err(e);
            }
        };

        let span = tracing::Span::current();
        span.record("src", tracing::field::display(view.source()));
        span.record("dst", tracing::field::display(view.destination()));

        let destination = match view.destination_socket() {
            Some(dst) if view.is_tcp() && !view.payload().is_empty() && self.is_tunnelable(dst) => dst,
            _ => {
                EngineStats::bump(&self.stats.passthrough);
                debug!(
                    "Passthrough {:?} {} -> {}",
                    view.protocol(),
                    view.source(),
                    view.destination()
                );
                return Ok(PacketOutcome::Passthrough);
            }
        };
        span.record("dst_port", destination.port());

        if self.backing_off(destination.ip()) {
            EngineStats::bump(&self.stats.backed_off);
            debug!("Skipping {}, recently unreachable", destination.ip());
            return Ok(PacketOutcome::BackedOff);
        }

        let peer = IpAddr::V4(*destination.ip());
        let secret = match self.handshake.negotiate(peer).await {
            Ok(secret) => secret,
            Err(e) if e.skips_tunnel() => {
                EngineStats::bump(&self.stats.peer_unreachable);
                self.mark_unreachable(*destination.ip());
                debug!("Not tunneling to {}: {}", peer, e);
                return Ok(PacketOutcome::Unreachable);
            }
            Err(e) => {
                EngineStats::bump(&self.stats.handshake_failures);
                if matches!(e, HandshakeError::CryptoFailure(_)) {
                    EngineStats::bump(&self.stats.crypto_failures);
                }
                return Err(Error::Handshake { peer, source: e });
            }
        };

        let frame = RelayFrame::new(destination, view.payload().to_vec());
        let wire = frame.to_wire(&secret, self.max_frame_len).map_err(|e| {
            EngineStats::bump(&self.stats.crypto_failures);
            e
        })?;

        let mutations = Mutations::new()
            .destination(*self.relay.ip())
            .destination_port(self.relay.port())
            .payload(&wire);
        let rewritten = packet::rewrite(&view, &mutations)?;

        EngineStats::bump(&self.stats.tunneled);
        debug!(
            "Tunneled {} payload bytes to {} as {} byte packet",
            view.payload().len(),
            destination,
            rewritten.len()
        );
        Ok(PacketOutcome::Tunneled(rewritten))
    }

    /// Relay and handshake traffic is never tunneled again
    fn is_tunnelable(&self, dst: SocketAddrV4) -> bool {
        !(dst.ip().is_loopback()
            || *dst.ip() == *self.relay.ip()
            || dst.port() == self.relay.port()
            || dst.port() == self.kem_port)
    }

    fn backing_off(&self, dst: &Ipv4Addr) -> bool {
        if self.unreachable_backoff.is_zero() {
            return false;
        }
        let mut unreachable = self.unreachable.lock().unwrap_or_else(|e| e.into_inner());
        match unreachable.get(dst) {
            Some(since) if since.elapsed() < self.unreachable_backoff => true,
            Some(_) => {
                unreachable.remove(dst);
                false
            }
            None => false,
        }
    }

    fn mark_unreachable(&self, dst: Ipv4Addr) {
        if self.unreachable_backoff.is_zero() {
            return;
        }
        let mut unreachable = self.unreachable.lock().unwrap_or_else(|e| e.into_inner());
        let backoff = self.unreachable_backoff;
        unreachable.retain(|_, since| since.elapsed() < backoff);
        unreachable.insert(dst, Instant::now());
    }
}

/// Resolves once shutdown is requested or the sender is gone
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
