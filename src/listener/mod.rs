//! Inbound Listener Framework
//!
//! A generic TCP accept loop. What happens on each connection is decided by
//! the [`ConnectionHandler`] the listener is started with; the KEM responder
//! and the PQC relay responder are the two handlers shipped with the crate.

pub mod kem;
pub mod relay;

pub use kem::KemResponder;
pub use relay::PqcRelayResponder;

use std::fmt;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::QuantdogConfig;
use crate::engine::shutdown_requested;
use crate::error::{Error, Result};

/// Pause after a transient accept error
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Where and how a listener runs
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub label: String,
    pub bind_address: IpAddr,
    pub port: u16,
    /// Time in-flight handlers get to finish after stop
    pub grace_period: Duration,
}

impl ListenerConfig {
    pub fn new(label: impl Into<String>, bind_address: IpAddr, port: u16) -> Self {
        Self {
            label: label.into(),
            bind_address,
            port,
            grace_period: Duration::from_secs(2),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// KEM responder listener from the application config
    pub fn kem(config: &QuantdogConfig) -> Self {
        Self::new("KEM", config.listener.bind_address, config.tunnel.kem_port)
            .with_grace_period(config.grace_period())
    }

    /// PQC relay listener from the application config
    pub fn relay(config: &QuantdogConfig) -> Self {
        Self::new("PQC relay", config.listener.bind_address, config.tunnel.relay_port)
            .with_grace_period(config.grace_period())
    }

    fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

/// One accepted connection
#[derive(Debug)]
pub struct ConnectionSession {
    pub id: Uuid,
    pub remote: SocketAddr,
    pub stream: TcpStream,
}

impl ConnectionSession {
    /// Remote address with IPv4-mapped IPv6 folded back to IPv4
    pub fn peer(&self) -> IpAddr {
        canonical_ip(self.remote)
    }
}

fn canonical_ip(addr: SocketAddr) -> IpAddr {
    match addr.ip() {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Per-connection protocol
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serve one connection. Errors close only this connection.
    async fn handle(&self, session: ConnectionSession) -> Result<()>;
}

/// Listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Listening,
    Error,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerState::Stopped => write!(f, "stopped"),
            ListenerState::Listening => write!(f, "listening"),
            ListenerState::Error => write!(f, "error"),
        }
    }
}

/// Connection counters
#[derive(Debug, Default)]
pub struct ListenerStats {
    accepted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStatsSnapshot {
    pub accepted: u64,
    pub completed: u64,
    pub failed: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Entry point of the framework
pub struct Listener;

impl Listener {
    /// Bind and start accepting in the background
    pub async fn start(config: ListenerConfig, handler: Arc<dyn ConnectionHandler>) -> Result<ListenerHandle> {
        let address = config.socket_addr();
        let listener = TcpListener::bind(address).await.map_err(|e| Error::Bind {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        let local_addr = listener.local_addr()?;
        info!("{} listener started on {}", config.label, local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(ListenerState::Listening));
        let stats = Arc::new(ListenerStats::default());

        let task = tokio::spawn(accept_loop(
            listener,
            config.clone(),
            handler,
            Arc::clone(&state),
            Arc::clone(&stats),
            shutdown_rx,
        ));

        Ok(ListenerHandle {
            label: config.label,
            local_addr,
            shutdown: shutdown_tx,
            state,
            stats,
            task: Some(task),
        })
    }
}

/// Controls a running listener. Dropping the handle also stops it, without
/// waiting.
pub struct ListenerHandle {
    label: String,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    state: Arc<Mutex<ListenerState>>,
    stats: Arc<ListenerStats>,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> ListenerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop accepting, give in-flight connections the grace period, then
    /// close whatever is left. The socket is released when this returns.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("{} accept loop ended abnormally: {}", self.label, e);
            }
        }
        set_state(&self.state, ListenerState::Stopped);
        info!("{} listener stopped", self.label);
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn set_state(state: &Mutex<ListenerState>, next: ListenerState) {
    *state.lock().unwrap_or_else(|e| e.into_inner()) = next;
}

/// Errors that concern a single pending connection, not the socket
fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    ) || matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM))
}

async fn accept_loop(
    listener: TcpListener,
    config: ListenerConfig,
    handler: Arc<dyn ConnectionHandler>,
    state: Arc<Mutex<ListenerState>>,
    stats: Arc<ListenerStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                reap(&config.label, &stats, joined);
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    stats.accepted.fetch_add(1, Ordering::Relaxed);
                    let _ = stream.set_nodelay(true);
                    let session = ConnectionSession { id: Uuid::new_v4(), remote, stream };
                    let span = tracing::debug_span!(
                        "connection",
                        listener = %config.label,
                        remote = %remote,
                        id = %session.id,
                    );
                    debug!(parent: &span, "Accepted connection");

                    let handler = Arc::clone(&handler);
                    let stats = Arc::clone(&stats);
                    let label = config.label.clone();
                    in_flight.spawn(
                        async move {
                            match handler.handle(session).await {
                                Ok(()) => {
                                    stats.completed.fetch_add(1, Ordering::Relaxed);
                                    debug!("Connection closed");
                                }
                                Err(e) => {
                                    stats.failed.fetch_add(1, Ordering::Relaxed);
                                    warn!("{} connection from {} failed: {}", label, remote, e);
                                }
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) if is_transient(&e) => {
                    warn!("{} accept error: {}", config.label, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                Err(e) => {
                    error!("{} listener failed: {}", config.label, e);
                    set_state(&state, ListenerState::Error);
                    break;
                }
            }
        }
    }

    // Release the port before draining
    drop(listener);

    if !in_flight.is_empty() {
        debug!(
            "{} waiting up to {:?} for {} connection(s)",
            config.label,
            config.grace_period,
            in_flight.len()
        );
        let drained = tokio::time::timeout(config.grace_period, async {
            while let Some(joined) = in_flight.join_next().await {
                reap(&config.label, &stats, joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} closing {} connection(s) after grace period",
                config.label,
                in_flight.len()
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {
                stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
    if *state == ListenerState::Listening {
        *state = ListenerState::Stopped;
    }
}

fn reap(label: &str, stats: &ListenerStats, joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        stats.failed.fetch_add(1, Ordering::Relaxed);
        if e.is_panic() {
            error!("{} connection handler panicked", label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Echo;

    #[async_trait]
    impl ConnectionHandler for Echo {
        async fn handle(&self, mut session: ConnectionSession) -> Result<()> {
            let mut buf = [0u8; 64];
            let n = session.stream.read(&mut buf).await?;
            if &buf[..n] == b"fail" {
                return Err(Error::Frame("told to fail".into()));
            }
            session.stream.write_all(&buf[..n]).await?;
            Ok(())
        }
    }

    /// Holds the connection until aborted
    struct Stall;

    #[async_trait]
    impl ConnectionHandler for Stall {
        async fn handle(&self, _session: ConnectionSession) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn local(label: &str) -> ListenerConfig {
        ListenerConfig::new(label, IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .with_grace_period(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_failures_stay_contained() {
        let mut handle = Listener::start(local("echo"), Arc::new(Echo)).await.unwrap();
        assert_eq!(handle.state(), ListenerState::Listening);

        let mut bad = TcpStream::connect(handle.local_addr()).await.unwrap();
        bad.write_all(b"fail").await.unwrap();
        let mut buf = Vec::new();
        bad.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        let mut good = TcpStream::connect(handle.local_addr()).await.unwrap();
        good.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        good.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(good);

        handle.stop().await;
        let stats = handle.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(handle.state(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_aborts_stalled_connections() {
        let mut handle = Listener::start(local("stall"), Arc::new(Stall)).await.unwrap();
        let _client = TcpStream::connect(handle.local_addr()).await.unwrap();

        // Wait until the connection is accepted
        for _ in 0..50 {
            if handle.stats().accepted == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .expect("stop exceeded grace period");
        assert_eq!(handle.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let handle = Listener::start(local("first"), Arc::new(Echo)).await.unwrap();
        let taken = ListenerConfig::new("second", IpAddr::V4(Ipv4Addr::LOCALHOST), handle.local_addr().port());
        assert!(matches!(
            Listener::start(taken, Arc::new(Echo)).await,
            Err(Error::Bind { .. })
        ));
    }

    #[test]
    fn test_session_peer_unmaps_ipv6() {
        let mapped: SocketAddr = "[::ffff:10.118.0.5]:4000".parse().unwrap();
        let native: IpAddr = "::1".parse().unwrap();
        assert_eq!(canonical_ip(mapped), "10.118.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(canonical_ip(SocketAddr::new(native, 1)), native);
    }
}
