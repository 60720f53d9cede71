//! Negotiated secret cache
//!
//! Maps a peer address to the shared secret negotiated with it. Entries are
//! immutable; a re-negotiation replaces the whole entry.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use lru::LruCache;
use tracing::debug;
use uuid::Uuid;

use crate::config::SecretsConfig;
use crate::crypto::{KemAlgorithm, RelayCipher};
use crate::error::{Error, Result};

/// A shared secret negotiated with one peer
pub struct PeerSecret {
    peer: IpAddr,
    secret: Vec<u8>,
    algorithm: KemAlgorithm,
    negotiated_at: DateTime<Utc>,
    session_id: Uuid,
    cipher: RelayCipher,
}

impl PeerSecret {
    /// Wrap freshly negotiated secret bytes. Fails if the length does not
    /// match what the algorithm produces.
    pub fn new(peer: IpAddr, algorithm: KemAlgorithm, secret: Vec<u8>) -> Result<Self> {
        if secret.len() != algorithm.shared_secret_len() {
            return Err(Error::Crypto(format!(
                "{} shared secret must be {} bytes, got {}",
                algorithm,
                algorithm.shared_secret_len(),
                secret.len()
            )));
        }
        let cipher = RelayCipher::from_shared_secret(&secret)?;
        Ok(Self {
            peer,
            secret,
            algorithm,
            negotiated_at: Utc::now(),
            session_id: Uuid::new_v4(),
            cipher,
        })
    }

    pub fn peer(&self) -> IpAddr {
        self.peer
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    pub fn algorithm(&self) -> KemAlgorithm {
        self.algorithm
    }

    pub fn negotiated_at(&self) -> DateTime<Utc> {
        self.negotiated_at
    }

    /// Unique per negotiation; distinguishes a re-negotiated entry
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Relay cipher keyed from this secret
    pub fn cipher(&self) -> &RelayCipher {
        &self.cipher
    }
}

impl fmt::Debug for PeerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSecret")
            .field("peer", &self.peer)
            .field("algorithm", &self.algorithm)
            .field("negotiated_at", &self.negotiated_at)
            .field("session_id", &self.session_id)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Storage behind a [`SecretStore`]
pub trait SecretBackend: Send + Sync {
    fn get(&self, peer: &IpAddr) -> Option<Arc<PeerSecret>>;

    fn insert(&self, secret: Arc<PeerSecret>);

    fn contains(&self, peer: &IpAddr) -> bool;

    fn len(&self) -> usize;
}

/// Plain map, grows with the number of peers
#[derive(Default)]
pub struct UnboundedBackend {
    secrets: RwLock<HashMap<IpAddr, Arc<PeerSecret>>>,
}

impl SecretBackend for UnboundedBackend {
    fn get(&self, peer: &IpAddr) -> Option<Arc<PeerSecret>> {
        let secrets = self.secrets.read().unwrap_or_else(|e| e.into_inner());
        secrets.get(peer).cloned()
    }

    fn insert(&self, secret: Arc<PeerSecret>) {
        let mut secrets = self.secrets.write().unwrap_or_else(|e| e.into_inner());
        secrets.insert(secret.peer(), secret);
    }

    fn contains(&self, peer: &IpAddr) -> bool {
        let secrets = self.secrets.read().unwrap_or_else(|e| e.into_inner());
        secrets.contains_key(peer)
    }

    fn len(&self) -> usize {
        self.secrets.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Bounded cache evicting the least recently used peer
pub struct LruBackend {
    secrets: Mutex<LruCache<IpAddr, Arc<PeerSecret>>>,
}

impl LruBackend {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            secrets: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl SecretBackend for LruBackend {
    fn get(&self, peer: &IpAddr) -> Option<Arc<PeerSecret>> {
        let mut secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        secrets.get(peer).cloned()
    }

    fn insert(&self, secret: Arc<PeerSecret>) {
        let peer = secret.peer();
        let mut secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((evicted, _)) = secrets.push(peer, secret) {
            if evicted != peer {
                debug!("Evicted secret for {}", evicted);
            }
        }
    }

    fn contains(&self, peer: &IpAddr) -> bool {
        let secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        secrets.contains(peer)
    }

    fn len(&self) -> usize {
        self.secrets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Per-peer secret cache shared by the engine, the handshake client and the
/// listeners.
pub struct SecretStore {
    backend: Box<dyn SecretBackend>,
    /// One gate per peer; holders of a gate are the only ones negotiating
    /// with that peer.
    gates: GateMap,
}

impl SecretStore {
    /// Unbounded store
    pub fn new() -> Self {
        Self::with_backend(Box::new(UnboundedBackend::default()))
    }

    /// LRU store holding at most `capacity` peers
    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self::with_backend(Box::new(LruBackend::new(capacity)))
    }

    pub fn with_backend(backend: Box<dyn SecretBackend>) -> Self {
        Self {
            backend,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &SecretsConfig) -> Self {
        match config.capacity.and_then(NonZeroUsize::new) {
            Some(capacity) => Self::with_capacity(capacity),
            None => Self::new(),
        }
    }

    pub fn get(&self, peer: &IpAddr) -> Option<Arc<PeerSecret>> {
        self.backend.get(peer)
    }

    /// Store a secret under its peer address. Last write wins.
    pub fn put(&self, secret: PeerSecret) -> Arc<PeerSecret> {
        let secret = Arc::new(secret);
        debug!(
            "Stored {} secret for {} (session {})",
            secret.algorithm(),
            secret.peer(),
            secret.session_id()
        );
        self.backend.insert(Arc::clone(&secret));
        secret
    }

    pub fn has(&self, peer: &IpAddr) -> bool {
        self.backend.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gate serializing handshakes with `peer`. The entry is dropped again
    /// once the last holder lets go.
    pub(crate) fn handshake_gate(&self, peer: IpAddr) -> HandshakeGate<'_> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        HandshakeGate {
            gates: &self.gates,
            peer,
            gate: Arc::clone(gates.entry(peer).or_default()),
        }
    }

    #[cfg(test)]
    pub(crate) fn gate_count(&self) -> usize {
        self.gates.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

type GateMap = Mutex<HashMap<IpAddr, Arc<tokio::sync::Mutex<()>>>>;

/// A claim on one peer's handshake gate
pub(crate) struct HandshakeGate<'a> {
    gates: &'a GateMap,
    peer: IpAddr,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Deref for HandshakeGate<'_> {
    type Target = tokio::sync::Mutex<()>;

    fn deref(&self) -> &Self::Target {
        &self.gate
    }
}

impl Drop for HandshakeGate<'_> {
    fn drop(&mut self) {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        // New claims clone under this lock, so a count of 2 (map + us) is final
        if Arc::strong_count(&self.gate) == 2 {
            if let Some(entry) = gates.get(&self.peer) {
                if Arc::ptr_eq(entry, &self.gate) {
                    gates.remove(&self.peer);
                }
            }
        }
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(peer: &str, fill: u8) -> PeerSecret {
        PeerSecret::new(peer.parse().unwrap(), KemAlgorithm::MlKem512, vec![fill; 32]).unwrap()
    }

    #[test]
    fn test_peer_secret_length_checked() {
        let peer: IpAddr = "10.118.0.5".parse().unwrap();
        assert!(PeerSecret::new(peer, KemAlgorithm::MlKem512, vec![0; 16]).is_err());
        assert!(PeerSecret::new(peer, KemAlgorithm::MlKem1024, vec![0; 32]).is_ok());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let s = secret("10.118.0.5", 0xAB);
        let printed = format!("{:?}", s);
        assert!(printed.contains("REDACTED"));
        assert!(!printed.contains("[171, 171"));
    }

    #[test]
    fn test_last_write_wins() {
        let store = SecretStore::new();
        let peer: IpAddr = "10.118.0.5".parse().unwrap();
        assert!(!store.has(&peer));
        assert!(store.get(&peer).is_none());

        let first = store.put(secret("10.118.0.5", 1));
        assert!(store.has(&peer));
        assert_eq!(store.get(&peer).unwrap().session_id(), first.session_id());
        assert_eq!(store.get(&peer).unwrap().secret(), &[1u8; 32]);

        let second = store.put(secret("10.118.0.5", 2));
        assert_ne!(first.session_id(), second.session_id());
        assert_eq!(store.get(&peer).unwrap().secret(), &[2u8; 32]);
        assert_eq!(store.len(), 1);

        // The old handle stays intact
        assert_eq!(first.secret(), &[1u8; 32]);
    }

    #[test]
    fn test_lru_evicts_oldest() {
        let store = SecretStore::with_capacity(NonZeroUsize::new(2).unwrap());
        store.put(secret("10.118.0.1", 1));
        store.put(secret("10.118.0.2", 2));

        // Touch .1 so .2 becomes the eviction candidate
        assert!(store.get(&"10.118.0.1".parse().unwrap()).is_some());
        store.put(secret("10.118.0.3", 3));

        assert_eq!(store.len(), 2);
        assert!(store.has(&"10.118.0.1".parse().unwrap()));
        assert!(!store.has(&"10.118.0.2".parse().unwrap()));
        assert!(store.has(&"10.118.0.3".parse().unwrap()));
    }

    #[test]
    fn test_from_config() {
        let bounded = SecretStore::from_config(&SecretsConfig { capacity: Some(1) });
        bounded.put(secret("10.118.0.1", 1));
        bounded.put(secret("10.118.0.2", 2));
        assert_eq!(bounded.len(), 1);

        let unbounded = SecretStore::from_config(&SecretsConfig::default());
        unbounded.put(secret("10.118.0.1", 1));
        unbounded.put(secret("10.118.0.2", 2));
        assert_eq!(unbounded.len(), 2);
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let store = Arc::new(SecretStore::new());
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let peer = format!("10.118.0.{}", i % 2);
                    for _ in 0..50 {
                        store.put(secret(&peer, i));
                        let got = store.get(&peer.parse().unwrap()).unwrap();
                        // Never a torn value: all 32 bytes come from one writer
                        assert!(got.secret().iter().all(|b| *b == got.secret()[0]));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_gate_is_shared_per_peer() {
        let store = SecretStore::new();
        let a: IpAddr = "10.118.0.1".parse().unwrap();
        let b: IpAddr = "10.118.0.2".parse().unwrap();

        let gate = store.handshake_gate(a);
        let _held = gate.lock().await;
        assert!(store.handshake_gate(a).try_lock().is_err());
        assert!(store.handshake_gate(b).try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_gates_released_after_use() {
        let store = SecretStore::with_capacity(NonZeroUsize::new(2).unwrap());
        for i in 0..5000u32 {
            let peer = IpAddr::from(std::net::Ipv4Addr::from(0x0a00_0000 + i));
            let gate = store.handshake_gate(peer);
            let _held = gate.lock().await;
        }
        assert_eq!(store.gate_count(), 0);
    }

    #[tokio::test]
    async fn test_gate_kept_while_another_claim_waits() {
        let store = SecretStore::new();
        let peer: IpAddr = "10.118.0.7".parse().unwrap();

        let first = store.handshake_gate(peer);
        let waiting = store.handshake_gate(peer);
        drop(first);
        assert_eq!(store.gate_count(), 1);

        // Still the same gate for a third claim
        let guard = waiting.lock().await;
        assert!(store.handshake_gate(peer).try_lock().is_err());
        drop(guard);
        drop(waiting);
        assert_eq!(store.gate_count(), 0);
    }
}
