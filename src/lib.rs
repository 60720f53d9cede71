//! QuantDog - Transparent Post-Quantum Tunneling Client
//!
//! Captures outbound IP traffic on a virtual interface, agrees a shared
//! secret with each destination over a post-quantum KEM handshake and
//! carries TCP payloads to a relay sealed under that secret.
//!
//! # Architecture
//!
//! - [`tun`] owns the virtual interface
//! - [`engine`] is the sequential outbound packet loop
//! - [`handshake`] negotiates secrets (ML-KEM), [`secrets`] caches them
//! - [`packet`] parses and rewrites IPv4/TCP/UDP packets
//! - [`relay`] defines the sealed frame carried to the relay port
//! - [`listener`] runs the KEM responder and the PQC relay responder

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod packet;
pub mod relay;
pub mod secrets;
pub mod tun;

pub use config::QuantdogConfig;
pub use error::{Error, HandshakeError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::QuantdogConfig;
    pub use crate::crypto::KemAlgorithm;
    pub use crate::engine::{PacketDevice, TunnelEngine};
    pub use crate::error::{Error, HandshakeError, Result};
    pub use crate::handshake::{HandshakeClient, HandshakeState};
    pub use crate::listener::{KemResponder, Listener, ListenerConfig, ListenerHandle, PqcRelayResponder};
    pub use crate::packet::{Mutations, PacketView};
    pub use crate::secrets::{PeerSecret, SecretStore};
}
