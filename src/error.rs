//! QuantDog Error Types

use std::net::IpAddr;
use thiserror::Error;

/// Result type alias for QuantDog operations
pub type Result<T> = std::result::Result<T, Error>;

/// QuantDog error types
#[derive(Error, Debug)]
pub enum Error {
    // Virtual interface errors (fatal at startup)
    #[error("Virtual interface device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Interface configuration failed: {0}")]
    InterfaceConfig(String),

    // Packet errors
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    // Handshake / secret errors
    #[error("Handshake with {peer} failed: {source}")]
    Handshake {
        peer: IpAddr,
        #[source]
        source: HandshakeError,
    },

    #[error("No shared secret negotiated for peer {0}")]
    SecretNotFound(IpAddr),

    #[error("Crypto error: {0}")]
    Crypto(String),

    // Relay errors
    #[error("Invalid relay frame: {0}")]
    Frame(String),

    // Listener errors
    #[error("Failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error must abort the process when hit during startup
    pub fn is_fatal_startup(&self) -> bool {
        matches!(
            self,
            Error::DeviceUnavailable(_)
                | Error::InterfaceConfig(_)
                | Error::Bind { .. }
                | Error::Config(_)
                | Error::ConfigParse(_)
        )
    }
}

/// Failure of a single KEM handshake attempt
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The peer did not answer within the configured bound. Expected for
    /// destinations that do not run a responder.
    #[error("peer unreachable (no responder within {timeout_ms} ms)")]
    PeerUnreachable { timeout_ms: u64 },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl HandshakeError {
    /// Whether the next packet to the same destination may try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandshakeError::Transport(_) | HandshakeError::Protocol(_))
    }

    /// Whether this outcome means "no tunnel for this peer right now" rather
    /// than something worth surfacing
    pub fn skips_tunnel(&self) -> bool {
        matches!(self, HandshakeError::PeerUnreachable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_classification() {
        assert!(Error::DeviceUnavailable("eperm".into()).is_fatal_startup());
        assert!(Error::InterfaceConfig("ip addr".into()).is_fatal_startup());
        assert!(!Error::MalformedPacket("short".into()).is_fatal_startup());
        assert!(!Error::SecretNotFound("10.0.0.1".parse().unwrap()).is_fatal_startup());
    }

    #[test]
    fn test_handshake_classification() {
        let unreachable = HandshakeError::PeerUnreachable { timeout_ms: 5000 };
        assert!(unreachable.skips_tunnel());
        assert!(!unreachable.is_retryable());

        let transport = HandshakeError::Transport(std::io::ErrorKind::ConnectionReset.into());
        assert!(transport.is_retryable());
        assert!(!transport.skips_tunnel());

        let crypto = HandshakeError::CryptoFailure("decapsulation".into());
        assert!(!crypto.is_retryable());
    }
}
