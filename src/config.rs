//! QuantDog Configuration
//!
//! Configuration structures for the tunneling client, its virtual interface
//! and the inbound listeners. Loaded from TOML, then overridden by a small set
//! of environment variables.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use crate::crypto::KemAlgorithm;

/// Main QuantDog configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QuantdogConfig {
    /// Virtual interface configuration
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Outbound tunnel configuration
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Inbound listener configuration
    #[serde(default)]
    pub listener: ListenerSettings,

    /// Secret cache configuration
    #[serde(default)]
    pub secrets: SecretsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Virtual interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// TUN device name
    #[serde(default = "default_interface")]
    pub name: String,

    /// Local address assigned to the device
    #[serde(default = "default_address")]
    pub address: Ipv4Addr,

    /// Prefix length of the local address
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,

    /// Broadcast address
    #[serde(default = "default_broadcast")]
    pub broadcast: Ipv4Addr,

    /// Tunnel peer subnet routed through the device (CIDR)
    #[serde(default = "default_peer_subnet")]
    pub peer_subnet: String,

    /// Tunnel gateway address
    #[serde(default = "default_gateway")]
    pub gateway: Ipv4Addr,

    /// Install a default route via the gateway
    #[serde(default = "default_true")]
    pub default_route: bool,

    /// MTU for the device
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

/// Outbound tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Maximum size of a captured packet
    #[serde(default = "default_packet_size")]
    pub max_packet_size: usize,

    /// Loopback address of the local relay
    #[serde(default = "default_relay_address")]
    pub relay_address: Ipv4Addr,

    /// PQC relay port
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,

    /// KEM handshake port
    #[serde(default = "default_kem_port")]
    pub kem_port: u16,

    /// KEM algorithm identifier
    #[serde(default = "default_kem_algorithm")]
    pub kem_algorithm: String,

    /// Handshake connect timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Handshake reply timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub exchange_timeout_ms: u64,

    /// Seconds to skip handshakes to a peer after it was unreachable (0 = never skip)
    #[serde(default = "default_unreachable_backoff")]
    pub unreachable_backoff_secs: u64,
}

/// Inbound listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    /// Address both listeners bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Run the KEM responder
    #[serde(default = "default_true")]
    pub enable_kem: bool,

    /// Run the PQC relay responder
    #[serde(default = "default_true")]
    pub enable_relay: bool,

    /// Time in-flight connections get to finish on stop
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Per-read timeout on accepted connections
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    /// Largest relay frame accepted
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Connect timeout when forwarding relayed plaintext
    #[serde(default = "default_timeout_ms")]
    pub forward_connect_timeout_ms: u64,
}

/// Secret cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecretsConfig {
    /// Bound the cache to this many peers (LRU). Unbounded when absent.
    #[serde(default)]
    pub capacity: Option<usize>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_interface() -> String {
    "tunqd".to_string()
}

fn default_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 117, 0, 2)
}

fn default_prefix_len() -> u8 {
    24
}

fn default_broadcast() -> Ipv4Addr {
    Ipv4Addr::new(10, 117, 0, 255)
}

fn default_peer_subnet() -> String {
    "10.118.0.0/24".to_string()
}

fn default_gateway() -> Ipv4Addr {
    Ipv4Addr::new(10, 117, 0, 1)
}

fn default_true() -> bool {
    true
}

fn default_mtu() -> u16 {
    1500
}

fn default_packet_size() -> usize {
    1500
}

fn default_relay_address() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

fn default_relay_port() -> u16 {
    11777
}

fn default_kem_port() -> u16 {
    11778
}

fn default_kem_algorithm() -> String {
    KemAlgorithm::default().name().to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_unreachable_backoff() -> u64 {
    30
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_grace_period_ms() -> u64 {
    2000
}

fn default_io_timeout_ms() -> u64 {
    30_000
}

fn default_max_frame_len() -> usize {
    65536
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: default_interface(),
            address: default_address(),
            prefix_len: default_prefix_len(),
            broadcast: default_broadcast(),
            peer_subnet: default_peer_subnet(),
            gateway: default_gateway(),
            default_route: true,
            mtu: default_mtu(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_packet_size: default_packet_size(),
            relay_address: default_relay_address(),
            relay_port: default_relay_port(),
            kem_port: default_kem_port(),
            kem_algorithm: default_kem_algorithm(),
            connect_timeout_ms: default_timeout_ms(),
            exchange_timeout_ms: default_timeout_ms(),
            unreachable_backoff_secs: default_unreachable_backoff(),
        }
    }
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            enable_kem: true,
            enable_relay: true,
            grace_period_ms: default_grace_period_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            max_frame_len: default_max_frame_len(),
            forward_connect_timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl QuantdogConfig {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: QuantdogConfig = toml::from_str(&content)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: QuantdogConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `QUANTDOG_*` overrides. The lookup is injected so tests don't
    /// have to touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> crate::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> crate::Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| crate::Error::Config(format!("{} has invalid value '{}'", key, value)))
        }

        if let Some(v) = lookup("QUANTDOG_PACKET_LENGTH") {
            self.tunnel.max_packet_size = parse("QUANTDOG_PACKET_LENGTH", &v)?;
        }
        if let Some(v) = lookup("QUANTDOG_PQC_PORT") {
            self.tunnel.relay_port = parse("QUANTDOG_PQC_PORT", &v)?;
        }
        if let Some(v) = lookup("QUANTDOG_KEM_PORT") {
            self.tunnel.kem_port = parse("QUANTDOG_KEM_PORT", &v)?;
        }
        if let Some(v) = lookup("QUANTDOG_KEMALG") {
            self.tunnel.kem_algorithm = v.trim().to_string();
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.interface.name.is_empty() || self.interface.name.len() > 15 {
            return Err(crate::Error::Config(
                "interface.name must be 1-15 characters".into(),
            ));
        }

        if self.interface.prefix_len > 32 {
            return Err(crate::Error::Config("interface.prefix_len must be <= 32".into()));
        }

        parse_cidr(&self.interface.peer_subnet)?;

        if self.tunnel.max_packet_size < 20 || self.tunnel.max_packet_size > 65535 {
            return Err(crate::Error::Config(
                "tunnel.max_packet_size must be between 20 and 65535".into(),
            ));
        }

        if self.tunnel.relay_port == 0 || self.tunnel.kem_port == 0 {
            return Err(crate::Error::Config("tunnel ports cannot be 0".into()));
        }

        if self.tunnel.relay_port == self.tunnel.kem_port {
            return Err(crate::Error::Config(
                "tunnel.relay_port and tunnel.kem_port must differ".into(),
            ));
        }

        self.kem_algorithm()?;

        if self.secrets.capacity == Some(0) {
            return Err(crate::Error::Config("secrets.capacity cannot be 0".into()));
        }

        Ok(())
    }

    /// Resolve the configured KEM algorithm
    pub fn kem_algorithm(&self) -> crate::Result<KemAlgorithm> {
        self.tunnel.kem_algorithm.parse()
    }

    /// Peer subnet as (network, prefix)
    pub fn peer_subnet(&self) -> crate::Result<(Ipv4Addr, u8)> {
        parse_cidr(&self.interface.peer_subnet)
    }

    /// Handshake connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.tunnel.connect_timeout_ms)
    }

    /// Handshake reply timeout as Duration
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.tunnel.exchange_timeout_ms)
    }

    /// Unreachable back-off as Duration
    pub fn unreachable_backoff(&self) -> Duration {
        Duration::from_secs(self.tunnel.unreachable_backoff_secs)
    }

    /// Listener grace period as Duration
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.listener.grace_period_ms)
    }

    /// Listener per-read timeout as Duration
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.listener.io_timeout_ms)
    }

    /// Relay forward connect timeout as Duration
    pub fn forward_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.listener.forward_connect_timeout_ms)
    }
}

/// Parse "a.b.c.d/len" into its parts
pub fn parse_cidr(cidr: &str) -> crate::Result<(Ipv4Addr, u8)> {
    let (addr, len) = cidr
        .split_once('/')
        .ok_or_else(|| crate::Error::Config(format!("'{}' is not in CIDR notation", cidr)))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| crate::Error::Config(format!("invalid subnet address in '{}'", cidr)))?;
    let len: u8 = len
        .parse()
        .map_err(|_| crate::Error::Config(format!("invalid prefix length in '{}'", cidr)))?;
    if len > 32 {
        return Err(crate::Error::Config(format!("prefix length too large in '{}'", cidr)));
    }
    Ok((addr, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = QuantdogConfig::from_str("").unwrap();
        assert_eq!(config.interface.name, "tunqd");
        assert_eq!(config.interface.address, Ipv4Addr::new(10, 117, 0, 2));
        assert_eq!(config.interface.broadcast, Ipv4Addr::new(10, 117, 0, 255));
        assert_eq!(config.peer_subnet().unwrap(), (Ipv4Addr::new(10, 118, 0, 0), 24));
        assert_eq!(config.tunnel.max_packet_size, 1500);
        assert_eq!(config.tunnel.relay_port, 11777);
        assert_eq!(config.tunnel.kem_port, 11778);
        assert_eq!(config.kem_algorithm().unwrap(), KemAlgorithm::MlKem512);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert!(config.secrets.capacity.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[interface]
name = "tunqd1"
default_route = false

[tunnel]
relay_port = 12000
kem_port = 12001
kem_algorithm = "ML-KEM-768"

[secrets]
capacity = 64
"#;

        let config = QuantdogConfig::from_str(toml).unwrap();
        assert_eq!(config.interface.name, "tunqd1");
        assert!(!config.interface.default_route);
        assert_eq!(config.tunnel.relay_port, 12000);
        assert_eq!(config.kem_algorithm().unwrap(), KemAlgorithm::MlKem768);
        assert_eq!(config.secrets.capacity, Some(64));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(QuantdogConfig::from_str("[tunnel]\nkem_algorithm = \"RSA-2048\"").is_err());
        assert!(QuantdogConfig::from_str("[tunnel]\nrelay_port = 5\nkem_port = 5").is_err());
        assert!(QuantdogConfig::from_str("[tunnel]\nmax_packet_size = 10").is_err());
        assert!(QuantdogConfig::from_str("[interface]\npeer_subnet = \"10.118.0.0\"").is_err());
        assert!(QuantdogConfig::from_str("[secrets]\ncapacity = 0").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("QUANTDOG_PACKET_LENGTH", "9000"),
            ("QUANTDOG_PQC_PORT", "21777"),
            ("QUANTDOG_KEM_PORT", "21778"),
            ("QUANTDOG_KEMALG", "ML-KEM-1024"),
        ]
        .into_iter()
        .collect();

        let mut config = QuantdogConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.tunnel.max_packet_size, 9000);
        assert_eq!(config.tunnel.relay_port, 21777);
        assert_eq!(config.tunnel.kem_port, 21778);
        assert_eq!(config.kem_algorithm().unwrap(), KemAlgorithm::MlKem1024);

        let mut config = QuantdogConfig::default();
        let bad = config.apply_env(|key| (key == "QUANTDOG_KEM_PORT").then(|| "port".to_string()));
        assert!(bad.is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quantdog.toml");

        let mut config = QuantdogConfig::default();
        config.tunnel.relay_port = 13777;
        config.save(&path).unwrap();

        let loaded = QuantdogConfig::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.tunnel.relay_port, 13777);
        assert_eq!(loaded.interface.name, "tunqd");
    }
}
