//! QuantDog - Transparent Post-Quantum Tunneling Client
//!
//! Daemon entry point: brings up the virtual interface, the KEM and relay
//! listeners and the outbound tunnel engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quantdog::config::QuantdogConfig;
use quantdog::crypto::KemAlgorithm;
use quantdog::engine::TunnelEngine;
use quantdog::error::{Error, Result};
use quantdog::handshake::HandshakeClient;
use quantdog::listener::{KemResponder, Listener, ListenerConfig, ListenerHandle, PqcRelayResponder};
use quantdog::secrets::SecretStore;
use quantdog::tun;

/// QuantDog - Transparent Post-Quantum Tunneling Client
#[derive(Parser)]
#[command(name = "quantdog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "quantdog.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the tunnel: interface, listeners and engine (requires root)
    Start,

    /// Run only the KEM and relay responders
    Listen,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "quantdog.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show resolved configuration and supported algorithms
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Read once; the level comes from here and load errors are reported
    // after logging is up
    let loaded = QuantdogConfig::from_file(&cli.config);
    let level = cli
        .log_level
        .clone()
        .or_else(|| loaded.as_ref().ok().map(|c| c.logging.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    let result = match cli.command {
        Commands::Start => match resolve_config(&cli.config, loaded) {
            Ok(config) => run_start(config).await,
            Err(e) => Err(e),
        },
        Commands::Listen => match resolve_config(&cli.config, loaded) {
            Ok(config) => run_listen(config).await,
            Err(e) => Err(e),
        },
        Commands::Init { output, force } => run_init(&output, force),
        Commands::Validate => run_validate(loaded),
        Commands::Info => resolve_config(&cli.config, loaded).and_then(run_info),
    };

    if let Err(e) = &result {
        if e.is_fatal_startup() {
            tracing::error!("QuantDog could not start: {}", e);
        }
    }
    result
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Fall back to defaults (plus env overrides) when the file is missing
fn resolve_config(path: &Path, loaded: Result<QuantdogConfig>) -> Result<QuantdogConfig> {
    match loaded {
        Ok(config) => Ok(config),
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("No configuration at {:?}, using defaults", path);
            let mut config = QuantdogConfig::default();
            config.apply_env(|key| std::env::var(key).ok())?;
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", path, e);
            Err(e)
        }
    }
}

/// Start interface, listeners and engine
async fn run_start(config: QuantdogConfig) -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        tracing::error!("quantdog start needs root to create the virtual interface");
        tracing::error!("Run: sudo quantdog start");
        return Err(Error::DeviceUnavailable("not running as root".into()));
    }

    tracing::info!(
        "Starting QuantDog ({} on {}, relay port {}, KEM port {})",
        config.tunnel.kem_algorithm,
        config.interface.name,
        config.tunnel.relay_port,
        config.tunnel.kem_port
    );

    let store = Arc::new(SecretStore::from_config(&config.secrets));

    let device = match tun::acquire(&config.interface) {
        Ok(device) => device,
        Err(e) => {
            tracing::error!("Failed to set up interface {}: {}", config.interface.name, e);
            return Err(e);
        }
    };

    let mut listeners = start_listeners(&config, &store).await?;

    let handshake = Arc::new(HandshakeClient::from_config(&config, Arc::clone(&store))?);
    let engine = Arc::new(TunnelEngine::new(&config, handshake));
    let stats = engine.stats();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut engine_task = {
        let engine = Arc::clone(&engine);
        // The device moves into the task and is closed when the loop ends
        tokio::spawn(async move { engine.run(&device, shutdown_rx).await })
    };

    let joined = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            engine_task.await
        }
        joined = &mut engine_task => joined,
    };

    for listener in &mut listeners {
        listener.stop().await;
    }

    let stats = stats.snapshot();
    tracing::info!(
        "Engine totals: {} read, {} tunneled, {} passthrough, {} malformed, {} unreachable",
        stats.packets_read,
        stats.tunneled,
        stats.passthrough,
        stats.malformed,
        stats.peer_unreachable
    );

    match joined {
        Ok(Ok(())) => {
            tracing::info!("QuantDog shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!("Tunnel engine failed: {}", e);
            Err(e)
        }
        Err(e) => Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))),
    }
}

/// Responder-only mode
async fn run_listen(config: QuantdogConfig) -> Result<()> {
    let store = Arc::new(SecretStore::from_config(&config.secrets));

    let mut listeners = start_listeners(&config, &store).await?;
    if listeners.is_empty() {
        tracing::warn!("Both listeners are disabled in the configuration, nothing to do");
        return Ok(());
    }

    shutdown_signal().await;
    tracing::info!("Received shutdown signal");

    for listener in &mut listeners {
        listener.stop().await;
        let stats = listener.stats();
        tracing::info!(
            "{}: {} accepted, {} completed, {} failed",
            listener.label(),
            stats.accepted,
            stats.completed,
            stats.failed
        );
    }
    Ok(())
}

async fn start_listeners(config: &QuantdogConfig, store: &Arc<SecretStore>) -> Result<Vec<ListenerHandle>> {
    let mut handles = Vec::new();

    if config.listener.enable_kem {
        let responder = KemResponder::from_config(config, Arc::clone(store));
        match Listener::start(ListenerConfig::kem(config), Arc::new(responder)).await {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                tracing::error!("Failed to start KEM listener: {}", e);
                return Err(e);
            }
        }
    }

    if config.listener.enable_relay {
        let responder = PqcRelayResponder::from_config(config, Arc::clone(store));
        match Listener::start(ListenerConfig::relay(config), Arc::new(responder)).await {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                tracing::error!("Failed to start PQC relay listener: {}", e);
                for handle in &mut handles {
                    handle.stop().await;
                }
                return Err(e);
            }
        }
    }

    Ok(handles)
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
}

/// Write a default configuration file
fn run_init(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        eprintln!("✗ {} already exists (use --force to overwrite)", output.display());
        return Err(Error::Config(format!("{} already exists", output.display())));
    }

    QuantdogConfig::default().save(output)?;
    println!("Configuration written to: {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Adjust the interface and tunnel sections");
    println!("  2. Validate: quantdog --config {} validate", output.display());
    println!("  3. Start:    sudo quantdog --config {} start", output.display());
    Ok(())
}

/// Validate configuration file
fn run_validate(loaded: Result<QuantdogConfig>) -> Result<()> {
    match loaded {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Interface:      {} ({}/{})",
                config.interface.name,
                config.interface.address,
                config.interface.prefix_len);
            println!("  Peer Subnet:    {}", config.interface.peer_subnet);
            println!("  KEM Algorithm:  {}", config.tunnel.kem_algorithm);
            println!("  Ports:          relay {}, KEM {}", config.tunnel.relay_port, config.tunnel.kem_port);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show resolved configuration
fn run_info(config: QuantdogConfig) -> Result<()> {

    println!("QuantDog Configuration");
    println!("======================");
    println!();
    println!("Interface:");
    println!("  Name:           {}", config.interface.name);
    println!("  Address:        {}/{}", config.interface.address, config.interface.prefix_len);
    println!("  Broadcast:      {}", config.interface.broadcast);
    println!("  Peer Subnet:    {}", config.interface.peer_subnet);
    println!("  Gateway:        {} (default route: {})", config.interface.gateway, config.interface.default_route);
    println!("  MTU:            {}", config.interface.mtu);
    println!();
    println!("Tunnel:");
    println!("  Max Packet:     {} bytes", config.tunnel.max_packet_size);
    println!("  Relay:          {}:{}", config.tunnel.relay_address, config.tunnel.relay_port);
    println!("  KEM Port:       {}", config.tunnel.kem_port);
    println!("  KEM Algorithm:  {}", config.tunnel.kem_algorithm);
    println!("  Timeouts:       connect {} ms, exchange {} ms",
        config.tunnel.connect_timeout_ms,
        config.tunnel.exchange_timeout_ms);
    println!("  Backoff:        {} s", config.tunnel.unreachable_backoff_secs);
    println!();
    println!("Listeners:");
    println!("  Bind Address:   {}", config.listener.bind_address);
    println!("  KEM Responder:  {}", config.listener.enable_kem);
    println!("  Relay:          {}", config.listener.enable_relay);
    println!("  Grace Period:   {} ms", config.listener.grace_period_ms);
    println!();
    println!("Secrets:");
    match config.secrets.capacity {
        Some(capacity) => println!("  Cache:          LRU, {} peers", capacity),
        None => println!("  Cache:          unbounded"),
    }
    println!();
    println!("Supported KEM algorithms:");
    for algorithm in KemAlgorithm::ALL {
        println!(
            "  {:<12} public key {:>4} B, ciphertext {:>4} B, secret {} B",
            algorithm.name(),
            algorithm.encapsulation_key_len(),
            algorithm.ciphertext_len(),
            algorithm.shared_secret_len()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_resolves_to_defaults() {
        let path = Path::new("/nonexistent/quantdog.toml");
        let loaded = QuantdogConfig::from_file(path);
        let config = resolve_config(path, loaded).unwrap();
        assert_eq!(config.interface.name, QuantdogConfig::default().interface.name);
    }

    #[test]
    fn test_invalid_file_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quantdog.toml");
        std::fs::write(&path, "[tunnel]\nrelay_port = 0\n").unwrap();

        let loaded = QuantdogConfig::from_file(&path);
        assert!(loaded.is_err());
        assert!(resolve_config(&path, loaded).is_err());
    }
}
