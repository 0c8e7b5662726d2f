//! veild daemon binary.
//!
//! Loads configuration, verifies the proxy if asked to, and runs the
//! SOCKS connector.

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};
use veild::{
    control_channel, hosts_handle, probe_proxy, Config, Connector, ConnectMode, HostsDb,
    PeerTable,
};

/// Overlay tunnel daemon
#[derive(Parser, Debug)]
#[command(name = "veild", version, about)]
struct Args {
    /// Path to configuration file (overrides default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let args = Args::parse();

    info!("veild starting");

    // A -c file is authoritative; without one, merge the search paths
    let loaded = match &args.config {
        Some(path) => Config::load_file(path).map(|cfg| (cfg, vec![path.clone()])),
        None => Config::load(),
    };
    let (config, loaded_paths) = match loaded {
        Ok(result) => result,
        Err(e) => {
            error!("Cannot load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if loaded_paths.is_empty() {
        info!("No config files found, using defaults");
    } else {
        for path in &loaded_paths {
            info!(path = %path.display(), "Loaded config file");
        }
    }

    if !config.socks.enabled() {
        warn!("No proxy configured, connection requests will be dropped");
    }

    info!("Connector configured:");
    info!("      mode: {}", config.socks.mode());
    match config.socks.proxy {
        Some(proxy) => info!("     proxy: {}", proxy),
        None => info!("     proxy: (disabled)"),
    }
    info!("    domain: {}", config.naming.domain());
    info!(" dest_port: {}", config.socks.dest_port());

    let hosts = hosts_handle(HostsDb::new(
        config.naming.hosts_path.clone(),
        config.naming.domain(),
    ));
    hosts.lock().check();

    let peers = Arc::new(PeerTable::new());
    let term = Arc::new(AtomicBool::new(false));

    // Confirm the proxy is reachable before going to work
    if config.node.probe && config.socks.enabled() && config.socks.mode() != ConnectMode::Direct {
        info!("Probing proxy before startup");
        match probe_proxy(&config, &term).await {
            Ok(stream) => {
                info!("Proxy is reachable");
                drop(stream);
            }
            Err(e) => {
                error!("Proxy probe failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let (control, control_rx) = control_channel(
        config.node.buffers.control_channel(),
        config.socks.enabled(),
    );

    let static_peers = config.node.peers.clone();
    let mut connector = Connector::new(
        config,
        hosts,
        peers.clone(),
        control_rx,
        term.clone(),
    );

    // Hold permanent connections to the configured peers
    for addr in &static_peers {
        info!(addr = %addr, "Queueing permanent connection");
        control.connect(*addr, true).await;
    }

    info!("veild running, press Ctrl+C to exit");

    tokio::select! {
        _ = connector.run() => {
            info!("Connector loop exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            term.store(true, Ordering::Relaxed);
        }
    }

    info!(peers = peers.len(), "veild shutdown complete");
}
