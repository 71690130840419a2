//! allium-daemon: the router core daemon.
//!
//! One Tokio process hosting the directory loop, the streaming engine,
//! the BOB control channel, and the proxy auto-config service.

mod bob;
mod config;
mod offline;
mod pac;

use std::sync::Arc;

use tracing::{error, info};

use allium_netdb::{NetDb, NetDbConfig};
use allium_streaming::StreamingEngine;
use allium_types::router_info::RouterCaps;
use allium_types::{PrivateKeys, RouterInfo};

use crate::bob::BobCommandChannel;
use crate::config::Config;
use crate::offline::{OfflineGarlic, OfflineTransport, OfflineTunnels};
use crate::pac::PacService;

/// File holding the router's own private keys.
const ROUTER_KEYS: &str = "router.keys";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::load(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("allium={}", config.log_level).parse()?),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "allium daemon starting");
    std::fs::create_dir_all(&config.data_dir)?;

    // Our own router identity, created on first run.
    let keys = load_router_keys(&config)?;
    info!(router = %keys.ident_hash(), "router identity ready");
    let router_info = RouterInfo::create(&keys, RouterCaps(0), Vec::new());

    let transport = Arc::new(OfflineTransport);
    let tunnels = Arc::new(OfflineTunnels);
    let garlic = Arc::new(OfflineGarlic);

    let netdb = Arc::new(NetDb::new(
        NetDbConfig {
            data_dir: config.data_dir.clone(),
        },
        keys,
        router_info,
        transport,
        tunnels.clone(),
        garlic.clone(),
        None,
    ));
    netdb.start()?;
    info!(routers = netdb.store().router_count(), "directory started");

    let engine = StreamingEngine::new(
        netdb.clone(),
        tunnels,
        garlic,
        config.data_dir.clone(),
    );
    engine.start();

    let bob = BobCommandChannel::new(config.bob_port, netdb.clone(), engine.clone());
    bob.start().await?;
    let mut zap = bob.shutdown_signal();

    let pac = PacService::new(config.pac_port, config.http_proxy_port);
    pac.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        _ = zap.recv() => {
            info!("zap received, shutting down");
        }
    }

    pac.stop();
    bob.stop();
    engine.stop();
    netdb.stop();
    info!("daemon stopped");
    Ok(())
}

/// Load the router's private keys, creating them on first run.
fn load_router_keys(config: &Config) -> anyhow::Result<PrivateKeys> {
    let path = config.data_dir.join(ROUTER_KEYS);
    match std::fs::read(&path) {
        Ok(bytes) => match PrivateKeys::from_bytes(&bytes) {
            Ok(keys) => Ok(keys),
            Err(e) => {
                error!(error = %e, "router key file unreadable, creating fresh keys");
                create_router_keys(&path)
            }
        },
        Err(_) => create_router_keys(&path),
    }
}

fn create_router_keys(path: &std::path::Path) -> anyhow::Result<PrivateKeys> {
    let keys = PrivateKeys::generate();
    std::fs::write(path, keys.to_bytes())?;
    info!(file = %path.display(), "new router keys created");
    Ok(keys)
}
