//! Client tunnels: a local TCP port bridged to one remote destination.
//!
//! Each accepted local connection resolves the configured destination (a
//! `<hash>.b32.i2p` host, a bare base32/base64 hash, or a full base64
//! destination), waits for its LeaseSet to appear in the directory, opens
//! an outgoing stream, and pumps bytes both ways.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use allium_netdb::NetDb;
use allium_streaming::StreamingEngine;
use allium_types::{IdentHash, LeaseSet};

use crate::conn::{Connection, ConnectionSet};
use crate::{Result, TunnelError, DESTINATION_POLL_ATTEMPTS, DESTINATION_POLL_SECS};

/// A local listener whose connections become streams to one destination.
#[derive(Clone)]
pub struct ClientTunnel {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    destination: String,
    bind_host: String,
    port: u16,
    netdb: Arc<NetDb>,
    engine: StreamingEngine,
    connections: ConnectionSet,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ClientTunnel {
    pub fn new(
        destination: String,
        bind_host: String,
        port: u16,
        netdb: Arc<NetDb>,
        engine: StreamingEngine,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                destination,
                bind_host,
                port,
                netdb,
                engine,
                connections: ConnectionSet::default(),
                accept_task: Mutex::new(None),
            }),
        }
    }

    /// Bind the local listener and start accepting. Returns the bound
    /// address (useful when the configured port is 0).
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener =
            TcpListener::bind((self.inner.bind_host.as_str(), self.inner.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, destination = %self.inner.destination, "client tunnel listening");
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        debug!(%peer, "client connection accepted");
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inner.bridge(socket).await {
                                warn!(error = %e, "client connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });
        *self.inner.accept_task.lock().unwrap() = Some(task);
        Ok(local_addr)
    }

    /// Stop accepting and drop every live connection.
    pub fn stop(&self) {
        if let Some(task) = self.inner.accept_task.lock().unwrap().take() {
            task.abort();
        }
        self.inner.connections.clear();
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }
}

impl ClientInner {
    async fn bridge(&self, socket: TcpStream) -> Result<()> {
        let ident = parse_destination(&self.destination)?;
        let lease_set = resolve_lease_set(&self.netdb, ident).await?;
        let local = self
            .engine
            .shared_destination()
            .ok_or(TunnelError::EngineNotStarted)?;
        let stream = local.create_outgoing_stream(lease_set);
        stream.send(&[])?;
        self.connections.add(Connection::spawn(socket, stream));
        Ok(())
    }
}

/// Turn the configured destination text into an address.
pub fn parse_destination(text: &str) -> Result<IdentHash> {
    let bad = || TunnelError::BadDestination(text.to_string());
    let host = text
        .strip_suffix(".b32.i2p")
        .or_else(|| text.strip_suffix(".b32"))
        .unwrap_or(text);
    if let Ok(ident) = IdentHash::from_base32(host) {
        return Ok(ident);
    }
    // A base64 hash otherwise.
    let bytes = allium_types::base64::from_base64(host).map_err(|_| bad())?;
    IdentHash::from_slice(&bytes)
        .filter(|_| bytes.len() == 32)
        .ok_or_else(bad)
}

/// Wait for the destination's LeaseSet, nudging the directory while
/// polling.
async fn resolve_lease_set(netdb: &NetDb, ident: IdentHash) -> Result<LeaseSet> {
    for attempt in 0..DESTINATION_POLL_ATTEMPTS {
        if let Some(lease_set) = netdb.store().find_lease_set(&ident) {
            return Ok((*lease_set).clone());
        }
        if attempt == 0 {
            netdb.request_destination(ident, None);
        }
        tokio::time::sleep(Duration::from_secs(DESTINATION_POLL_SECS)).await;
    }
    warn!(%ident, "destination LeaseSet never arrived");
    Err(TunnelError::NotResolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_b32_host() {
        let ident = IdentHash::of(b"destination");
        let host = format!("{}.b32.i2p", ident.to_base32());
        assert_eq!(parse_destination(&host).unwrap(), ident);
        assert_eq!(parse_destination(&ident.to_base32()).unwrap(), ident);
    }

    #[test]
    fn test_parse_base64_hash() {
        let ident = IdentHash::of(b"destination");
        assert_eq!(parse_destination(&ident.to_base64()).unwrap(), ident);
    }

    #[test]
    fn test_parse_garbage_rejected() {
        assert!(matches!(
            parse_destination("definitely not an address"),
            Err(TunnelError::BadDestination(_))
        ));
    }
}
