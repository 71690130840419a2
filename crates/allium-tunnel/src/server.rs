//! Server tunnels: a hosted destination bridged to a local service.
//!
//! The tunnel installs itself as its destination's acceptor; every
//! incoming stream opens a TCP connection to the configured host and port
//! and pumps bytes both ways.

use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use allium_streaming::{Stream, StreamingDestination};

use crate::conn::{Connection, ConnectionSet};

/// A destination whose incoming streams are forwarded to `(host, port)`.
#[derive(Clone)]
pub struct ServerTunnel {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    host: String,
    port: u16,
    destination: StreamingDestination,
    connections: ConnectionSet,
    running: Mutex<bool>,
}

impl ServerTunnel {
    pub fn new(host: String, port: u16, destination: StreamingDestination) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                host,
                port,
                destination,
                connections: ConnectionSet::default(),
                running: Mutex::new(false),
            }),
        }
    }

    /// Install the acceptor. Must run on the runtime so accepted streams
    /// can spawn their connect tasks.
    pub fn start(&self) {
        let runtime = tokio::runtime::Handle::current();
        let inner = self.inner.clone();
        *self.inner.running.lock().unwrap() = true;
        info!(
            address = %self.inner.destination.ident_hash().to_base32(),
            target = %format!("{}:{}", self.inner.host, self.inner.port),
            "server tunnel started"
        );
        self.inner.destination.set_acceptor(Box::new(move |stream| {
            let inner = inner.clone();
            runtime.spawn(async move {
                inner.bridge(stream).await;
            });
        }));
    }

    /// Stop accepting streams and drop every live connection.
    pub fn stop(&self) {
        *self.inner.running.lock().unwrap() = false;
        self.inner.destination.reset_acceptor();
        self.inner.connections.clear();
    }

    pub fn destination(&self) -> &StreamingDestination {
        &self.inner.destination
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }
}

impl ServerInner {
    async fn bridge(&self, stream: Stream) {
        if !*self.running.lock().unwrap() {
            stream.close();
            return;
        }
        debug!(target_host = %self.host, target_port = self.port, "incoming stream");
        match TcpStream::connect((self.host.as_str(), self.port)).await {
            Ok(socket) => self.connections.add(Connection::spawn(socket, stream)),
            Err(e) => {
                warn!(error = %e, "cannot reach tunnel target");
                stream.close();
            }
        }
    }
}
