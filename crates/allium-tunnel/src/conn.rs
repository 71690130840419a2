//! The bidirectional byte pumps shared by client and server tunnels.
//!
//! Each bridged connection runs two tasks: one copying socket bytes into
//! the stream, one copying stream bytes back out. Either side ending, an
//! error, or an hour of idleness tears the pair down; the stream is closed
//! and the socket dropped on every exit path.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use allium_streaming::{Stream, StreamingError};

use crate::{CONNECTION_BUFFER_SIZE, CONNECTION_MAX_IDLE_SECS};

/// One bridged connection: a clear-net socket glued to a stream.
pub(crate) struct Connection {
    stream: Stream,
    upstream: tokio::task::JoinHandle<()>,
    downstream: tokio::task::JoinHandle<()>,
}

impl Connection {
    /// Spawn the two pumps for `socket` ↔ `stream`.
    pub(crate) fn spawn(socket: TcpStream, stream: Stream) -> Self {
        let (mut read_half, mut write_half) = socket.into_split();
        let idle = Duration::from_secs(CONNECTION_MAX_IDLE_SECS);

        let up_stream = stream.clone();
        let upstream = tokio::spawn(async move {
            let mut buf = [0u8; CONNECTION_BUFFER_SIZE];
            loop {
                let read = tokio::time::timeout(idle, read_half.read(&mut buf)).await;
                match read {
                    Ok(Ok(0)) => {
                        debug!("local socket closed");
                        break;
                    }
                    Ok(Ok(n)) => {
                        trace!(n, "socket -> stream");
                        if up_stream.send(&buf[..n]).is_err() {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        debug!(error = %e, "socket read failed");
                        break;
                    }
                    Err(_) => {
                        debug!("connection idle, dropping");
                        break;
                    }
                }
            }
            up_stream.close();
        });

        let down_stream = stream.clone();
        let downstream = tokio::spawn(async move {
            let mut buf = [0u8; CONNECTION_BUFFER_SIZE];
            loop {
                match down_stream.read(&mut buf, idle).await {
                    Ok(n) => {
                        trace!(n, "stream -> socket");
                        if write_half.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(StreamingError::ConnectionReset) => {
                        debug!("stream closed");
                        break;
                    }
                    Err(_) => {
                        debug!("stream idle, dropping");
                        break;
                    }
                }
            }
            let _ = write_half.shutdown().await;
            down_stream.close();
        });

        Self {
            stream,
            upstream,
            downstream,
        }
    }

    /// Whether both pumps have finished on their own.
    pub(crate) fn is_finished(&self) -> bool {
        self.upstream.is_finished() && self.downstream.is_finished()
    }

    /// Force the connection down.
    pub(crate) fn terminate(&self) {
        self.upstream.abort();
        self.downstream.abort();
        self.stream.close();
    }
}

/// A shared registry of live connections, pruned as pumps finish.
#[derive(Default)]
pub(crate) struct ConnectionSet {
    connections: std::sync::Mutex<Vec<Connection>>,
}

impl ConnectionSet {
    pub(crate) fn add(&self, connection: Connection) {
        let mut connections = self.connections.lock().unwrap();
        connections.retain(|c| !c.is_finished());
        connections.push(connection);
    }

    pub(crate) fn len(&self) -> usize {
        let mut connections = self.connections.lock().unwrap();
        connections.retain(|c| !c.is_finished());
        connections.len()
    }

    /// Terminate and drop everything.
    pub(crate) fn clear(&self) {
        let connections: Vec<Connection> =
            std::mem::take(&mut *self.connections.lock().unwrap());
        for connection in &connections {
            connection.terminate();
        }
    }
}
