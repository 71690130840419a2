//! # allium-tunnel
//!
//! Bridges between clear-net TCP sockets and anonymous streams.
//!
//! - [`conn`] - the bidirectional byte pumps shared by both tunnel kinds
//! - [`client`] - a local TCP listener whose connections become outgoing
//!   streams to one remote destination
//! - [`server`] - a hosted destination whose incoming streams become TCP
//!   connections to a configured host and port
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | Pump buffer | 8192 bytes |
//! | Idle timeout | 3600 s |
//! | Destination resolve poll | 1 s |
//! | Destination resolve attempts | 30 |

pub mod client;
pub mod conn;
pub mod server;

pub use client::ClientTunnel;
pub use server::ServerTunnel;

/// Size of each pump buffer.
pub const CONNECTION_BUFFER_SIZE: usize = 8192;

/// Idle connections are dropped after this long.
pub const CONNECTION_MAX_IDLE_SECS: u64 = 3600;

/// How often an unresolved destination is re-checked in the directory.
pub const DESTINATION_POLL_SECS: u64 = 1;

/// How many polls before giving up on a destination.
pub const DESTINATION_POLL_ATTEMPTS: usize = 30;

/// Error types for tunnel operations.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// The configured destination could not be parsed.
    #[error("bad destination {0:?}")]
    BadDestination(String),

    /// The destination's LeaseSet never showed up in the directory.
    #[error("destination not resolved")]
    NotResolved,

    /// The streaming engine has no shared local destination yet.
    #[error("streaming engine not started")]
    EngineNotStarted,

    /// Stream-level failure.
    #[error(transparent)]
    Streaming(#[from] allium_streaming::StreamingError),

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Either kind of tunnel, as held by the control-channel registry.
pub enum Tunnel {
    Client(ClientTunnel),
    Server(ServerTunnel),
}

impl Tunnel {
    /// Close every connection and stop accepting new ones.
    pub fn stop(&self) {
        match self {
            Tunnel::Client(tunnel) => tunnel.stop(),
            Tunnel::Server(tunnel) => tunnel.stop(),
        }
    }
}
