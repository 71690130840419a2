//! # allium-streaming
//!
//! Reliable, ordered, bidirectional byte streams layered on best-effort
//! anonymous datagrams: TCP-like semantics over a lossy, high-latency
//! substrate.
//!
//! - [`packet`] - the bit-exact big-endian packet codec
//! - [`stream`] - the per-connection state machine: sequencing, ACK/NACK,
//!   retransmission, close
//! - [`destination`] - one identity multiplexing many streams over a shared
//!   tunnel pool
//! - [`engine`] - the destination registry and incoming datagram dispatch
//! - [`data`] - gzip framing of streaming packets into Data messages
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | MTU | 1730 bytes |
//! | Max decompressed packet | 4096 bytes |
//! | Compression threshold | 66 bytes |
//! | Resend timeout | 10 s |
//! | Max resend attempts | 5 |
//! | Tunnel pool hops | 3 |

pub mod data;
pub mod destination;
pub mod engine;
pub mod packet;
pub mod stream;

#[cfg(test)]
pub(crate) mod testutil;

pub use destination::StreamingDestination;
pub use engine::StreamingEngine;
pub use packet::Packet;
pub use stream::Stream;

/// Largest streaming packet we emit, header and payload together.
pub const STREAMING_MTU: usize = 1730;

/// Largest packet accepted after decompression.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Payloads at or below this size are not worth compressing hard.
pub const COMPRESSION_THRESHOLD_SIZE: usize = 66;

/// Seconds before in-flight packets are resent.
pub const RESEND_TIMEOUT_SECS: u64 = 10;

/// A stream closes after this many fruitless resend rounds of one packet.
pub const MAX_NUM_RESEND_ATTEMPTS: u32 = 5;

/// Hops in a destination's tunnel pool.
pub const TUNNEL_POOL_HOPS: usize = 3;

/// Error types for streaming operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    /// A packet or frame could not be parsed.
    #[error(transparent)]
    Data(#[from] allium_types::DataError),

    /// The stream is closed and its receive queue is drained.
    #[error("connection reset")]
    ConnectionReset,

    /// A receive wait expired with nothing to deliver.
    #[error("timed out")]
    TimedOut,
}

/// Convenience result type for streaming operations.
pub type Result<T> = std::result::Result<T, StreamingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(STREAMING_MTU, 1730);
        assert_eq!(MAX_PACKET_SIZE, 4096);
        assert_eq!(RESEND_TIMEOUT_SECS, 10);
        assert_eq!(MAX_NUM_RESEND_ATTEMPTS, 5);
    }
}
