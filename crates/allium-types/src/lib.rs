//! # allium-types
//!
//! Shared data model for the Allium router core.
//!
//! This crate defines the records and addresses the rest of the workspace is
//! built around:
//!
//! - [`ident`] - 32-byte router/destination addresses, daily routing keys,
//!   and the XOR distance metric
//! - [`identity`] - Ed25519-backed identities and private key bundles
//! - [`base64`] - the network's base64/base32 text encodings
//! - [`router_info`] - signed router descriptors with capability flags
//! - [`lease_set`] - signed lease bundles published by destinations
//! - [`i2np`] - the directory/data message payloads exchanged between routers
//! - [`traits`] - contracts of the collaborators the core drives but does not
//!   implement (transport, tunnel pools, garlic sessions, reseeding)
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | Address size | 32 bytes (SHA-256) |
//! | Identity encoding | 32-byte Ed25519 verifying key |
//! | Signature size | 64 bytes |
//! | Routing key rotation | daily (UTC date salt) |
//! | Max gzipped RouterInfo in a store | 2048 bytes |

pub mod base64;
pub mod i2np;
pub mod ident;
pub mod identity;
pub mod lease_set;
pub mod router_info;
pub mod traits;

pub use ident::{IdentHash, RoutingKey, XorMetric};
pub use identity::{Identity, PrivateKeys};
pub use lease_set::{Lease, LeaseSet};
pub use router_info::{RouterCaps, RouterInfo};

/// Size of every signature in the data model (Ed25519).
pub const SIGNATURE_SIZE: usize = 64;

/// Size of an encoded identity (Ed25519 verifying key).
pub const IDENTITY_SIZE: usize = 32;

/// Maximum declared size of a gzipped RouterInfo inside a DatabaseStore.
pub const MAX_ROUTER_INFO_SIZE: usize = 2048;

/// Error types for data-model operations.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// A record or message payload could not be parsed.
    #[error("malformed {what}: {detail}")]
    Malformed {
        what: &'static str,
        detail: String,
    },

    /// An Ed25519 signature did not verify.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// A record's timestamp is too far in the future.
    #[error("timestamp {timestamp} is in the future (now {now})")]
    ClockSkew { timestamp: u64, now: u64 },

    /// An update carried a different identity than the stored record.
    #[error("identity mismatch on update")]
    IdentityMismatch,

    /// A declared length exceeds the protocol cap.
    #[error("{what} length {len} exceeds maximum of {max}")]
    TooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },

    /// Base64/base32 text could not be decoded.
    #[error("invalid encoding: {0}")]
    Encoding(String),

    /// Gzip compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// File I/O error while reading or writing a record.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type for data-model operations.
pub type Result<T> = std::result::Result<T, DataError>;

/// Milliseconds since the Unix epoch.
pub fn millis_since_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Seconds since the Unix epoch.
pub fn seconds_since_epoch() -> u64 {
    millis_since_epoch() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DataError::TooLarge {
            what: "RouterInfo",
            len: 4000,
            max: MAX_ROUTER_INFO_SIZE,
        };
        assert!(err.to_string().contains("4000"));
        assert!(err.to_string().contains("2048"));
    }

    #[test]
    fn test_clock_sanity() {
        let ms = millis_since_epoch();
        let s = seconds_since_epoch();
        assert!(ms / 1000 >= s);
        assert!(ms > 1_600_000_000_000);
    }
}
