//! Signed router descriptors.
//!
//! A [`RouterInfo`] describes one router: its identity, capability flags,
//! publication timestamp, and transport addresses, all covered by the
//! identity's signature.
//!
//! ## Wire format
//!
//! ```text
//! RouterInfo {
//!     identity:   [u8; 32],  // canonical identity encoding
//!     timestamp:  u64,       // milliseconds since epoch, big-endian
//!     caps:       u8,        // capability bit set
//!     addr_count: u8,
//!     addresses:  { style: u8, port: u16, host_len: u8, host: [u8] } * n,
//!     signature:  [u8; 64],  // over everything above
//! }
//! ```
//!
//! Records are replaced wholesale on update; the directory only accepts a
//! replacement whose timestamp is strictly greater than the stored one.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::ident::IdentHash;
use crate::identity::{Identity, PrivateKeys};
use crate::{DataError, Result, IDENTITY_SIZE, SIGNATURE_SIZE};

/// Maximum tolerated forward clock skew on a record timestamp.
pub const MAX_CLOCK_SKEW_MS: u64 = 2 * 60 * 1000;

/// Capability flags carried in a RouterInfo.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct RouterCaps(pub u8);

impl RouterCaps {
    pub const FLOODFILL: u8 = 0x01;
    pub const HIGH_BANDWIDTH: u8 = 0x02;
    pub const HIDDEN: u8 = 0x04;
    pub const INTRODUCER: u8 = 0x08;
    pub const V6: u8 = 0x10;

    pub fn has(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }
}

/// Transport family of a published address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransportStyle {
    Ntcp,
    Ssu,
}

/// One published transport address.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RouterAddress {
    pub style: TransportStyle,
    pub host: String,
    pub port: u16,
}

/// A signed descriptor of one router.
pub struct RouterInfo {
    identity: Identity,
    timestamp_ms: u64,
    caps: RouterCaps,
    addresses: Vec<RouterAddress>,
    signature: [u8; SIGNATURE_SIZE],
    // Runtime state, not part of the signed record.
    unreachable: AtomicBool,
    updated: AtomicBool,
}

impl Clone for RouterInfo {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            timestamp_ms: self.timestamp_ms,
            caps: self.caps,
            addresses: self.addresses.clone(),
            signature: self.signature,
            unreachable: AtomicBool::new(self.is_unreachable()),
            updated: AtomicBool::new(self.is_updated()),
        }
    }
}

impl RouterInfo {
    /// Build and sign a fresh descriptor for `keys`.
    pub fn create(keys: &PrivateKeys, caps: RouterCaps, addresses: Vec<RouterAddress>) -> Self {
        Self::create_at(keys, caps, addresses, crate::millis_since_epoch())
    }

    /// Build and sign a descriptor with an explicit timestamp.
    pub fn create_at(
        keys: &PrivateKeys,
        caps: RouterCaps,
        addresses: Vec<RouterAddress>,
        timestamp_ms: u64,
    ) -> Self {
        let mut unsigned = Self {
            identity: keys.identity().clone(),
            timestamp_ms,
            caps,
            addresses,
            signature: [0u8; SIGNATURE_SIZE],
            unreachable: AtomicBool::new(false),
            updated: AtomicBool::new(true),
        };
        let body = unsigned.encode_body();
        unsigned.signature = keys.sign(&body);
        unsigned
    }

    /// Parse and verify a signed descriptor.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let malformed = |detail: String| DataError::Malformed {
            what: "RouterInfo",
            detail,
        };
        if bytes.len() < IDENTITY_SIZE + 10 + SIGNATURE_SIZE {
            return Err(malformed(format!("{} bytes is too short", bytes.len())));
        }
        let identity = Identity::from_bytes(&bytes[..IDENTITY_SIZE])?;
        let mut pos = IDENTITY_SIZE;
        let timestamp_ms = u64::from_be_bytes(bytes[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let caps = RouterCaps(bytes[pos]);
        pos += 1;
        let addr_count = bytes[pos] as usize;
        pos += 1;
        let mut addresses = Vec::with_capacity(addr_count);
        for _ in 0..addr_count {
            if bytes.len() < pos + 4 {
                return Err(malformed("truncated address".into()));
            }
            let style = match bytes[pos] {
                0 => TransportStyle::Ntcp,
                1 => TransportStyle::Ssu,
                other => return Err(malformed(format!("unknown transport style {other}"))),
            };
            let port = u16::from_be_bytes(bytes[pos + 1..pos + 3].try_into().unwrap());
            let host_len = bytes[pos + 3] as usize;
            pos += 4;
            let host = bytes
                .get(pos..pos + host_len)
                .ok_or_else(|| malformed("truncated host".into()))?;
            let host = std::str::from_utf8(host)
                .map_err(|_| malformed("host is not UTF-8".into()))?
                .to_string();
            pos += host_len;
            addresses.push(RouterAddress { style, host, port });
        }
        let signature: [u8; SIGNATURE_SIZE] = bytes
            .get(pos..pos + SIGNATURE_SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| malformed("truncated signature".into()))?;
        identity.verify(&bytes[..pos], &signature)?;

        let now = crate::millis_since_epoch();
        if timestamp_ms > now + MAX_CLOCK_SKEW_MS {
            return Err(DataError::ClockSkew {
                timestamp: timestamp_ms,
                now,
            });
        }

        Ok(Self {
            identity,
            timestamp_ms,
            caps,
            addresses,
            signature,
            unreachable: AtomicBool::new(false),
            updated: AtomicBool::new(false),
        })
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(&self.identity.to_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.push(self.caps.0);
        out.push(self.addresses.len() as u8);
        for addr in &self.addresses {
            out.push(match addr.style {
                TransportStyle::Ntcp => 0,
                TransportStyle::Ssu => 1,
            });
            out.extend_from_slice(&addr.port.to_be_bytes());
            out.push(addr.host.len() as u8);
            out.extend_from_slice(addr.host.as_bytes());
        }
        out
    }

    /// Re-encode the full signed record.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.encode_body();
        out.extend_from_slice(&self.signature);
        out
    }

    /// Whether `new` is an acceptable replacement for this record: same
    /// identity and a strictly greater timestamp.
    pub fn accepts_update(&self, new: &RouterInfo) -> Result<bool> {
        if new.identity != self.identity {
            return Err(DataError::IdentityMismatch);
        }
        Ok(new.timestamp_ms > self.timestamp_ms)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn ident_hash(&self) -> IdentHash {
        self.identity.ident_hash()
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn caps(&self) -> RouterCaps {
        self.caps
    }

    pub fn addresses(&self) -> &[RouterAddress] {
        &self.addresses
    }

    pub fn is_floodfill(&self) -> bool {
        self.caps.has(RouterCaps::FLOODFILL)
    }

    pub fn is_high_bandwidth(&self) -> bool {
        self.caps.has(RouterCaps::HIGH_BANDWIDTH)
    }

    pub fn is_hidden(&self) -> bool {
        self.caps.has(RouterCaps::HIDDEN)
    }

    pub fn uses_introducer(&self) -> bool {
        self.caps.has(RouterCaps::INTRODUCER)
    }

    pub fn is_v6(&self) -> bool {
        self.caps.has(RouterCaps::V6)
    }

    pub fn is_unreachable(&self) -> bool {
        self.unreachable.load(Ordering::Relaxed)
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }

    /// Whether the record changed since it was last written to disk.
    pub fn is_updated(&self) -> bool {
        self.updated.load(Ordering::Relaxed)
    }

    pub fn set_updated(&self, updated: bool) {
        self.updated.store(updated, Ordering::Relaxed);
    }

    /// Write the signed record to `path`.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    /// Read and verify a signed record from `path`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for RouterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterInfo")
            .field("ident", &self.ident_hash())
            .field("timestamp_ms", &self.timestamp_ms)
            .field("caps", &self.caps)
            .finish()
    }
}
