//! Router and destination addresses with the XOR distance metric.
//!
//! Every participant is addressed by an [`IdentHash`]: the SHA-256 of its
//! identity's canonical encoding. Directory placement does not compare raw
//! hashes though; it compares [`RoutingKey`]s, which mix the current UTC
//! date into the hash so that closeness in the keyspace rotates daily.

use sha2::{Digest, Sha256};

use crate::base64;

/// A 32-byte address: SHA-256 of an identity's canonical encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct IdentHash(pub [u8; 32]);

impl IdentHash {
    /// Wrap raw hash bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Read a hash from the front of a buffer.
    ///
    /// Returns `None` if the buffer is shorter than 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 32] = slice.get(..32)?.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Hash arbitrary data into an address.
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Self(digest.into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Network-alphabet base64 form, as used in file names.
    pub fn to_base64(&self) -> String {
        base64::to_base64(&self.0)
    }

    /// Lowercase base32 form, as used in `.b32.i2p` hosts.
    pub fn to_base32(&self) -> String {
        base64::to_base32(&self.0)
    }

    /// Parse the base64 text form.
    pub fn from_base64(text: &str) -> crate::Result<Self> {
        let bytes = base64::from_base64(text)?;
        Self::from_slice(&bytes).ok_or_else(|| crate::DataError::Encoding("short hash".into()))
    }

    /// Parse the base32 text form.
    pub fn from_base32(text: &str) -> crate::Result<Self> {
        let bytes = base64::from_base32(text)?;
        Self::from_slice(&bytes).ok_or_else(|| crate::DataError::Encoding("short hash".into()))
    }
}

impl std::fmt::Debug for IdentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentHash({})", &self.to_base64()[..8])
    }
}

impl std::fmt::Display for IdentHash {
    /// Abbreviated form for logs: the first 8 base64 characters.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_base64()[..8])
    }
}

impl AsRef<[u8]> for IdentHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The value actually compared under XOR when placing or looking up records.
///
/// `SHA-256(ident ‖ yyyymmdd)` for the current UTC date.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RoutingKey(pub [u8; 32]);

impl RoutingKey {
    /// Derive the routing key of `ident` for the current UTC day.
    pub fn create(ident: &IdentHash) -> Self {
        Self::create_for_millis(ident, crate::millis_since_epoch())
    }

    /// Derive the routing key of `ident` for the UTC day containing `ms`.
    pub fn create_for_millis(ident: &IdentHash, ms: u64) -> Self {
        let (year, month, day) = civil_from_days((ms / 86_400_000) as i64);
        let date = format!("{year:04}{month:02}{day:02}");
        let mut hasher = Sha256::new();
        hasher.update(ident.as_bytes());
        hasher.update(date.as_bytes());
        Self(hasher.finalize().into())
    }

    /// XOR distance between this routing key and a raw address.
    pub fn distance_to(&self, ident: &IdentHash) -> XorMetric {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ ident.0[i];
        }
        XorMetric(out)
    }
}

/// 256-bit big-endian XOR distance. Smaller is closer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct XorMetric(pub [u8; 32]);

impl XorMetric {
    /// The maximum possible distance, useful as a scan sentinel.
    pub const MAX: XorMetric = XorMetric([0xff; 32]);
}

/// Convert days since the Unix epoch to a (year, month, day) civil date.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if month <= 2 { year + 1 } else { year }, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ident_hash_roundtrip() {
        let h = IdentHash::of(b"some identity bytes");
        let b64 = h.to_base64();
        assert_eq!(IdentHash::from_base64(&b64).unwrap(), h);
        let b32 = h.to_base32();
        assert_eq!(IdentHash::from_base32(&b32).unwrap(), h);
    }

    #[test]
    fn test_civil_from_days() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1));
        // Leap day.
        assert_eq!(civil_from_days(19_782), (2024, 2, 29));
    }

    #[test]
    fn test_routing_key_rotates_daily() {
        let h = IdentHash::of(b"router");
        let day1 = RoutingKey::create_for_millis(&h, 0);
        let day2 = RoutingKey::create_for_millis(&h, 86_400_000);
        assert_ne!(day1, day2);
        // Same day, different time of day: stable.
        let later = RoutingKey::create_for_millis(&h, 3_600_000);
        assert_eq!(day1, later);
    }

    #[test]
    fn test_xor_metric_ordering() {
        let target = IdentHash::from_bytes([0u8; 32]);
        let key = RoutingKey::create_for_millis(&target, 0);
        let near = IdentHash::from_bytes({
            let mut b = key.0;
            b[31] ^= 1;
            b
        });
        let far = IdentHash::from_bytes({
            let mut b = key.0;
            b[0] ^= 0x80;
            b
        });
        assert!(key.distance_to(&near) < key.distance_to(&far));
        assert!(key.distance_to(&far) < XorMetric::MAX);
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let h = IdentHash::of(b"x");
        let key = RoutingKey(h.0);
        assert_eq!(key.distance_to(&h), XorMetric([0u8; 32]));
    }
}
