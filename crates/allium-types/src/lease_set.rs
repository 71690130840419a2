//! Signed lease bundles published by destinations.
//!
//! A [`Lease`] authorizes delivery to a destination through one inbound
//! tunnel gateway until its end date. A [`LeaseSet`] is the signed bundle of
//! a destination's current leases; it stays valid as long as at least one
//! lease has not expired.
//!
//! ## Wire format
//!
//! ```text
//! LeaseSet {
//!     identity:    [u8; 32],
//!     lease_count: u8,
//!     leases:      { gateway: [u8; 32], tunnel_id: u32, end_date: u64 } * n,
//!     signature:   [u8; 64],
//! }
//! ```

use crate::ident::IdentHash;
use crate::identity::{Identity, PrivateKeys};
use crate::{DataError, Result, IDENTITY_SIZE, SIGNATURE_SIZE};

/// One delivery authorization: a tunnel gateway valid until `end_date_ms`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Lease {
    pub tunnel_gateway: IdentHash,
    pub tunnel_id: u32,
    pub end_date_ms: u64,
}

impl Lease {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.end_date_ms
    }
}

/// A destination's signed set of current leases.
#[derive(Clone, Debug)]
pub struct LeaseSet {
    identity: Identity,
    leases: Vec<Lease>,
    signature: [u8; SIGNATURE_SIZE],
}

impl LeaseSet {
    /// Build and sign a lease set for `keys`.
    pub fn create(keys: &PrivateKeys, leases: Vec<Lease>) -> Self {
        let mut unsigned = Self {
            identity: keys.identity().clone(),
            leases,
            signature: [0u8; SIGNATURE_SIZE],
        };
        let body = unsigned.encode_body();
        unsigned.signature = keys.sign(&body);
        unsigned
    }

    /// Parse and verify a signed lease set.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let malformed = |detail: String| DataError::Malformed {
            what: "LeaseSet",
            detail,
        };
        if bytes.len() < IDENTITY_SIZE + 1 + SIGNATURE_SIZE {
            return Err(malformed(format!("{} bytes is too short", bytes.len())));
        }
        let identity = Identity::from_bytes(&bytes[..IDENTITY_SIZE])?;
        let mut pos = IDENTITY_SIZE;
        let lease_count = bytes[pos] as usize;
        pos += 1;
        let mut leases = Vec::with_capacity(lease_count);
        for _ in 0..lease_count {
            let entry = bytes
                .get(pos..pos + 44)
                .ok_or_else(|| malformed("truncated lease".into()))?;
            leases.push(Lease {
                tunnel_gateway: IdentHash::from_slice(entry).unwrap(),
                tunnel_id: u32::from_be_bytes(entry[32..36].try_into().unwrap()),
                end_date_ms: u64::from_be_bytes(entry[36..44].try_into().unwrap()),
            });
            pos += 44;
        }
        let signature: [u8; SIGNATURE_SIZE] = bytes
            .get(pos..pos + SIGNATURE_SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| malformed("truncated signature".into()))?;
        identity.verify(&bytes[..pos], &signature)?;
        Ok(Self {
            identity,
            leases,
            signature,
        })
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IDENTITY_SIZE + 1 + self.leases.len() * 44);
        out.extend_from_slice(&self.identity.to_bytes());
        out.push(self.leases.len() as u8);
        for lease in &self.leases {
            out.extend_from_slice(lease.tunnel_gateway.as_bytes());
            out.extend_from_slice(&lease.tunnel_id.to_be_bytes());
            out.extend_from_slice(&lease.end_date_ms.to_be_bytes());
        }
        out
    }

    /// Re-encode the full signed record.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.encode_body();
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn ident_hash(&self) -> IdentHash {
        self.identity.ident_hash()
    }

    pub fn leases(&self) -> &[Lease] {
        &self.leases
    }

    /// The leases still valid at `now_ms`.
    pub fn non_expired_leases(&self, now_ms: u64) -> Vec<Lease> {
        self.leases
            .iter()
            .copied()
            .filter(|l| !l.is_expired(now_ms))
            .collect()
    }

    /// A lease set is alive while any of its leases is.
    pub fn has_non_expired_leases(&self, now_ms: u64) -> bool {
        self.leases.iter().any(|l| !l.is_expired(now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(gateway_byte: u8, end_date_ms: u64) -> Lease {
        Lease {
            tunnel_gateway: IdentHash::from_bytes([gateway_byte; 32]),
            tunnel_id: 7,
            end_date_ms,
        }
    }

    #[test]
    fn test_roundtrip() {
        let keys = PrivateKeys::generate();
        let ls = LeaseSet::create(&keys, vec![lease(1, 1000), lease(2, 2000)]);
        let parsed = LeaseSet::from_bytes(&ls.to_bytes()).unwrap();
        assert_eq!(parsed.ident_hash(), keys.ident_hash());
        assert_eq!(parsed.leases(), ls.leases());
    }

    #[test]
    fn test_tampered_rejected() {
        let keys = PrivateKeys::generate();
        let ls = LeaseSet::create(&keys, vec![lease(1, 1000)]);
        let mut bytes = ls.to_bytes();
        bytes[40] ^= 1; // inside the first lease gateway
        assert!(matches!(
            LeaseSet::from_bytes(&bytes),
            Err(DataError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_expiry() {
        let keys = PrivateKeys::generate();
        let ls = LeaseSet::create(&keys, vec![lease(1, 1000), lease(2, 2000)]);
        assert!(ls.has_non_expired_leases(500));
        assert_eq!(ls.non_expired_leases(1500).len(), 1);
        assert_eq!(ls.non_expired_leases(1500)[0].tunnel_gateway.as_bytes()[0], 2);
        assert!(!ls.has_non_expired_leases(2000));
    }

    #[test]
    fn test_empty_lease_set_is_expired() {
        let keys = PrivateKeys::generate();
        let ls = LeaseSet::create(&keys, Vec::new());
        assert!(!ls.has_non_expired_leases(0));
    }
}
