//! Identities and private key bundles.
//!
//! An [`Identity`] is the public half of a destination or router: an Ed25519
//! verifying key with a canonical 32-byte encoding. Its SHA-256 is the
//! owner's [`IdentHash`]. [`PrivateKeys`] couples the signing key with the
//! derived identity and round-trips through the on-disk `.dat` key files.

use ed25519_dalek::{Signer, Verifier};

use crate::ident::IdentHash;
use crate::{DataError, Result, IDENTITY_SIZE, SIGNATURE_SIZE};

/// The public identity of a router or destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    verifying: ed25519_dalek::VerifyingKey,
}

impl Identity {
    /// Parse an identity from its canonical 32-byte encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; IDENTITY_SIZE] =
            bytes
                .get(..IDENTITY_SIZE)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| DataError::Malformed {
                    what: "identity",
                    detail: format!("need {IDENTITY_SIZE} bytes, have {}", bytes.len()),
                })?;
        let verifying = ed25519_dalek::VerifyingKey::from_bytes(&raw).map_err(|e| {
            DataError::Malformed {
                what: "identity",
                detail: e.to_string(),
            }
        })?;
        Ok(Self { verifying })
    }

    /// The canonical encoding this identity hashes to.
    pub fn to_bytes(&self) -> [u8; IDENTITY_SIZE] {
        self.verifying.to_bytes()
    }

    /// The universal address of this identity.
    pub fn ident_hash(&self) -> IdentHash {
        IdentHash::of(&self.to_bytes())
    }

    /// Verify `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let sig: [u8; SIGNATURE_SIZE] =
            signature
                .try_into()
                .map_err(|_| DataError::Malformed {
                    what: "signature",
                    detail: format!("need {SIGNATURE_SIZE} bytes, have {}", signature.len()),
                })?;
        self.verifying
            .verify(message, &ed25519_dalek::Signature::from_bytes(&sig))
            .map_err(|_| DataError::SignatureInvalid)
    }
}

/// A private key bundle: the signing key plus its public identity.
#[derive(Clone)]
pub struct PrivateKeys {
    signing: ed25519_dalek::SigningKey,
    identity: Identity,
}

impl PrivateKeys {
    /// Generate a fresh random key bundle.
    pub fn generate() -> Self {
        let signing = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        let identity = Identity {
            verifying: signing.verifying_key(),
        };
        Self { signing, identity }
    }

    /// The public identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The address of the public identity.
    pub fn ident_hash(&self) -> IdentHash {
        self.identity.ident_hash()
    }

    /// Sign `message`, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }

    /// Serialize to the `.dat` key-file layout: secret key then identity.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + IDENTITY_SIZE);
        out.extend_from_slice(&self.signing.to_bytes());
        out.extend_from_slice(&self.identity.to_bytes());
        out
    }

    /// Parse the `.dat` key-file layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let secret: [u8; 32] =
            bytes
                .get(..32)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| DataError::Malformed {
                    what: "private keys",
                    detail: format!("need 64 bytes, have {}", bytes.len()),
                })?;
        let signing = ed25519_dalek::SigningKey::from_bytes(&secret);
        let identity = Identity {
            verifying: signing.verifying_key(),
        };
        // The stored identity must match the one derived from the secret.
        if let Some(stored) = bytes.get(32..32 + IDENTITY_SIZE) {
            if stored != identity.to_bytes() {
                return Err(DataError::IdentityMismatch);
            }
        }
        Ok(Self { signing, identity })
    }
}

impl std::fmt::Debug for PrivateKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKeys({})", self.ident_hash())
    }
}
