//! Text encodings used across the network.
//!
//! The network uses its own base64 alphabet: the standard alphabet with `+`
//! and `/` replaced by `-` and `~`, so encoded hashes are safe in file names
//! and URLs. Destination hosts use lowercase base32 (`<hash>.b32` form).

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, PAD};
use base64::Engine;
use data_encoding::BASE32_NOPAD;

use crate::{DataError, Result};

/// The network's base64 alphabet: standard with `-` and `~` in place of `+/`.
const NET_ALPHABET: alphabet::Alphabet = match alphabet::Alphabet::new(
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~",
) {
    Ok(a) => a,
    Err(_) => panic!("invalid base64 alphabet"),
};

const NET_ENGINE: GeneralPurpose = GeneralPurpose::new(&NET_ALPHABET, PAD);

const NET_ENGINE_NO_PAD: GeneralPurpose =
    GeneralPurpose::new(&NET_ALPHABET, GeneralPurposeConfig::new().with_encode_padding(false));

/// Characters that can start an encoded hash, one shard directory per char.
pub const BASE64_CHARS: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~";

/// Encode bytes with the network base64 alphabet (padded).
pub fn to_base64(data: &[u8]) -> String {
    NET_ENGINE.encode(data)
}

/// Decode network-alphabet base64, accepting padded or unpadded input.
pub fn from_base64(text: &str) -> Result<Vec<u8>> {
    let engine = if text.ends_with('=') {
        &NET_ENGINE
    } else {
        &NET_ENGINE_NO_PAD
    };
    engine
        .decode(text)
        .map_err(|e| DataError::Encoding(e.to_string()))
}

/// Encode bytes as lowercase unpadded base32 (the `.b32` host form).
pub fn to_base32(data: &[u8]) -> String {
    BASE32_NOPAD.encode(data).to_ascii_lowercase()
}

/// Decode lowercase (or uppercase) unpadded base32.
pub fn from_base32(text: &str) -> Result<Vec<u8>> {
    BASE32_NOPAD
        .decode(text.to_ascii_uppercase().as_bytes())
        .map_err(|e| DataError::Encoding(e.to_string()))
}
