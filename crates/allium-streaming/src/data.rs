//! Gzip framing of streaming packets into Data message payloads.
//!
//! A streaming packet travels inside a Data message as a gzip stream whose
//! header bytes are repurposed: bytes 4..8 (the gzip mtime field) carry the
//! source and destination ports, and byte 9 (the gzip OS field) carries the
//! protocol number. Decompressors ignore both fields, so the stream stays
//! valid.

use tracing::warn;

use allium_types::i2np::{gzip_compress, gzip_decompress};
use allium_types::DataError;

use crate::packet::Packet;
use crate::{Result, COMPRESSION_THRESHOLD_SIZE, MAX_PACKET_SIZE};

/// Protocol number of the streaming layer inside Data messages.
pub const PROTOCOL_STREAMING: u8 = 6;

/// Frame a raw streaming packet for a Data message.
pub fn to_data_payload(packet: &[u8]) -> Result<Vec<u8>> {
    // Tiny payloads gain nothing from real compression.
    let fast = packet.len() <= COMPRESSION_THRESHOLD_SIZE;
    let mut frame = gzip_compress(packet, fast)?;
    if frame.len() < 10 {
        return Err(DataError::Compression("gzip header too short".into()).into());
    }
    frame[4..8].fill(0); // source and destination ports
    frame[9] = PROTOCOL_STREAMING;
    Ok(frame)
}

/// Unframe a Data message payload back into a streaming packet.
pub fn from_data_payload(frame: &[u8]) -> Result<Packet> {
    if frame.len() < 10 {
        return Err(DataError::Malformed {
            what: "data frame",
            detail: format!("{} bytes is too short", frame.len()),
        }
        .into());
    }
    if frame[9] != PROTOCOL_STREAMING {
        warn!(protocol = frame[9], "unsupported protocol in data frame");
        return Err(DataError::Malformed {
            what: "data frame",
            detail: format!("protocol {} is not supported", frame[9]),
        }
        .into());
    }
    let bytes = gzip_decompress(frame, MAX_PACKET_SIZE)?;
    Packet::from_bytes(bytes)
}
