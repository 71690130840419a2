//! The streaming packet codec.
//!
//! ## Wire format (big-endian)
//!
//! ```text
//! Packet {
//!     send_stream_id: u32,
//!     recv_stream_id: u32,
//!     seq:            u32,
//!     ack_through:    u32,
//!     nack_count:     u8,
//!     nacks:          u32 * nack_count,
//!     resend_delay:   u8,
//!     flags:          u16,
//!     option_size:    u16,
//!     options:        [u8; option_size],
//!     payload:        [u8],
//! }
//! ```
//!
//! A packet owns its buffer; readers drain the payload in place through the
//! consumption offset, and senders carry the resend-attempt counter on it.

use crate::{Result, MAX_PACKET_SIZE};
use allium_types::DataError;

pub const FLAG_SYNCHRONIZE: u16 = 0x0001;
pub const FLAG_CLOSE: u16 = 0x0002;
pub const FLAG_RESET: u16 = 0x0004;
pub const FLAG_SIGNATURE_INCLUDED: u16 = 0x0008;
pub const FLAG_SIGNATURE_REQUESTED: u16 = 0x0010;
pub const FLAG_FROM_INCLUDED: u16 = 0x0020;
pub const FLAG_DELAY_REQUESTED: u16 = 0x0040;
pub const FLAG_MAX_PACKET_SIZE_INCLUDED: u16 = 0x0080;
pub const FLAG_PROFILE_INTERACTIVE: u16 = 0x0100;
pub const FLAG_ECHO: u16 = 0x0200;
pub const FLAG_NO_ACK: u16 = 0x0400;

/// Fixed bytes before the NACK block.
const HEADER_SIZE: usize = 17;

/// One streaming packet.
#[derive(Clone, Debug)]
pub struct Packet {
    buf: Vec<u8>,
    /// Bytes of payload already handed to the reader.
    consumed: usize,
    /// Resend rounds this packet has been through.
    pub num_resend_attempts: u32,
}

impl Packet {
    /// Take ownership of raw packet bytes, validating the layout.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self> {
        let malformed = |detail: String| DataError::Malformed {
            what: "streaming packet",
            detail,
        };
        if buf.len() > MAX_PACKET_SIZE {
            return Err(DataError::TooLarge {
                what: "streaming packet",
                len: buf.len(),
                max: MAX_PACKET_SIZE,
            }
            .into());
        }
        if buf.len() < HEADER_SIZE + 1 + 4 {
            return Err(malformed(format!("{} bytes is too short", buf.len())).into());
        }
        let packet = Self {
            buf,
            consumed: 0,
            num_resend_attempts: 0,
        };
        // The NACK block, flags, and option block must all fit.
        if packet.flags_offset() + 4 > packet.buf.len() {
            return Err(malformed("NACK block past end of packet".into()).into());
        }
        let payload_start = packet.options_offset() + packet.option_size() as usize;
        if payload_start > packet.buf.len() {
            return Err(malformed("option block past end of packet".into()).into());
        }
        Ok(packet)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn send_stream_id(&self) -> u32 {
        read_u32(&self.buf, 0)
    }

    pub fn recv_stream_id(&self) -> u32 {
        read_u32(&self.buf, 4)
    }

    pub fn seq(&self) -> u32 {
        read_u32(&self.buf, 8)
    }

    pub fn ack_through(&self) -> u32 {
        read_u32(&self.buf, 12)
    }

    pub fn nack_count(&self) -> u8 {
        self.buf[16]
    }

    pub fn nack(&self, i: usize) -> u32 {
        read_u32(&self.buf, HEADER_SIZE + i * 4)
    }

    pub fn resend_delay(&self) -> u8 {
        self.buf[HEADER_SIZE + self.nack_count() as usize * 4]
    }

    fn flags_offset(&self) -> usize {
        HEADER_SIZE + self.nack_count() as usize * 4 + 1
    }

    pub fn flags(&self) -> u16 {
        read_u16(&self.buf, self.flags_offset())
    }

    pub fn option_size(&self) -> u16 {
        read_u16(&self.buf, self.flags_offset() + 2)
    }

    /// Absolute offset of the option block.
    pub fn options_offset(&self) -> usize {
        self.flags_offset() + 4
    }

    pub fn options(&self) -> &[u8] {
        let start = self.options_offset();
        &self.buf[start..start + self.option_size() as usize]
    }

    fn payload_offset(&self) -> usize {
        self.options_offset() + self.option_size() as usize
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload_offset()..]
    }

    /// The payload not yet handed to the reader.
    pub fn remaining_payload(&self) -> &[u8] {
        &self.buf[self.payload_offset() + self.consumed..]
    }

    /// Mark `n` payload bytes as delivered.
    pub fn consume(&mut self, n: usize) {
        self.consumed += n;
    }

    pub fn is_syn(&self) -> bool {
        self.flags() & FLAG_SYNCHRONIZE != 0
    }

    pub fn is_no_ack(&self) -> bool {
        self.flags() & FLAG_NO_ACK != 0
    }

    pub fn is_close(&self) -> bool {
        self.flags() & FLAG_CLOSE != 0
    }

    /// Zero a region in place, used for signing and verification of the
    /// signature option.
    pub fn zero_region(&mut self, start: usize, len: usize) {
        self.buf[start..start + len].fill(0);
    }

    /// Patch a region in place.
    pub fn write_region(&mut self, start: usize, data: &[u8]) {
        self.buf[start..start + data.len()].copy_from_slice(data);
    }
}

/// Incremental packet writer.
pub struct PacketBuilder {
    buf: Vec<u8>,
}

impl PacketBuilder {
    /// Start a packet with the fixed header.
    pub fn new(
        send_stream_id: u32,
        recv_stream_id: u32,
        seq: u32,
        ack_through: u32,
        nacks: &[u32],
    ) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&send_stream_id.to_be_bytes());
        buf.extend_from_slice(&recv_stream_id.to_be_bytes());
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&ack_through.to_be_bytes());
        buf.push(nacks.len() as u8);
        for nack in nacks {
            buf.extend_from_slice(&nack.to_be_bytes());
        }
        buf.push(0); // resend delay
        Self { buf }
    }

    /// Append the flags and option-size words; `option_size` must match the
    /// option bytes appended afterwards.
    pub fn flags(mut self, flags: u16, option_size: u16) -> Self {
        self.buf.extend_from_slice(&flags.to_be_bytes());
        self.buf.extend_from_slice(&option_size.to_be_bytes());
        self
    }

    /// Append raw option or payload bytes. Returns the absolute offset the
    /// bytes landed at, which is how the signature option is located for
    /// later patching.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let at = self.buf.len();
        self.buf.extend_from_slice(data);
        at
    }

    pub fn build(self) -> Packet {
        Packet {
            buf: self.buf,
            consumed: 0,
            num_resend_attempts: 0,
        }
    }
}

fn read_u16(buf: &[u8], pos: usize) -> u16 {
    u16::from_be_bytes(buf[pos..pos + 2].try_into().unwrap())
}

fn read_u32(buf: &[u8], pos: usize) -> u32 {
    u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_sample(nacks: &[u32], options: &[u8], payload: &[u8]) -> Packet {
        let mut builder =
            PacketBuilder::new(0x11223344, 0x55667788, 3, 2, nacks).flags(
                FLAG_SYNCHRONIZE | FLAG_NO_ACK,
                options.len() as u16,
            );
        builder.append(options);
        builder.append(payload);
        builder.build()
    }

    #[test]
    fn test_header_fields() {
        let p = build_sample(&[7, 9], b"opts", b"payload");
        assert_eq!(p.send_stream_id(), 0x11223344);
        assert_eq!(p.recv_stream_id(), 0x55667788);
        assert_eq!(p.seq(), 3);
        assert_eq!(p.ack_through(), 2);
        assert_eq!(p.nack_count(), 2);
        assert_eq!(p.nack(0), 7);
        assert_eq!(p.nack(1), 9);
        assert_eq!(p.resend_delay(), 0);
        assert!(p.is_syn());
        assert!(p.is_no_ack());
        assert!(!p.is_close());
        assert_eq!(p.options(), b"opts");
        assert_eq!(p.payload(), b"payload");
    }

    #[test]
    fn test_wire_roundtrip() {
        let p = build_sample(&[1], b"", b"data bytes");
        let parsed = Packet::from_bytes(p.as_bytes().to_vec()).unwrap();
        assert_eq!(parsed.seq(), p.seq());
        assert_eq!(parsed.flags(), p.flags());
        assert_eq!(parsed.payload(), p.payload());
    }

    #[test]
    fn test_layout_is_bit_exact() {
        let p = build_sample(&[], b"", b"");
        let bytes = p.as_bytes();
        assert_eq!(&bytes[0..4], &0x11223344u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &0x55667788u32.to_be_bytes());
        assert_eq!(&bytes[8..12], &3u32.to_be_bytes());
        assert_eq!(&bytes[12..16], &2u32.to_be_bytes());
        assert_eq!(bytes[16], 0); // nack count
        assert_eq!(bytes[17], 0); // resend delay
        assert_eq!(
            &bytes[18..20],
            &(FLAG_SYNCHRONIZE | FLAG_NO_ACK).to_be_bytes()
        );
        assert_eq!(&bytes[20..22], &0u16.to_be_bytes());
        assert_eq!(bytes.len(), 22);
    }

    #[test]
    fn test_consume_tracks_remaining() {
        let mut p = build_sample(&[], b"", b"abcdef");
        assert_eq!(p.remaining_payload(), b"abcdef");
        p.consume(4);
        assert_eq!(p.remaining_payload(), b"ef");
        p.consume(2);
        assert!(p.remaining_payload().is_empty());
    }

    #[test]
    fn test_truncated_rejected() {
        assert!(Packet::from_bytes(vec![0u8; 10]).is_err());

        // Option size pointing past the end of the buffer.
        let mut builder = PacketBuilder::new(1, 2, 3, 0, &[]).flags(0, 100);
        builder.append(b"short");
        let bytes = builder.build().into_bytes();
        assert!(Packet::from_bytes(bytes).is_err());
    }

    #[test]
    fn test_oversized_rejected() {
        assert!(Packet::from_bytes(vec![0u8; MAX_PACKET_SIZE + 1]).is_err());
    }

    #[test]
    fn test_nack_count_overflow_rejected() {
        // A NACK count whose block runs past the end of the buffer.
        let mut bytes = PacketBuilder::new(1, 2, 3, 0, &[]).flags(0, 0).build().into_bytes();
        bytes[16] = 200;
        assert!(Packet::from_bytes(bytes).is_err());
    }

    #[test]
    fn test_zero_and_patch_region() {
        let mut p = build_sample(&[], b"sigsig", b"");
        let start = p.options_offset();
        p.zero_region(start, 6);
        assert_eq!(p.options(), b"\0\0\0\0\0\0");
        p.write_region(start, b"sigsig");
        assert_eq!(p.options(), b"sigsig");
    }
}
