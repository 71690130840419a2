//! Directory and data message payloads exchanged between routers.
//!
//! Only the message bodies the core produces and consumes are modeled here:
//! the three directory messages (store, lookup, search reply), the Data
//! message carrying streaming payloads, the tunnel-gateway wrapper used when
//! a reply must enter a tunnel directly, and opaque garlic envelopes
//! produced by the garlic collaborator.
//!
//! ## Wire formats (big-endian)
//!
//! ```text
//! DatabaseStore {
//!     key:         [u8; 32],
//!     type:        u8,        // 0 = RouterInfo (gzipped), 1 = LeaseSet
//!     reply_token: u32,
//!     [reply_tunnel_id: u32, reply_gateway: [u8; 32]]   // if reply_token != 0
//!     payload:     u16 length + gzip blob | raw LeaseSet
//! }
//!
//! DatabaseLookup {
//!     key:   [u8; 32],
//!     from:  [u8; 32],
//!     flags: u8,              // 0x01 reply to tunnel, 0x02 encrypted reply,
//!                             // bits 2-3 lookup type
//!     [reply_tunnel_id: u32]  // if flags & 0x01
//!     num_excluded: u16, excluded: [u8; 32] * n,
//!     [session_key: [u8; 32], num_tags: u8, tags: [u8; 32] * n]  // if flags & 0x02
//! }
//!
//! DatabaseSearchReply {
//!     key: [u8; 32], num: u8, peers: [u8; 32] * num, from: [u8; 32]
//! }
//! ```

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::ident::IdentHash;
use crate::{DataError, Result, MAX_ROUTER_INFO_SIZE};

/// Message type codes.
pub const MSG_DATABASE_STORE: u8 = 1;
pub const MSG_DATABASE_LOOKUP: u8 = 2;
pub const MSG_DATABASE_SEARCH_REPLY: u8 = 3;
pub const MSG_GARLIC: u8 = 11;
pub const MSG_TUNNEL_GATEWAY: u8 = 19;
pub const MSG_DATA: u8 = 20;

/// DatabaseLookup flag: route the reply into a tunnel.
pub const LOOKUP_FLAG_TUNNEL: u8 = 0x01;
/// DatabaseLookup flag: garlic-wrap the reply with the supplied tag.
pub const LOOKUP_FLAG_ENCRYPTED: u8 = 0x02;

/// Maximum excluded peers accepted in a lookup.
pub const MAX_EXCLUDED_PEERS: usize = 512;

/// What a lookup is asking for, carried in flag bits 2-3.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LookupType {
    Any = 0,
    LeaseSet = 1,
    RouterInfo = 2,
    Exploration = 3,
}

impl LookupType {
    fn from_flags(flags: u8) -> Self {
        match (flags >> 2) & 0x03 {
            1 => LookupType::LeaseSet,
            2 => LookupType::RouterInfo,
            3 => LookupType::Exploration,
            _ => LookupType::Any,
        }
    }
}

/// Payload of a DatabaseStore: one record, keyed by its owner's address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorePayload {
    /// An uncompressed RouterInfo blob (gzipped on the wire).
    RouterInfo(Vec<u8>),
    /// A raw LeaseSet blob.
    LeaseSet(Vec<u8>),
}

/// A record being pushed to a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseStore {
    pub key: IdentHash,
    pub payload: StorePayload,
    pub reply_token: u32,
    pub reply_tunnel_id: u32,
    pub reply_gateway: IdentHash,
}

impl DatabaseStore {
    /// Store for a RouterInfo blob with no reply requested.
    pub fn router_info(key: IdentHash, blob: Vec<u8>) -> Self {
        Self {
            key,
            payload: StorePayload::RouterInfo(blob),
            reply_token: 0,
            reply_tunnel_id: 0,
            reply_gateway: IdentHash::default(),
        }
    }

    /// Store for a LeaseSet blob with no reply requested.
    pub fn lease_set(key: IdentHash, blob: Vec<u8>) -> Self {
        Self {
            key,
            payload: StorePayload::LeaseSet(blob),
            reply_token: 0,
            reply_tunnel_id: 0,
            reply_gateway: IdentHash::default(),
        }
    }
}

/// A directory query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseLookup {
    pub key: IdentHash,
    pub from: IdentHash,
    pub lookup_type: LookupType,
    /// Nonzero when the reply should be delivered into `from`'s tunnel.
    pub reply_tunnel_id: Option<u32>,
    pub excluded: Vec<IdentHash>,
    /// Session key and tags for an encrypted reply.
    pub reply_key: Option<([u8; 32], Vec<[u8; 32]>)>,
}

/// The closest-peers answer to a lookup that found nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseSearchReply {
    pub key: IdentHash,
    pub peers: Vec<IdentHash>,
    pub from: IdentHash,
}

/// A message body as dispatched between the core's subsystems.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum I2npMessage {
    DatabaseStore(DatabaseStore),
    DatabaseLookup(DatabaseLookup),
    DatabaseSearchReply(DatabaseSearchReply),
    /// A framed streaming payload (gzip blob; the length prefix is added on
    /// the wire).
    Data(Vec<u8>),
    /// A message to be injected at a tunnel gateway.
    TunnelGateway { tunnel_id: u32, inner: Box<I2npMessage> },
    /// An opaque garlic envelope produced by the garlic collaborator.
    Garlic(Vec<u8>),
}

impl I2npMessage {
    pub fn type_id(&self) -> u8 {
        match self {
            I2npMessage::DatabaseStore(_) => MSG_DATABASE_STORE,
            I2npMessage::DatabaseLookup(_) => MSG_DATABASE_LOOKUP,
            I2npMessage::DatabaseSearchReply(_) => MSG_DATABASE_SEARCH_REPLY,
            I2npMessage::Data(_) => MSG_DATA,
            I2npMessage::TunnelGateway { .. } => MSG_TUNNEL_GATEWAY,
            I2npMessage::Garlic(_) => MSG_GARLIC,
        }
    }

    /// Serialize as a type byte followed by the message body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![self.type_id()];
        match self {
            I2npMessage::DatabaseStore(store) => {
                out.extend_from_slice(store.key.as_bytes());
                match &store.payload {
                    StorePayload::RouterInfo(blob) => {
                        out.push(0);
                        push_reply(&mut out, store);
                        let gz = gzip_compress(blob, false)?;
                        if gz.len() > MAX_ROUTER_INFO_SIZE {
                            return Err(DataError::TooLarge {
                                what: "RouterInfo",
                                len: gz.len(),
                                max: MAX_ROUTER_INFO_SIZE,
                            });
                        }
                        out.extend_from_slice(&(gz.len() as u16).to_be_bytes());
                        out.extend_from_slice(&gz);
                    }
                    StorePayload::LeaseSet(blob) => {
                        out.push(1);
                        push_reply(&mut out, store);
                        out.extend_from_slice(blob);
                    }
                }
            }
            I2npMessage::DatabaseLookup(lookup) => {
                out.extend_from_slice(lookup.key.as_bytes());
                out.extend_from_slice(lookup.from.as_bytes());
                let mut flags = (lookup.lookup_type as u8) << 2;
                if lookup.reply_tunnel_id.is_some() {
                    flags |= LOOKUP_FLAG_TUNNEL;
                }
                if lookup.reply_key.is_some() {
                    flags |= LOOKUP_FLAG_ENCRYPTED;
                }
                out.push(flags);
                if let Some(tunnel_id) = lookup.reply_tunnel_id {
                    out.extend_from_slice(&tunnel_id.to_be_bytes());
                }
                out.extend_from_slice(&(lookup.excluded.len() as u16).to_be_bytes());
                for peer in &lookup.excluded {
                    out.extend_from_slice(peer.as_bytes());
                }
                if let Some((key, tags)) = &lookup.reply_key {
                    out.extend_from_slice(key);
                    out.push(tags.len() as u8);
                    for tag in tags {
                        out.extend_from_slice(tag);
                    }
                }
            }
            I2npMessage::DatabaseSearchReply(reply) => {
                out.extend_from_slice(reply.key.as_bytes());
                out.push(reply.peers.len() as u8);
                for peer in &reply.peers {
                    out.extend_from_slice(peer.as_bytes());
                }
                out.extend_from_slice(reply.from.as_bytes());
            }
            I2npMessage::Data(payload) => {
                out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                out.extend_from_slice(payload);
            }
            I2npMessage::TunnelGateway { tunnel_id, inner } => {
                out.extend_from_slice(&tunnel_id.to_be_bytes());
                let inner = inner.encode()?;
                out.extend_from_slice(&(inner.len() as u16).to_be_bytes());
                out.extend_from_slice(&inner);
            }
            I2npMessage::Garlic(blob) => {
                out.extend_from_slice(&(blob.len() as u32).to_be_bytes());
                out.extend_from_slice(blob);
            }
        }
        Ok(out)
    }

    /// Parse a type byte followed by the message body.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let malformed = |detail: String| DataError::Malformed {
            what: "I2NP message",
            detail,
        };
        let (&type_id, body) = bytes
            .split_first()
            .ok_or_else(|| malformed("empty message".into()))?;
        match type_id {
            MSG_DATABASE_STORE => decode_store(body),
            MSG_DATABASE_LOOKUP => decode_lookup(body),
            MSG_DATABASE_SEARCH_REPLY => decode_search_reply(body),
            MSG_DATA => {
                let len = read_u32(body, 0)? as usize;
                let payload = body
                    .get(4..4 + len)
                    .ok_or_else(|| malformed("truncated data payload".into()))?;
                Ok(I2npMessage::Data(payload.to_vec()))
            }
            MSG_TUNNEL_GATEWAY => {
                let tunnel_id = read_u32(body, 0)?;
                let len = read_u16(body, 4)? as usize;
                let inner = body
                    .get(6..6 + len)
                    .ok_or_else(|| malformed("truncated gateway payload".into()))?;
                Ok(I2npMessage::TunnelGateway {
                    tunnel_id,
                    inner: Box::new(I2npMessage::decode(inner)?),
                })
            }
            MSG_GARLIC => {
                let len = read_u32(body, 0)? as usize;
                let payload = body
                    .get(4..4 + len)
                    .ok_or_else(|| malformed("truncated garlic payload".into()))?;
                Ok(I2npMessage::Garlic(payload.to_vec()))
            }
            other => Err(malformed(format!("unexpected message type {other}"))),
        }
    }
}

fn push_reply(out: &mut Vec<u8>, store: &DatabaseStore) {
    out.extend_from_slice(&store.reply_token.to_be_bytes());
    if store.reply_token != 0 {
        out.extend_from_slice(&store.reply_tunnel_id.to_be_bytes());
        out.extend_from_slice(store.reply_gateway.as_bytes());
    }
}

fn decode_store(body: &[u8]) -> Result<I2npMessage> {
    let malformed = |detail: &str| DataError::Malformed {
        what: "DatabaseStore",
        detail: detail.into(),
    };
    let key = IdentHash::from_slice(body).ok_or_else(|| malformed("truncated key"))?;
    let store_type = *body.get(32).ok_or_else(|| malformed("missing type"))?;
    let reply_token = read_u32(body, 33)?;
    let mut pos = 37;
    let (reply_tunnel_id, reply_gateway) = if reply_token != 0 {
        let tunnel_id = read_u32(body, pos)?;
        let gateway = IdentHash::from_slice(body.get(pos + 4..).unwrap_or_default())
            .ok_or_else(|| malformed("truncated reply gateway"))?;
        pos += 36;
        (tunnel_id, gateway)
    } else {
        (0, IdentHash::default())
    };
    let payload = match store_type {
        0 => {
            let declared = read_u16(body, pos)? as usize;
            if declared > MAX_ROUTER_INFO_SIZE {
                return Err(DataError::TooLarge {
                    what: "RouterInfo",
                    len: declared,
                    max: MAX_ROUTER_INFO_SIZE,
                });
            }
            let gz = body
                .get(pos + 2..pos + 2 + declared)
                .ok_or_else(|| malformed("truncated RouterInfo blob"))?;
            StorePayload::RouterInfo(gzip_decompress(gz, MAX_ROUTER_INFO_SIZE)?)
        }
        1 => StorePayload::LeaseSet(body[pos..].to_vec()),
        other => {
            return Err(DataError::Malformed {
                what: "DatabaseStore",
                detail: format!("unknown store type {other}"),
            })
        }
    };
    Ok(I2npMessage::DatabaseStore(DatabaseStore {
        key,
        payload,
        reply_token,
        reply_tunnel_id,
        reply_gateway,
    }))
}

fn decode_lookup(body: &[u8]) -> Result<I2npMessage> {
    let malformed = |detail: &str| DataError::Malformed {
        what: "DatabaseLookup",
        detail: detail.into(),
    };
    let key = IdentHash::from_slice(body).ok_or_else(|| malformed("truncated key"))?;
    let from = IdentHash::from_slice(body.get(32..).unwrap_or_default())
        .ok_or_else(|| malformed("truncated from"))?;
    let flags = *body.get(64).ok_or_else(|| malformed("missing flags"))?;
    let mut pos = 65;
    let reply_tunnel_id = if flags & LOOKUP_FLAG_TUNNEL != 0 {
        let id = read_u32(body, pos)?;
        pos += 4;
        Some(id)
    } else {
        None
    };
    let mut num_excluded = read_u16(body, pos)? as usize;
    pos += 2;
    if num_excluded > MAX_EXCLUDED_PEERS {
        tracing::warn!(num_excluded, "excluded peer count over limit, ignoring list");
        num_excluded = 0;
    }
    let mut excluded = Vec::with_capacity(num_excluded);
    for _ in 0..num_excluded {
        let peer = IdentHash::from_slice(body.get(pos..).unwrap_or_default())
            .ok_or_else(|| malformed("truncated excluded peer"))?;
        excluded.push(peer);
        pos += 32;
    }
    let reply_key = if flags & LOOKUP_FLAG_ENCRYPTED != 0 {
        let key: [u8; 32] = body
            .get(pos..pos + 32)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| malformed("truncated session key"))?;
        let num_tags = *body.get(pos + 32).ok_or_else(|| malformed("missing tag count"))? as usize;
        pos += 33;
        let mut tags = Vec::with_capacity(num_tags);
        for _ in 0..num_tags {
            let tag: [u8; 32] = body
                .get(pos..pos + 32)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| malformed("truncated session tag"))?;
            tags.push(tag);
            pos += 32;
        }
        Some((key, tags))
    } else {
        None
    };
    Ok(I2npMessage::DatabaseLookup(DatabaseLookup {
        key,
        from,
        lookup_type: LookupType::from_flags(flags),
        reply_tunnel_id,
        excluded,
        reply_key,
    }))
}

fn decode_search_reply(body: &[u8]) -> Result<I2npMessage> {
    let malformed = |detail: &str| DataError::Malformed {
        what: "DatabaseSearchReply",
        detail: detail.into(),
    };
    let key = IdentHash::from_slice(body).ok_or_else(|| malformed("truncated key"))?;
    let num = *body.get(32).ok_or_else(|| malformed("missing count"))? as usize;
    let mut pos = 33;
    let mut peers = Vec::with_capacity(num);
    for _ in 0..num {
        let peer = IdentHash::from_slice(body.get(pos..).unwrap_or_default())
            .ok_or_else(|| malformed("truncated peer hash"))?;
        peers.push(peer);
        pos += 32;
    }
    let from = IdentHash::from_slice(body.get(pos..).unwrap_or_default())
        .ok_or_else(|| malformed("truncated from"))?;
    Ok(I2npMessage::DatabaseSearchReply(DatabaseSearchReply {
        key,
        peers,
        from,
    }))
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16> {
    buf.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes(b.try_into().unwrap()))
        .ok_or_else(|| DataError::Malformed {
            what: "I2NP message",
            detail: format!("truncated u16 at {pos}"),
        })
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32> {
    buf.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
        .ok_or_else(|| DataError::Malformed {
            what: "I2NP message",
            detail: format!("truncated u32 at {pos}"),
        })
}

/// Gzip-compress `data`. `fast` selects the minimum deflate level, used for
/// payloads too small to benefit from real compression.
pub fn gzip_compress(data: &[u8], fast: bool) -> Result<Vec<u8>> {
    let level = if fast {
        flate2::Compression::fast()
    } else {
        flate2::Compression::default()
    };
    let mut encoder = GzEncoder::new(Vec::new(), level);
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| DataError::Compression(e.to_string()))
}

/// Gzip-decompress `data`, refusing output larger than `max`.
pub fn gzip_decompress(data: &[u8], max: usize) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data).take(max as u64 + 1);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| DataError::Compression(e.to_string()))?;
    if out.len() > max {
        return Err(DataError::TooLarge {
            what: "decompressed payload",
            len: out.len(),
            max,
        });
    }
    Ok(out)
}
