//! In-memory collaborator doubles shared by the streaming tests.
//!
//! The loopback tunnel manager captures every block an outbound tunnel is
//! handed, so tests can inspect raw packets or deliver them to the peer
//! destination by hand, packet by packet.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use allium_netdb::{NetDb, NetDbConfig};
use allium_types::i2np::I2npMessage;
use allium_types::traits::{
    GarlicProvider, GarlicSession, InboundTunnel, OutboundTunnel, Transport, TunnelManager,
    TunnelMessageBlock, TunnelPool,
};
use allium_types::router_info::RouterCaps;
use allium_types::{IdentHash, LeaseSet, PrivateKeys, RouterInfo};

use crate::data;
use crate::destination::StreamingDestination;
use crate::packet::Packet;

pub(crate) struct NullTransport;

impl Transport for NullTransport {
    fn send_message(&self, _to: &IdentHash, _msg: I2npMessage) {}
}

pub(crate) struct PassthroughGarlic;

struct PassthroughSession;

impl GarlicSession for PassthroughSession {
    fn wrap_single_message(&self, msg: I2npMessage, _lease_set: Option<&LeaseSet>) -> I2npMessage {
        msg
    }
}

impl GarlicProvider for PassthroughGarlic {
    fn routing_session(&self, _remote: &LeaseSet, _num_tags: usize) -> Arc<dyn GarlicSession> {
        Arc::new(PassthroughSession)
    }
    fn tagged_session(&self, _key: [u8; 32], _tag: [u8; 32]) -> Arc<dyn GarlicSession> {
        Arc::new(PassthroughSession)
    }
}

struct LoopInbound {
    gateway: IdentHash,
    tunnel_id: u32,
}

impl InboundTunnel for LoopInbound {
    fn gateway_ident(&self) -> IdentHash {
        self.gateway
    }
    fn gateway_tunnel_id(&self) -> u32 {
        self.tunnel_id
    }
    fn expiration_ms(&self) -> u64 {
        allium_types::millis_since_epoch() + 10 * 60 * 1000
    }
}

struct CaptureOutbound {
    sink: Arc<Mutex<VecDeque<TunnelMessageBlock>>>,
}

impl OutboundTunnel for CaptureOutbound {
    fn send_tunnel_data(&self, blocks: Vec<TunnelMessageBlock>) {
        self.sink.lock().unwrap().extend(blocks);
    }
}

/// One destination's pool: outbound tunnels write into a shared sink.
pub(crate) struct LoopPool {
    sink: Arc<Mutex<VecDeque<TunnelMessageBlock>>>,
    inbound: Arc<LoopInbound>,
}

impl LoopPool {
    fn new(index: u32) -> Self {
        Self {
            sink: Arc::new(Mutex::new(VecDeque::new())),
            inbound: Arc::new(LoopInbound {
                gateway: IdentHash::of(format!("gateway-{index}").as_bytes()),
                tunnel_id: 1000 + index,
            }),
        }
    }

    /// Drain every captured block.
    pub(crate) fn take_blocks(&self) -> Vec<TunnelMessageBlock> {
        self.sink.lock().unwrap().drain(..).collect()
    }
}

impl TunnelPool for LoopPool {
    fn next_outbound_tunnel(
        &self,
        _prev: Option<&Arc<dyn OutboundTunnel>>,
    ) -> Option<Arc<dyn OutboundTunnel>> {
        Some(Arc::new(CaptureOutbound {
            sink: self.sink.clone(),
        }))
    }
    fn next_inbound_tunnel(&self) -> Option<Arc<dyn InboundTunnel>> {
        Some(self.inbound.clone())
    }
    fn inbound_tunnels(&self) -> Vec<Arc<dyn InboundTunnel>> {
        vec![self.inbound.clone()]
    }
}

/// Records every pool it creates so tests can reach the capture sinks.
pub(crate) struct LoopTunnelManager {
    pools: Mutex<Vec<Arc<LoopPool>>>,
    counter: Mutex<u32>,
}

impl LoopTunnelManager {
    pub(crate) fn new() -> Self {
        Self {
            pools: Mutex::new(Vec::new()),
            counter: Mutex::new(0),
        }
    }

    /// The pool most recently created (the last destination's).
    pub(crate) fn last_pool(&self) -> Arc<LoopPool> {
        self.pools.lock().unwrap().last().unwrap().clone()
    }
}

impl TunnelManager for LoopTunnelManager {
    fn create_tunnel_pool(&self, _hops: usize) -> Arc<dyn TunnelPool> {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        let pool = Arc::new(LoopPool::new(*counter));
        self.pools.lock().unwrap().push(pool.clone());
        pool
    }
    fn exploratory_pool(&self) -> Arc<dyn TunnelPool> {
        self.create_tunnel_pool(2)
    }
}

/// A directory instance backed by a temp dir, never started; tests use its
/// store directly.
pub(crate) fn test_netdb(dir: &std::path::Path) -> Arc<NetDb> {
    let keys = PrivateKeys::generate();
    let router_info = RouterInfo::create(&keys, RouterCaps(0), Vec::new());
    Arc::new(NetDb::new(
        NetDbConfig {
            data_dir: dir.to_path_buf(),
        },
        keys,
        router_info,
        Arc::new(NullTransport),
        Arc::new(LoopTunnelManager::new()),
        Arc::new(PassthroughGarlic),
        None,
    ))
}

/// Decode the streaming packet inside one captured block.
pub(crate) fn packet_of(block: &TunnelMessageBlock) -> Packet {
    match &block.msg {
        I2npMessage::Data(frame) => data::from_data_payload(frame).expect("decodable frame"),
        other => panic!("expected Data message, got {other:?}"),
    }
}

/// Deliver blocks to a destination as if they crossed the network.
pub(crate) fn deliver(blocks: Vec<TunnelMessageBlock>, to: &StreamingDestination) {
    for block in blocks {
        to.handle_next_packet(packet_of(&block));
    }
}

/// Shuttle every pending block from `pool` into `to`. Returns how many.
pub(crate) fn pump(pool: &LoopPool, to: &StreamingDestination) -> usize {
    let blocks = pool.take_blocks();
    let count = blocks.len();
    deliver(blocks, to);
    count
}
