//! Detached collaborator endpoints.
//!
//! The transport stack, tunnel builder, and garlic layer live outside this
//! workspace. Until one is attached, the daemon wires the core against
//! these endpoints: sends are logged and dropped, no tunnels exist, and
//! garlic envelopes pass through unwrapped. The directory, streaming
//! state machines, control channel, and boundary services all run
//! normally on top.

use std::sync::Arc;

use tracing::debug;

use allium_types::i2np::I2npMessage;
use allium_types::traits::{
    GarlicProvider, GarlicSession, InboundTunnel, OutboundTunnel, Transport, TunnelManager,
    TunnelPool,
};
use allium_types::{IdentHash, LeaseSet};

/// Drops outgoing messages until a real transport is attached.
pub struct OfflineTransport;

impl Transport for OfflineTransport {
    fn send_message(&self, to: &IdentHash, msg: I2npMessage) {
        debug!(%to, type_id = msg.type_id(), "no transport attached, dropping message");
    }
}

/// A pool with no tunnels in it.
pub struct OfflinePool;

impl TunnelPool for OfflinePool {
    fn next_outbound_tunnel(
        &self,
        _prev: Option<&Arc<dyn OutboundTunnel>>,
    ) -> Option<Arc<dyn OutboundTunnel>> {
        None
    }
    fn next_inbound_tunnel(&self) -> Option<Arc<dyn InboundTunnel>> {
        None
    }
    fn inbound_tunnels(&self) -> Vec<Arc<dyn InboundTunnel>> {
        Vec::new()
    }
}

/// Hands out empty pools.
pub struct OfflineTunnels;

impl TunnelManager for OfflineTunnels {
    fn create_tunnel_pool(&self, _hops: usize) -> Arc<dyn TunnelPool> {
        Arc::new(OfflinePool)
    }
    fn exploratory_pool(&self) -> Arc<dyn TunnelPool> {
        Arc::new(OfflinePool)
    }
}

/// Passes messages through without a garlic envelope.
pub struct OfflineGarlic;

struct OfflineSession;

impl GarlicSession for OfflineSession {
    fn wrap_single_message(&self, msg: I2npMessage, _lease_set: Option<&LeaseSet>) -> I2npMessage {
        msg
    }
}

impl GarlicProvider for OfflineGarlic {
    fn routing_session(&self, _remote: &LeaseSet, _num_tags: usize) -> Arc<dyn GarlicSession> {
        Arc::new(OfflineSession)
    }
    fn tagged_session(&self, _key: [u8; 32], _tag: [u8; 32]) -> Arc<dyn GarlicSession> {
        Arc::new(OfflineSession)
    }
}
