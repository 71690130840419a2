//! Contracts of the collaborators the core drives but does not implement.
//!
//! The low-level transports, the tunnel building machinery, the garlic
//! layer, and the reseed downloader live outside this workspace. The core
//! only ever talks to them through these traits; tests substitute in-memory
//! loopback implementations.

use std::sync::Arc;

use crate::i2np::I2npMessage;
use crate::ident::IdentHash;
use crate::lease_set::LeaseSet;

/// How a tunnel message block is to be delivered at the tunnel endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeliveryType {
    /// Deliver to a router directly.
    Router,
    /// Deliver into a tunnel at a gateway router.
    Tunnel,
}

/// One message handed to an outbound tunnel for delivery.
pub struct TunnelMessageBlock {
    pub delivery: DeliveryType,
    pub to: IdentHash,
    /// Gateway tunnel ID; only meaningful for [`DeliveryType::Tunnel`].
    pub tunnel_id: u32,
    pub msg: I2npMessage,
}

/// The raw outward path used when tunnels are unavailable or anonymity is
/// not required (direct floodfill queries, lookup replies).
pub trait Transport: Send + Sync {
    fn send_message(&self, to: &IdentHash, msg: I2npMessage);
}

/// An established outbound tunnel.
pub trait OutboundTunnel: Send + Sync {
    fn send_tunnel_data(&self, blocks: Vec<TunnelMessageBlock>);
}

/// An established inbound tunnel; its gateway is what peers must hit to
/// reach us.
pub trait InboundTunnel: Send + Sync {
    fn gateway_ident(&self) -> IdentHash;
    fn gateway_tunnel_id(&self) -> u32;
    /// When the tunnel's lease expires, in milliseconds since epoch.
    fn expiration_ms(&self) -> u64;
}

/// A pool of currently usable tunnels belonging to one destination (or the
/// shared exploratory pool).
pub trait TunnelPool: Send + Sync {
    /// Round-robin over outbound tunnels, avoiding `prev` when possible.
    fn next_outbound_tunnel(
        &self,
        prev: Option<&Arc<dyn OutboundTunnel>>,
    ) -> Option<Arc<dyn OutboundTunnel>>;

    fn next_inbound_tunnel(&self) -> Option<Arc<dyn InboundTunnel>>;

    /// All live inbound tunnels, for building a lease set.
    fn inbound_tunnels(&self) -> Vec<Arc<dyn InboundTunnel>>;
}

/// Creates tunnel pools for destinations.
pub trait TunnelManager: Send + Sync {
    fn create_tunnel_pool(&self, hops: usize) -> Arc<dyn TunnelPool>;
    /// The shared exploratory pool used by the directory.
    fn exploratory_pool(&self) -> Arc<dyn TunnelPool>;
}

/// An established garlic session with one remote destination.
pub trait GarlicSession: Send + Sync {
    /// Wrap `msg` in a single garlic envelope, optionally bundling our
    /// current lease set alongside it.
    fn wrap_single_message(&self, msg: I2npMessage, lease_set: Option<&LeaseSet>) -> I2npMessage;
}

/// Hands out garlic sessions.
pub trait GarlicProvider: Send + Sync {
    /// Session keyed by the remote's lease set, provisioned with `num_tags`
    /// session tags.
    fn routing_session(&self, remote: &LeaseSet, num_tags: usize) -> Arc<dyn GarlicSession>;

    /// One-shot session from an explicit key and tag, used for encrypted
    /// lookup replies.
    fn tagged_session(&self, session_key: [u8; 32], tag: [u8; 32]) -> Arc<dyn GarlicSession>;
}

/// The SU3 reseed downloader.
pub trait Reseeder: Send + Sync {
    /// Load the signing certificates needed to verify SU3 bundles.
    fn load_certificates(&self);
    /// Fetch and unpack one reseed bundle; true on success.
    fn reseed_now_su3(&self) -> bool;
}
