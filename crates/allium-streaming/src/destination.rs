//! One identity multiplexing many streams over a shared tunnel pool.
//!
//! A destination owns its private keys, a 3-hop tunnel pool, an optional
//! current LeaseSet, and the streams indexed by their receive stream ID.
//! Incoming packets are dispatched by the peer-chosen `send_stream_id`;
//! zero means a brand new incoming conversation, which goes to the acceptor
//! hook or is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use allium_netdb::NetDb;
use allium_types::traits::{GarlicProvider, TunnelManager, TunnelPool};
use allium_types::{IdentHash, Identity, Lease, LeaseSet, PrivateKeys};

use crate::packet::Packet;
use crate::stream::{Stream, StreamInner};
use crate::TUNNEL_POOL_HOPS;

/// Hook invoked with each accepted incoming stream.
pub type Acceptor = Box<dyn Fn(Stream) + Send + Sync>;

/// A local streaming endpoint.
#[derive(Clone)]
pub struct StreamingDestination {
    pub(crate) inner: Arc<DestinationInner>,
}

pub(crate) struct DestinationInner {
    keys: PrivateKeys,
    is_public: bool,
    pool: Arc<dyn TunnelPool>,
    garlic: Arc<dyn GarlicProvider>,
    netdb: Arc<NetDb>,
    lease_set: Mutex<Option<LeaseSet>>,
    streams: Mutex<HashMap<u32, Arc<StreamInner>>>,
    acceptor: Mutex<Option<Acceptor>>,
}

impl StreamingDestination {
    pub fn new(
        keys: PrivateKeys,
        is_public: bool,
        tunnels: &dyn TunnelManager,
        garlic: Arc<dyn GarlicProvider>,
        netdb: Arc<NetDb>,
    ) -> Self {
        let pool = tunnels.create_tunnel_pool(TUNNEL_POOL_HOPS);
        if is_public {
            info!(address = %keys.ident_hash().to_base32(), "local address created");
        }
        Self {
            inner: Arc::new(DestinationInner {
                keys,
                is_public,
                pool,
                garlic,
                netdb,
                lease_set: Mutex::new(None),
                streams: Mutex::new(HashMap::new()),
                acceptor: Mutex::new(None),
            }),
        }
    }

    pub fn identity(&self) -> &Identity {
        self.inner.keys.identity()
    }

    pub fn ident_hash(&self) -> IdentHash {
        self.inner.keys.ident_hash()
    }

    pub fn is_public(&self) -> bool {
        self.inner.is_public
    }

    /// Open a stream towards `remote`.
    pub fn create_outgoing_stream(&self, remote: LeaseSet) -> Stream {
        let stream = StreamInner::new(&self.inner, Some(remote));
        let handle = Stream { inner: stream.clone() };
        self.inner
            .streams
            .lock()
            .unwrap()
            .insert(stream.recv_stream_id, stream);
        handle
    }

    /// Route one decoded packet to its stream.
    pub fn handle_next_packet(&self, packet: Packet) {
        let send_stream_id = packet.send_stream_id();
        if send_stream_id != 0 {
            let stream = self
                .inner
                .streams
                .lock()
                .unwrap()
                .get(&send_stream_id)
                .cloned();
            match stream {
                Some(stream) => stream.handle_next_packet(packet),
                None => debug!(send_stream_id, "packet for unknown stream dropped"),
            }
            return;
        }

        // A new incoming conversation.
        let stream = StreamInner::new(&self.inner, None);
        let handle = Stream { inner: stream.clone() };
        self.inner
            .streams
            .lock()
            .unwrap()
            .insert(stream.recv_stream_id, stream.clone());
        stream.handle_next_packet(packet);
        let accepted = {
            let acceptor = self.inner.acceptor.lock().unwrap();
            match acceptor.as_ref() {
                Some(acceptor) => {
                    acceptor(handle);
                    true
                }
                None => false,
            }
        };
        if !accepted {
            warn!("no acceptor for incoming stream, dropping");
            self.delete_stream(stream.recv_stream_id);
        }
    }

    /// Close and remove one stream.
    pub fn delete_stream(&self, recv_stream_id: u32) {
        let stream = self.inner.streams.lock().unwrap().remove(&recv_stream_id);
        if let Some(stream) = stream {
            stream.close();
        }
    }

    pub fn set_acceptor(&self, acceptor: Acceptor) {
        *self.inner.acceptor.lock().unwrap() = Some(acceptor);
    }

    pub fn reset_acceptor(&self) {
        *self.inner.acceptor.lock().unwrap() = None;
    }

    pub fn is_acceptor_set(&self) -> bool {
        self.inner.acceptor.lock().unwrap().is_some()
    }

    /// The current LeaseSet, built from the pool on first use.
    pub fn lease_set(&self) -> Option<LeaseSet> {
        self.inner.lease_set()
    }

    /// The tunnel pool changed: rebuild the LeaseSet, have every stream
    /// prepend it to its next batch, and publish it when public.
    pub fn set_lease_set_updated(&self) {
        self.inner.update_lease_set();
        let streams: Vec<Arc<StreamInner>> =
            self.inner.streams.lock().unwrap().values().cloned().collect();
        for stream in streams {
            Stream { inner: stream }.set_lease_set_updated();
        }
        if self.inner.is_public {
            if let Some(lease_set) = self.inner.lease_set() {
                self.inner
                    .netdb
                    .publish_lease_set(&lease_set, &*self.inner.pool);
            }
        }
    }

    /// Tear down every stream; called when the destination is retired.
    pub fn shutdown(&self) {
        let streams: Vec<Arc<StreamInner>> = {
            let mut map = self.inner.streams.lock().unwrap();
            map.drain().map(|(_, s)| s).collect()
        };
        for stream in streams {
            stream.close();
        }
    }

    pub fn stream_count(&self) -> usize {
        self.inner.streams.lock().unwrap().len()
    }
}

impl DestinationInner {
    pub(crate) fn keys(&self) -> &PrivateKeys {
        &self.keys
    }

    pub(crate) fn netdb(&self) -> &Arc<NetDb> {
        &self.netdb
    }

    pub(crate) fn garlic(&self) -> &Arc<dyn GarlicProvider> {
        &self.garlic
    }

    pub(crate) fn pool(&self) -> &Arc<dyn TunnelPool> {
        &self.pool
    }

    pub(crate) fn lease_set(&self) -> Option<LeaseSet> {
        let mut lease_set = self.lease_set.lock().unwrap();
        if lease_set.is_none() {
            *lease_set = self.build_lease_set();
        }
        lease_set.clone()
    }

    fn update_lease_set(&self) {
        let fresh = self.build_lease_set();
        *self.lease_set.lock().unwrap() = fresh;
    }

    fn build_lease_set(&self) -> Option<LeaseSet> {
        let leases: Vec<Lease> = self
            .pool
            .inbound_tunnels()
            .iter()
            .map(|tunnel| Lease {
                tunnel_gateway: tunnel.gateway_ident(),
                tunnel_id: tunnel.gateway_tunnel_id(),
                end_date_ms: tunnel.expiration_ms(),
            })
            .collect();
        if leases.is_empty() {
            return None;
        }
        Some(LeaseSet::create(&self.keys, leases))
    }
}
