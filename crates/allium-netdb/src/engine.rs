//! The directory loop: message dispatch, iterative lookup, exploration,
//! publication, and periodic maintenance.
//!
//! A dedicated thread pulls decoded messages off the [`MsgQueue`] with a
//! 15-second timeout. Timeouts drive lookup retries; every tick evaluates
//! the periodic save, publish, and explore tasks. A malformed message is
//! logged and dropped; the loop never stops on one.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use tracing::{debug, info, warn};

use allium_types::i2np::{
    DatabaseLookup, DatabaseSearchReply, DatabaseStore, I2npMessage, StorePayload,
};
use allium_types::traits::{
    DeliveryType, GarlicProvider, InboundTunnel, OutboundTunnel, Reseeder, Transport,
    TunnelManager, TunnelMessageBlock, TunnelPool,
};
use allium_types::{IdentHash, LeaseSet, PrivateKeys, RouterInfo};

use crate::queue::MsgQueue;
use crate::requested::{RequestComplete, RequestedDestination};
use crate::store::NetDbStore;
use crate::{
    Result, CROWDED_ROUTER_COUNT, EXPLORE_INTERVAL_CROWDED_SECS,
    EXPLORE_INTERVAL_SECS, INTRODUCER_EXPIRATION_MS, MAX_LOOKUP_ATTEMPTS, MAX_RESEED_RETRIES,
    PUBLISH_FLOODFILL_COUNT, PUBLISH_INTERVAL_SECS, QUEUE_TIMEOUT_MS, REQUEST_LIFETIME_SECS,
    REQUEST_RETRY_SECS, RESEED_THRESHOLD, SAVE_INTERVAL_SECS,
};

/// Directory configuration.
pub struct NetDbConfig {
    /// Data directory; records live in its `netDb/` subdirectory.
    pub data_dir: PathBuf,
}

/// A decoded message handed across from the transport side, tagged with the
/// inbound tunnel it arrived through, if any.
pub struct QueuedMessage {
    pub msg: I2npMessage,
    pub from: Option<Arc<dyn InboundTunnel>>,
}

/// The floodfill directory.
pub struct NetDb {
    inner: Arc<NetDbInner>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

struct NetDbInner {
    store: NetDbStore,
    queue: MsgQueue<QueuedMessage>,
    requests: Mutex<HashMap<IdentHash, RequestedDestination>>,
    local_keys: PrivateKeys,
    local_router_info: RouterInfo,
    transport: Arc<dyn Transport>,
    tunnels: Arc<dyn TunnelManager>,
    garlic: Arc<dyn GarlicProvider>,
    reseeder: Option<Arc<dyn Reseeder>>,
    running: AtomicBool,
}

impl NetDb {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NetDbConfig,
        local_keys: PrivateKeys,
        local_router_info: RouterInfo,
        transport: Arc<dyn Transport>,
        tunnels: Arc<dyn TunnelManager>,
        garlic: Arc<dyn GarlicProvider>,
        reseeder: Option<Arc<dyn Reseeder>>,
    ) -> Self {
        Self {
            inner: Arc::new(NetDbInner {
                store: NetDbStore::new(&config.data_dir),
                queue: MsgQueue::new(),
                requests: Mutex::new(HashMap::new()),
                local_keys,
                local_router_info,
                transport,
                tunnels,
                garlic,
                reseeder,
                running: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }

    /// The record store, shared with the streaming layer.
    pub fn store(&self) -> &NetDbStore {
        &self.inner.store
    }

    /// Load persisted records, reseed if the table is too small, and start
    /// the directory loop.
    pub fn start(&self) -> Result<()> {
        self.inner.store.load()?;
        self.inner.reseed_if_needed()?;
        self.inner.running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("netdb".into())
            .spawn(move || inner.run())
            .expect("spawn netdb thread");
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop the loop and fail every open request.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.queue.wake();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let requests: Vec<_> = {
            let mut map = self.inner.requests.lock().unwrap();
            map.drain().map(|(_, d)| d).collect()
        };
        for request in requests {
            request.fail();
        }
    }

    /// Hand a decoded message to the directory loop.
    pub fn post_message(&self, msg: I2npMessage, from: Option<Arc<dyn InboundTunnel>>) {
        self.inner.queue.put(QueuedMessage { msg, from });
    }

    /// Look up a RouterInfo, asking the closest floodfill directly.
    pub fn request_destination(&self, key: IdentHash, on_complete: Option<RequestComplete>) {
        self.inner.request_destination(key, on_complete)
    }

    /// Publish a local destination's LeaseSet to its closest floodfill.
    pub fn publish_lease_set(&self, lease_set: &LeaseSet, pool: &dyn TunnelPool) {
        self.inner.publish_lease_set(lease_set, pool)
    }
}

impl NetDbInner {
    fn run(self: Arc<Self>) {
        let mut last_save = 0u64;
        let mut last_publish = 0u64;
        let mut last_explore = 0u64;
        while self.running.load(Ordering::SeqCst) {
            match self.queue.get_with_timeout(Duration::from_millis(QUEUE_TIMEOUT_MS)) {
                Some(first) => {
                    let mut next = Some(first);
                    while let Some(queued) = next {
                        if let Err(e) = self.dispatch(queued) {
                            warn!(error = %e, "dropping message");
                        }
                        next = self.queue.get();
                    }
                }
                None => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    self.manage_requests();
                }
            }

            let ts = allium_types::seconds_since_epoch();
            if ts.saturating_sub(last_save) >= SAVE_INTERVAL_SECS {
                if last_save > 0 {
                    if let Err(e) = self.store.save_updated() {
                        warn!(error = %e, "save pass failed");
                    }
                    self.store.manage_lease_sets();
                }
                last_save = ts;
            }
            if ts.saturating_sub(last_publish) >= PUBLISH_INTERVAL_SECS {
                self.publish();
                last_publish = ts;
            }
            if ts.saturating_sub(last_explore) >= EXPLORE_INTERVAL_SECS {
                let population = self.store.router_count();
                if population < CROWDED_ROUTER_COUNT
                    || ts.saturating_sub(last_explore) >= EXPLORE_INTERVAL_CROWDED_SECS
                {
                    let n = (800 / population.max(1)).clamp(1, 9);
                    self.explore(n);
                    last_explore = ts;
                }
            }
        }
    }

    fn reseed_if_needed(&self) -> Result<()> {
        let Some(reseeder) = &self.reseeder else {
            return Ok(());
        };
        if self.store.router_count() >= RESEED_THRESHOLD {
            return Ok(());
        }
        reseeder.load_certificates();
        let mut retries = 0;
        while self.store.router_count() < RESEED_THRESHOLD && retries < MAX_RESEED_RETRIES {
            if !reseeder.reseed_now_su3() {
                warn!(retries, "reseed attempt failed");
            }
            self.store.load()?;
            retries += 1;
        }
        if self.store.router_count() < RESEED_THRESHOLD {
            warn!("router table still small after {MAX_RESEED_RETRIES} reseed attempts");
        }
        Ok(())
    }

    fn dispatch(&self, queued: QueuedMessage) -> Result<()> {
        match queued.msg {
            I2npMessage::DatabaseStore(store) => {
                debug!("DatabaseStore");
                self.handle_database_store(store, queued.from)
            }
            I2npMessage::DatabaseSearchReply(reply) => {
                debug!("DatabaseSearchReply");
                self.handle_database_search_reply(reply);
                Ok(())
            }
            I2npMessage::DatabaseLookup(lookup) => {
                debug!("DatabaseLookup");
                self.handle_database_lookup(lookup);
                Ok(())
            }
            other => {
                warn!(type_id = other.type_id(), "unexpected message type in directory queue");
                Ok(())
            }
        }
    }

    fn handle_database_store(
        &self,
        store: DatabaseStore,
        from: Option<Arc<dyn InboundTunnel>>,
    ) -> Result<()> {
        match store.payload {
            StorePayload::RouterInfo(blob) => {
                let record = self.store.add_router_info(&blob)?;
                let ident = record.ident_hash();
                if ident != store.key {
                    warn!(key = %store.key, %ident, "store key does not match record identity");
                }
                self.complete_request(&ident, Some(record));
                Ok(())
            }
            StorePayload::LeaseSet(blob) => {
                self.store.add_lease_set(store.key, &blob, from.is_some())
            }
        }
    }

    fn handle_database_search_reply(&self, reply: DatabaseSearchReply) {
        let request = self.requests.lock().unwrap().remove(&reply.key);
        match request {
            Some(mut dest) => {
                let mut keep = false;
                if !reply.peers.is_empty()
                    && !dest.is_exploratory()
                    && dest.attempts() < MAX_LOOKUP_ATTEMPTS
                {
                    let pool = self.tunnels.exploratory_pool();
                    let outbound = pool.next_outbound_tunnel(None);
                    let inbound = pool.next_inbound_tunnel();
                    if let (Some(outbound), Some(inbound)) = (outbound, inbound) {
                        if let Some(next) =
                            self.store.closest_floodfill(dest.destination(), dest.excluded())
                        {
                            debug!(
                                key = %reply.key,
                                attempt = dest.attempts(),
                                floodfill = %next.ident_hash(),
                                "trying next floodfill"
                            );
                            let lookup = dest.create_request_message(
                                next.ident_hash(),
                                Some(&*inbound),
                                self.local_ident(),
                            );
                            outbound.send_tunnel_data(vec![
                                self.router_block(next.ident_hash(), self.local_store_msg()),
                                self.router_block(next.ident_hash(), lookup),
                            ]);
                            keep = true;
                        }
                    }
                } else if !dest.is_exploratory() {
                    warn!(key = %reply.key, "not found after {MAX_LOOKUP_ATTEMPTS} floodfills");
                }
                if keep {
                    self.requests.lock().unwrap().insert(reply.key, dest);
                } else {
                    dest.fail();
                }
            }
            None => debug!(key = %reply.key, "search reply for unknown request"),
        }

        // Chase every returned peer we do not know or only know staled.
        let now = allium_types::millis_since_epoch();
        for peer in &reply.peers {
            let fresh = self
                .store
                .find_router(peer)
                .map(|r| now < r.timestamp_ms() + INTRODUCER_EXPIRATION_MS)
                .unwrap_or(false);
            if !fresh {
                debug!(%peer, "requesting new/outdated router");
                self.request_destination(*peer, None);
            }
        }
    }

    fn handle_database_lookup(&self, lookup: DatabaseLookup) {
        let mut reply = if let Some(router) = self.store.find_router(&lookup.key) {
            debug!(key = %lookup.key, "requested RouterInfo found");
            I2npMessage::DatabaseStore(DatabaseStore::router_info(lookup.key, router.to_bytes()))
        } else if let Some(lease_set) = self.store.find_lease_set(&lookup.key) {
            debug!(key = %lookup.key, "requested LeaseSet found");
            I2npMessage::DatabaseStore(DatabaseStore::lease_set(lookup.key, lease_set.to_bytes()))
        } else {
            let excluded: HashSet<IdentHash> = lookup.excluded.iter().copied().collect();
            debug!(key = %lookup.key, excluded = excluded.len(), "not found, replying closest");
            let peers = self
                .store
                .closest_floodfill(&lookup.key, &excluded)
                .map(|ff| vec![ff.ident_hash()])
                .unwrap_or_default();
            I2npMessage::DatabaseSearchReply(DatabaseSearchReply {
                key: lookup.key,
                peers,
                from: self.local_ident(),
            })
        };

        match lookup.reply_tunnel_id {
            Some(tunnel_id) => {
                // Encryption is only meaningful on the tunnel path.
                if let Some((session_key, tags)) = &lookup.reply_key {
                    if let Some(tag) = tags.first() {
                        reply = self
                            .garlic
                            .tagged_session(*session_key, *tag)
                            .wrap_single_message(reply, None);
                    }
                }
                let outbound = self.tunnels.exploratory_pool().next_outbound_tunnel(None);
                match outbound {
                    Some(outbound) => outbound.send_tunnel_data(vec![TunnelMessageBlock {
                        delivery: DeliveryType::Tunnel,
                        to: lookup.from,
                        tunnel_id,
                        msg: reply,
                    }]),
                    None => self.transport.send_message(
                        &lookup.from,
                        I2npMessage::TunnelGateway {
                            tunnel_id,
                            inner: Box::new(reply),
                        },
                    ),
                }
            }
            None => self.transport.send_message(&lookup.from, reply),
        }
    }

    fn request_destination(&self, key: IdentHash, on_complete: Option<RequestComplete>) {
        let mut requests = self.requests.lock().unwrap();
        let dest = requests
            .entry(key)
            .or_insert_with(|| RequestedDestination::new(key, false));
        if let Some(callback) = on_complete {
            dest.add_callback(callback);
        }
        match self.store.closest_floodfill(&key, dest.excluded()) {
            Some(floodfill) => {
                let msg =
                    dest.create_request_message(floodfill.ident_hash(), None, self.local_ident());
                drop(requests);
                self.transport.send_message(&floodfill.ident_hash(), msg);
            }
            None => {
                let dest = requests.remove(&key);
                drop(requests);
                warn!(%key, "no floodfills found");
                if let Some(dest) = dest {
                    dest.fail();
                }
            }
        }
    }

    fn explore(&self, count: usize) {
        let pool = self.tunnels.exploratory_pool();
        let outbound = pool.next_outbound_tunnel(None);
        let inbound = pool.next_inbound_tunnel();
        let through_tunnels = outbound.is_some() && inbound.is_some();

        debug!(count, through_tunnels, "exploring new routers");
        let mut rng = rand::thread_rng();
        let mut blocks = Vec::new();
        let mut asked: HashSet<IdentHash> = HashSet::new();
        for _ in 0..count {
            let mut random = [0u8; 32];
            rng.fill_bytes(&mut random);
            let key = IdentHash::from_bytes(random);
            let mut dest = RequestedDestination::new(key, true);
            match self.store.closest_floodfill(&key, dest.excluded()) {
                // Ask each floodfill only once per sweep.
                Some(floodfill) if !asked.contains(&floodfill.ident_hash()) => {
                    asked.insert(floodfill.ident_hash());
                    if through_tunnels {
                        let lookup = dest.create_request_message(
                            floodfill.ident_hash(),
                            inbound.as_deref(),
                            self.local_ident(),
                        );
                        blocks.push(
                            self.router_block(floodfill.ident_hash(), self.local_store_msg()),
                        );
                        blocks.push(self.router_block(floodfill.ident_hash(), lookup));
                    } else {
                        let lookup = dest.create_request_message(
                            floodfill.ident_hash(),
                            None,
                            self.local_ident(),
                        );
                        self.transport.send_message(&floodfill.ident_hash(), lookup);
                    }
                    self.requests.lock().unwrap().insert(key, dest);
                }
                _ => {}
            }
        }
        if let (true, Some(outbound)) = (!blocks.is_empty(), outbound) {
            outbound.send_tunnel_data(blocks);
        }
    }

    fn publish(&self) {
        let mut excluded = HashSet::new();
        for _ in 0..PUBLISH_FLOODFILL_COUNT {
            if let Some(floodfill) = self.store.closest_floodfill(&self.local_ident(), &excluded) {
                info!(floodfill = %floodfill.ident_hash(), "publishing our RouterInfo");
                self.transport
                    .send_message(&floodfill.ident_hash(), self.local_store_msg());
                excluded.insert(floodfill.ident_hash());
            }
        }
    }

    fn publish_lease_set(&self, lease_set: &LeaseSet, pool: &dyn TunnelPool) {
        let key = lease_set.ident_hash();
        self.store.store_local_lease_set(lease_set.clone());
        let Some(floodfill) = self.store.closest_floodfill(&key, &HashSet::new()) else {
            warn!(%key, "no floodfill to publish LeaseSet to");
            return;
        };
        let msg = I2npMessage::DatabaseStore(DatabaseStore::lease_set(key, lease_set.to_bytes()));
        match pool.next_outbound_tunnel(None) {
            Some(outbound) => {
                outbound.send_tunnel_data(vec![self.router_block(floodfill.ident_hash(), msg)])
            }
            None => self.transport.send_message(&floodfill.ident_hash(), msg),
        }
    }

    fn manage_requests(&self) {
        let now = allium_types::seconds_since_epoch();
        let mut failed = Vec::new();
        let mut sends: Vec<(Arc<dyn OutboundTunnel>, Vec<TunnelMessageBlock>)> = Vec::new();
        {
            let mut requests = self.requests.lock().unwrap();
            let keys: Vec<IdentHash> = requests.keys().copied().collect();
            for key in keys {
                let dest = requests.get_mut(&key).unwrap();
                let mut done = false;
                if !dest.is_exploratory()
                    && now < dest.created_at_secs() + REQUEST_LIFETIME_SECS
                {
                    if now > dest.created_at_secs() + REQUEST_RETRY_SECS {
                        if dest.attempts() < MAX_LOOKUP_ATTEMPTS {
                            let pool = self.tunnels.exploratory_pool();
                            let outbound = pool.next_outbound_tunnel(None);
                            let inbound = pool.next_inbound_tunnel();
                            let next = self.store.closest_floodfill(&key, dest.excluded());
                            match (outbound, inbound, next) {
                                (Some(outbound), Some(inbound), Some(next)) => {
                                    let lookup = dest.create_request_message(
                                        next.ident_hash(),
                                        Some(&*inbound),
                                        self.local_ident(),
                                    );
                                    sends.push((
                                        outbound,
                                        vec![self.router_block(next.ident_hash(), lookup)],
                                    ));
                                }
                                _ => {
                                    warn!(%key, "lookup prerequisites gone");
                                    done = true;
                                }
                            }
                        } else {
                            warn!(%key, "not found after {MAX_LOOKUP_ATTEMPTS} attempts");
                            done = true;
                        }
                    }
                } else {
                    // Expired, or a one-shot exploratory request being retired.
                    done = true;
                }
                if done {
                    if let Some(dest) = requests.remove(&key) {
                        failed.push(dest);
                    }
                }
            }
        }
        for (outbound, blocks) in sends {
            outbound.send_tunnel_data(blocks);
        }
        for dest in failed {
            dest.fail();
        }
    }

    fn complete_request(&self, ident: &IdentHash, result: Option<Arc<RouterInfo>>) {
        let request = self.requests.lock().unwrap().remove(ident);
        if let Some(dest) = request {
            match result {
                Some(record) => dest.success(record),
                None => dest.fail(),
            }
        }
    }

    fn local_ident(&self) -> IdentHash {
        self.local_keys.ident_hash()
    }

    /// A DatabaseStore announcing our own RouterInfo.
    fn local_store_msg(&self) -> I2npMessage {
        I2npMessage::DatabaseStore(DatabaseStore::router_info(
            self.local_ident(),
            self.local_router_info.to_bytes(),
        ))
    }

    fn router_block(&self, to: IdentHash, msg: I2npMessage) -> TunnelMessageBlock {
        TunnelMessageBlock {
            delivery: DeliveryType::Router,
            to,
            tunnel_id: 0,
            msg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allium_types::router_info::{RouterCaps, TransportStyle};
    use allium_types::router_info::RouterAddress;
    use allium_types::traits::GarlicSession;
    use allium_types::Lease;
    use std::sync::atomic::AtomicUsize;

    /// Transport double that records every direct send.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(IdentHash, I2npMessage)>>,
    }

    impl Transport for RecordingTransport {
        fn send_message(&self, to: &IdentHash, msg: I2npMessage) {
            self.sent.lock().unwrap().push((*to, msg));
        }
    }

    impl RecordingTransport {
        fn take(&self) -> Vec<(IdentHash, I2npMessage)> {
            std::mem::take(&mut self.sent.lock().unwrap())
        }
    }

    /// Tunnel manager double with no tunnels at all.
    struct NoTunnels;

    struct EmptyPool;

    impl TunnelPool for EmptyPool {
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

    impl TunnelManager for NoTunnels {
        fn create_tunnel_pool(&self, _hops: usize) -> Arc<dyn TunnelPool> {
            Arc::new(EmptyPool)
        }
        fn exploratory_pool(&self) -> Arc<dyn TunnelPool> {
            Arc::new(EmptyPool)
        }
    }

    /// Garlic double that passes messages through unwrapped.
    struct PassthroughGarlic;

    struct PassthroughSession;

    impl GarlicSession for PassthroughSession {
        fn wrap_single_message(
            &self,
            msg: I2npMessage,
            _lease_set: Option<&LeaseSet>,
        ) -> I2npMessage {
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

    struct Fixture {
        _dir: tempfile::TempDir,
        netdb: NetDb,
        transport: Arc<RecordingTransport>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let keys = PrivateKeys::generate();
        let router_info = RouterInfo::create(
            &keys,
            RouterCaps(0),
            vec![RouterAddress {
                style: TransportStyle::Ntcp,
                host: "192.0.2.9".into(),
                port: 9100,
            }],
        );
        let transport = Arc::new(RecordingTransport::default());
        let netdb = NetDb::new(
            NetDbConfig {
                data_dir: dir.path().to_path_buf(),
            },
            keys,
            router_info,
            transport.clone(),
            Arc::new(NoTunnels),
            Arc::new(PassthroughGarlic),
            None,
        );
        Fixture {
            _dir: dir,
            netdb,
            transport,
        }
    }

    fn floodfill_blob() -> (PrivateKeys, Vec<u8>) {
        let keys = PrivateKeys::generate();
        let ri = RouterInfo::create(&keys, RouterCaps(RouterCaps::FLOODFILL), Vec::new());
        (keys, ri.to_bytes())
    }

    #[test]
    fn test_store_message_inserts_and_completes_request() {
        let f = fixture();
        let (keys, blob) = floodfill_blob();
        let ident = keys.ident_hash();

        let completed = Arc::new(AtomicUsize::new(0));
        {
            // Seed a floodfill so the request can be sent somewhere.
            let (_, seed) = floodfill_blob();
            f.netdb.store().add_router_info(&seed).unwrap();
        }
        let flag = completed.clone();
        f.netdb.request_destination(
            ident,
            Some(Box::new(move |result| {
                assert!(result.is_some());
                flag.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert_eq!(f.transport.take().len(), 1);

        f.netdb
            .inner
            .handle_database_store(DatabaseStore::router_info(ident, blob), None)
            .unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert!(f.netdb.store().find_router(&ident).is_some());
    }

    #[test]
    fn test_request_without_floodfills_fails_immediately() {
        let f = fixture();
        let failed = Arc::new(AtomicUsize::new(0));
        let flag = failed.clone();
        f.netdb.request_destination(
            IdentHash::of(b"nowhere"),
            Some(Box::new(move |result| {
                assert!(result.is_none());
                flag.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert!(f.transport.take().is_empty());
    }

    #[test]
    fn test_lookup_served_from_router_store() {
        let f = fixture();
        let (keys, blob) = floodfill_blob();
        f.netdb.store().add_router_info(&blob).unwrap();

        let requester = IdentHash::of(b"requester");
        f.netdb.inner.handle_database_lookup(DatabaseLookup {
            key: keys.ident_hash(),
            from: requester,
            lookup_type: allium_types::i2np::LookupType::RouterInfo,
            reply_tunnel_id: None,
            excluded: Vec::new(),
            reply_key: None,
        });
        let sent = f.transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, requester);
        match &sent[0].1 {
            I2npMessage::DatabaseStore(store) => {
                assert_eq!(store.key, keys.ident_hash());
                assert!(matches!(store.payload, StorePayload::RouterInfo(_)));
            }
            other => panic!("wrong reply: {other:?}"),
        }
    }

    #[test]
    fn test_lookup_miss_replies_closest_floodfill() {
        let f = fixture();
        let (ff_keys, blob) = floodfill_blob();
        f.netdb.store().add_router_info(&blob).unwrap();

        let requester = IdentHash::of(b"requester");
        f.netdb.inner.handle_database_lookup(DatabaseLookup {
            key: IdentHash::of(b"missing"),
            from: requester,
            lookup_type: allium_types::i2np::LookupType::RouterInfo,
            reply_tunnel_id: None,
            excluded: Vec::new(),
            reply_key: None,
        });
        let sent = f.transport.take();
        assert_eq!(sent.len(), 1);
        match &sent[0].1 {
            I2npMessage::DatabaseSearchReply(reply) => {
                assert_eq!(reply.peers, vec![ff_keys.ident_hash()]);
            }
            other => panic!("wrong reply: {other:?}"),
        }
    }

    #[test]
    fn test_lookup_excluding_only_floodfill_replies_empty() {
        let f = fixture();
        let (ff_keys, blob) = floodfill_blob();
        f.netdb.store().add_router_info(&blob).unwrap();

        f.netdb.inner.handle_database_lookup(DatabaseLookup {
            key: IdentHash::of(b"missing"),
            from: IdentHash::of(b"requester"),
            lookup_type: allium_types::i2np::LookupType::RouterInfo,
            reply_tunnel_id: None,
            excluded: vec![ff_keys.ident_hash()],
            reply_key: None,
        });
        let sent = f.transport.take();
        match &sent[0].1 {
            I2npMessage::DatabaseSearchReply(reply) => assert!(reply.peers.is_empty()),
            other => panic!("wrong reply: {other:?}"),
        }
    }

    #[test]
    fn test_search_reply_without_tunnels_fails_request() {
        let f = fixture();
        let (_, seed) = floodfill_blob();
        f.netdb.store().add_router_info(&seed).unwrap();

        let key = IdentHash::of(b"wanted");
        let failed = Arc::new(AtomicUsize::new(0));
        let flag = failed.clone();
        f.netdb.request_destination(
            key,
            Some(Box::new(move |result| {
                assert!(result.is_none());
                flag.fetch_add(1, Ordering::SeqCst);
            })),
        );
        f.transport.take();

        // With peers but no exploratory tunnels the retry path is closed, so
        // the request fails right away.
        f.netdb.inner.handle_database_search_reply(DatabaseSearchReply {
            key,
            peers: vec![IdentHash::of(b"peer")],
            from: IdentHash::of(b"ff"),
        });
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_search_reply_chases_unknown_peers() {
        let f = fixture();
        let (_, seed) = floodfill_blob();
        f.netdb.store().add_router_info(&seed).unwrap();

        // No open request for this key; the peer hashes are still chased.
        f.netdb.inner.handle_database_search_reply(DatabaseSearchReply {
            key: IdentHash::of(b"unrelated"),
            peers: vec![IdentHash::of(b"peer1"), IdentHash::of(b"peer2")],
            from: IdentHash::of(b"ff"),
        });
        let sent = f.transport.take();
        assert_eq!(sent.len(), 2);
        for (_, msg) in sent {
            assert!(matches!(msg, I2npMessage::DatabaseLookup(_)));
        }
    }

    #[test]
    fn test_explore_issues_batched_requests() {
        let f = fixture();
        for _ in 0..3 {
            let (_, blob) = floodfill_blob();
            f.netdb.store().add_router_info(&blob).unwrap();
        }
        let before = f.netdb.store().router_count();

        f.netdb.inner.explore(9);
        let sent = f.transport.take();
        // Every send is a lookup; each floodfill is asked at most once.
        assert!(!sent.is_empty());
        assert!(sent.len() <= 3);
        let targets: HashSet<IdentHash> = sent.iter().map(|(to, _)| *to).collect();
        assert_eq!(targets.len(), sent.len());
        for (_, msg) in &sent {
            assert!(matches!(msg, I2npMessage::DatabaseLookup(_)));
        }

        // Exploration never shrinks the table; replies only grow it.
        assert_eq!(f.netdb.store().router_count(), before);
        let (_, blob) = floodfill_blob();
        f.netdb
            .inner
            .handle_database_store(
                DatabaseStore::router_info(IdentHash::of(b"x"), blob),
                None,
            )
            .unwrap();
        assert_eq!(f.netdb.store().router_count(), before + 1);
    }

    #[test]
    fn test_manage_requests_retires_exploratory() {
        let f = fixture();
        f.netdb
            .inner
            .requests
            .lock()
            .unwrap()
            .insert(IdentHash::of(b"e"), RequestedDestination::new(IdentHash::of(b"e"), true));
        f.netdb.inner.manage_requests();
        assert!(f.netdb.inner.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn test_run_loop_processes_posted_store() {
        let f = fixture();
        f.netdb.start().unwrap();
        let (keys, blob) = floodfill_blob();
        f.netdb.post_message(
            I2npMessage::DatabaseStore(DatabaseStore::router_info(keys.ident_hash(), blob)),
            None,
        );
        // The loop picks the message up well within the poll timeout.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while f.netdb.store().find_router(&keys.ident_hash()).is_none() {
            assert!(std::time::Instant::now() < deadline, "store was not processed");
            std::thread::sleep(Duration::from_millis(10));
        }
        f.netdb.stop();
    }

    #[test]
    fn test_publish_lease_set_reaches_floodfill() {
        let f = fixture();
        let (ff_keys, blob) = floodfill_blob();
        f.netdb.store().add_router_info(&blob).unwrap();

        let dest_keys = PrivateKeys::generate();
        let lease_set = LeaseSet::create(
            &dest_keys,
            vec![Lease {
                tunnel_gateway: IdentHash::of(b"gw"),
                tunnel_id: 3,
                end_date_ms: allium_types::millis_since_epoch() + 600_000,
            }],
        );
        f.netdb.publish_lease_set(&lease_set, &EmptyPool);

        // Stored locally and pushed to the closest floodfill directly (the
        // empty pool has no outbound tunnels).
        assert!(f.netdb.store().find_lease_set(&dest_keys.ident_hash()).is_some());
        let sent = f.transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ff_keys.ident_hash());
        assert!(matches!(&sent[0].1, I2npMessage::DatabaseStore(s)
            if matches!(s.payload, StorePayload::LeaseSet(_))));
    }
}
