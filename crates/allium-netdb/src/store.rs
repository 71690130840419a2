//! In-memory record maps, the floodfill index, and on-disk persistence.
//!
//! Three collections, each behind its own mutex held only for map
//! operations, never across file or network I/O:
//!
//! - `router_infos: IdentHash → RouterInfo`
//! - `floodfills`: the subset of reachable routers flagged as floodfills
//! - `lease_sets: IdentHash → LeaseSet`
//!
//! RouterInfos persist under `netDb/r<c>/routerInfo-<base64>.dat`, sharded
//! by the first character of the base64 address; the shard tree is created
//! on first use.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::{debug, info, warn};

use allium_types::base64::BASE64_CHARS;
use allium_types::{IdentHash, LeaseSet, RouterInfo, RoutingKey, XorMetric};

use crate::{
    NetDbError, Result, EXPIRATION_POPULATION, INTRODUCER_EXPIRATION_MS, ROUTER_EXPIRATION_MS,
};

/// Name of the router-record directory inside the data dir.
pub const NETDB_DIR: &str = "netDb";

/// The record store.
pub struct NetDbStore {
    dir: PathBuf,
    router_infos: Mutex<HashMap<IdentHash, Arc<RouterInfo>>>,
    floodfills: Mutex<Vec<Arc<RouterInfo>>>,
    lease_sets: Mutex<HashMap<IdentHash, Arc<LeaseSet>>>,
}

impl NetDbStore {
    /// Create a store persisting under `<data_dir>/netDb`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join(NETDB_DIR),
            router_infos: Mutex::new(HashMap::new()),
            floodfills: Mutex::new(Vec::new()),
            lease_sets: Mutex::new(HashMap::new()),
        }
    }

    /// Parse a RouterInfo blob and insert or update it.
    ///
    /// An update is applied only when its timestamp is strictly greater than
    /// the stored record's. Returns the record now stored under the key.
    pub fn add_router_info(&self, bytes: &[u8]) -> Result<Arc<RouterInfo>> {
        let parsed = RouterInfo::from_bytes(bytes)?;
        parsed.set_updated(true);
        let ident = parsed.ident_hash();

        let mut routers = self.router_infos.lock().unwrap();
        match routers.get(&ident) {
            Some(existing) => {
                if existing.accepts_update(&parsed)? {
                    debug!(%ident, "RouterInfo updated");
                    let old = existing.clone();
                    let new = Arc::new(parsed);
                    routers.insert(ident, new.clone());
                    drop(routers);
                    self.replace_floodfill(&old, &new);
                    Ok(new)
                } else {
                    Ok(existing.clone())
                }
            }
            None => {
                debug!(%ident, "new RouterInfo added");
                let new = Arc::new(parsed);
                routers.insert(ident, new.clone());
                drop(routers);
                if new.is_floodfill() {
                    self.floodfills.lock().unwrap().push(new.clone());
                }
                Ok(new)
            }
        }
    }

    fn replace_floodfill(&self, old: &Arc<RouterInfo>, new: &Arc<RouterInfo>) {
        let mut floodfills = self.floodfills.lock().unwrap();
        floodfills.retain(|r| !Arc::ptr_eq(r, old));
        if new.is_floodfill() && !new.is_unreachable() {
            floodfills.push(new.clone());
        }
    }

    /// Parse and store a LeaseSet.
    ///
    /// Stores that did not arrive through a tunnel are unsolicited and are
    /// rejected: a LeaseSet may only reach us as a lookup reply or a local
    /// publication.
    pub fn add_lease_set(&self, key: IdentHash, bytes: &[u8], from_tunnel: bool) -> Result<()> {
        if !from_tunnel {
            warn!(%key, "rejecting unsolicited LeaseSet");
            return Err(NetDbError::UnsolicitedLeaseSet(key));
        }
        let parsed = LeaseSet::from_bytes(bytes)?;
        if parsed.ident_hash() != key {
            return Err(allium_types::DataError::Malformed {
                what: "LeaseSet",
                detail: "store key does not match identity".into(),
            }
            .into());
        }
        let mut lease_sets = self.lease_sets.lock().unwrap();
        if lease_sets.insert(key, Arc::new(parsed)).is_some() {
            debug!(%key, "LeaseSet updated");
        } else {
            debug!(%key, "new LeaseSet added");
        }
        Ok(())
    }

    /// Insert a locally built LeaseSet (our own publication).
    pub fn store_local_lease_set(&self, lease_set: LeaseSet) {
        let key = lease_set.ident_hash();
        self.lease_sets.lock().unwrap().insert(key, Arc::new(lease_set));
    }

    pub fn find_router(&self, ident: &IdentHash) -> Option<Arc<RouterInfo>> {
        self.router_infos.lock().unwrap().get(ident).cloned()
    }

    pub fn find_lease_set(&self, ident: &IdentHash) -> Option<Arc<LeaseSet>> {
        self.lease_sets.lock().unwrap().get(ident).cloned()
    }

    /// Mark a router for deletion on the next save pass, keeping the
    /// floodfill index consistent.
    pub fn set_unreachable(&self, ident: &IdentHash, unreachable: bool) {
        let record = self.router_infos.lock().unwrap().get(ident).cloned();
        if let Some(record) = record {
            record.set_unreachable(unreachable);
            if record.is_floodfill() {
                let mut floodfills = self.floodfills.lock().unwrap();
                if unreachable {
                    floodfills.retain(|r| !Arc::ptr_eq(r, &record));
                } else if !floodfills.iter().any(|r| Arc::ptr_eq(r, &record)) {
                    floodfills.push(record.clone());
                }
            }
        }
    }

    /// The reachable floodfill closest to `target`'s routing key under XOR,
    /// skipping `excluded`.
    pub fn closest_floodfill(
        &self,
        target: &IdentHash,
        excluded: &HashSet<IdentHash>,
    ) -> Option<Arc<RouterInfo>> {
        let dest_key = RoutingKey::create(target);
        let mut min_metric = XorMetric::MAX;
        let mut closest = None;
        for record in self.floodfills.lock().unwrap().iter() {
            let ident = record.ident_hash();
            if record.is_unreachable() || excluded.contains(&ident) {
                continue;
            }
            let metric = dest_key.distance_to(&ident);
            if metric < min_metric {
                min_metric = metric;
                closest = Some(record.clone());
            }
        }
        closest
    }

    /// A uniformly chosen reachable router passing `filter`: random start
    /// index, scan forward, at most one wrap-around.
    pub fn random_router<F>(&self, filter: F) -> Option<Arc<RouterInfo>>
    where
        F: Fn(&RouterInfo) -> bool,
    {
        let routers = self.router_infos.lock().unwrap();
        if routers.is_empty() {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..routers.len());
        let mut skipped = Vec::with_capacity(start);
        for (i, record) in routers.values().enumerate() {
            if i < start {
                skipped.push(record);
                continue;
            }
            if !record.is_unreachable() && filter(record) {
                return Some(record.clone());
            }
        }
        skipped
            .into_iter()
            .find(|r| !r.is_unreachable() && filter(r))
            .cloned()
    }

    /// A random non-hidden router.
    pub fn random_visible_router(&self) -> Option<Arc<RouterInfo>> {
        self.random_router(|r| !r.is_hidden())
    }

    /// A random non-hidden router with the high-bandwidth capability.
    pub fn random_high_bandwidth_router(&self) -> Option<Arc<RouterInfo>> {
        self.random_router(|r| !r.is_hidden() && r.is_high_bandwidth())
    }

    pub fn router_count(&self) -> usize {
        self.router_infos.lock().unwrap().len()
    }

    pub fn floodfill_count(&self) -> usize {
        self.floodfills.lock().unwrap().len()
    }

    fn file_path(&self, ident: &IdentHash) -> PathBuf {
        let b64 = ident.to_base64();
        let shard = format!("r{}", &b64[..1]);
        self.dir.join(shard).join(format!("routerInfo-{b64}.dat"))
    }

    /// Create the shard directory tree if it does not exist yet.
    fn ensure_tree(&self) -> Result<()> {
        if self.dir.is_dir() {
            return Ok(());
        }
        info!(dir = %self.dir.display(), "creating netDb directory tree");
        std::fs::create_dir_all(&self.dir).map_err(NetDbError::Directory)?;
        for c in BASE64_CHARS {
            let shard = self.dir.join(format!("r{}", *c as char));
            std::fs::create_dir(&shard).map_err(NetDbError::Directory)?;
        }
        Ok(())
    }

    /// Read every persisted record, dropping (and deleting) the ones that
    /// are unreachable or stale. Returns the number of routers loaded.
    pub fn load(&self) -> Result<usize> {
        self.ensure_tree()?;

        // Start from a clean slate in case of a previous partial load.
        self.router_infos.lock().unwrap().clear();
        self.floodfills.lock().unwrap().clear();

        let now = allium_types::millis_since_epoch();
        let mut loaded = 0usize;
        for shard in std::fs::read_dir(&self.dir).map_err(NetDbError::Directory)? {
            let shard = shard.map_err(NetDbError::Directory)?;
            if !shard.path().is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(shard.path()).map_err(NetDbError::Directory)? {
                let path = entry.map_err(NetDbError::Directory)?.path();
                let record = match RouterInfo::from_file(&path) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "dropping unreadable record");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                };
                let stale_introducer = record.uses_introducer()
                    && now >= record.timestamp_ms() + INTRODUCER_EXPIRATION_MS;
                if record.is_unreachable() || stale_introducer {
                    let _ = std::fs::remove_file(&path);
                    continue;
                }
                let record = Arc::new(record);
                if record.is_floodfill() {
                    self.floodfills.lock().unwrap().push(record.clone());
                }
                self.router_infos
                    .lock()
                    .unwrap()
                    .insert(record.ident_hash(), record);
                loaded += 1;
            }
        }
        info!(routers = loaded, floodfills = self.floodfill_count(), "netDb loaded");
        Ok(loaded)
    }

    /// The periodic save pass: write out changed records, expire old ones,
    /// and delete unreachable records from disk and memory.
    pub fn save_updated(&self) -> Result<()> {
        self.ensure_tree()?;

        let snapshot: Vec<Arc<RouterInfo>> =
            self.router_infos.lock().unwrap().values().cloned().collect();
        let mut total = snapshot.len();
        let now = allium_types::millis_since_epoch();
        let mut saved = 0usize;
        let mut deleted = 0usize;

        for record in &snapshot {
            if record.is_updated() {
                if let Err(e) = record.to_file(&self.file_path(&record.ident_hash())) {
                    warn!(ident = %record.ident_hash(), error = %e, "failed to save record");
                    continue;
                }
                record.set_updated(false);
                saved += 1;
                continue;
            }

            let expired_introducer = record.uses_introducer()
                && now >= record.timestamp_ms() + INTRODUCER_EXPIRATION_MS;
            let expired_old =
                total > EXPIRATION_POPULATION && now >= record.timestamp_ms() + ROUTER_EXPIRATION_MS;
            if expired_introducer || expired_old {
                total -= 1;
                record.set_unreachable(true);
            }

            if record.is_unreachable() {
                let path = self.file_path(&record.ident_hash());
                if path.exists() {
                    let _ = std::fs::remove_file(&path);
                    deleted += 1;
                }
                if record.is_floodfill() {
                    self.floodfills
                        .lock()
                        .unwrap()
                        .retain(|r| !Arc::ptr_eq(r, record));
                }
            }
        }

        if saved > 0 {
            debug!(saved, "routers saved");
        }
        if deleted > 0 {
            debug!(deleted, "routers deleted");
        }
        self.router_infos
            .lock()
            .unwrap()
            .retain(|_, r| !r.is_unreachable());
        Ok(())
    }

    /// Drop LeaseSets whose every lease has expired.
    pub fn manage_lease_sets(&self) {
        let now = allium_types::millis_since_epoch();
        self.lease_sets.lock().unwrap().retain(|ident, ls| {
            let alive = ls.has_non_expired_leases(now);
            if !alive {
                debug!(%ident, "LeaseSet expired");
            }
            alive
        });
    }
}
