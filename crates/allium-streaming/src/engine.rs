//! The destination registry and incoming datagram dispatch.
//!
//! One engine hosts every local destination, including the shared
//! non-public one used by client tunnels. Incoming Data messages arrive
//! from the transport side and are pushed through an ordered channel onto
//! the runtime, then routed to the owning destination by address.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use allium_netdb::NetDb;
use allium_types::traits::{GarlicProvider, TunnelManager};
use allium_types::{IdentHash, PrivateKeys};

use crate::data;
use crate::destination::StreamingDestination;
use crate::Result;

/// The streaming engine: registry of local destinations.
#[derive(Clone)]
pub struct StreamingEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    netdb: Arc<NetDb>,
    tunnels: Arc<dyn TunnelManager>,
    garlic: Arc<dyn GarlicProvider>,
    data_dir: PathBuf,
    destinations: Mutex<HashMap<IdentHash, StreamingDestination>>,
    shared: Mutex<Option<StreamingDestination>>,
    ingress: Mutex<Option<mpsc::UnboundedSender<(IdentHash, Vec<u8>)>>>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StreamingEngine {
    pub fn new(
        netdb: Arc<NetDb>,
        tunnels: Arc<dyn TunnelManager>,
        garlic: Arc<dyn GarlicProvider>,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                netdb,
                tunnels,
                garlic,
                data_dir,
                destinations: Mutex::new(HashMap::new()),
                shared: Mutex::new(None),
                ingress: Mutex::new(None),
                pump: Mutex::new(None),
            }),
        }
    }

    /// Create the shared local destination and the ordered ingress pump.
    pub fn start(&self) {
        {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.is_none() {
                let destination = self.register(PrivateKeys::generate(), false);
                *shared = Some(destination);
            }
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let (tx, mut rx) = mpsc::unbounded_channel::<(IdentHash, Vec<u8>)>();
            *self.inner.ingress.lock().unwrap() = Some(tx);
            let inner = self.inner.clone();
            let handle = runtime.spawn(async move {
                while let Some((destination, frame)) = rx.recv().await {
                    inner.dispatch_data(destination, &frame);
                }
            });
            *self.inner.pump.lock().unwrap() = Some(handle);
        }
        info!("streaming engine started");
    }

    /// Tear down every destination and stop the pump.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.pump.lock().unwrap().take() {
            handle.abort();
        }
        *self.inner.ingress.lock().unwrap() = None;
        let destinations: Vec<StreamingDestination> = {
            let mut map = self.inner.destinations.lock().unwrap();
            map.drain().map(|(_, d)| d).collect()
        };
        for destination in destinations {
            destination.shutdown();
        }
        *self.inner.shared.lock().unwrap() = None;
        info!("streaming engine stopped");
    }

    /// The shared non-public destination used by client tunnels.
    pub fn shared_destination(&self) -> Option<StreamingDestination> {
        self.inner.shared.lock().unwrap().clone()
    }

    /// Create and register a fresh destination.
    pub fn create_destination(&self, is_public: bool) -> StreamingDestination {
        self.register(PrivateKeys::generate(), is_public)
    }

    /// Load a destination from a `.dat` key file in the data directory,
    /// creating and persisting fresh keys when the file does not exist.
    pub fn load_destination(&self, filename: &str, is_public: bool) -> Result<StreamingDestination> {
        let path = self.inner.data_dir.join(filename);
        let keys = match std::fs::read(&path) {
            Ok(bytes) => {
                let keys = PrivateKeys::from_bytes(&bytes)?;
                info!(address = %keys.ident_hash().to_base32(), file = %path.display(), "local address loaded");
                keys
            }
            Err(_) => {
                let keys = PrivateKeys::generate();
                std::fs::write(&path, keys.to_bytes()).map_err(allium_types::DataError::Io)?;
                info!(address = %keys.ident_hash().to_base32(), file = %path.display(), "new private keys file created");
                keys
            }
        };
        if let Some(existing) = self.find_destination(&keys.ident_hash()) {
            return Ok(existing);
        }
        Ok(self.register(keys, is_public))
    }

    /// Register a destination built from explicit keys.
    pub fn add_destination(&self, keys: PrivateKeys, is_public: bool) -> StreamingDestination {
        self.register(keys, is_public)
    }

    pub fn find_destination(&self, ident: &IdentHash) -> Option<StreamingDestination> {
        self.inner.destinations.lock().unwrap().get(ident).cloned()
    }

    /// Retire a destination, tearing down its streams.
    pub fn delete_destination(&self, ident: &IdentHash) {
        let destination = self.inner.destinations.lock().unwrap().remove(ident);
        if let Some(destination) = destination {
            destination.shutdown();
        }
    }

    /// Hand over an incoming Data message payload for `destination`.
    ///
    /// Ordered per sender: frames go through a single-consumer channel when
    /// the engine runs on a runtime, and are dispatched inline otherwise.
    pub fn handle_data_message(&self, destination: IdentHash, frame: &[u8]) {
        let ingress = self.inner.ingress.lock().unwrap().clone();
        match ingress {
            Some(tx) => {
                if tx.send((destination, frame.to_vec())).is_err() {
                    warn!("streaming engine is stopped, dropping frame");
                }
            }
            None => self.inner.dispatch_data(destination, frame),
        }
    }

    fn register(&self, keys: PrivateKeys, is_public: bool) -> StreamingDestination {
        let destination = StreamingDestination::new(
            keys,
            is_public,
            &*self.inner.tunnels,
            self.inner.garlic.clone(),
            self.inner.netdb.clone(),
        );
        self.inner
            .destinations
            .lock()
            .unwrap()
            .insert(destination.ident_hash(), destination.clone());
        destination
    }
}

impl EngineInner {
    fn dispatch_data(&self, destination: IdentHash, frame: &[u8]) {
        let Some(target) = self.destinations.lock().unwrap().get(&destination).cloned() else {
            warn!(%destination, "local destination not found, dropping frame");
            return;
        };
        match data::from_data_payload(frame) {
            Ok(packet) => target.handle_next_packet(packet),
            Err(e) => debug!(error = %e, "dropping undecodable frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_netdb, LoopTunnelManager, PassthroughGarlic};

    fn engine(dir: &std::path::Path) -> StreamingEngine {
        StreamingEngine::new(
            test_netdb(dir),
            Arc::new(LoopTunnelManager::new()),
            Arc::new(PassthroughGarlic),
            dir.to_path_buf(),
        )
    }

    #[test]
    fn test_load_destination_creates_and_reloads_keys() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let created = engine.load_destination("service.dat", true).unwrap();
        let ident = created.ident_hash();
        assert!(dir.path().join("service.dat").is_file());

        // Loading the same file again resolves to the same identity.
        let reloaded = engine.load_destination("service.dat", true).unwrap();
        assert_eq!(reloaded.ident_hash(), ident);
    }

    #[test]
    fn test_shared_destination_created_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        assert!(engine.shared_destination().is_none());
        engine.start();
        let shared = engine.shared_destination().unwrap();
        assert!(!shared.is_public());
        assert!(engine.find_destination(&shared.ident_hash()).is_some());
        engine.stop();
        assert!(engine.shared_destination().is_none());
    }

    #[test]
    fn test_unknown_destination_frame_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        // Not registered and engine not started: dispatched inline, dropped.
        engine.handle_data_message(IdentHash::of(b"nobody"), &[0u8; 16]);
    }

    #[test]
    fn test_delete_destination_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let destination = engine.create_destination(false);
        let ident = destination.ident_hash();
        assert!(engine.find_destination(&ident).is_some());
        engine.delete_destination(&ident);
        assert!(engine.find_destination(&ident).is_none());
    }
}
