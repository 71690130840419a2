//! Open state of in-flight directory lookups.

use std::collections::HashSet;
use std::sync::Arc;

use allium_types::i2np::{DatabaseLookup, I2npMessage, LookupType};
use allium_types::traits::InboundTunnel;
use allium_types::{IdentHash, RouterInfo};

/// One-shot completion callback of a lookup.
pub type RequestComplete = Box<dyn FnOnce(Option<Arc<RouterInfo>>) + Send>;

/// An in-flight lookup for one key.
///
/// A second lookup for the same key does not open a new request; its
/// callback is merged onto the existing one and every callback fires when
/// the request completes or fails.
pub struct RequestedDestination {
    destination: IdentHash,
    is_exploratory: bool,
    excluded: HashSet<IdentHash>,
    created_at_secs: u64,
    callbacks: Vec<RequestComplete>,
}

impl RequestedDestination {
    pub fn new(destination: IdentHash, is_exploratory: bool) -> Self {
        Self {
            destination,
            is_exploratory,
            excluded: HashSet::new(),
            created_at_secs: allium_types::seconds_since_epoch(),
            callbacks: Vec::new(),
        }
    }

    pub fn destination(&self) -> &IdentHash {
        &self.destination
    }

    pub fn is_exploratory(&self) -> bool {
        self.is_exploratory
    }

    pub fn excluded(&self) -> &HashSet<IdentHash> {
        &self.excluded
    }

    /// How many floodfills have been asked so far.
    pub fn attempts(&self) -> usize {
        self.excluded.len()
    }

    pub fn created_at_secs(&self) -> u64 {
        self.created_at_secs
    }

    pub fn add_callback(&mut self, callback: RequestComplete) {
        self.callbacks.push(callback);
    }

    /// Build the lookup to send to `floodfill`, marking it as asked and
    /// restarting the response clock.
    ///
    /// With `reply_tunnel` set the reply is routed back through our inbound
    /// tunnel; otherwise it comes straight to `local_ident`.
    pub fn create_request_message(
        &mut self,
        floodfill: IdentHash,
        reply_tunnel: Option<&dyn InboundTunnel>,
        local_ident: IdentHash,
    ) -> I2npMessage {
        let lookup_type = if self.is_exploratory {
            LookupType::Exploration
        } else {
            LookupType::RouterInfo
        };
        let (from, reply_tunnel_id) = match reply_tunnel {
            Some(tunnel) => (tunnel.gateway_ident(), Some(tunnel.gateway_tunnel_id())),
            None => (local_ident, None),
        };
        let msg = I2npMessage::DatabaseLookup(DatabaseLookup {
            key: self.destination,
            from,
            lookup_type,
            reply_tunnel_id,
            excluded: self.excluded.iter().copied().collect(),
            reply_key: None,
        });
        self.excluded.insert(floodfill);
        self.created_at_secs = allium_types::seconds_since_epoch();
        msg
    }

    /// Complete the request with a found record, consuming it.
    pub fn success(self, router: Arc<RouterInfo>) {
        for callback in self.callbacks {
            callback(Some(router.clone()));
        }
    }

    /// Complete the request with nothing, consuming it.
    pub fn fail(self) {
        for callback in self.callbacks {
            callback(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_request_message_excludes_floodfill() {
        let key = IdentHash::of(b"target");
        let local = IdentHash::of(b"me");
        let ff = IdentHash::of(b"floodfill");
        let mut dest = RequestedDestination::new(key, false);
        assert_eq!(dest.attempts(), 0);

        let msg = dest.create_request_message(ff, None, local);
        assert_eq!(dest.attempts(), 1);
        assert!(dest.excluded().contains(&ff));
        match msg {
            I2npMessage::DatabaseLookup(lookup) => {
                assert_eq!(lookup.key, key);
                assert_eq!(lookup.from, local);
                assert_eq!(lookup.lookup_type, LookupType::RouterInfo);
                assert!(lookup.reply_tunnel_id.is_none());
                // The floodfill we are asking is not in its own exclusion list.
                assert!(!lookup.excluded.contains(&ff));
            }
            other => panic!("wrong variant: {other:?}"),
        }

        // The second attempt carries the first floodfill as excluded.
        let msg2 = dest.create_request_message(IdentHash::of(b"ff2"), None, local);
        match msg2 {
            I2npMessage::DatabaseLookup(lookup) => assert!(lookup.excluded.contains(&ff)),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_merged_callbacks_all_fire() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        let mut dest = RequestedDestination::new(IdentHash::of(b"k"), false);
        for _ in 0..3 {
            dest.add_callback(Box::new(|result| {
                assert!(result.is_none());
                FIRED.fetch_add(1, Ordering::SeqCst);
            }));
        }
        dest.fail();
        assert_eq!(FIRED.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exploratory_lookup_type() {
        let mut dest = RequestedDestination::new(IdentHash::of(b"k"), true);
        let msg =
            dest.create_request_message(IdentHash::of(b"ff"), None, IdentHash::of(b"me"));
        match msg {
            I2npMessage::DatabaseLookup(lookup) => {
                assert_eq!(lookup.lookup_type, LookupType::Exploration)
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
