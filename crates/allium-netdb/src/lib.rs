//! # allium-netdb
//!
//! The floodfill directory: a replicated key→record store holding
//! [`RouterInfo`](allium_types::RouterInfo) and
//! [`LeaseSet`](allium_types::LeaseSet) records, located by XOR distance
//! over daily routing keys.
//!
//! - [`queue`] - the wake-able FIFO between the transport threads and the
//!   directory loop
//! - [`store`] - the in-memory maps, floodfill index, and on-disk
//!   persistence under `netDb/`
//! - [`requested`] - open state of in-flight lookups
//! - [`engine`] - the directory loop: message dispatch, iterative lookup,
//!   exploration, publication, and periodic maintenance
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | Queue poll timeout | 15 s |
//! | Save / lease sweep | 60 s |
//! | Publish interval | 2400 s |
//! | Explore interval | 30 s (90 s at ≥2500 routers) |
//! | Explore batch | clamp(800 / population, 1, 9) |
//! | Retry after | 5 s |
//! | Max floodfills tried | 7 |
//! | Request lifetime | 60 s |
//! | Reseed threshold | < 50 routers |
//! | Reseed attempts | 10 |

pub mod engine;
pub mod queue;
pub mod requested;
pub mod store;

pub use engine::{NetDb, NetDbConfig, QueuedMessage};
pub use store::NetDbStore;

/// Poll timeout of the directory loop.
pub const QUEUE_TIMEOUT_MS: u64 = 15_000;

/// Period of the save / lease-sweep pass, in seconds.
pub const SAVE_INTERVAL_SECS: u64 = 60;

/// Period of self-publication, in seconds.
pub const PUBLISH_INTERVAL_SECS: u64 = 2400;

/// Base period of exploration, in seconds.
pub const EXPLORE_INTERVAL_SECS: u64 = 30;

/// Relaxed exploration period once the table is well populated, in seconds.
pub const EXPLORE_INTERVAL_CROWDED_SECS: u64 = 90;

/// Population at which exploration slows down.
pub const CROWDED_ROUTER_COUNT: usize = 2500;

/// A lookup retries after this many seconds without a response.
pub const REQUEST_RETRY_SECS: u64 = 5;

/// A lookup is abandoned after this many seconds.
pub const REQUEST_LIFETIME_SECS: u64 = 60;

/// Maximum floodfills asked per lookup.
pub const MAX_LOOKUP_ATTEMPTS: usize = 7;

/// Number of floodfills our own RouterInfo is published to.
pub const PUBLISH_FLOODFILL_COUNT: usize = 3;

/// Below this population the reseed collaborator is invoked at start.
pub const RESEED_THRESHOLD: usize = 50;

/// Maximum reseed invocations at start.
pub const MAX_RESEED_RETRIES: usize = 10;

/// A RouterInfo using an introducer expires after this long.
pub const INTRODUCER_EXPIRATION_MS: u64 = 3600 * 1000;

/// A RouterInfo expires after this long once the table holds more than
/// [`EXPIRATION_POPULATION`] records.
pub const ROUTER_EXPIRATION_MS: u64 = 72 * 3600 * 1000;

/// Population above which ordinary records are expired.
pub const EXPIRATION_POPULATION: usize = 300;

/// Error types for directory operations.
#[derive(Debug, thiserror::Error)]
pub enum NetDbError {
    /// The record or message could not be used.
    #[error(transparent)]
    Data(#[from] allium_types::DataError),

    /// A LeaseSet store arrived outside a tunnel.
    #[error("unsolicited LeaseSet for {0}")]
    UnsolicitedLeaseSet(allium_types::IdentHash),

    /// No floodfill was available to serve a request.
    #[error("no floodfills available")]
    NoFloodfills,

    /// The netDb directory could not be created or read.
    #[error("netDb directory error: {0}")]
    Directory(std::io::Error),
}

/// Convenience result type for directory operations.
pub type Result<T> = std::result::Result<T, NetDbError>;
