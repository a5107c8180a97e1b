//! rideline-node: real-time trip coordination and offline location sync
//!
//! The systems core of the Rideline platform's clients. One process runs:
//! - a persistent, auto-reconnecting channel connection to the relay
//! - a background location tracker with a durable last-known record
//! - a durable FIFO queue replaying mutations made while disconnected
//! - pure edge estimators (fare, route, ETA, surge, fraud) used as
//!   offline fallbacks and optimistic pre-confirmation values
//! - the guarded trip state machine keeping rider, driver, and operations
//!   views convergent under at-least-once delivery
//!
//! Consistency across clients is eventual: idempotent replay of channel
//! events plus the offline queue, no distributed transactions.

pub mod channel;
pub mod config;
pub mod error;
pub mod estimate;
pub mod location;
pub mod queue;
pub mod trip;

pub use channel::{ChannelConnection, ChannelEvent, LinkState, Subscription};
pub use config::Config;
pub use location::{LocationSample, LocationTracker, SamplingMode, StartOutcome};
pub use queue::{DrainReport, OfflineQueue, OperationExecutor, OperationKind};
pub use trip::{Role, Trip, TripCoordinator, TripStatus};

/// Unix timestamp in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
