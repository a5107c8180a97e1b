//! Error taxonomy for the coordination layer
//!
//! Typed errors are reserved for conditions callers are expected to branch
//! on: auth rejection, exhausted reconnects, state-machine guard violations,
//! and replay failures. Storage and wiring plumbing uses `anyhow` with
//! context instead.

use thiserror::Error;

use crate::trip::TripStatus;

/// Errors surfaced by the persistent channel connection.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The relay rejected the bearer token. Never retried.
    #[error("authentication rejected: {0}")]
    Authentication(String),

    /// The reconnect budget was exhausted. The handle is terminally
    /// disconnected and a fresh `connect` is required.
    #[error("connection failed after {attempts} attempts")]
    Connection { attempts: u32 },

    /// No live link to hand the frame to. Returned by the acknowledged
    /// send path so callers keep the payload instead of losing it.
    #[error("channel not connected")]
    NotConnected,
}

/// Errors produced by a transport implementation during connect or I/O.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Credential was missing or refused by the remote side.
    #[error("transport auth rejected: {0}")]
    AuthRejected(String),

    /// Transient connect failure; the channel layer retries these.
    #[error("transport connect failed: {0}")]
    Connect(String),
}

/// Guard violations raised by the trip state machine.
///
/// These are surfaced to the initiating caller and never propagated as a
/// crash; remote duplicates are handled as no-ops before reaching here.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TripError {
    /// The requested transition is not in the permitted table.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: TripStatus, to: TripStatus },

    /// An accept was attempted on a trip that already left `requested`.
    #[error("trip already accepted by driver {driver_id}")]
    AlreadyAccepted { driver_id: String },

    /// No trip with this id is currently tracked.
    #[error("unknown trip {0}")]
    UnknownTrip(String),

    /// The local driver session already has a non-terminal trip.
    #[error("driver already has active trip {0}")]
    DriverBusy(String),
}

/// Storage-level failures from the offline operation queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("queue payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// A queued operation's executor rejected it during drain.
///
/// The operation stays in the queue (along with everything enqueued after
/// it) and is retried on the next drain; it is never discarded
/// automatically.
#[derive(Debug, Clone, Error)]
#[error("replay of {kind} operation {operation_id} failed: {reason}")]
pub struct ReplayFailure {
    pub operation_id: String,
    pub kind: String,
    pub reason: String,
}
