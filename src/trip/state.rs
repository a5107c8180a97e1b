//! Trip status lifecycle and the closed transition table
//!
//! `requested -> accepted -> driver_arrived -> in_progress -> {completed | cancelled}`
//!
//! Illegal moves are rejected at construction time by [`Trip::transition`];
//! there is no scattered boolean bookkeeping anywhere else in the crate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TripError;
use crate::estimate::{FareEstimate, FraudAssessment, GeoPoint, Provenance, VehicleClass};

/// Role a client process plays on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Rider,
    Driver,
    Operations,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rider" => Ok(Role::Rider),
            "driver" => Ok(Role::Driver),
            "operations" => Ok(Role::Operations),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Rider => "rider",
            Role::Driver => "driver",
            Role::Operations => "operations",
        };
        f.write_str(s)
    }
}

/// Status of a trip. `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Requested,
    Accepted,
    DriverArrived,
    InProgress,
    Completed,
    Cancelled,
}

impl TripStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TripStatus::Completed | TripStatus::Cancelled)
    }

    /// The permitted transition table. Cancellation is allowed from any
    /// non-terminal state; everything else moves strictly forward.
    pub fn can_transition_to(self, next: TripStatus) -> bool {
        if next == TripStatus::Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (TripStatus::Requested, TripStatus::Accepted)
                | (TripStatus::Accepted, TripStatus::DriverArrived)
                | (TripStatus::DriverArrived, TripStatus::InProgress)
                | (TripStatus::InProgress, TripStatus::Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TripStatus::Requested => "requested",
            TripStatus::Accepted => "accepted",
            TripStatus::DriverArrived => "driver_arrived",
            TripStatus::InProgress => "in_progress",
            TripStatus::Completed => "completed",
            TripStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat message attached to a trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripMessage {
    pub sender_role: Role,
    pub body: String,
    pub sent_at_ms: u64,
}

/// The per-trip record driven through guarded transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub id: String,
    pub status: TripStatus,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub vehicle_class: VehicleClass,
    /// Assigned on accept, absent until then.
    pub driver_id: Option<String>,
    /// Edge estimate until an authoritative fare supersedes it.
    pub fare: Option<FareEstimate>,
    /// Advisory only; never consulted by a transition guard.
    pub fraud: Option<FraudAssessment>,
    pub requested_at_ms: u64,
    pub accepted_at_ms: Option<u64>,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub cancelled_at_ms: Option<u64>,
    /// The status the trip was in when it was cancelled, kept for audit.
    pub cancelled_from: Option<TripStatus>,
    pub cancel_reason: Option<String>,
    pub messages: Vec<TripMessage>,
}

impl Trip {
    pub fn new(
        id: String,
        pickup: GeoPoint,
        dropoff: GeoPoint,
        vehicle_class: VehicleClass,
        requested_at_ms: u64,
    ) -> Self {
        Self {
            id,
            status: TripStatus::Requested,
            pickup,
            dropoff,
            vehicle_class,
            driver_id: None,
            fare: None,
            fraud: None,
            requested_at_ms,
            accepted_at_ms: None,
            started_at_ms: None,
            completed_at_ms: None,
            cancelled_at_ms: None,
            cancelled_from: None,
            cancel_reason: None,
            messages: Vec::new(),
        }
    }

    /// Apply a guarded transition, stamping the matching timestamp.
    ///
    /// Rejects with [`TripError::AlreadyAccepted`] when an accept races a
    /// prior accept, and [`TripError::InvalidTransition`] for any move not
    /// in the table. State is untouched on rejection.
    pub fn transition(&mut self, next: TripStatus, now_ms: u64) -> Result<(), TripError> {
        if !self.status.can_transition_to(next) {
            if next == TripStatus::Accepted && self.status != TripStatus::Requested {
                return Err(TripError::AlreadyAccepted {
                    driver_id: self.driver_id.clone().unwrap_or_default(),
                });
            }
            return Err(TripError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        match next {
            TripStatus::Accepted => self.accepted_at_ms = Some(now_ms),
            TripStatus::InProgress => self.started_at_ms = Some(now_ms),
            TripStatus::Completed => self.completed_at_ms = Some(now_ms),
            TripStatus::Cancelled => {
                self.cancelled_from = Some(self.status);
                self.cancelled_at_ms = Some(now_ms);
            }
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Replace the fare only if the incoming value outranks the held one.
    ///
    /// Authoritative always wins; an edge value never overwrites an
    /// authoritative one.
    pub fn merge_fare(&mut self, incoming: FareEstimate) {
        let keep_held = matches!(
            self.fare.map(|f| f.provenance),
            Some(Provenance::Authoritative)
        ) && incoming.provenance == Provenance::Edge;
        if !keep_held {
            self.fare = Some(incoming);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_trip() -> Trip {
        Trip::new(
            "trip-1".into(),
            GeoPoint::new(52.52, 13.40),
            GeoPoint::new(52.50, 13.45),
            VehicleClass::Economy,
            1_000,
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut trip = test_trip();
        trip.transition(TripStatus::Accepted, 2_000).unwrap();
        trip.transition(TripStatus::DriverArrived, 3_000).unwrap();
        trip.transition(TripStatus::InProgress, 4_000).unwrap();
        trip.transition(TripStatus::Completed, 5_000).unwrap();

        assert_eq!(trip.status, TripStatus::Completed);
        assert_eq!(trip.accepted_at_ms, Some(2_000));
        assert_eq!(trip.started_at_ms, Some(4_000));
        assert_eq!(trip.completed_at_ms, Some(5_000));
    }

    #[test]
    fn test_no_state_skipping() {
        let mut trip = test_trip();
        let err = trip.transition(TripStatus::InProgress, 2_000).unwrap_err();
        assert_eq!(
            err,
            TripError::InvalidTransition {
                from: TripStatus::Requested,
                to: TripStatus::InProgress,
            }
        );
        assert_eq!(trip.status, TripStatus::Requested);
    }

    #[test]
    fn test_double_accept_rejected() {
        let mut trip = test_trip();
        trip.transition(TripStatus::Accepted, 2_000).unwrap();
        trip.driver_id = Some("driver-7".into());

        let err = trip.transition(TripStatus::Accepted, 3_000).unwrap_err();
        assert_eq!(
            err,
            TripError::AlreadyAccepted {
                driver_id: "driver-7".into(),
            }
        );
    }

    #[test]
    fn test_cancel_records_prior_state() {
        let mut trip = test_trip();
        trip.transition(TripStatus::Accepted, 2_000).unwrap();
        trip.transition(TripStatus::Cancelled, 3_000).unwrap();

        assert_eq!(trip.status, TripStatus::Cancelled);
        assert_eq!(trip.cancelled_from, Some(TripStatus::Accepted));
        // A cancellation is not a completion in the audit record.
        assert_eq!(trip.cancelled_at_ms, Some(3_000));
        assert_eq!(trip.completed_at_ms, None);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut trip = test_trip();
        trip.transition(TripStatus::Cancelled, 2_000).unwrap();
        assert!(trip.transition(TripStatus::Accepted, 3_000).is_err());
        assert!(trip.transition(TripStatus::Cancelled, 3_000).is_err());
    }

    #[test]
    fn test_authoritative_fare_wins() {
        use crate::estimate;

        let mut trip = test_trip();
        let edge = estimate::fare(10.0, 20.0, VehicleClass::Economy, 1.0);
        trip.merge_fare(edge);

        let mut authoritative = edge;
        authoritative.total = 21.00;
        authoritative.provenance = Provenance::Authoritative;
        trip.merge_fare(authoritative);
        assert_eq!(trip.fare.unwrap().total, 21.00);

        // A later edge estimate must not claw it back
        trip.merge_fare(edge);
        assert_eq!(trip.fare.unwrap().provenance, Provenance::Authoritative);
    }
}
