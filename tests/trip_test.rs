//! Trip coordinator tests
//!
//! End-to-end over `InMemoryTransport`, with the test standing in for the
//! relay: the guarded lifecycle, idempotent remote application, offline
//! diversion into the queue, authoritative fare merging, driver busy
//! enforcement, and emergency broadcast orthogonal to trip status.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::time::sleep;

use rideline_node::channel::protocol::{topics, Envelope};
use rideline_node::channel::transport::InMemoryTransport;
use rideline_node::channel::ChannelConnection;
use rideline_node::config::{ChannelConfig, LocationConfig};
use rideline_node::error::TripError;
use rideline_node::estimate::{self, GeoPoint, Provenance, VehicleClass};
use rideline_node::location::store::LocationStore;
use rideline_node::location::{LocationTracker, SimulatedSource, TokioTaskRunner};
use rideline_node::queue::{OfflineQueue, OperationKind};
use rideline_node::trip::{Role, TripCoordinator, TripStatus};

const TOKEN: &str = "valid-token";

fn pickup() -> GeoPoint {
    GeoPoint::new(52.5200, 13.4050)
}

fn dropoff() -> GeoPoint {
    GeoPoint::new(52.4800, 13.5000)
}

struct Harness {
    _dir: TempDir,
    transport: InMemoryTransport,
    channel: Arc<ChannelConnection>,
    queue: Arc<OfflineQueue>,
    coordinator: TripCoordinator,
}

impl Harness {
    async fn new(role: Role) -> Self {
        let dir = TempDir::new().unwrap();
        let transport = InMemoryTransport::new(TOKEN);
        let config = ChannelConfig {
            url: "mem://relay".to_string(),
            max_reconnect_attempts: 3,
            base_delay_ms: 2,
            max_delay_ms: 10,
            outbound_buffer: 64,
        };
        let channel = Arc::new(
            ChannelConnection::connect(Arc::new(transport.clone()), config, TOKEN)
                .await
                .unwrap(),
        );

        let store = Arc::new(LocationStore::open(dir.path(), "device-a").unwrap());
        let queue = Arc::new(OfflineQueue::open(dir.path(), "device-a").unwrap());
        let tracker = Arc::new(LocationTracker::new(
            Arc::new(SimulatedSource::new(pickup())),
            Arc::new(TokioTaskRunner::new()),
            store,
            LocationConfig::default(),
        ));

        let coordinator = TripCoordinator::new(
            role,
            Arc::clone(&channel),
            Arc::clone(&queue),
            tracker,
            Duration::from_secs(10),
        );
        coordinator.start();

        Self {
            _dir: dir,
            transport,
            channel,
            queue,
            coordinator,
        }
    }

    /// Sever the link and exhaust the reconnect budget.
    async fn go_offline(&self) {
        self.transport.reject_next_connects(10);
        self.transport.drop_links();
        sleep(Duration::from_millis(150)).await;
        assert!(!self.channel.is_connected());
    }

    /// Feed a frame in as if the relay delivered it, and let the
    /// coordinator loop process it.
    async fn deliver(&self, topic: &str, payload: serde_json::Value) {
        self.transport.push(Envelope::new(topic, payload)).await;
        sleep(Duration::from_millis(50)).await;
    }
}

// =============================================================================
// Requesting
// =============================================================================

#[tokio::test]
async fn test_request_yields_optimistic_trip_with_edge_fare() {
    let harness = Harness::new(Role::Rider).await;

    let trip = harness
        .coordinator
        .request(pickup(), dropoff(), VehicleClass::Economy)
        .await
        .unwrap();

    assert_eq!(trip.status, TripStatus::Requested);
    let fare = trip.fare.unwrap();
    assert_eq!(fare.provenance, Provenance::Edge);
    assert!(fare.total > 0.0);
    assert!(trip.fraud.is_some());

    sleep(Duration::from_millis(50)).await;
    // The trip topic was joined and the creation replayed to the relay.
    assert_eq!(harness.transport.received_on(topics::TRIP_JOIN).len(), 1);
    let creations = harness.transport.received_on(topics::TRIP_STATUS_UPDATE);
    assert_eq!(creations.len(), 1);
    assert_eq!(creations[0].payload["tripId"], json!(trip.id));
    assert!(harness.queue.is_empty().unwrap());
}

#[tokio::test]
async fn test_offline_request_is_queued_not_dropped() {
    let harness = Harness::new(Role::Rider).await;
    harness.go_offline().await;

    let trip = harness
        .coordinator
        .request(pickup(), dropoff(), VehicleClass::Comfort)
        .await
        .unwrap();

    // The optimistic trip exists locally with an edge fare.
    assert_eq!(trip.status, TripStatus::Requested);
    assert_eq!(trip.fare.unwrap().provenance, Provenance::Edge);

    // Nothing reached the relay; the creation is durable instead.
    assert!(harness.transport.received_on(topics::TRIP_STATUS_UPDATE).is_empty());
    let pending = harness.queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, OperationKind::TripCreate);
}

#[tokio::test]
async fn test_offline_transitions_divert_through_queue() {
    let harness = Harness::new(Role::Rider).await;
    harness.go_offline().await;

    let trip = harness
        .coordinator
        .request(pickup(), dropoff(), VehicleClass::Economy)
        .await
        .unwrap();
    harness.coordinator.accept(&trip.id, "driver-7").await.unwrap();

    let kinds: Vec<OperationKind> = harness
        .queue
        .pending()
        .unwrap()
        .into_iter()
        .map(|op| op.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            OperationKind::TripCreate,
            OperationKind::StatusUpdate, // the accept frame
            OperationKind::StatusUpdate, // the status announcement
        ]
    );
}

#[tokio::test]
async fn test_reconnect_drains_operations_queued_while_away() {
    let harness = Harness::new(Role::Rider).await;

    // Left over from a disconnected session.
    harness
        .queue
        .enqueue(OperationKind::StatusUpdate, json!({"tripId": "t9", "status": "cancelled"}))
        .unwrap();

    // A brief link loss; the reconnect event triggers a drain.
    harness.transport.drop_links();
    sleep(Duration::from_millis(150)).await;
    assert!(harness.channel.is_connected());

    assert!(harness.queue.is_empty().unwrap());
    let replayed = harness.transport.received_on(topics::TRIP_STATUS_UPDATE);
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].payload["tripId"], json!("t9"));
}

#[tokio::test]
async fn test_rejoins_trip_topics_after_reconnect() {
    let harness = Harness::new(Role::Rider).await;
    let trip = harness
        .coordinator
        .request(pickup(), dropoff(), VehicleClass::Economy)
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.transport.received_on(topics::TRIP_JOIN).len(), 1);

    // The relay's membership records die with the link; after the
    // reconnect the coordinator must re-assert them or remote trip
    // events stop arriving for good.
    harness.transport.drop_links();
    sleep(Duration::from_millis(150)).await;
    assert!(harness.channel.is_connected());

    let joins = harness.transport.received_on(topics::TRIP_JOIN);
    assert_eq!(joins.len(), 2);
    assert_eq!(joins[1].payload["tripId"], json!(trip.id));
}

#[tokio::test]
async fn test_operations_rejoin_broadcast_after_reconnect() {
    let harness = Harness::new(Role::Operations).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.transport.received_on(topics::ADMIN_JOIN).len(), 1);

    harness.transport.drop_links();
    sleep(Duration::from_millis(150)).await;
    assert!(harness.channel.is_connected());

    assert_eq!(harness.transport.received_on(topics::ADMIN_JOIN).len(), 2);
}

// =============================================================================
// Lifecycle guards
// =============================================================================

#[tokio::test]
async fn test_full_lifecycle_reaches_archive() {
    let harness = Harness::new(Role::Rider).await;
    let trip = harness
        .coordinator
        .request(pickup(), dropoff(), VehicleClass::Economy)
        .await
        .unwrap();

    harness.coordinator.accept(&trip.id, "driver-7").await.unwrap();
    harness.coordinator.mark_arrived(&trip.id).await.unwrap();
    harness.coordinator.begin(&trip.id).await.unwrap();
    let finished = harness.coordinator.complete(&trip.id).await.unwrap();

    assert_eq!(finished.status, TripStatus::Completed);
    assert!(finished.completed_at_ms.is_some());

    // Terminal trips move out of the live map into the archive.
    assert!(harness.coordinator.trip(&trip.id).await.is_none());
    let archived = harness.coordinator.archived();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].id, trip.id);

    sleep(Duration::from_millis(50)).await;
    // Leaving the trip topic accompanies the terminal transition.
    assert_eq!(harness.transport.received_on(topics::TRIP_LEAVE).len(), 1);
}

#[tokio::test]
async fn test_skipping_states_is_rejected_without_corruption() {
    let harness = Harness::new(Role::Rider).await;
    let trip = harness
        .coordinator
        .request(pickup(), dropoff(), VehicleClass::Economy)
        .await
        .unwrap();

    let err = harness.coordinator.begin(&trip.id).await.unwrap_err();
    assert_eq!(
        err,
        TripError::InvalidTransition {
            from: TripStatus::Requested,
            to: TripStatus::InProgress,
        }
    );

    let unchanged = harness.coordinator.trip(&trip.id).await.unwrap();
    assert_eq!(unchanged.status, TripStatus::Requested);
}

#[tokio::test]
async fn test_second_accept_names_the_winning_driver() {
    let harness = Harness::new(Role::Rider).await;
    let trip = harness
        .coordinator
        .request(pickup(), dropoff(), VehicleClass::Economy)
        .await
        .unwrap();

    harness.coordinator.accept(&trip.id, "driver-7").await.unwrap();
    let err = harness.coordinator.accept(&trip.id, "driver-9").await.unwrap_err();
    assert_eq!(
        err,
        TripError::AlreadyAccepted {
            driver_id: "driver-7".to_string(),
        }
    );

    let current = harness.coordinator.trip(&trip.id).await.unwrap();
    assert_eq!(current.driver_id.as_deref(), Some("driver-7"));
}

#[tokio::test]
async fn test_cancel_records_prior_state_and_reason() {
    let harness = Harness::new(Role::Rider).await;
    let trip = harness
        .coordinator
        .request(pickup(), dropoff(), VehicleClass::Economy)
        .await
        .unwrap();
    harness.coordinator.accept(&trip.id, "driver-7").await.unwrap();

    let cancelled = harness
        .coordinator
        .cancel(&trip.id, Some("driver no-show".to_string()))
        .await
        .unwrap();

    assert_eq!(cancelled.status, TripStatus::Cancelled);
    assert_eq!(cancelled.cancelled_from, Some(TripStatus::Accepted));
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("driver no-show"));
    assert!(cancelled.cancelled_at_ms.is_some());
    assert_eq!(cancelled.completed_at_ms, None);

    // Terminal: nothing moves it again.
    let err = harness.coordinator.complete(&trip.id).await.unwrap_err();
    assert_eq!(err, TripError::UnknownTrip(trip.id.clone()));
    assert_eq!(harness.coordinator.archived()[0].status, TripStatus::Cancelled);
}

// =============================================================================
// Remote application
// =============================================================================

#[tokio::test]
async fn test_duplicate_remote_status_is_idempotent() {
    let harness = Harness::new(Role::Rider).await;
    let trip = harness
        .coordinator
        .request(pickup(), dropoff(), VehicleClass::Economy)
        .await
        .unwrap();

    let accepted = json!({ "tripId": trip.id, "status": "accepted", "driverId": "driver-7" });
    harness.deliver(topics::TRIP_ACCEPTED, accepted.clone()).await;

    let first = harness.coordinator.trip(&trip.id).await.unwrap();
    assert_eq!(first.status, TripStatus::Accepted);
    assert_eq!(first.driver_id.as_deref(), Some("driver-7"));

    // At-least-once delivery: the duplicate changes nothing.
    harness.deliver(topics::TRIP_ACCEPTED, accepted).await;
    let second = harness.coordinator.trip(&trip.id).await.unwrap();
    assert_eq!(second.status, first.status);
    assert_eq!(second.driver_id, first.driver_id);
    assert_eq!(second.accepted_at_ms, first.accepted_at_ms);
}

#[tokio::test]
async fn test_out_of_order_remote_status_is_ignored() {
    let harness = Harness::new(Role::Rider).await;
    let trip = harness
        .coordinator
        .request(pickup(), dropoff(), VehicleClass::Economy)
        .await
        .unwrap();

    harness
        .deliver(
            topics::TRIP_STATUS_UPDATE,
            json!({ "tripId": trip.id, "status": "in_progress" }),
        )
        .await;

    let unchanged = harness.coordinator.trip(&trip.id).await.unwrap();
    assert_eq!(unchanged.status, TripStatus::Requested);
}

#[tokio::test]
async fn test_authoritative_fare_supersedes_edge_estimate() {
    let harness = Harness::new(Role::Rider).await;
    let trip = harness
        .coordinator
        .request(pickup(), dropoff(), VehicleClass::Economy)
        .await
        .unwrap();
    assert_eq!(trip.fare.unwrap().provenance, Provenance::Edge);

    let confirmed = estimate::fare(6.0, 12.0, VehicleClass::Economy, 1.0);
    harness
        .deliver(
            topics::TRIP_ACCEPTED,
            json!({
                "tripId": trip.id,
                "status": "accepted",
                "driverId": "driver-7",
                "fare": confirmed,
            }),
        )
        .await;

    let updated = harness.coordinator.trip(&trip.id).await.unwrap();
    let fare = updated.fare.unwrap();
    assert_eq!(fare.provenance, Provenance::Authoritative);
    assert_eq!(fare.total, confirmed.total);

    // A later edge value never overwrites the confirmed fare.
    let mut shadow = updated.clone();
    shadow.merge_fare(estimate::fare(99.0, 99.0, VehicleClass::Xl, 2.0));
    assert_eq!(shadow.fare.unwrap().total, confirmed.total);
}

#[tokio::test]
async fn test_remote_request_broadcast_tracks_shadow_trip() {
    let harness = Harness::new(Role::Driver).await;

    harness
        .deliver(
            topics::TRIP_STATUS_UPDATE,
            json!({
                "tripId": "t-remote",
                "status": "requested",
                "pickup": pickup(),
                "dropoff": dropoff(),
                "vehicleClass": "economy",
            }),
        )
        .await;

    let shadow = harness.coordinator.trip("t-remote").await.unwrap();
    assert_eq!(shadow.status, TripStatus::Requested);
    assert_eq!(shadow.pickup, pickup());
}

#[tokio::test]
async fn test_driver_holds_at_most_one_active_trip() {
    let harness = Harness::new(Role::Driver).await;

    for trip_id in ["t1", "t2"] {
        harness
            .deliver(
                topics::TRIP_STATUS_UPDATE,
                json!({
                    "tripId": trip_id,
                    "status": "requested",
                    "pickup": pickup(),
                    "dropoff": dropoff(),
                }),
            )
            .await;
    }

    harness.coordinator.accept("t1", "driver-7").await.unwrap();
    let err = harness.coordinator.accept("t2", "driver-7").await.unwrap_err();
    assert_eq!(err, TripError::DriverBusy("t1".to_string()));

    // Finishing the active trip frees the slot.
    harness.coordinator.mark_arrived("t1").await.unwrap();
    harness.coordinator.begin("t1").await.unwrap();
    harness.coordinator.complete("t1").await.unwrap();
    harness.coordinator.accept("t2", "driver-7").await.unwrap();
}

#[tokio::test]
async fn test_racing_accepts_commit_exactly_one_trip() {
    let harness = Harness::new(Role::Driver).await;

    for trip_id in ["t1", "t2"] {
        harness
            .deliver(
                topics::TRIP_STATUS_UPDATE,
                json!({
                    "tripId": trip_id,
                    "status": "requested",
                    "pickup": pickup(),
                    "dropoff": dropoff(),
                }),
            )
            .await;
    }

    // The slot is reserved before any await point, so concurrent accepts
    // of different trips cannot both pass the busy check.
    let (first, second) = tokio::join!(
        harness.coordinator.accept("t1", "driver-7"),
        harness.coordinator.accept("t2", "driver-7"),
    );
    assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);
    let busy = if first.is_ok() {
        second.unwrap_err()
    } else {
        first.unwrap_err()
    };
    assert!(matches!(busy, TripError::DriverBusy(_)));

    let active: Vec<TripStatus> = [
        harness.coordinator.trip("t1").await.unwrap().status,
        harness.coordinator.trip("t2").await.unwrap().status,
    ]
    .into_iter()
    .filter(|s| *s == TripStatus::Accepted)
    .collect();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn test_failed_accept_releases_driver_slot() {
    let harness = Harness::new(Role::Driver).await;

    for trip_id in ["t1", "t2"] {
        harness
            .deliver(
                topics::TRIP_STATUS_UPDATE,
                json!({
                    "tripId": trip_id,
                    "status": "requested",
                    "pickup": pickup(),
                    "dropoff": dropoff(),
                }),
            )
            .await;
    }
    // Another driver wins t1 first.
    harness
        .deliver(
            topics::TRIP_ACCEPTED,
            json!({ "tripId": "t1", "status": "accepted", "driverId": "driver-9" }),
        )
        .await;

    let err = harness.coordinator.accept("t1", "driver-7").await.unwrap_err();
    assert_eq!(
        err,
        TripError::AlreadyAccepted {
            driver_id: "driver-9".to_string(),
        }
    );

    // The rejected accept must not leave a phantom reservation behind.
    harness.coordinator.accept("t2", "driver-7").await.unwrap();
}

// =============================================================================
// Emergency
// =============================================================================

#[tokio::test]
async fn test_emergency_broadcasts_without_touching_status() {
    let harness = Harness::new(Role::Rider).await;
    let trip = harness
        .coordinator
        .request(pickup(), dropoff(), VehicleClass::Economy)
        .await
        .unwrap();
    harness.coordinator.accept(&trip.id, "driver-7").await.unwrap();

    harness
        .coordinator
        .raise_emergency(&trip.id, "send help")
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    let frames = harness.transport.received_on(topics::TRIP_EMERGENCY);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].payload["message"], json!("send help"));

    // Orthogonal to the lifecycle: the trip is exactly where it was.
    let unchanged = harness.coordinator.trip(&trip.id).await.unwrap();
    assert_eq!(unchanged.status, TripStatus::Accepted);

    // Unknown trips cannot raise emergencies.
    let err = harness.coordinator.raise_emergency("t-none", "help").unwrap_err();
    assert_eq!(err, TripError::UnknownTrip("t-none".to_string()));
}

#[tokio::test]
async fn test_emergency_alert_reaches_trip_subscribers() {
    let harness = Harness::new(Role::Rider).await;
    harness
        .deliver(
            topics::TRIP_EMERGENCY_ALERT,
            json!({ "tripId": "t1", "message": "send help" }),
        )
        .await;

    let alerts = harness.coordinator.emergencies();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].trip_id, "t1");
    assert_eq!(alerts[0].message, "send help");
}

#[tokio::test]
async fn test_operations_receive_emergency_on_ops_broadcast() {
    let harness = Harness::new(Role::Operations).await;
    sleep(Duration::from_millis(50)).await;

    // Operations announced themselves on start.
    assert_eq!(harness.transport.received_on(topics::ADMIN_JOIN).len(), 1);

    harness
        .deliver(
            topics::OPS_BROADCAST,
            json!({ "tripId": "t1", "message": "send help" }),
        )
        .await;

    let alerts = harness.coordinator.emergencies();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].trip_id, "t1");
}

// =============================================================================
// Messaging / snapshots
// =============================================================================

#[tokio::test]
async fn test_messages_flow_both_ways() {
    let harness = Harness::new(Role::Rider).await;
    let trip = harness
        .coordinator
        .request(pickup(), dropoff(), VehicleClass::Economy)
        .await
        .unwrap();

    harness
        .coordinator
        .send_message(&trip.id, "waiting at the corner")
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.transport.received_on(topics::TRIP_MESSAGE).len(), 1);

    harness
        .deliver(
            topics::TRIP_MESSAGE_RECEIVED,
            json!({ "tripId": trip.id, "message": "on my way", "senderRole": "driver" }),
        )
        .await;

    let current = harness.coordinator.trip(&trip.id).await.unwrap();
    assert_eq!(current.messages.len(), 2);
    assert_eq!(current.messages[0].body, "waiting at the corner");
    assert_eq!(current.messages[1].body, "on my way");
    assert_eq!(current.messages[1].sender_role, Role::Driver);
}

#[tokio::test]
async fn test_snapshot_watch_follows_mutations() {
    let harness = Harness::new(Role::Rider).await;
    let mut snapshots = harness.coordinator.snapshots();

    let trip = harness
        .coordinator
        .request(pickup(), dropoff(), VehicleClass::Economy)
        .await
        .unwrap();
    assert_eq!(
        snapshots.borrow_and_update().as_ref().map(|t| t.status),
        Some(TripStatus::Requested)
    );

    harness.coordinator.accept(&trip.id, "driver-7").await.unwrap();
    assert_eq!(
        snapshots.borrow_and_update().as_ref().map(|t| t.status),
        Some(TripStatus::Accepted)
    );
}
