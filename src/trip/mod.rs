//! Trip coordinator - the per-process trip state container
//!
//! Drives the authoritative trip lifecycle from both directions:
//! - a typed action API for local actions (request, accept, arrive, begin,
//!   complete, cancel, message, emergency)
//! - a remote-event loop consuming channel envelopes, idempotent under
//!   at-least-once delivery
//!
//! Transitions for one trip are serialized behind a per-trip lock;
//! different trips move independently. Every local transition publishes
//! `trip:status-update` (or diverts it into the offline queue when
//! disconnected), switches the location tracker profile around
//! `in_progress`, and observes join/leave discipline on the trip topic.
//! Consumers watch a snapshot channel instead of sharing mutable state.

pub mod state;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::protocol::{topics, Envelope};
use crate::channel::{ChannelConnection, ChannelEvent, Subscription};
use crate::error::TripError;
use crate::estimate::{self, FareEstimate, GeoPoint, Provenance, TripRequest, VehicleClass};
use crate::location::{LocationSample, LocationTracker, SamplingMode};
use crate::queue::{OfflineQueue, OperationExecutor, OperationKind, QueuedOperation};

pub use state::{Role, Trip, TripMessage, TripStatus};

/// An emergency received from the relay. Orthogonal to trip status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyAlert {
    pub trip_id: String,
    pub location: Option<LocationSample>,
    pub message: String,
    pub received_at_ms: u64,
}

struct CoordinatorInner {
    role: Role,
    channel: Arc<ChannelConnection>,
    queue: Arc<OfflineQueue>,
    tracker: Arc<LocationTracker>,
    retry_interval: Duration,
    /// Live trips behind per-trip locks.
    trips: StdMutex<HashMap<String, Arc<Mutex<Trip>>>>,
    /// Terminal trips, kept for duplicate-event absorption and audit.
    archived: StdMutex<Vec<Trip>>,
    /// Trip topics we have joined and not yet left.
    joined: StdMutex<HashSet<String>>,
    /// The one non-terminal trip this driver session may hold.
    active_driver_trip: StdMutex<Option<String>>,
    /// Local view of recent requests feeding surge and fraud heuristics.
    recent_requests: StdMutex<Vec<TripRequest>>,
    emergencies: StdMutex<Vec<EmergencyAlert>>,
    snapshot_tx: watch::Sender<Option<Trip>>,
    remote_tx: mpsc::UnboundedSender<Envelope>,
}

/// Explicitly constructed, dependency-injected coordination service.
/// One per client process; built on app start, shut down on logout.
pub struct TripCoordinator {
    inner: Arc<CoordinatorInner>,
    subscriptions: StdMutex<Vec<Subscription>>,
    remote_rx: StdMutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl TripCoordinator {
    pub fn new(
        role: Role,
        channel: Arc<ChannelConnection>,
        queue: Arc<OfflineQueue>,
        tracker: Arc<LocationTracker>,
        retry_interval: Duration,
    ) -> Self {
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(CoordinatorInner {
                role,
                channel,
                queue,
                tracker,
                retry_interval,
                trips: StdMutex::new(HashMap::new()),
                archived: StdMutex::new(Vec::new()),
                joined: StdMutex::new(HashSet::new()),
                active_driver_trip: StdMutex::new(None),
                recent_requests: StdMutex::new(Vec::new()),
                emergencies: StdMutex::new(Vec::new()),
                snapshot_tx,
                remote_tx,
            }),
            subscriptions: StdMutex::new(Vec::new()),
            remote_rx: StdMutex::new(Some(remote_rx)),
            task: StdMutex::new(None),
        }
    }

    /// Register channel subscriptions and spawn the remote-event loop.
    pub fn start(&self) {
        let mut subscriptions = Vec::new();
        for topic in [
            topics::TRIP_STATUS_UPDATE,
            topics::TRIP_ACCEPTED,
            topics::TRIP_CANCELLED,
            topics::TRIP_MESSAGE_RECEIVED,
            topics::TRIP_EMERGENCY_ALERT,
        ] {
            let tx = self.inner.remote_tx.clone();
            subscriptions.push(self.inner.channel.subscribe(topic, move |envelope| {
                let _ = tx.send(envelope.clone());
            }));
        }

        if self.inner.role == Role::Operations {
            let tx = self.inner.remote_tx.clone();
            subscriptions.push(self.inner.channel.subscribe(topics::OPS_BROADCAST, move |envelope| {
                let _ = tx.send(envelope.clone());
            }));
            self.inner.channel.publish(topics::ADMIN_JOIN, json!({}));
            info!("joined operations broadcast");
        }

        *self.subscriptions.lock().unwrap() = subscriptions;

        if let Some(remote_rx) = self.remote_rx.lock().unwrap().take() {
            let inner = Arc::clone(&self.inner);
            let events = self.inner.channel.events();
            *self.task.lock().unwrap() = Some(tokio::spawn(run_loop(inner, remote_rx, events)));
        }
        info!(role = %self.inner.role, "trip coordinator started");
    }

    /// Drop all channel subscriptions, leave joined trip topics, and stop
    /// the event loop.
    pub async fn shutdown(&self) {
        self.subscriptions.lock().unwrap().clear();
        let joined: Vec<String> = self.inner.joined.lock().unwrap().drain().collect();
        for trip_id in joined {
            self.inner
                .channel
                .publish(topics::TRIP_LEAVE, json!({ "tripId": trip_id }));
        }
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        info!("trip coordinator shut down");
    }

    // ---- actions -----------------------------------------------------

    /// Create a trip request. Always durable: the creation op is enqueued
    /// first, then replayed immediately when connected, so the caller gets
    /// an optimistic trip with an edge fare either way.
    pub async fn request(
        &self,
        pickup: GeoPoint,
        dropoff: GeoPoint,
        vehicle_class: VehicleClass,
    ) -> Result<Trip> {
        let now = crate::now_ms();
        let trip_request = TripRequest {
            pickup,
            dropoff,
            requested_at_ms: now,
        };

        let (surge_multiplier, fraud) = {
            let mut recent = self.inner.recent_requests.lock().unwrap();
            prune_recent_requests(&mut recent, now);
            let fraud = estimate::fraud_risk(&trip_request, &recent);
            let surge = estimate::surge(recent.len() as u32);
            recent.push(trip_request);
            (surge, fraud)
        };

        let route = estimate::route(pickup, dropoff);
        let fare = estimate::fare(route.distance_km, route.duration_min, vehicle_class, surge_multiplier);

        let mut trip = Trip::new(
            uuid::Uuid::new_v4().to_string(),
            pickup,
            dropoff,
            vehicle_class,
            now,
        );
        trip.fare = Some(fare);
        trip.fraud = Some(fraud);

        let payload = json!({
            "tripId": trip.id,
            "status": trip.status,
            "pickup": trip.pickup,
            "dropoff": trip.dropoff,
            "vehicleClass": vehicle_class,
            "fare": fare,
        });
        self.inner.queue.enqueue(OperationKind::TripCreate, payload)?;

        self.inner
            .trips
            .lock()
            .unwrap()
            .insert(trip.id.clone(), Arc::new(Mutex::new(trip.clone())));
        self.inner.join_trip(&trip.id);

        if self.inner.channel.is_connected() {
            self.inner.drain_now().await;
        } else {
            info!(trip_id = %trip.id, "offline, trip creation queued");
        }

        self.inner.publish_snapshot(&trip);
        Ok(trip)
    }

    /// Accept a requested trip, naming the driver.
    ///
    /// For drivers the one-active-trip slot is reserved under its lock
    /// before the transition runs, so two racing accepts of different
    /// trips cannot both commit; the reservation rolls back if the guard
    /// rejects the transition.
    pub async fn accept(&self, trip_id: &str, driver_id: &str) -> Result<Trip, TripError> {
        let reserved = if self.inner.role == Role::Driver {
            let mut active = self.inner.active_driver_trip.lock().unwrap();
            if let Some(active_id) = active.clone() {
                if active_id != trip_id {
                    return Err(TripError::DriverBusy(active_id));
                }
                false
            } else {
                *active = Some(trip_id.to_string());
                true
            }
        } else {
            false
        };

        let result = match self.inner.trip_handle(trip_id) {
            Ok(handle) => {
                let mut trip = handle.lock().await;
                trip.transition(TripStatus::Accepted, crate::now_ms())
                    .map(|()| {
                        trip.driver_id = Some(driver_id.to_string());
                        trip.clone()
                    })
            }
            Err(e) => Err(e),
        };

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                if reserved {
                    let mut active = self.inner.active_driver_trip.lock().unwrap();
                    if active.as_deref() == Some(trip_id) {
                        *active = None;
                    }
                }
                return Err(e);
            }
        };

        self.inner.join_trip(trip_id);
        self.inner.publish_or_queue(
            topics::TRIP_ACCEPTED,
            OperationKind::StatusUpdate,
            json!({ "tripId": trip_id, "driverId": driver_id, "status": TripStatus::Accepted }),
        );
        self.inner.announce_transition(&snapshot);
        Ok(snapshot)
    }

    /// Driver has reached the pickup point.
    pub async fn mark_arrived(&self, trip_id: &str) -> Result<Trip, TripError> {
        self.apply_local(trip_id, TripStatus::DriverArrived).await
    }

    /// Rider is on board; the trip is underway.
    pub async fn begin(&self, trip_id: &str) -> Result<Trip, TripError> {
        self.apply_local(trip_id, TripStatus::InProgress).await
    }

    /// Trip reached the dropoff point.
    pub async fn complete(&self, trip_id: &str) -> Result<Trip, TripError> {
        self.apply_local(trip_id, TripStatus::Completed).await
    }

    /// Cancel from any non-terminal state; the prior state is recorded.
    pub async fn cancel(&self, trip_id: &str, reason: Option<String>) -> Result<Trip, TripError> {
        let handle = self.inner.trip_handle(trip_id)?;
        let snapshot = {
            let mut trip = handle.lock().await;
            trip.transition(TripStatus::Cancelled, crate::now_ms())?;
            trip.cancel_reason = reason.clone();
            trip.clone()
        };
        self.inner.publish_or_queue(
            topics::TRIP_CANCELLED,
            OperationKind::StatusUpdate,
            json!({ "tripId": trip_id, "status": TripStatus::Cancelled, "reason": reason }),
        );
        self.inner.announce_transition(&snapshot);
        Ok(snapshot)
    }

    /// Broadcast an emergency for a live trip. Never changes trip status.
    pub fn raise_emergency(&self, trip_id: &str, message: &str) -> Result<(), TripError> {
        let _ = self.inner.trip_handle(trip_id)?;
        let location = self.inner.tracker.last_known();
        self.inner.channel.publish(
            topics::TRIP_EMERGENCY,
            json!({ "tripId": trip_id, "location": location, "message": message }),
        );
        warn!(trip_id, "emergency raised");
        Ok(())
    }

    /// Send a chat message to the other trip party.
    pub async fn send_message(&self, trip_id: &str, body: &str) -> Result<(), TripError> {
        let handle = self.inner.trip_handle(trip_id)?;
        let snapshot = {
            let mut trip = handle.lock().await;
            trip.messages.push(TripMessage {
                sender_role: self.inner.role,
                body: body.to_string(),
                sent_at_ms: crate::now_ms(),
            });
            trip.clone()
        };
        self.inner.channel.publish(
            topics::TRIP_MESSAGE,
            json!({ "tripId": trip_id, "message": body, "senderRole": self.inner.role }),
        );
        self.inner.publish_snapshot(&snapshot);
        Ok(())
    }

    /// Flip driver availability; diverted to the queue while disconnected.
    pub fn set_driver_availability(&self, online: bool) -> Result<()> {
        let status = if online { "online" } else { "offline" };
        self.inner.publish_or_queue(
            topics::DRIVER_STATUS_CHANGE,
            OperationKind::DriverStatus,
            json!({ "status": status }),
        );
        Ok(())
    }

    /// Queue a rating for durable submission.
    pub async fn submit_rating(&self, trip_id: &str, rating: u8, comment: Option<String>) -> Result<()> {
        self.inner.queue.enqueue(
            OperationKind::RatingSubmit,
            json!({ "tripId": trip_id, "rating": rating, "comment": comment }),
        )?;
        if self.inner.channel.is_connected() {
            self.inner.drain_now().await;
        }
        Ok(())
    }

    /// Queue a profile mutation for durable submission.
    pub async fn update_profile(&self, fields: Value) -> Result<()> {
        self.inner.queue.enqueue(OperationKind::ProfileUpdate, fields)?;
        if self.inner.channel.is_connected() {
            self.inner.drain_now().await;
        }
        Ok(())
    }

    // ---- observation -------------------------------------------------

    /// Watch the most recently mutated trip snapshot.
    pub fn snapshots(&self) -> watch::Receiver<Option<Trip>> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Current state of a live trip.
    pub async fn trip(&self, trip_id: &str) -> Option<Trip> {
        let handle = self.inner.trips.lock().unwrap().get(trip_id).cloned()?;
        let trip = handle.lock().await;
        Some(trip.clone())
    }

    /// Terminal trips observed by this process.
    pub fn archived(&self) -> Vec<Trip> {
        self.inner.archived.lock().unwrap().clone()
    }

    /// Emergencies received on this process's subscriptions.
    pub fn emergencies(&self) -> Vec<EmergencyAlert> {
        self.inner.emergencies.lock().unwrap().clone()
    }

    /// Sample callback for the location tracker: republishes driver
    /// positions on the channel while connected.
    pub fn location_publisher(&self) -> impl Fn(LocationSample) + Send + Sync + 'static {
        let inner = Arc::clone(&self.inner);
        move |sample| {
            if inner.role != Role::Driver || !inner.channel.is_connected() {
                return;
            }
            let trip_id = inner.active_driver_trip.lock().unwrap().clone();
            inner.channel.publish(
                topics::DRIVER_LOCATION_UPDATE,
                json!({
                    "latitude": sample.latitude,
                    "longitude": sample.longitude,
                    "heading": sample.heading,
                    "speed": sample.speed,
                    "tripId": trip_id,
                }),
            );
        }
    }

    async fn apply_local(&self, trip_id: &str, next: TripStatus) -> Result<Trip, TripError> {
        let handle = self.inner.trip_handle(trip_id)?;
        let snapshot = {
            let mut trip = handle.lock().await;
            trip.transition(next, crate::now_ms())?;
            trip.clone()
        };
        self.inner.announce_transition(&snapshot);
        Ok(snapshot)
    }
}

impl CoordinatorInner {
    fn trip_handle(&self, trip_id: &str) -> Result<Arc<Mutex<Trip>>, TripError> {
        self.trips
            .lock()
            .unwrap()
            .get(trip_id)
            .cloned()
            .ok_or_else(|| TripError::UnknownTrip(trip_id.to_string()))
    }

    fn publish_snapshot(&self, trip: &Trip) {
        self.snapshot_tx.send_replace(Some(trip.clone()));
    }

    fn join_trip(&self, trip_id: &str) {
        if self.joined.lock().unwrap().insert(trip_id.to_string()) {
            self.channel
                .publish(topics::TRIP_JOIN, json!({ "tripId": trip_id }));
        }
    }

    fn leave_trip(&self, trip_id: &str) {
        if self.joined.lock().unwrap().remove(trip_id) {
            self.channel
                .publish(topics::TRIP_LEAVE, json!({ "tripId": trip_id }));
        }
    }

    /// Re-assert relay-side topic membership after a reconnect. The
    /// relay's membership records died with the old link; joins are
    /// idempotent there, so replaying them is safe.
    fn rejoin_topics(&self) {
        let joined: Vec<String> = self.joined.lock().unwrap().iter().cloned().collect();
        for trip_id in joined {
            debug!(trip_id = %trip_id, "rejoining trip topic after reconnect");
            self.channel
                .publish(topics::TRIP_JOIN, json!({ "tripId": trip_id }));
        }
        if self.role == Role::Operations {
            self.channel.publish(topics::ADMIN_JOIN, json!({}));
        }
    }

    /// Publish directly while connected, otherwise persist for replay.
    fn publish_or_queue(&self, topic: &str, kind: OperationKind, payload: Value) {
        if self.channel.is_connected() {
            self.channel.publish(topic, payload);
        } else {
            match self.queue.enqueue(kind, payload) {
                Ok(operation) => debug!(operation_id = %operation.id, topic, "offline, operation queued"),
                Err(e) => warn!(topic, error = %e, "failed to queue offline operation"),
            }
        }
    }

    /// Effects of a locally initiated transition: publish the new status
    /// (or queue it) and apply the shared post-transition effects.
    fn announce_transition(&self, trip: &Trip) {
        self.publish_or_queue(
            topics::TRIP_STATUS_UPDATE,
            OperationKind::StatusUpdate,
            json!({ "tripId": trip.id, "status": trip.status }),
        );
        self.post_transition_effects(trip);
    }

    /// Effects shared by local and remote transitions: tracker profile
    /// switches around `in_progress`, leave + archive on terminal states,
    /// and a fresh snapshot.
    fn post_transition_effects(&self, trip: &Trip) {
        match trip.status {
            TripStatus::InProgress => {
                if self.role == Role::Driver {
                    self.tracker.set_mode(SamplingMode::ActiveTrip);
                }
            }
            status if status.is_terminal() => {
                if self.role == Role::Driver {
                    self.tracker.set_mode(SamplingMode::IdleScan);
                    let mut active = self.active_driver_trip.lock().unwrap();
                    if active.as_deref() == Some(trip.id.as_str()) {
                        *active = None;
                    }
                }
                self.leave_trip(&trip.id);
                self.archive(trip);
            }
            _ => {}
        }
        self.publish_snapshot(trip);
    }

    fn archive(&self, trip: &Trip) {
        self.trips.lock().unwrap().remove(&trip.id);
        self.archived.lock().unwrap().push(trip.clone());
        debug!(trip_id = %trip.id, status = %trip.status, "trip archived");
    }

    async fn drain_now(&self) {
        let executor = ChannelExecutor {
            channel: Arc::clone(&self.channel),
        };
        if let Err(e) = self.queue.drain(&executor).await {
            warn!(error = %e, "queue drain failed");
        }
    }

    // ---- remote events -----------------------------------------------

    async fn handle_remote(&self, envelope: Envelope) {
        match envelope.topic.as_str() {
            topics::TRIP_STATUS_UPDATE => self.handle_remote_status(&envelope).await,
            topics::TRIP_ACCEPTED => self.handle_remote_accepted(&envelope).await,
            topics::TRIP_CANCELLED => self.handle_remote_cancelled(&envelope).await,
            topics::TRIP_MESSAGE_RECEIVED => self.handle_remote_message(&envelope).await,
            topics::TRIP_EMERGENCY_ALERT | topics::OPS_BROADCAST => {
                self.handle_remote_emergency(&envelope);
            }
            other => debug!(topic = other, "unhandled remote topic"),
        }
    }

    async fn handle_remote_status(&self, envelope: &Envelope) {
        let Some(trip_id) = envelope.payload_str("tripId").map(str::to_string) else {
            warn!("status update without tripId ignored");
            return;
        };
        let Some(status) = parse_status(&envelope.payload) else {
            warn!(trip_id, "status update with unknown status ignored");
            return;
        };

        if status == TripStatus::Requested {
            self.track_remote_request(&trip_id, envelope);
            return;
        }

        self.apply_remote_status(&trip_id, status, envelope).await;
    }

    /// A creation broadcast: track the trip if we have not seen it.
    /// Duplicate broadcasts are no-ops.
    fn track_remote_request(&self, trip_id: &str, envelope: &Envelope) {
        let mut trips = self.trips.lock().unwrap();
        if trips.contains_key(trip_id) {
            debug!(trip_id, "duplicate trip creation ignored");
            return;
        }
        let (Some(pickup), Some(dropoff)) = (
            parse_point(envelope.payload.get("pickup")),
            parse_point(envelope.payload.get("dropoff")),
        ) else {
            debug!(trip_id, "creation without route ignored");
            return;
        };
        let vehicle_class = envelope
            .payload
            .get("vehicleClass")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(VehicleClass::Economy);

        let mut trip = Trip::new(
            trip_id.to_string(),
            pickup,
            dropoff,
            vehicle_class,
            crate::now_ms(),
        );
        if let Some(fare) = parse_fare(envelope.payload.get("fare")) {
            trip.merge_fare(fare);
        }
        trips.insert(trip_id.to_string(), Arc::new(Mutex::new(trip.clone())));
        drop(trips);

        info!(trip_id, "tracking remotely requested trip");
        self.publish_snapshot(&trip);
    }

    /// Apply a remote status. Duplicates of the current status are
    /// idempotent no-ops; out-of-order statuses are logged and ignored,
    /// never a crash.
    async fn apply_remote_status(&self, trip_id: &str, status: TripStatus, envelope: &Envelope) {
        let handle = match self.trip_handle(trip_id) {
            Ok(handle) => handle,
            Err(_) => {
                // Possibly a duplicate for an archived trip.
                let archived = self.archived.lock().unwrap();
                if archived.iter().any(|t| t.id == trip_id && t.status == status) {
                    debug!(trip_id, status = %status, "duplicate status for archived trip ignored");
                } else {
                    debug!(trip_id, status = %status, "status for untracked trip ignored");
                }
                return;
            }
        };

        let snapshot = {
            let mut trip = handle.lock().await;
            if trip.status == status {
                debug!(trip_id, status = %status, "duplicate status ignored");
                return;
            }
            if let Err(e) = trip.transition(status, crate::now_ms()) {
                warn!(trip_id, error = %e, "out-of-order remote status ignored");
                return;
            }
            if let Some(driver_id) = envelope.payload_str("driverId") {
                trip.driver_id = Some(driver_id.to_string());
            }
            if let Some(reason) = envelope.payload_str("reason") {
                trip.cancel_reason = Some(reason.to_string());
            }
            // A relay-confirmed fare supersedes the edge estimate.
            if let Some(fare) = parse_fare(envelope.payload.get("fare")) {
                trip.merge_fare(fare);
            }
            trip.clone()
        };

        debug!(trip_id, status = %status, "remote status applied");
        self.post_transition_effects(&snapshot);
    }

    async fn handle_remote_accepted(&self, envelope: &Envelope) {
        let Some(trip_id) = envelope.payload_str("tripId").map(str::to_string) else {
            return;
        };
        self.apply_remote_status(&trip_id, TripStatus::Accepted, envelope)
            .await;
    }

    async fn handle_remote_cancelled(&self, envelope: &Envelope) {
        let Some(trip_id) = envelope.payload_str("tripId").map(str::to_string) else {
            return;
        };
        self.apply_remote_status(&trip_id, TripStatus::Cancelled, envelope)
            .await;
    }

    async fn handle_remote_message(&self, envelope: &Envelope) {
        let Some(trip_id) = envelope.payload_str("tripId") else {
            return;
        };
        let Ok(handle) = self.trip_handle(trip_id) else {
            debug!(trip_id, "message for untracked trip ignored");
            return;
        };
        let sender_role = envelope
            .payload
            .get("senderRole")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(Role::Rider);
        let body = envelope.payload_str("message").unwrap_or_default().to_string();

        let snapshot = {
            let mut trip = handle.lock().await;
            trip.messages.push(TripMessage {
                sender_role,
                body,
                sent_at_ms: crate::now_ms(),
            });
            trip.clone()
        };
        self.publish_snapshot(&snapshot);
    }

    fn handle_remote_emergency(&self, envelope: &Envelope) {
        let alert = EmergencyAlert {
            trip_id: envelope.payload_str("tripId").unwrap_or_default().to_string(),
            location: envelope
                .payload
                .get("location")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            message: envelope.payload_str("message").unwrap_or_default().to_string(),
            received_at_ms: crate::now_ms(),
        };
        warn!(trip_id = %alert.trip_id, message = %alert.message, "emergency alert received");
        self.emergencies.lock().unwrap().push(alert);
    }
}

/// Replays queued operations over the channel's acknowledged send path.
/// A down or saturated link fails the executor call, so the drain halts
/// and the operation stays queued instead of being dropped.
struct ChannelExecutor {
    channel: Arc<ChannelConnection>,
}

#[async_trait]
impl OperationExecutor for ChannelExecutor {
    async fn execute(&self, operation: &QueuedOperation) -> Result<()> {
        let topic = match operation.kind {
            OperationKind::TripCreate | OperationKind::StatusUpdate => topics::TRIP_STATUS_UPDATE,
            OperationKind::ProfileUpdate => topics::PROFILE_UPDATE,
            OperationKind::RatingSubmit => topics::RATING_SUBMIT,
            OperationKind::DriverStatus => topics::DRIVER_STATUS_CHANGE,
        };
        self.channel.send(topic, operation.payload.clone()).await?;
        Ok(())
    }
}

async fn run_loop(
    inner: Arc<CoordinatorInner>,
    mut remote_rx: mpsc::UnboundedReceiver<Envelope>,
    mut events: broadcast::Receiver<ChannelEvent>,
) {
    let mut retry = tokio::time::interval(inner.retry_interval);
    retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = remote_rx.recv() => match maybe {
                Some(envelope) => inner.handle_remote(envelope).await,
                None => break,
            },
            event = events.recv() => match event {
                // Reconnection is the moment to restore relay-side topic
                // membership and reconcile queued mutations.
                Ok(ChannelEvent::Connected) => {
                    inner.rejoin_topics();
                    inner.drain_now().await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "coordinator lagged behind channel events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = retry.tick() => {
                let pending = !inner.queue.is_empty().unwrap_or(true);
                if pending && inner.channel.is_connected() {
                    inner.drain_now().await;
                }
            }
        }
    }
    debug!("trip coordinator loop ended");
}

/// Keep only request history inside the recency window, so the surge
/// input reflects current demand instead of the session lifetime total.
fn prune_recent_requests(recent: &mut Vec<TripRequest>, now_ms: u64) {
    let cutoff = now_ms.saturating_sub(estimate::RECENT_REQUEST_WINDOW_MS);
    recent.retain(|r| r.requested_at_ms >= cutoff);
}

fn parse_status(payload: &Value) -> Option<TripStatus> {
    payload
        .get("status")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn parse_point(value: Option<&Value>) -> Option<GeoPoint> {
    value.and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Fares arriving over the channel are relay-confirmed: whatever the
/// sender stamped, they rank as authoritative here.
fn parse_fare(value: Option<&Value>) -> Option<FareEstimate> {
    let mut fare: FareEstimate = value.and_then(|v| serde_json::from_value(v.clone()).ok())?;
    fare.provenance = Provenance::Authoritative;
    Some(fare)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_requests_age_out_of_surge_input() {
        let here = GeoPoint::new(52.52, 13.40);
        let at = |ms| TripRequest {
            pickup: here,
            dropoff: here,
            requested_at_ms: ms,
        };

        // An old burst that would pin surge at 1.5, plus one live request.
        let now = 20 * 60 * 1000;
        let mut recent: Vec<TripRequest> = (0..6)
            .map(|i| at(i * 1_000))
            .chain([at(now - 1_000)])
            .collect();

        prune_recent_requests(&mut recent, now);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].requested_at_ms, now - 1_000);
        assert_eq!(estimate::surge(recent.len() as u32), 1.0);
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let here = GeoPoint::new(52.52, 13.40);
        let now = estimate::RECENT_REQUEST_WINDOW_MS + 500;
        let mut recent = vec![
            TripRequest {
                pickup: here,
                dropoff: here,
                requested_at_ms: 500,
            },
            TripRequest {
                pickup: here,
                dropoff: here,
                requested_at_ms: 499,
            },
        ];

        prune_recent_requests(&mut recent, now);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].requested_at_ms, 500);
    }
}
