//! Edge estimator - locally computed fallbacks
//!
//! Pure, deterministic functions with no I/O:
//! - Fare from a fixed per-vehicle-class rate table
//! - Great-circle route distance/duration (haversine)
//! - ETA with a time-of-day traffic factor
//! - Three-tier surge step function
//! - Advisory fraud risk flags
//!
//! Every output carries [`Provenance::Edge`] and is superseded by any later
//! authoritative value for the same quantity. Fraud output annotates, it
//! never blocks a transition or a publish.

use serde::{Deserialize, Serialize};

/// Earth radius used by the haversine distance, in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Assumed average city driving speed for duration estimates, km/h.
const AVERAGE_CITY_SPEED_KMH: f64 = 30.0;

/// Below this many nearby recent requests there is no surge.
const SURGE_LOW_THRESHOLD: u32 = 5;
/// At or above this many nearby recent requests surge goes to the top tier.
const SURGE_HIGH_THRESHOLD: u32 = 15;
const SURGE_MODERATE: f64 = 1.5;
const SURGE_HIGH: f64 = 2.0;

/// Recency horizon for request history, milliseconds: both the
/// rapid-requests fraud flag and the surge input count requests inside it.
pub const RECENT_REQUEST_WINDOW_MS: u64 = 5 * 60 * 1000;
/// Requests inside the window at or above this count raise the flag.
const RAPID_REQUEST_THRESHOLD: usize = 3;
/// Trips longer than this are flagged as unusual, km.
const UNUSUAL_DISTANCE_KM: f64 = 100.0;
/// Pickup and dropoff closer than this are the same location, km.
const SAME_LOCATION_KM: f64 = 0.05;

/// A WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Vehicle class a trip is priced under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Economy,
    Comfort,
    Xl,
}

/// Per-class pricing row from the fixed local rate table.
#[derive(Debug, Clone, Copy)]
pub struct RateCard {
    pub base: f64,
    pub per_km: f64,
    pub per_min: f64,
    pub minimum: f64,
}

/// Look up the rate card for a vehicle class.
pub fn rate_card(class: VehicleClass) -> RateCard {
    match class {
        VehicleClass::Economy => RateCard {
            base: 2.50,
            per_km: 1.20,
            per_min: 0.30,
            minimum: 5.00,
        },
        VehicleClass::Comfort => RateCard {
            base: 4.00,
            per_km: 1.80,
            per_min: 0.45,
            minimum: 8.00,
        },
        VehicleClass::Xl => RateCard {
            base: 5.50,
            per_km: 2.20,
            per_min: 0.55,
            minimum: 10.00,
        },
    }
}

/// Whether a value was computed locally or confirmed remotely.
///
/// Authoritative values always supersede edge values for the same trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Edge,
    Authoritative,
}

/// A fare broken into its components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FareEstimate {
    pub base: f64,
    pub distance_component: f64,
    pub time_component: f64,
    pub surge_multiplier: f64,
    /// `max(base + distance + time, minimum) * surge`, rounded to 2 dp.
    pub total: f64,
    pub provenance: Provenance,
}

/// Route distance and duration between two points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteEstimate {
    pub distance_km: f64,
    pub duration_min: f64,
}

/// A trip request as seen by the fraud heuristics.
#[derive(Debug, Clone, Copy)]
pub struct TripRequest {
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub requested_at_ms: u64,
}

/// Fraud flags raised by the local heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudFlag {
    RapidRequests,
    UnusualDistance,
    SameLocation,
}

/// Advisory fraud assessment. Annotates a trip, never blocks one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudAssessment {
    pub flags: Vec<FraudFlag>,
    /// Proportional to flag count, in `[0, 1]`.
    pub score: f64,
    pub provenance: Provenance,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Great-circle distance between two points via the haversine formula, km.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Estimate the route between pickup and dropoff.
///
/// Duration assumes the fixed average city speed; no road network data is
/// consulted.
pub fn route(pickup: GeoPoint, dropoff: GeoPoint) -> RouteEstimate {
    let distance_km = haversine_km(pickup, dropoff);
    RouteEstimate {
        distance_km,
        duration_min: distance_km / AVERAGE_CITY_SPEED_KMH * 60.0,
    }
}

/// Compute a fare from distance, duration, vehicle class and surge.
pub fn fare(
    distance_km: f64,
    duration_min: f64,
    class: VehicleClass,
    surge_multiplier: f64,
) -> FareEstimate {
    let rates = rate_card(class);
    let distance_component = distance_km * rates.per_km;
    let time_component = duration_min * rates.per_min;
    let subtotal = (rates.base + distance_component + time_component).max(rates.minimum);

    FareEstimate {
        base: rates.base,
        distance_component: round2(distance_component),
        time_component: round2(time_component),
        surge_multiplier,
        total: round2(subtotal * surge_multiplier),
        provenance: Provenance::Edge,
    }
}

/// Time-of-day traffic factor applied to route durations.
///
/// Peak commute windows slow travel down, late night speeds it up.
pub fn traffic_factor(hour_of_day: u8) -> f64 {
    match hour_of_day {
        7..=8 | 17..=18 => 1.5,
        22..=23 | 0..=4 => 0.8,
        _ => 1.0,
    }
}

/// Estimated minutes to reach `destination` from `current` at `hour_of_day`.
pub fn eta(current: GeoPoint, destination: GeoPoint, hour_of_day: u8) -> f64 {
    route(current, destination).duration_min * traffic_factor(hour_of_day)
}

/// Surge multiplier from the local count of nearby recent requests.
///
/// Three-tier step function. This is the requesting client's own view and
/// is advisory only; a server-aggregated value supersedes it.
pub fn surge(nearby_recent_request_count: u32) -> f64 {
    if nearby_recent_request_count < SURGE_LOW_THRESHOLD {
        1.0
    } else if nearby_recent_request_count < SURGE_HIGH_THRESHOLD {
        SURGE_MODERATE
    } else {
        SURGE_HIGH
    }
}

/// Score a trip request against the user's recent request history.
pub fn fraud_risk(request: &TripRequest, recent: &[TripRequest]) -> FraudAssessment {
    let mut flags = Vec::new();

    let window_start = request.requested_at_ms.saturating_sub(RECENT_REQUEST_WINDOW_MS);
    let recent_count = recent
        .iter()
        .filter(|r| r.requested_at_ms >= window_start && r.requested_at_ms <= request.requested_at_ms)
        .count();
    if recent_count >= RAPID_REQUEST_THRESHOLD {
        flags.push(FraudFlag::RapidRequests);
    }

    let distance_km = haversine_km(request.pickup, request.dropoff);
    if distance_km > UNUSUAL_DISTANCE_KM {
        flags.push(FraudFlag::UnusualDistance);
    }
    if distance_km < SAME_LOCATION_KM {
        flags.push(FraudFlag::SameLocation);
    }

    FraudAssessment {
        score: flags.len() as f64 / 3.0,
        flags,
        provenance: Provenance::Edge,
    }
}
