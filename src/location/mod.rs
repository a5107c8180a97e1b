//! Location tracker
//!
//! Produces a restartable stream of position samples that keeps flowing
//! while the host UI is suspended:
//! - sampling runs as an independent background task via the injected
//!   [`BackgroundTaskRunner`]
//! - every emitted sample is persisted to the durable last-known record,
//!   so a freshly foregrounded process recovers position synchronously
//! - profiles gate emissions by minimum interval and displacement, and
//!   switch live between idle-scan and active-trip
//! - `stop` releases the OS registration on every path; `start` clears a
//!   stale registration left by an abnormal exit before re-acquiring

pub mod source;
pub mod store;

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::LocationConfig;
use crate::estimate::{haversine_km, GeoPoint};
use source::{BackgroundTaskRunner, LocationSource};
use store::LocationStore;

pub use source::{PermissionStatus, SimulatedSource, TokioTaskRunner};

/// Registry name of the sampling task.
pub const TRACKER_TASK: &str = "location-tracker";

/// One position fix. Never mutated in place; superseded by newer samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Degrees clockwise from true north.
    pub heading: f64,
    /// Metres per second.
    pub speed: f64,
    /// Horizontal accuracy radius, metres.
    pub accuracy: f64,
    pub captured_at_ms: u64,
}

impl LocationSample {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// Sampling mode; active trips sample tighter than idle scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SamplingMode {
    IdleScan,
    ActiveTrip,
}

/// Resolved sampling parameters for a mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingProfile {
    /// Minimum time between emitted samples.
    pub interval: std::time::Duration,
    /// Minimum movement between emitted samples, metres.
    pub min_displacement_m: f64,
    pub mode: SamplingMode,
}

/// Result of a start attempt. Permission denial is a typed, recoverable
/// outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    PermissionDenied { reason: String },
}

pub struct LocationTracker {
    source: Arc<dyn LocationSource>,
    runner: Arc<dyn BackgroundTaskRunner>,
    store: Arc<LocationStore>,
    config: LocationConfig,
    profile_tx: watch::Sender<SamplingProfile>,
}

impl LocationTracker {
    pub fn new(
        source: Arc<dyn LocationSource>,
        runner: Arc<dyn BackgroundTaskRunner>,
        store: Arc<LocationStore>,
        config: LocationConfig,
    ) -> Self {
        let initial = config.profile(SamplingMode::IdleScan);
        let (profile_tx, _) = watch::channel(initial);
        Self {
            source,
            runner,
            store,
            config,
            profile_tx,
        }
    }

    /// Begin sampling in the given mode, delivering emitted samples to
    /// `on_sample` from the background task.
    pub async fn start(
        &self,
        mode: SamplingMode,
        on_sample: impl Fn(LocationSample) + Send + Sync + 'static,
    ) -> Result<StartOutcome> {
        let permission = self.source.request_permission().await;
        if !permission.granted {
            let reason = permission.reason.unwrap_or_else(|| "denied".to_string());
            info!(reason, "location permission denied");
            return Ok(StartOutcome::PermissionDenied { reason });
        }

        // A leftover registration means the previous run died without
        // reaching stop(); clear it before re-acquiring.
        if let Some(acquired_at_ms) = self.store.stale_registration()? {
            warn!(acquired_at_ms, "clearing stale tracker registration");
            self.source.release().await;
            self.store.clear_registration()?;
        }

        self.source.acquire().await?;
        self.store.register_tracker(crate::now_ms())?;
        self.profile_tx.send_replace(self.config.profile(mode));

        let source = Arc::clone(&self.source);
        let store = Arc::clone(&self.store);
        let mut profile_rx = self.profile_tx.subscribe();
        let task = async move {
            let mut last_emitted: Option<LocationSample> = None;
            loop {
                let Some(sample) = source.next_sample().await else {
                    break;
                };
                let profile = *profile_rx.borrow_and_update();

                if let Some(previous) = last_emitted {
                    let elapsed_ms = sample.captured_at_ms.saturating_sub(previous.captured_at_ms);
                    if elapsed_ms < profile.interval.as_millis() as u64 {
                        continue;
                    }
                    let moved_m = haversine_km(previous.point(), sample.point()) * 1000.0;
                    if moved_m < profile.min_displacement_m {
                        continue;
                    }
                }

                // Persist before delivery: the durable record must never
                // lag what consumers have seen.
                if let Err(e) = store.write_last_known(&sample) {
                    warn!(error = %e, "failed to persist last known location");
                }
                on_sample(sample);
                last_emitted = Some(sample);
            }
            debug!("location sampling loop ended");
        };

        self.runner.register(TRACKER_TASK, Box::pin(task));
        self.runner.start(TRACKER_TASK)?;
        info!(?mode, "location tracker started");
        Ok(StartOutcome::Started)
    }

    /// Switch the live sampling profile (tightened during active trips,
    /// reverted afterwards).
    pub fn set_mode(&self, mode: SamplingMode) {
        let profile = self.config.profile(mode);
        debug!(?mode, interval_ms = profile.interval.as_millis() as u64, "sampling profile switched");
        self.profile_tx.send_replace(profile);
    }

    /// Halt sampling and release the OS registration.
    pub async fn stop(&self) {
        self.runner.stop(TRACKER_TASK);
        self.source.release().await;
        if let Err(e) = self.store.clear_registration() {
            warn!(error = %e, "failed to clear tracker registration");
        }
        info!("location tracker stopped");
    }

    /// Synchronous last-known read for cold-start and UI-resume paths.
    pub fn last_known(&self) -> Option<LocationSample> {
        match self.store.last_known() {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "failed to read last known location");
                None
            }
        }
    }
}
