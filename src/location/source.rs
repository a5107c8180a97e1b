//! Platform capabilities injected into the tracker
//!
//! [`LocationSource`] abstracts the OS positioning service and
//! [`BackgroundTaskRunner`] abstracts the platform task registry, so the
//! sampling logic is portable and testable without a real scheduler or GPS.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::LocationSample;
use crate::estimate::GeoPoint;

/// Typed permission outcome. Denial is an expected, recoverable condition,
/// never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionStatus {
    pub granted: bool,
    pub reason: Option<String>,
}

impl PermissionStatus {
    pub fn granted() -> Self {
        Self {
            granted: true,
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            granted: false,
            reason: Some(reason.into()),
        }
    }
}

/// OS positioning service seam.
#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Ask for (or probe) location permission.
    async fn request_permission(&self) -> PermissionStatus;

    /// Acquire the OS-level tracking registration.
    async fn acquire(&self) -> Result<()>;

    /// Release the OS-level tracking registration. Safe to call when not
    /// acquired (used to clear a stale registration after a crash).
    async fn release(&self);

    /// Next position fix. `None` once the source is released.
    async fn next_sample(&self) -> Option<LocationSample>;
}

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Platform task registry seam: named register/start/stop.
pub trait BackgroundTaskRunner: Send + Sync {
    /// Stage a task body under a name. Replaces any unstarted body.
    fn register(&self, name: &str, task: BoxedTask);

    /// Start a previously registered task.
    fn start(&self, name: &str) -> Result<()>;

    /// Stop a running task. Safe to call when not running.
    fn stop(&self, name: &str);
}

/// Tokio-backed runner used by the daemon and the tests.
#[derive(Default)]
pub struct TokioTaskRunner {
    staged: Mutex<HashMap<String, BoxedTask>>,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TokioTaskRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackgroundTaskRunner for TokioTaskRunner {
    fn register(&self, name: &str, task: BoxedTask) {
        self.staged.lock().unwrap().insert(name.to_string(), task);
        debug!(task = name, "background task registered");
    }

    fn start(&self, name: &str) -> Result<()> {
        let Some(task) = self.staged.lock().unwrap().remove(name) else {
            bail!("no registered task named '{name}'");
        };
        let handle = tokio::spawn(task);
        if let Some(previous) = self.running.lock().unwrap().insert(name.to_string(), handle) {
            previous.abort();
        }
        debug!(task = name, "background task started");
        Ok(())
    }

    fn stop(&self, name: &str) {
        if let Some(handle) = self.running.lock().unwrap().remove(name) {
            handle.abort();
            debug!(task = name, "background task stopped");
        }
    }
}

/// Stand-in positioning source for environments without a platform
/// integration: drifts north-east from a starting point on every poll.
/// Also accepts externally pushed fixes, which tests use for scripting.
pub struct SimulatedSource {
    fix_tx: mpsc::UnboundedSender<LocationSample>,
    fix_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<LocationSample>>,
    state: Mutex<SimulatedState>,
    permission: PermissionStatus,
}

struct SimulatedState {
    position: GeoPoint,
    acquired: bool,
}

impl SimulatedSource {
    pub fn new(start: GeoPoint) -> Self {
        let (fix_tx, fix_rx) = mpsc::unbounded_channel();
        Self {
            fix_tx,
            fix_rx: tokio::sync::Mutex::new(fix_rx),
            state: Mutex::new(SimulatedState {
                position: start,
                acquired: false,
            }),
            permission: PermissionStatus::granted(),
        }
    }

    /// A source whose permission probe always denies.
    pub fn denied(reason: &str) -> Self {
        let mut source = Self::new(GeoPoint::new(0.0, 0.0));
        source.permission = PermissionStatus::denied(reason);
        source
    }

    /// Inject a fix, delivered ahead of the synthetic drift.
    pub fn push_fix(&self, sample: LocationSample) {
        let _ = self.fix_tx.send(sample);
    }

    pub fn is_acquired(&self) -> bool {
        self.state.lock().unwrap().acquired
    }

    fn drift(&self) -> LocationSample {
        let mut state = self.state.lock().unwrap();
        state.position.latitude += 0.0005;
        state.position.longitude += 0.0005;
        LocationSample {
            latitude: state.position.latitude,
            longitude: state.position.longitude,
            heading: 45.0,
            speed: 8.3,
            accuracy: 5.0,
            captured_at_ms: crate::now_ms(),
        }
    }
}

#[async_trait]
impl LocationSource for SimulatedSource {
    async fn request_permission(&self) -> PermissionStatus {
        self.permission.clone()
    }

    async fn acquire(&self) -> Result<()> {
        self.state.lock().unwrap().acquired = true;
        Ok(())
    }

    async fn release(&self) {
        self.state.lock().unwrap().acquired = false;
    }

    async fn next_sample(&self) -> Option<LocationSample> {
        let mut fix_rx = self.fix_rx.lock().await;
        tokio::select! {
            pushed = fix_rx.recv() => pushed,
            _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {
                if self.state.lock().unwrap().acquired {
                    Some(self.drift())
                } else {
                    None
                }
            }
        }
    }
}
