//! Offline operation queue
//!
//! Durably buffers mutating operations attempted while disconnected and
//! replays them in original enqueue order once connectivity returns:
//! - `enqueue` persists before returning and never waits on a drain
//! - `drain` is FIFO, removes an operation only after its executor
//!   resolves, and halts at the first failure leaving the suffix intact
//! - a single in-flight guard makes overlapping drains no-ops
//!
//! Every trip-mutating or profile-mutating action taken while disconnected
//! passes through here rather than being dropped.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{QueueError, ReplayFailure};

/// Type tag of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    TripCreate,
    /// A guarded transition taken while disconnected.
    StatusUpdate,
    ProfileUpdate,
    RatingSubmit,
    DriverStatus,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::TripCreate => "trip-create",
            OperationKind::StatusUpdate => "status-update",
            OperationKind::ProfileUpdate => "profile-update",
            OperationKind::RatingSubmit => "rating-submit",
            OperationKind::DriverStatus => "driver-status",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "trip-create" => Some(OperationKind::TripCreate),
            "status-update" => Some(OperationKind::StatusUpdate),
            "profile-update" => Some(OperationKind::ProfileUpdate),
            "rating-submit" => Some(OperationKind::RatingSubmit),
            "driver-status" => Some(OperationKind::DriverStatus),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durably persisted operation awaiting replay.
#[derive(Debug, Clone)]
pub struct QueuedOperation {
    pub id: String,
    /// Monotonic enqueue order within this device's queue.
    pub seq: i64,
    pub kind: OperationKind,
    pub payload: Value,
    pub enqueued_at_ms: u64,
}

/// Replays one operation against the remote side. `Ok` means the remote
/// acknowledged it and the queue may remove it.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, operation: &QueuedOperation) -> Result<()>;
}

/// Outcome of one drain pass.
#[derive(Debug, Clone)]
pub struct DrainReport {
    /// Operations removed after successful replay.
    pub replayed: usize,
    /// Operations still queued when the pass ended.
    pub remaining: usize,
    /// Set when the pass halted on a rejected operation.
    pub failure: Option<ReplayFailure>,
    /// True when another drain was already in flight and this call did
    /// nothing.
    pub skipped: bool,
}

pub struct OfflineQueue {
    db: Mutex<Connection>,
    device_id: String,
    draining: AtomicBool,
}

impl OfflineQueue {
    /// Open or create the queue database under `data_dir`.
    pub fn open(data_dir: &Path, device_id: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir).context("creating data directory")?;
        let db_path = data_dir.join("queue.db");
        let db = Connection::open(&db_path)
            .with_context(|| format!("opening database at {}", db_path.display()))?;

        db.execute_batch("PRAGMA journal_mode=WAL;")?;

        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS operations (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL
            );",
        )?;

        info!(path = %db_path.display(), "offline queue opened");

        Ok(Self {
            db: Mutex::new(db),
            device_id: device_id.to_string(),
            draining: AtomicBool::new(false),
        })
    }

    /// Durably persist an operation. Safe from any task; never waits on an
    /// in-flight drain.
    pub fn enqueue(&self, kind: OperationKind, payload: Value) -> Result<QueuedOperation, QueueError> {
        let id = uuid::Uuid::new_v4().to_string();
        let enqueued_at_ms = crate::now_ms();
        let encoded = serde_json::to_string(&payload)?;

        let seq = {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT INTO operations (id, device_id, kind, payload, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, self.device_id, kind.as_str(), encoded, enqueued_at_ms as i64],
            )?;
            db.last_insert_rowid()
        };

        debug!(operation_id = %id, %kind, seq, "operation enqueued");
        Ok(QueuedOperation {
            id,
            seq,
            kind,
            payload,
            enqueued_at_ms,
        })
    }

    /// Number of operations currently queued.
    pub fn len(&self) -> Result<usize, QueueError> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT count(*) FROM operations WHERE device_id = ?1",
            [&self.device_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of queued operations in replay order.
    pub fn pending(&self) -> Result<Vec<QueuedOperation>, QueueError> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare_cached(
            "SELECT seq, id, kind, payload, enqueued_at
             FROM operations WHERE device_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([&self.device_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut operations = Vec::new();
        for row in rows {
            let (seq, id, kind, payload, enqueued_at) = row?;
            let Some(kind) = OperationKind::parse(&kind) else {
                warn!(seq, kind = %kind, "skipping operation with unknown kind");
                continue;
            };
            operations.push(QueuedOperation {
                id,
                seq,
                kind,
                payload: serde_json::from_str(&payload)?,
                enqueued_at_ms: enqueued_at as u64,
            });
        }
        Ok(operations)
    }

    /// Replay queued operations in enqueue order.
    ///
    /// Idempotent and re-entrant-safe: a second overlapping call observes
    /// the in-flight guard and returns with `skipped = true`. Operations
    /// enqueued while a drain is running are picked up by the same pass.
    pub async fn drain(&self, executor: &dyn OperationExecutor) -> Result<DrainReport, QueueError> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("drain already in flight, skipping");
            return Ok(DrainReport {
                replayed: 0,
                remaining: self.len()?,
                failure: None,
                skipped: true,
            });
        }

        let result = self.drain_locked(executor).await;
        self.draining.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_locked(&self, executor: &dyn OperationExecutor) -> Result<DrainReport, QueueError> {
        let mut replayed = 0;
        let mut failure = None;

        loop {
            // Refetch the head each iteration so appends made during the
            // drain are replayed in the same pass.
            let Some(operation) = self.head()? else {
                break;
            };

            match executor.execute(&operation).await {
                Ok(()) => {
                    self.remove(operation.seq)?;
                    replayed += 1;
                    debug!(operation_id = %operation.id, kind = %operation.kind, "operation replayed");
                }
                Err(e) => {
                    // The failed operation and everything after it stay
                    // queued in order for the next drain.
                    let replay_failure = ReplayFailure {
                        operation_id: operation.id.clone(),
                        kind: operation.kind.to_string(),
                        reason: e.to_string(),
                    };
                    warn!(operation_id = %operation.id, kind = %operation.kind, error = %e,
                          "replay failed, halting drain");
                    failure = Some(replay_failure);
                    break;
                }
            }
        }

        let remaining = self.len()?;
        if replayed > 0 || failure.is_some() {
            info!(replayed, remaining, failed = failure.is_some(), "drain pass finished");
        }
        Ok(DrainReport {
            replayed,
            remaining,
            failure,
            skipped: false,
        })
    }

    fn head(&self) -> Result<Option<QueuedOperation>, QueueError> {
        let db = self.db.lock().unwrap();
        loop {
            let mut stmt = db.prepare_cached(
                "SELECT seq, id, kind, payload, enqueued_at
                 FROM operations WHERE device_id = ?1 ORDER BY seq ASC LIMIT 1",
            )?;
            let result = stmt.query_row([&self.device_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            });
            drop(stmt);

            match result {
                Ok((seq, id, kind, payload, enqueued_at)) => {
                    let Some(kind) = OperationKind::parse(&kind) else {
                        warn!(seq, kind = %kind, "removing operation with unknown kind");
                        db.execute("DELETE FROM operations WHERE seq = ?1", [seq])?;
                        continue;
                    };
                    return Ok(Some(QueuedOperation {
                        id,
                        seq,
                        kind,
                        payload: serde_json::from_str(&payload)?,
                        enqueued_at_ms: enqueued_at as u64,
                    }));
                }
                Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn remove(&self, seq: i64) -> Result<(), QueueError> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM operations WHERE seq = ?1", [seq])?;
        Ok(())
    }
}
