//! Offline queue replay properties
//!
//! FIFO replay, halt-on-failure with the suffix intact, the single
//! in-flight drain guard, and appends joining a running pass.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use rideline_node::queue::{
    DrainReport, OfflineQueue, OperationExecutor, OperationKind, QueuedOperation,
};

// =============================================================================
// Test executors
// =============================================================================

/// Records replayed operation ids in order.
#[derive(Default)]
struct RecordingExecutor {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl OperationExecutor for RecordingExecutor {
    async fn execute(&self, operation: &QueuedOperation) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(operation.id.clone());
        Ok(())
    }
}

/// Rejects the operation with the given id, accepts everything else.
struct RejectingExecutor {
    reject_id: String,
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl OperationExecutor for RejectingExecutor {
    async fn execute(&self, operation: &QueuedOperation) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(operation.id.clone());
        if operation.id == self.reject_id {
            anyhow::bail!("relay rejected operation");
        }
        Ok(())
    }
}

/// Counts executions, yielding between them so overlapping drains interleave.
#[derive(Default)]
struct SlowCountingExecutor {
    executed: AtomicUsize,
}

#[async_trait]
impl OperationExecutor for SlowCountingExecutor {
    async fn execute(&self, _operation: &QueuedOperation) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn open_queue(dir: &TempDir) -> OfflineQueue {
    OfflineQueue::open(dir.path(), "device-a").unwrap()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_drain_replays_in_enqueue_order() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);

    let a = queue.enqueue(OperationKind::TripCreate, json!({"tripId": "t1"})).unwrap();
    let b = queue.enqueue(OperationKind::StatusUpdate, json!({"tripId": "t1"})).unwrap();
    let c = queue.enqueue(OperationKind::RatingSubmit, json!({"stars": 5})).unwrap();
    assert_eq!(queue.len().unwrap(), 3);

    let executor = RecordingExecutor::default();
    let report = queue.drain(&executor).await.unwrap();

    assert_eq!(report.replayed, 3);
    assert_eq!(report.remaining, 0);
    assert!(report.failure.is_none());
    assert!(!report.skipped);
    assert_eq!(*executor.seen.lock().unwrap(), vec![a.id, b.id, c.id]);
    assert!(queue.is_empty().unwrap());
}

#[tokio::test]
async fn test_drain_halts_on_failure_keeping_suffix() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);

    let a = queue.enqueue(OperationKind::TripCreate, json!({"tripId": "t1"})).unwrap();
    let b = queue.enqueue(OperationKind::StatusUpdate, json!({"tripId": "t1"})).unwrap();
    let c = queue.enqueue(OperationKind::ProfileUpdate, json!({"name": "Ada"})).unwrap();

    let executor = RejectingExecutor {
        reject_id: b.id.clone(),
        seen: Mutex::new(Vec::new()),
    };
    let report = queue.drain(&executor).await.unwrap();

    assert_eq!(report.replayed, 1);
    assert_eq!(report.remaining, 2);
    let failure = report.failure.unwrap();
    assert_eq!(failure.operation_id, b.id);
    assert_eq!(failure.kind, "status-update");

    // The failed operation and everything after it survive in order.
    let pending = queue.pending().unwrap();
    let ids: Vec<&str> = pending.iter().map(|op| op.id.as_str()).collect();
    assert_eq!(ids, vec![b.id.as_str(), c.id.as_str()]);
    assert!(!executor.seen.lock().unwrap().contains(&c.id));
    drop(a);

    // A later drain resumes from the failed head.
    let recovery = RecordingExecutor::default();
    let report = queue.drain(&recovery).await.unwrap();
    assert_eq!(report.replayed, 2);
    assert_eq!(*recovery.seen.lock().unwrap(), vec![b.id, c.id]);
}

#[tokio::test]
async fn test_overlapping_drains_execute_each_operation_once() {
    let dir = TempDir::new().unwrap();
    let queue = Arc::new(open_queue(&dir));

    for i in 0..5 {
        queue
            .enqueue(OperationKind::StatusUpdate, json!({"n": i}))
            .unwrap();
    }

    let executor = SlowCountingExecutor::default();
    let (first, second): (DrainReport, DrainReport) =
        match tokio::join!(queue.drain(&executor), queue.drain(&executor)) {
            (Ok(a), Ok(b)) => (a, b),
            other => panic!("drain failed: {other:?}"),
        };

    // Exactly one pass did the work; the other observed the guard.
    assert_eq!(executor.executed.load(Ordering::SeqCst), 5);
    assert_eq!(first.skipped as u8 + second.skipped as u8, 1);
    assert_eq!(first.replayed + second.replayed, 5);
    assert!(queue.is_empty().unwrap());
}

#[tokio::test]
async fn test_enqueue_during_drain_joins_the_pass() {
    let dir = TempDir::new().unwrap();
    let queue = Arc::new(open_queue(&dir));

    queue
        .enqueue(OperationKind::TripCreate, json!({"tripId": "t1"}))
        .unwrap();
    queue
        .enqueue(OperationKind::StatusUpdate, json!({"tripId": "t1"}))
        .unwrap();

    let executor = SlowCountingExecutor::default();
    let drain_queue = Arc::clone(&queue);
    let drain = tokio::spawn(async move { drain_queue.drain(&executor).await });

    // Land an append while the first operation is still in flight.
    tokio::time::sleep(Duration::from_millis(5)).await;
    queue
        .enqueue(OperationKind::RatingSubmit, json!({"stars": 4}))
        .unwrap();

    let report = drain.await.unwrap().unwrap();
    assert_eq!(report.replayed, 3);
    assert_eq!(report.remaining, 0);
    assert!(queue.is_empty().unwrap());
}

#[tokio::test]
async fn test_queue_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let enqueued = {
        let queue = open_queue(&dir);
        queue
            .enqueue(OperationKind::ProfileUpdate, json!({"name": "Ada"}))
            .unwrap()
    };

    let queue = open_queue(&dir);
    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, enqueued.id);
    assert_eq!(pending[0].kind, OperationKind::ProfileUpdate);
    assert_eq!(pending[0].payload, json!({"name": "Ada"}));
}

#[tokio::test]
async fn test_queues_are_scoped_per_device() {
    let dir = TempDir::new().unwrap();
    let ours = OfflineQueue::open(dir.path(), "device-a").unwrap();
    ours.enqueue(OperationKind::TripCreate, json!({"tripId": "t1"}))
        .unwrap();

    let theirs = OfflineQueue::open(dir.path(), "device-b").unwrap();
    assert!(theirs.is_empty().unwrap());
    assert_eq!(ours.len().unwrap(), 1);
}
