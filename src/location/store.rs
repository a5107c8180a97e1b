//! Durable last-known-location record
//!
//! SQLite-backed, keyed per device. The tracker task is the only writer
//! (single-writer invariant); readers get a snapshot without waiting for
//! the next fix. A registration row marks a live OS-level tracking
//! acquisition so a restart can detect and clear a stale one.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{debug, info};

use super::LocationSample;

pub struct LocationStore {
    db: Mutex<Connection>,
    device_id: String,
}

impl LocationStore {
    /// Open or create the location database under `data_dir`.
    pub fn open(data_dir: &Path, device_id: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir).context("creating data directory")?;
        let db_path = data_dir.join("location.db");
        let db = Connection::open(&db_path)
            .with_context(|| format!("opening database at {}", db_path.display()))?;

        // WAL so foreground reads never block the tracker's writes
        db.execute_batch("PRAGMA journal_mode=WAL;")?;

        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS last_known (
                device_id TEXT PRIMARY KEY,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                heading REAL NOT NULL,
                speed REAL NOT NULL,
                accuracy REAL NOT NULL,
                captured_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tracker_registration (
                device_id TEXT PRIMARY KEY,
                acquired_at INTEGER NOT NULL
            );",
        )?;

        info!(path = %db_path.display(), "location store opened");

        Ok(Self {
            db: Mutex::new(db),
            device_id: device_id.to_string(),
        })
    }

    /// Upsert the last-known sample for this device.
    pub fn write_last_known(&self, sample: &LocationSample) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO last_known
                 (device_id, latitude, longitude, heading, speed, accuracy, captured_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(device_id) DO UPDATE SET
                 latitude = ?2, longitude = ?3, heading = ?4,
                 speed = ?5, accuracy = ?6, captured_at = ?7",
            rusqlite::params![
                self.device_id,
                sample.latitude,
                sample.longitude,
                sample.heading,
                sample.speed,
                sample.accuracy,
                sample.captured_at_ms as i64,
            ],
        )?;
        Ok(())
    }

    /// Read the last-known sample, if any was ever persisted.
    pub fn last_known(&self) -> Result<Option<LocationSample>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare_cached(
            "SELECT latitude, longitude, heading, speed, accuracy, captured_at
             FROM last_known WHERE device_id = ?1",
        )?;

        let result = stmt.query_row([&self.device_id], |row| {
            Ok(LocationSample {
                latitude: row.get(0)?,
                longitude: row.get(1)?,
                heading: row.get(2)?,
                speed: row.get(3)?,
                accuracy: row.get(4)?,
                captured_at_ms: row.get::<_, i64>(5)? as u64,
            })
        });

        match result {
            Ok(sample) => Ok(Some(sample)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record a live tracking acquisition.
    pub fn register_tracker(&self, acquired_at_ms: u64) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO tracker_registration (device_id, acquired_at)
             VALUES (?1, ?2)
             ON CONFLICT(device_id) DO UPDATE SET acquired_at = ?2",
            rusqlite::params![self.device_id, acquired_at_ms as i64],
        )?;
        debug!(acquired_at_ms, "tracker registration recorded");
        Ok(())
    }

    /// Remove the registration row.
    pub fn clear_registration(&self) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM tracker_registration WHERE device_id = ?1",
            [&self.device_id],
        )?;
        Ok(())
    }

    /// A leftover registration row means the previous run never reached
    /// `stop()`. Returns its acquisition timestamp.
    pub fn stale_registration(&self) -> Result<Option<u64>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare_cached(
            "SELECT acquired_at FROM tracker_registration WHERE device_id = ?1",
        )?;
        let result = stmt.query_row([&self.device_id], |row| row.get::<_, i64>(0));
        match result {
            Ok(at) => Ok(Some(at as u64)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
