//! Node configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::location::{SamplingMode, SamplingProfile};
use crate::trip::Role;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            channel: ChannelConfig::default(),
            location: LocationConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable per-device identifier; keys the durable state surfaces.
    pub device_id: String,

    /// Role this process plays: rider, driver, or operations.
    pub role: Role,

    /// Data directory for the SQLite-backed state.
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            role: Role::Rider,
            data_dir: PathBuf::from("./rideline-data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Relay endpoint.
    #[serde(default = "default_channel_url")]
    pub url: String,

    /// Reconnect attempts before the handle goes terminally disconnected.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// First backoff delay; doubles per attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff ceiling.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Outbound frame buffer; publishes beyond this are dropped with a
    /// warning rather than blocking the caller.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: default_channel_url(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

fn default_channel_url() -> String {
    "ws://127.0.0.1:9800/channel".to_string()
}
fn default_max_reconnect_attempts() -> u32 {
    8
}
fn default_base_delay_ms() -> u64 {
    250
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_outbound_buffer() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    /// Minimum time between samples while idle-scanning, milliseconds.
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,

    /// Minimum movement between samples while idle-scanning, metres.
    #[serde(default = "default_idle_displacement_m")]
    pub idle_min_displacement_m: f64,

    /// Minimum time between samples during an active trip, milliseconds.
    #[serde(default = "default_trip_interval_ms")]
    pub trip_interval_ms: u64,

    /// Minimum movement between samples during an active trip, metres.
    #[serde(default = "default_trip_displacement_m")]
    pub trip_min_displacement_m: f64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: default_idle_interval_ms(),
            idle_min_displacement_m: default_idle_displacement_m(),
            trip_interval_ms: default_trip_interval_ms(),
            trip_min_displacement_m: default_trip_displacement_m(),
        }
    }
}

impl LocationConfig {
    /// Resolve the sampling profile for a mode.
    pub fn profile(&self, mode: SamplingMode) -> SamplingProfile {
        match mode {
            SamplingMode::IdleScan => SamplingProfile {
                interval: Duration::from_millis(self.idle_interval_ms),
                min_displacement_m: self.idle_min_displacement_m,
                mode,
            },
            SamplingMode::ActiveTrip => SamplingProfile {
                interval: Duration::from_millis(self.trip_interval_ms),
                min_displacement_m: self.trip_min_displacement_m,
                mode,
            },
        }
    }
}

fn default_idle_interval_ms() -> u64 {
    10_000
}
fn default_idle_displacement_m() -> f64 {
    25.0
}
fn default_trip_interval_ms() -> u64 {
    2_000
}
fn default_trip_displacement_m() -> f64 {
    5.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Interval between drain retries while operations are pending.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

fn default_retry_interval_ms() -> u64 {
    15_000
}
