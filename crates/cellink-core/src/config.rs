// ── Runtime station configuration ──
//
// These types describe *how* to reach a station and how often to poll
// it. They carry the user identity but never touch disk: the config
// crate builds a `StationConfig` and hands it in.

use std::time::Duration;

use cellink_api::{MonitoringParameters, UserIdentity};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::tags::TagMap;

/// Change-subscription tuning for the reliability loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringConfig {
    /// Reconciliation tick. Constant, no backoff.
    pub tick: Duration,
    pub sampling_interval: Duration,
    pub queue_size: u32,
    pub discard_oldest: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            sampling_interval: Duration::from_millis(100),
            queue_size: 1,
            discard_oldest: true,
        }
    }
}

impl MonitoringConfig {
    pub fn parameters(&self) -> MonitoringParameters {
        MonitoringParameters {
            sampling_interval: self.sampling_interval,
            queue_size: self.queue_size,
            discard_oldest: self.discard_oldest,
            reporting: true,
        }
    }
}

/// Configuration of one [`TransportClient`](crate::TransportClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// URI of the application namespace holding the station tags.
    pub application_uri: String,
    pub identity: UserIdentity,
    /// Upper bound for a single background request of the subscription loop.
    pub request_timeout: Duration,
    pub monitoring: MonitoringConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            application_uri: "urn:cellink:station".into(),
            identity: UserIdentity::Anonymous,
            request_timeout: Duration::from_secs(5),
            monitoring: MonitoringConfig::default(),
        }
    }
}

/// Polling cadences of the orchestration cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollIntervals {
    pub require_data: Duration,
    pub upload: Duration,
    pub plan_respond: Duration,
    pub execute_command: Duration,
    pub init_finish: Duration,
    pub connect: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            require_data: Duration::from_millis(300),
            upload: Duration::from_millis(300),
            plan_respond: Duration::from_millis(300),
            execute_command: Duration::from_millis(100),
            init_finish: Duration::from_millis(500),
            connect: Duration::from_secs(1),
        }
    }
}

impl PollIntervals {
    /// Every interval set to `period`. Handy for tests.
    pub fn uniform(period: Duration) -> Self {
        Self {
            require_data: period,
            upload: period,
            plan_respond: period,
            execute_command: period,
            init_finish: period,
            connect: period,
        }
    }
}

/// How the run cycle treats a finished or failed transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Loop back to waiting after every transfer; faults go through recovery.
    #[default]
    Auto,
    /// One transfer, then the machine stops. No existing-error check on start.
    Manual,
}

/// Everything needed to drive one station.
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// Display name used in logs and alerts.
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Device type the station must report.
    pub expected_device_type: u16,
    pub client: ClientConfig,
    pub tags: TagMap,
    pub poll: PollIntervals,
    pub run_mode: RunMode,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            name: "station".into(),
            host: "127.0.0.1".into(),
            port: 4840,
            expected_device_type: 1,
            client: ClientConfig::default(),
            tags: TagMap::default(),
            poll: PollIntervals::default(),
            run_mode: RunMode::default(),
        }
    }
}

impl StationConfig {
    /// `host:port`, as used in log lines.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
