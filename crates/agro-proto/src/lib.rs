pub mod failsafe;
pub mod telemetry;

use serde::{Deserialize, Serialize};

/// Liveness of the link to the flight controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Transport is open but no heartbeat arrived within the liveness window.
    Degraded,
}

impl Default for LinkState {
    fn default() -> Self {
        LinkState::Disconnected
    }
}

/// Wall-clock milliseconds since the unix epoch.
pub fn unix_ms_now() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
