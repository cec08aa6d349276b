use serde::{Deserialize, Serialize};

use crate::LinkState;

/// One sampling tick of vehicle state, as handed to backend sync and live
/// subscribers. Every vehicle field is optional because the snapshot it was
/// copied from may not have received that message yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub seq: u64,
    pub ts_unix_ms: i64,
    pub link_state: LinkState,

    pub armed: Option<bool>,
    pub custom_mode: Option<u32>,

    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt_m: Option<f32>,
    pub fix_type: Option<u8>,
    pub satellites: Option<u8>,
    pub hdop: Option<f32>,

    // Attitude (radians)
    pub roll: Option<f32>,
    pub pitch: Option<f32>,
    pub yaw: Option<f32>,

    // Battery monitoring
    pub battery_voltage: Option<f32>,
    pub battery_percent: Option<u8>,
    pub battery_current: Option<f32>,

    pub rc_rssi: Option<u8>,
}

impl TelemetrySample {
    pub fn empty(seq: u64, ts_unix_ms: i64, link_state: LinkState) -> Self {
        Self {
            seq,
            ts_unix_ms,
            link_state,
            armed: None,
            custom_mode: None,
            lat: None,
            lon: None,
            alt_m: None,
            fix_type: None,
            satellites: None,
            hdop: None,
            roll: None,
            pitch: None,
            yaw: None,
            battery_voltage: None,
            battery_percent: None,
            battery_current: None,
            rc_rssi: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_json_uses_snake_case_link_state() {
        let s = TelemetrySample::empty(3, 1_700_000_000_000, LinkState::Degraded);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"link_state\":\"degraded\""));
        assert!(json.contains("\"lat\":null"));
    }
}
