//! Semantic messages exchanged with the flight controller, independent of
//! the wire encoding.

pub mod mav;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

pub use mav::MavlinkCodec;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub custom_mode: u32,
    pub armed: bool,
    pub system_status: u8,
    pub vehicle_type: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f32,
    /// 0-1 no fix, 2 = 2D, 3 = 3D and above.
    pub fix_type: u8,
    pub satellites: u8,
    pub hdop: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Attitude {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    pub voltage: Option<f32>,  // Volts
    pub current: Option<f32>,  // Amps
    pub remaining: Option<u8>, // Percent 0-100
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RcChannels {
    pub channels: Vec<u16>,
    /// 0-254, 255 = unknown.
    pub rssi: u8,
}

/// Commands the core knows how to correlate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CommandCode {
    ArmDisarm,
    SetMode,
    NavWaypoint,
    MissionStart,
    Other(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckResult {
    Accepted,
    InProgress,
    TemporarilyRejected,
    Denied,
    Unsupported,
    Failed,
    Other(u8),
}

impl AckResult {
    /// `InProgress` is informational; anything else ends the command.
    pub fn is_final(self) -> bool {
        !matches!(self, AckResult::InProgress)
    }

    pub fn describe(self) -> String {
        match self {
            AckResult::Accepted => "accepted".into(),
            AckResult::InProgress => "in progress".into(),
            AckResult::TemporarilyRejected => "temporarily rejected".into(),
            AckResult::Denied => "denied".into(),
            AckResult::Unsupported => "unsupported".into(),
            AckResult::Failed => "failed".into(),
            AckResult::Other(code) => format!("result code {code}"),
        }
    }
}

/// A navigation target as sent to the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTarget {
    pub latitude: f64,
    pub longitude: f64,
    /// Metres, relative to home.
    pub altitude: f32,
    pub acceptance_radius: f32,
    pub hold_s: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Heartbeat(Heartbeat),
    Gps {
        fix: GpsFix,
        time_us: Option<u64>,
    },
    Attitude {
        attitude: Attitude,
        time_us: Option<u64>,
    },
    SysStatus(Battery),
    RcChannels {
        rc: RcChannels,
        time_us: Option<u64>,
    },
    CommandAck {
        code: CommandCode,
        result: AckResult,
    },
    MissionRequest {
        seq: u16,
    },
    MissionAck {
        accepted: bool,
        detail: String,
    },
    Other,
}

impl Message {
    /// Acks and mission handshake messages, routed to the command side.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Message::CommandAck { .. } | Message::MissionRequest { .. } | Message::MissionAck { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    CommandLong { code: CommandCode, params: [f32; 7] },
    MissionCount { count: u16 },
    MissionItem { seq: u16, target: GeoTarget },
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(Message),
    NeedMoreData,
}

/// Wire encoding seam. `decode` consumes bytes from the front of `buf`;
/// on `Err` it must have consumed at least one byte so the caller can
/// keep going.
pub trait MessageCodec: Send + Sync {
    fn decode(&self, buf: &mut BytesMut) -> Result<Decoded, CodecError>;
    fn encode(&self, out: &Outbound) -> Result<Bytes, CodecError>;
}
