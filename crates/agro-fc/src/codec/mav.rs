use std::sync::atomic::{AtomicU8, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mavlink::{
    common::{
        MavAutopilot, MavCmd, MavFrame, MavMessage, MavMissionResult, MavModeFlag, MavResult, MavState, MavType, COMMAND_LONG_DATA,
        HEARTBEAT_DATA, MISSION_COUNT_DATA, MISSION_ITEM_INT_DATA, SYS_STATUS_DATA,
    },
    MavHeader, MavlinkVersion,
};
use tracing::trace;

use super::{
    AckResult, Attitude, Battery, CommandCode, Decoded, GeoTarget, GpsFix, Heartbeat, Message,
    MessageCodec, Outbound, RcChannels,
};
use crate::{error::CodecError, LinkConfig};

const V1_MAGIC: u8 = 0xFE;
const V2_MAGIC: u8 = 0xFD;
const V2_SIGNED: u8 = 0x01;
const V2_SIGNATURE_LEN: usize = 13;

/// MAVLink `common` dialect codec.
pub struct MavlinkCodec {
    version: MavlinkVersion,
    sys_id: u8,
    comp_id: u8,
    target_sys: u8,
    target_comp: u8,
    sequence: AtomicU8,
}

impl MavlinkCodec {
    pub fn new(version: MavlinkVersion, sys_id: u8, comp_id: u8, target_sys: u8, target_comp: u8) -> Self {
        Self { version, sys_id, comp_id, target_sys, target_comp, sequence: AtomicU8::new(0) }
    }

    pub fn from_config(cfg: &LinkConfig) -> Result<Self, CodecError> {
        let version = match cfg.mavlink_version.to_ascii_uppercase().as_str() {
            "V1" | "1" => MavlinkVersion::V1,
            "V2" | "2" => MavlinkVersion::V2,
            other => return Err(CodecError::Unsupported(format!("mavlink version {other:?}"))),
        };
        Ok(Self::new(version, cfg.sys_id, cfg.comp_id, cfg.target_sys, cfg.target_comp))
    }

    fn from_target(&self, hdr: &MavHeader) -> bool {
        self.target_sys == 0 || hdr.system_id == self.target_sys
    }

    fn translate(&self, hdr: &MavHeader, msg: MavMessage) -> Message {
        if !self.from_target(hdr) {
            return Message::Other;
        }
        match msg {
            MavMessage::HEARTBEAT(hb) => {
                // Other components on the vehicle (gimbal, camera) heartbeat too.
                if self.target_comp != 0 && hdr.component_id != self.target_comp {
                    return Message::Other;
                }
                Message::Heartbeat(Heartbeat {
                    custom_mode: hb.custom_mode,
                    armed: hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED),
                    system_status: hb.system_status as u8,
                    vehicle_type: hb.mavtype as u8,
                })
            }
            MavMessage::GPS_RAW_INT(gps) => Message::Gps {
                fix: GpsFix {
                    latitude: gps.lat as f64 / 1e7,
                    longitude: gps.lon as f64 / 1e7,
                    altitude_m: gps.alt as f32 / 1000.0,
                    fix_type: gps.fix_type as u8,
                    satellites: gps.satellites_visible,
                    // eph is HDOP * 100, UINT16_MAX if unknown
                    hdop: (gps.eph != u16::MAX).then(|| gps.eph as f32 / 100.0),
                },
                time_us: (gps.time_usec != 0).then_some(gps.time_usec),
            },
            MavMessage::ATTITUDE(att) => Message::Attitude {
                attitude: Attitude { roll: att.roll, pitch: att.pitch, yaw: att.yaw },
                time_us: Some(att.time_boot_ms as u64 * 1000),
            },
            MavMessage::SYS_STATUS(status) => Message::SysStatus(battery_from(&status)),
            MavMessage::RC_CHANNELS(rc) => {
                let raw = [
                    rc.chan1_raw, rc.chan2_raw, rc.chan3_raw, rc.chan4_raw,
                    rc.chan5_raw, rc.chan6_raw, rc.chan7_raw, rc.chan8_raw,
                ];
                let count = (rc.chancount as usize).min(raw.len());
                Message::RcChannels {
                    rc: RcChannels { channels: raw[..count].to_vec(), rssi: rc.rssi },
                    time_us: Some(rc.time_boot_ms as u64 * 1000),
                }
            }
            MavMessage::COMMAND_ACK(ack) => Message::CommandAck {
                code: command_code(ack.command),
                result: ack_result(ack.result),
            },
            MavMessage::MISSION_REQUEST_INT(req) => Message::MissionRequest { seq: req.seq },
            MavMessage::MISSION_REQUEST(req) => Message::MissionRequest { seq: req.seq },
            MavMessage::MISSION_ACK(ack) => Message::MissionAck {
                accepted: ack.mavtype == MavMissionResult::MAV_MISSION_ACCEPTED,
                detail: format!("{:?}", ack.mavtype),
            },
            _ => Message::Other,
        }
    }

    fn to_mavlink(&self, out: &Outbound) -> Result<MavMessage, CodecError> {
        let msg = match out {
            Outbound::CommandLong { code, params } => MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
                target_system: self.target_sys,
                target_component: self.target_comp,
                command: mav_cmd(*code)?,
                confirmation: 0,
                param1: params[0],
                param2: params[1],
                param3: params[2],
                param4: params[3],
                param5: params[4],
                param6: params[5],
                param7: params[6],
            }),
            Outbound::MissionCount { count } => MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
                count: *count,
                target_system: self.target_sys,
                target_component: self.target_comp,
                ..Default::default()
            }),
            Outbound::MissionItem { seq, target } => MavMessage::MISSION_ITEM_INT(mission_item(
                *seq,
                target,
                self.target_sys,
                self.target_comp,
            )),
            Outbound::Heartbeat => MavMessage::HEARTBEAT(HEARTBEAT_DATA {
                custom_mode: 0,
                mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
                autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
                base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
                system_status: MavState::MAV_STATE_ACTIVE,
                mavlink_version: 3,
            }),
        };
        Ok(msg)
    }
}

impl MessageCodec for MavlinkCodec {
    fn decode(&self, buf: &mut BytesMut) -> Result<Decoded, CodecError> {
        let Some(start) = buf.iter().position(|b| *b == V1_MAGIC || *b == V2_MAGIC) else {
            if !buf.is_empty() {
                trace!("fc: discarding {} bytes of line noise", buf.len());
                buf.clear();
            }
            return Ok(Decoded::NeedMoreData);
        };
        if start > 0 {
            trace!("fc: skipping {} bytes before frame start", start);
            buf.advance(start);
        }

        let Some(len) = frame_len(buf) else {
            return Ok(Decoded::NeedMoreData);
        };
        if buf.len() < len {
            return Ok(Decoded::NeedMoreData);
        }

        let version = if buf[0] == V1_MAGIC { MavlinkVersion::V1 } else { MavlinkVersion::V2 };
        let parsed = {
            let mut frame: &[u8] = &buf[..len];
            mavlink::read_versioned_msg::<MavMessage, _>(&mut frame, version)
        };
        match parsed {
            Ok((hdr, msg)) => {
                buf.advance(len);
                Ok(Decoded::Message(self.translate(&hdr, msg)))
            }
            Err(e) => {
                // Could be a magic byte inside noise; resync one byte on.
                buf.advance(1);
                Err(CodecError::Malformed(format!("{e:?}")))
            }
        }
    }

    fn encode(&self, out: &Outbound) -> Result<Bytes, CodecError> {
        let msg = self.to_mavlink(out)?;
        let hdr = MavHeader {
            system_id: self.sys_id,
            component_id: self.comp_id,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        let mut w = BytesMut::with_capacity(64).writer();
        mavlink::write_versioned_msg(&mut w, self.version, hdr, &msg)
            .map_err(|e| CodecError::Encode(format!("{e:?}")))?;
        Ok(w.into_inner().freeze())
    }
}

/// Full frame length implied by the header, if enough of it is buffered.
fn frame_len(buf: &[u8]) -> Option<usize> {
    match *buf.first()? {
        V1_MAGIC => buf.get(1).map(|len| *len as usize + 8),
        V2_MAGIC => {
            let len = *buf.get(1)? as usize;
            let incompat = *buf.get(2)?;
            let sig = if incompat & V2_SIGNED != 0 { V2_SIGNATURE_LEN } else { 0 };
            Some(len + 12 + sig)
        }
        _ => None,
    }
}

fn battery_from(status: &SYS_STATUS_DATA) -> Battery {
    Battery {
        // millivolts, UINT16_MAX = unknown
        voltage: (status.voltage_battery != u16::MAX).then(|| status.voltage_battery as f32 / 1000.0),
        // centiamps, -1 = unknown
        current: (status.current_battery != -1).then(|| status.current_battery as f32 / 100.0),
        remaining: (0..=100)
            .contains(&status.battery_remaining)
            .then_some(status.battery_remaining as u8),
    }
}

fn mission_item(seq: u16, target: &GeoTarget, target_sys: u8, target_comp: u8) -> MISSION_ITEM_INT_DATA {
    MISSION_ITEM_INT_DATA {
        param1: target.hold_s,
        param2: target.acceptance_radius,
        param3: 0.0,
        param4: f32::NAN,
        x: (target.latitude * 1e7).round() as i32,
        y: (target.longitude * 1e7).round() as i32,
        z: target.altitude,
        seq,
        command: MavCmd::MAV_CMD_NAV_WAYPOINT,
        target_system: target_sys,
        target_component: target_comp,
        frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
        current: 0,
        autocontinue: 1,
        ..Default::default()
    }
}

fn mav_cmd(code: CommandCode) -> Result<MavCmd, CodecError> {
    match code {
        CommandCode::ArmDisarm => Ok(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM),
        CommandCode::SetMode => Ok(MavCmd::MAV_CMD_DO_SET_MODE),
        CommandCode::NavWaypoint => Ok(MavCmd::MAV_CMD_NAV_WAYPOINT),
        CommandCode::MissionStart => Ok(MavCmd::MAV_CMD_MISSION_START),
        CommandCode::Other(id) => Err(CodecError::Unsupported(format!("command id {id}"))),
    }
}

fn command_code(cmd: MavCmd) -> CommandCode {
    match cmd {
        MavCmd::MAV_CMD_COMPONENT_ARM_DISARM => CommandCode::ArmDisarm,
        MavCmd::MAV_CMD_DO_SET_MODE => CommandCode::SetMode,
        MavCmd::MAV_CMD_NAV_WAYPOINT => CommandCode::NavWaypoint,
        MavCmd::MAV_CMD_MISSION_START => CommandCode::MissionStart,
        other => CommandCode::Other(other as u16),
    }
}

fn ack_result(result: MavResult) -> AckResult {
    match result {
        MavResult::MAV_RESULT_ACCEPTED => AckResult::Accepted,
        MavResult::MAV_RESULT_IN_PROGRESS => AckResult::InProgress,
        MavResult::MAV_RESULT_TEMPORARILY_REJECTED => AckResult::TemporarilyRejected,
        MavResult::MAV_RESULT_DENIED => AckResult::Denied,
        MavResult::MAV_RESULT_UNSUPPORTED => AckResult::Unsupported,
        MavResult::MAV_RESULT_FAILED => AckResult::Failed,
        #[allow(unreachable_patterns)]
        other => AckResult::Other(other as u8),
    }
}
