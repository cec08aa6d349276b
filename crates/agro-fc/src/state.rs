use std::time::Duration;

use agro_proto::LinkState;
use tokio::time::Instant;

use crate::codec::{Attitude, Battery, GpsFix, Heartbeat, Message, RcChannels};

/// A backwards jump of the device clock larger than this is taken as a
/// reboot of the flight controller rather than a stale message.
const SOURCE_CLOCK_RESET_US: u64 = 10_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<T> {
    pub value: T,
    pub received_at: Instant,
    /// Device-side timestamp, when the message carries one.
    pub source_us: Option<u64>,
    /// Link session the value arrived on.
    pub session: u64,
}

impl<T> Stamped<T> {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.received_at)
    }

    fn is_newer_than(&self, source_us: Option<u64>, session: u64) -> bool {
        if self.session != session {
            return false;
        }
        match (self.source_us, source_us) {
            (Some(stored), Some(incoming)) => {
                incoming < stored && stored - incoming < SOURCE_CLOCK_RESET_US
            }
            _ => false,
        }
    }
}

/// Latest known value of each field, each stamped with when it arrived.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VehicleSnapshot {
    pub heartbeat: Option<Stamped<Heartbeat>>,
    pub gps: Option<Stamped<GpsFix>>,
    pub attitude: Option<Stamped<Attitude>>,
    pub battery: Option<Stamped<Battery>>,
    pub rc: Option<Stamped<RcChannels>>,
    /// Bumped on every accepted update.
    pub revision: u64,
}

impl VehicleSnapshot {
    /// Folds one decoded message in. Returns false when the message carries
    /// nothing for the snapshot or is older than the stored field.
    pub fn apply(&mut self, msg: &Message, now: Instant, session: u64) -> bool {
        let stored = match msg {
            Message::Heartbeat(hb) => store(&mut self.heartbeat, *hb, None, now, session),
            Message::Gps { fix, time_us } => store(&mut self.gps, *fix, *time_us, now, session),
            Message::Attitude { attitude, time_us } => {
                store(&mut self.attitude, *attitude, *time_us, now, session)
            }
            Message::SysStatus(battery) => store(&mut self.battery, *battery, None, now, session),
            Message::RcChannels { rc, time_us } => {
                store(&mut self.rc, rc.clone(), *time_us, now, session)
            }
            _ => false,
        };
        if stored {
            self.revision += 1;
        }
        stored
    }

    pub fn armed(&self) -> Option<bool> {
        self.heartbeat.as_ref().map(|hb| hb.value.armed)
    }

    pub fn custom_mode(&self) -> Option<u32> {
        self.heartbeat.as_ref().map(|hb| hb.value.custom_mode)
    }
}

fn store<T>(
    slot: &mut Option<Stamped<T>>,
    value: T,
    source_us: Option<u64>,
    now: Instant,
    session: u64,
) -> bool {
    if let Some(current) = slot {
        if current.is_newer_than(source_us, session) {
            return false;
        }
    }
    *slot = Some(Stamped { value, received_at: now, source_us, session });
    true
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkStatus {
    pub state: LinkState,
    /// When `state` was entered.
    pub since: Instant,
    /// Incremented on every successful open.
    pub session: u64,
    /// Consecutive failed reopen attempts; reset on the first heartbeat.
    pub reconnect_failures: u32,
    /// True between `connect()` and `disconnect()`.
    pub wanted: bool,
}

impl LinkStatus {
    pub fn new(now: Instant) -> Self {
        Self {
            state: LinkState::Disconnected,
            since: now,
            session: 0,
            reconnect_failures: 0,
            wanted: false,
        }
    }

    pub fn in_state_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gps(lat: f64, time_us: u64) -> Message {
        Message::Gps {
            fix: GpsFix { latitude: lat, fix_type: 3, ..Default::default() },
            time_us: Some(time_us),
        }
    }

    #[test]
    fn test_older_source_time_is_dropped() {
        let now = Instant::now();
        let mut snap = VehicleSnapshot::default();
        assert!(snap.apply(&gps(10.0, 2_000_000), now, 1));
        assert!(!snap.apply(&gps(11.0, 1_500_000), now, 1));
        assert_eq!(snap.gps.as_ref().unwrap().value.latitude, 10.0);
        assert_eq!(snap.revision, 1);
    }

    #[test]
    fn test_new_session_or_clock_reset_overwrites() {
        let now = Instant::now();
        let mut snap = VehicleSnapshot::default();
        assert!(snap.apply(&gps(10.0, 60_000_000), now, 1));
        assert!(snap.apply(&gps(11.0, 1_000), now, 2), "new session");
        assert!(snap.apply(&gps(12.0, 90_000_000), now, 2));
        assert!(snap.apply(&gps(13.0, 500), now, 2), "device rebooted");
        assert_eq!(snap.gps.as_ref().unwrap().value.latitude, 13.0);
    }

    #[test]
    fn test_control_messages_leave_snapshot_alone() {
        let mut snap = VehicleSnapshot::default();
        assert!(!snap.apply(&Message::MissionRequest { seq: 0 }, Instant::now(), 1));
        assert_eq!(snap, VehicleSnapshot::default());
    }
}
