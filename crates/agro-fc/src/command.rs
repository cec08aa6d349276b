//! Sends commands to the vehicle and correlates acknowledgements.
//!
//! Every submission ends in exactly one [`CommandResult`]: accepted,
//! rejected (by the vehicle or locally) or timed out. Results are values;
//! `submit` never returns an error.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{oneshot, Semaphore},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    codec::{AckResult, CommandCode, GeoTarget, GpsFix, Message, Outbound},
    connection::{ConnectionManager, LinkObserver, OutboundLink},
    state::VehicleSnapshot,
    error::LinkError,
};

/// ArduPilot's magic value for a forced arm/disarm in param2.
const FORCE_MAGIC: f32 = 21196.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub arm_timeout_ms: u64,
    pub mode_timeout_ms: u64,
    pub goto_timeout_ms: u64,
    pub upload_timeout_ms: u64,
    pub mission_start_timeout_ms: u64,

    /// Cap on concurrently in-flight goto/upload commands.
    pub max_independent_in_flight: usize,

    /// Completed results kept for `history()`.
    pub history_len: usize,

    /// Mode name -> autopilot custom_mode number.
    pub modes: BTreeMap<String, u32>,

    pub pre_arm: PreArmConfig,
}

/// GPS checks run locally before a non-forced arm is sent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreArmConfig {
    pub require_gps: bool,
    pub min_fix_type: u8,
    pub min_satellites: u8,
    /// Only checked when the receiver reports HDOP.
    pub max_hdop: Option<f32>,
}

impl Default for PreArmConfig {
    fn default() -> Self {
        Self { require_gps: true, min_fix_type: 3, min_satellites: 6, max_hdop: Some(2.0) }
    }
}

impl PreArmConfig {
    /// Why `fix` is not good enough to arm on, if it isn't.
    pub fn check(&self, fix: Option<&GpsFix>) -> Result<(), String> {
        if !self.require_gps {
            return Ok(());
        }
        let fix = fix.ok_or("no GPS data")?;
        if fix.fix_type < self.min_fix_type {
            return Err(format!("GPS fix type {} below {}", fix.fix_type, self.min_fix_type));
        }
        if fix.satellites < self.min_satellites {
            return Err(format!("{} satellites, need {}", fix.satellites, self.min_satellites));
        }
        match (fix.hdop, self.max_hdop) {
            (Some(hdop), Some(max)) if hdop > max => Err(format!("HDOP {:.1} above {:.1}", hdop, max)),
            _ => Ok(()),
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        // ArduCopter numbering
        let modes = [("STABILIZE", 0), ("AUTO", 3), ("GUIDED", 4), ("LOITER", 5), ("RTL", 6), ("LAND", 9)]
            .into_iter()
            .map(|(name, n)| (name.to_string(), n))
            .collect();
        Self {
            arm_timeout_ms: 2000,
            mode_timeout_ms: 2000,
            goto_timeout_ms: 5000,
            upload_timeout_ms: 10_000,
            mission_start_timeout_ms: 2000,
            max_independent_in_flight: 4,
            history_len: 200,
            modes,
            pre_arm: PreArmConfig::default(),
        }
    }
}

impl CommandConfig {
    pub fn timeout_for(&self, kind: CommandKind) -> Duration {
        let ms = match kind {
            CommandKind::Arm | CommandKind::Disarm => self.arm_timeout_ms,
            CommandKind::SetMode => self.mode_timeout_ms,
            CommandKind::Goto => self.goto_timeout_ms,
            CommandKind::UploadMission => self.upload_timeout_ms,
            CommandKind::StartMission => self.mission_start_timeout_ms,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Arm,
    Disarm,
    SetMode,
    Goto,
    UploadMission,
    StartMission,
}

/// Kinds sharing a class may not be in flight together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exclusive {
    Arming,
    Mode,
    MissionControl,
}

/// What an acknowledgement is matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckKey {
    Command(CommandCode),
    Mission,
}

impl CommandKind {
    fn exclusive(self) -> Option<Exclusive> {
        match self {
            CommandKind::Arm | CommandKind::Disarm => Some(Exclusive::Arming),
            CommandKind::SetMode => Some(Exclusive::Mode),
            CommandKind::StartMission => Some(Exclusive::MissionControl),
            CommandKind::Goto | CommandKind::UploadMission => None,
        }
    }

    fn ack_key(self) -> AckKey {
        match self {
            CommandKind::Arm | CommandKind::Disarm => AckKey::Command(CommandCode::ArmDisarm),
            CommandKind::SetMode => AckKey::Command(CommandCode::SetMode),
            CommandKind::Goto => AckKey::Command(CommandCode::NavWaypoint),
            CommandKind::StartMission => AckKey::Command(CommandCode::MissionStart),
            CommandKind::UploadMission => AckKey::Mission,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    Arm { arm: bool, force: bool },
    SetMode { mode: String },
    Goto { target: GeoTarget },
    UploadMission { items: Vec<GeoTarget> },
    StartMission { first: u16, last: u16 },
}

impl CommandPayload {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandPayload::Arm { arm: true, .. } => CommandKind::Arm,
            CommandPayload::Arm { arm: false, .. } => CommandKind::Disarm,
            CommandPayload::SetMode { .. } => CommandKind::SetMode,
            CommandPayload::Goto { .. } => CommandKind::Goto,
            CommandPayload::UploadMission { .. } => CommandKind::UploadMission,
            CommandPayload::StartMission { .. } => CommandKind::StartMission,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Accepted,
    Rejected,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub command_id: CommandId,
    pub kind: CommandKind,
    pub outcome: CommandOutcome,
    pub detail: String,
    pub submitted_at: Instant,
    pub completed_at: Instant,
}

impl CommandResult {
    pub fn accepted(&self) -> bool {
        self.outcome == CommandOutcome::Accepted
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandStats {
    pub submitted: u64,
    pub sent: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub timed_out: u64,
}

struct Resolution {
    outcome: CommandOutcome,
    detail: String,
}

struct Entry {
    kind: CommandKind,
    ack: AckKey,
    /// Set just before the first byte is written.
    session: Option<u64>,
    items: Option<Arc<Vec<GeoTarget>>>,
    reply: oneshot::Sender<Resolution>,
}

#[derive(Default)]
struct Table {
    entries: BTreeMap<CommandId, Entry>,
}

impl Table {
    fn conflicts(&self, class: Exclusive) -> bool {
        self.entries.values().any(|e| e.kind.exclusive() == Some(class))
    }

    /// Resolves the oldest matching entry. The reply is sent while the table
    /// is still locked so a racing timeout always finds it in the channel.
    fn resolve_oldest(&mut self, ack: AckKey, session: u64, resolution: Resolution) -> Option<CommandId> {
        let id = self
            .entries
            .iter()
            .find(|(_, e)| e.ack == ack && e.session == Some(session))
            .map(|(id, _)| *id)?;
        let entry = self.entries.remove(&id)?;
        let _ = entry.reply.send(resolution);
        Some(id)
    }

    fn upload_item(&self, session: u64, seq: u16) -> Option<GeoTarget> {
        self.entries
            .values()
            .find(|e| e.ack == AckKey::Mission && e.session == Some(session))
            .and_then(|e| e.items.as_ref())
            .and_then(|items| items.get(seq as usize).copied())
    }
}

#[derive(Default)]
struct Ledger {
    history: VecDeque<CommandResult>,
    stats: CommandStats,
}

#[derive(Clone)]
pub struct CommandExecutor {
    inner: Arc<ExecInner>,
}

struct ExecInner {
    cfg: CommandConfig,
    modes: BTreeMap<String, u32>,
    link: OutboundLink,
    next_id: AtomicU64,
    slots: Arc<Semaphore>,
    table: Mutex<Table>,
    ledger: Mutex<Ledger>,
    /// Latest fix from the link, for pre-arm checks.
    gps: Mutex<Option<GpsFix>>,
}

/// Removes the in-flight entry if the submitting future is dropped.
struct InFlightGuard<'a> {
    inner: &'a ExecInner,
    id: CommandId,
    kind: CommandKind,
    submitted_at: Instant,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.inner.lock_table().entries.remove(&self.id);
        debug!("fc: command {:?} cancelled by submitter", self.id);
        self.inner.finish(
            self.id,
            self.kind,
            self.submitted_at,
            CommandOutcome::Rejected,
            "cancelled by submitter".into(),
        );
    }
}

impl CommandExecutor {
    pub fn new(cfg: CommandConfig, link: OutboundLink) -> Self {
        let modes = cfg
            .modes
            .iter()
            .map(|(name, n)| (name.to_ascii_uppercase(), *n))
            .collect();
        let slots = Arc::new(Semaphore::new(cfg.max_independent_in_flight.max(1)));
        Self {
            inner: Arc::new(ExecInner {
                cfg,
                modes,
                link,
                next_id: AtomicU64::new(0),
                slots,
                table: Mutex::new(Table::default()),
                ledger: Mutex::new(Ledger::default()),
                gps: Mutex::new(None),
            }),
        }
    }

    /// Builds an executor on `conn`'s link and registers it for acks.
    pub fn attach(conn: &ConnectionManager, cfg: CommandConfig) -> Self {
        let exec = Self::new(cfg, conn.outbound());
        conn.add_observer(Arc::new(exec.clone()));
        exec
    }

    pub fn mode_number(&self, name: &str) -> Option<u32> {
        self.inner.modes.get(&name.to_ascii_uppercase()).copied()
    }

    pub fn mode_name(&self, number: u32) -> Option<&str> {
        self.inner
            .modes
            .iter()
            .find(|(_, n)| **n == number)
            .map(|(name, _)| name.as_str())
    }

    pub async fn submit(&self, payload: CommandPayload) -> CommandResult {
        let inner = self.inner.as_ref();
        let id = CommandId(inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let kind = payload.kind();
        let submitted_at = Instant::now();
        inner.ledger().stats.submitted += 1;
        debug!("fc: submit {:?} {:?}", id, payload);

        if let CommandPayload::Arm { arm: true, force: false } = payload {
            let gps = *inner.gps.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(reason) = inner.cfg.pre_arm.check(gps.as_ref()) {
                return inner.finish(id, kind, submitted_at, CommandOutcome::Rejected, format!("pre-arm: {reason}"));
            }
        }

        let first = match inner.first_message(&payload) {
            Ok(out) => out,
            Err(detail) => return inner.finish(id, kind, submitted_at, CommandOutcome::Rejected, detail),
        };
        let items = match payload {
            CommandPayload::UploadMission { items } => Some(Arc::new(items)),
            _ => None,
        };

        let _permit = match kind.exclusive() {
            Some(_) => None,
            None => match inner.slots.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    return inner.finish(id, kind, submitted_at, CommandOutcome::Rejected, "executor closed".into())
                }
            },
        };

        let (reply, mut rx) = oneshot::channel();
        {
            let mut table = inner.lock_table();
            if kind.exclusive().is_some_and(|class| table.conflicts(class)) {
                drop(table);
                return inner.finish(
                    id,
                    kind,
                    submitted_at,
                    CommandOutcome::Rejected,
                    "conflicting command in flight".into(),
                );
            }
            table
                .entries
                .insert(id, Entry { kind, ack: kind.ack_key(), session: None, items, reply });
        }
        let mut guard = InFlightGuard { inner, id, kind, submitted_at, armed: true };

        if let Err(e) = inner.write_first(id, &first).await {
            guard.armed = false;
            inner.lock_table().entries.remove(&id);
            return inner.finish(id, kind, submitted_at, CommandOutcome::Rejected, format!("link: {e}"));
        }
        inner.ledger().stats.sent += 1;

        let timeout = inner.cfg.timeout_for(kind);
        let resolution = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Resolution { outcome: CommandOutcome::Rejected, detail: "reply dropped".into() },
            Err(_) => inner.expire(id, &mut rx, timeout),
        };
        guard.armed = false;
        inner.finish(id, kind, submitted_at, resolution.outcome, resolution.detail)
    }

    /// Most recent results, oldest first.
    pub fn history(&self, limit: usize) -> Vec<CommandResult> {
        let ledger = self.inner.ledger();
        let skip = ledger.history.len().saturating_sub(limit);
        ledger.history.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> CommandStats {
        self.inner.ledger().stats
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock_table().entries.len()
    }

    /// Companion heartbeat so the autopilot sees us as a live GCS.
    pub async fn run_heartbeat(&self, hz: f32, cancel: CancellationToken) {
        if hz <= 0.0 {
            return;
        }
        let mut tick = tokio::time::interval(Duration::from_secs_f32(1.0 / hz));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => match self.inner.link.send(&Outbound::Heartbeat).await {
                    Ok(_) => {}
                    Err(LinkError::NotConnected) => trace!("fc: heartbeat skipped, no link"),
                    Err(e) => debug!("fc: heartbeat send failed: {}", e),
                },
            }
        }
    }
}

impl ExecInner {
    fn lock_table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn first_message(&self, payload: &CommandPayload) -> Result<Outbound, String> {
        let out = match payload {
            CommandPayload::Arm { arm, force } => Outbound::CommandLong {
                code: CommandCode::ArmDisarm,
                params: [
                    if *arm { 1.0 } else { 0.0 },
                    if *force { FORCE_MAGIC } else { 0.0 },
                    0.0, 0.0, 0.0, 0.0, 0.0,
                ],
            },
            CommandPayload::SetMode { mode } => {
                let number = self
                    .modes
                    .get(&mode.to_ascii_uppercase())
                    .ok_or_else(|| format!("unknown mode {mode:?}"))?;
                Outbound::CommandLong {
                    code: CommandCode::SetMode,
                    // param1: MAV_MODE_FLAG_CUSTOM_MODE_ENABLED
                    params: [1.0, *number as f32, 0.0, 0.0, 0.0, 0.0, 0.0],
                }
            }
            CommandPayload::Goto { target } => Outbound::CommandLong {
                code: CommandCode::NavWaypoint,
                params: [
                    target.hold_s,
                    target.acceptance_radius,
                    0.0,
                    0.0,
                    target.latitude as f32,
                    target.longitude as f32,
                    target.altitude,
                ],
            },
            CommandPayload::UploadMission { items } => {
                if items.is_empty() {
                    return Err("empty mission".into());
                }
                let count = u16::try_from(items.len()).map_err(|_| "mission too long".to_string())?;
                Outbound::MissionCount { count }
            }
            CommandPayload::StartMission { first, last } => Outbound::CommandLong {
                code: CommandCode::MissionStart,
                params: [*first as f32, *last as f32, 0.0, 0.0, 0.0, 0.0, 0.0],
            },
        };
        Ok(out)
    }

    /// Deadline passed: removes the entry, unless an ack got to it first.
    fn expire(&self, id: CommandId, rx: &mut oneshot::Receiver<Resolution>, timeout: Duration) -> Resolution {
        let mut table = self.lock_table();
        let timed_out = Resolution {
            outcome: CommandOutcome::TimedOut,
            detail: format!("no ack within {} ms", timeout.as_millis()),
        };
        if table.entries.remove(&id).is_some() {
            timed_out
        } else {
            // The ack's reply was sent under this lock, so it is already in the channel.
            rx.try_recv().unwrap_or(timed_out)
        }
    }

    /// Stamps the entry with the link session before writing, so an ack
    /// racing the write still correlates.
    async fn write_first(&self, id: CommandId, out: &Outbound) -> Result<(), LinkError> {
        let mut link = self.link.lock().await;
        let session = link.session().ok_or(LinkError::NotConnected)?;
        if let Some(entry) = self.lock_table().entries.get_mut(&id) {
            entry.session = Some(session);
        }
        link.send(out).await.map(|_| ())
    }

    fn finish(
        &self,
        id: CommandId,
        kind: CommandKind,
        submitted_at: Instant,
        outcome: CommandOutcome,
        detail: String,
    ) -> CommandResult {
        let result = CommandResult {
            command_id: id,
            kind,
            outcome,
            detail,
            submitted_at,
            completed_at: Instant::now(),
        };
        match outcome {
            CommandOutcome::Accepted => info!("fc: {:?} {:?} accepted", kind, id),
            _ => warn!("fc: {:?} {:?} {:?}: {}", kind, id, outcome, result.detail),
        }

        let mut ledger = self.ledger();
        match outcome {
            CommandOutcome::Accepted => ledger.stats.accepted += 1,
            CommandOutcome::Rejected => ledger.stats.rejected += 1,
            CommandOutcome::TimedOut => ledger.stats.timed_out += 1,
        }
        ledger.history.push_back(result.clone());
        while ledger.history.len() > self.cfg.history_len {
            ledger.history.pop_front();
        }
        result
    }
}

impl LinkObserver for CommandExecutor {
    fn on_snapshot(&self, snapshot: &Arc<VehicleSnapshot>) {
        *self.inner.gps.lock().unwrap_or_else(|e| e.into_inner()) = snapshot.gps.as_ref().map(|g| g.value);
    }

    fn on_control(&self, msg: &Message, session: u64) {
        let inner = self.inner.as_ref();
        match msg {
            Message::CommandAck { code, result } => {
                if !result.is_final() {
                    trace!("fc: {:?} in progress", code);
                    return;
                }
                let resolution = match result {
                    AckResult::Accepted => Resolution { outcome: CommandOutcome::Accepted, detail: "accepted".into() },
                    other => Resolution { outcome: CommandOutcome::Rejected, detail: other.describe() },
                };
                if inner.lock_table().resolve_oldest(AckKey::Command(*code), session, resolution).is_none() {
                    debug!("fc: ack for {:?} matches nothing in flight", code);
                }
            }
            Message::MissionAck { accepted, detail } => {
                let outcome = if *accepted { CommandOutcome::Accepted } else { CommandOutcome::Rejected };
                let resolution = Resolution { outcome, detail: detail.clone() };
                if inner.lock_table().resolve_oldest(AckKey::Mission, session, resolution).is_none() {
                    debug!("fc: mission ack matches no upload in flight");
                }
            }
            Message::MissionRequest { seq } => {
                let Some(target) = inner.lock_table().upload_item(session, *seq) else {
                    debug!("fc: mission item {} requested with no upload in flight", seq);
                    return;
                };
                let link = inner.link.clone();
                let seq = *seq;
                tokio::spawn(async move {
                    if let Err(e) = link.send(&Outbound::MissionItem { seq, target }).await {
                        warn!("fc: mission item {} not sent: {}", seq, e);
                    }
                });
            }
            _ => {}
        }
    }
}
