//! Periodic failsafe evaluation.
//!
//! Rules run in priority order (heartbeat loss, RC loss, low battery, GPS
//! loss) and the first one that holds wins. A trigger raises once per
//! episode; the episode ends only after its condition has stayed false for
//! the clear debounce.
//!
//! While an episode holds, its corrective command is enforced: a failed
//! attempt is logged as a follow-up entry and resent, and an accepted one is
//! resent only if a later heartbeat shows the vehicle out of the target state.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use agro_proto::{
    failsafe::{ActionTaken, FailsafeAction, FailsafeEvent, FailsafeTrigger, Severity},
    unix_ms_now, LinkState,
};
use serde::Deserialize;
use tokio::{
    sync::{broadcast, oneshot, watch},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    command::{CommandExecutor, CommandPayload, CommandResult},
    connection::{ConnectionManager, LinkView},
    state::VehicleSnapshot,
    subscription::Subscription,
};

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub tick_ms: u64,
    /// Added to the link heartbeat timeout before heartbeat loss is raised.
    pub heartbeat_grace_ms: u64,
    /// How long RC must stay lost with frozen channels.
    pub rc_loss_ms: u64,
    /// RC data older than this counts as lost.
    pub rc_timeout_ms: u64,
    /// Normalised RSSI (0..1) below which RC counts as lost.
    pub rc_min_signal: f32,
    pub battery_critical_pct: u8,
    pub clear_debounce_ms: u64,
    /// Wait after a failed corrective command before sending it again.
    pub action_retry_ms: u64,
    /// Heartbeat outage after which the core reports itself unavailable...
    pub fatal_ceiling_ms: u64,
    /// ...provided at least this many reopen attempts have failed.
    pub fatal_min_reconnect_failures: u32,
    pub actions: FailsafeActions,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            tick_ms: 200,
            heartbeat_grace_ms: 3000,
            rc_loss_ms: 1000,
            rc_timeout_ms: 2000,
            rc_min_signal: 0.1,
            battery_critical_pct: 10,
            clear_debounce_ms: 2000,
            action_retry_ms: 1000,
            fatal_ceiling_ms: 30_000,
            fatal_min_reconnect_failures: 2,
            actions: FailsafeActions::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FailsafeActions {
    pub heartbeat_loss: FailsafeAction,
    pub rc_loss: FailsafeAction,
    pub low_battery: FailsafeAction,
    pub gps_loss: FailsafeAction,
    pub manual: FailsafeAction,
}

impl Default for FailsafeActions {
    fn default() -> Self {
        Self {
            heartbeat_loss: FailsafeAction::SetMode { mode: "RTL".into() },
            rc_loss: FailsafeAction::SetMode { mode: "RTL".into() },
            low_battery: FailsafeAction::SetMode { mode: "LAND".into() },
            gps_loss: FailsafeAction::HoldPosition { mode: "LOITER".into() },
            manual: FailsafeAction::Disarm { force: true },
        }
    }
}

impl FailsafeActions {
    pub fn for_trigger(&self, trigger: FailsafeTrigger) -> &FailsafeAction {
        match trigger {
            FailsafeTrigger::HeartbeatLoss => &self.heartbeat_loss,
            FailsafeTrigger::RcLoss => &self.rc_loss,
            FailsafeTrigger::LowBattery => &self.low_battery,
            FailsafeTrigger::GpsLoss => &self.gps_loss,
            FailsafeTrigger::Manual => &self.manual,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RadioStatus {
    pub channels: Vec<u16>,
    pub signal_lost: bool,
}

/// Where RC link quality comes from. `None` means no radio is being reported
/// at all, which is not treated as a loss.
pub trait RadioSource: Send + Sync {
    fn radio(&self, now: Instant) -> Option<RadioStatus>;
}

/// Reads RC from the vehicle snapshot.
pub struct LinkRadio {
    conn: ConnectionManager,
    timeout: Duration,
    min_signal: f32,
}

impl LinkRadio {
    pub fn new(conn: ConnectionManager, cfg: &SafetyConfig) -> Self {
        Self {
            conn,
            timeout: Duration::from_millis(cfg.rc_timeout_ms),
            min_signal: cfg.rc_min_signal,
        }
    }
}

impl RadioSource for LinkRadio {
    fn radio(&self, now: Instant) -> Option<RadioStatus> {
        let snapshot = self.conn.snapshot();
        let rc = snapshot.rc.as_ref()?;
        let stale = rc.age(now) > self.timeout;
        // 255 = autopilot does not know
        let weak = rc.value.rssi != u8::MAX && (rc.value.rssi as f32 / 254.0) < self.min_signal;
        Some(RadioStatus { channels: rc.value.channels.clone(), signal_lost: stale || weak })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailsafeNotice {
    Raised(FailsafeEvent),
    Cleared { trigger: FailsafeTrigger, event_id: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoreHealth {
    Nominal,
    /// The vehicle has been unreachable past the fatal ceiling.
    Unavailable { reason: String },
}

/// Whether a mission is running. Set by the mission side, read by the GPS rule.
#[derive(Clone)]
pub struct MissionActivity(Arc<watch::Sender<bool>>);

impl MissionActivity {
    fn new() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }

    pub fn set(&self, active: bool) {
        self.0.send_if_modified(|current| {
            let changed = *current != active;
            *current = active;
            changed
        });
    }

    pub fn is_active(&self) -> bool {
        *self.0.borrow()
    }
}

/// Where an episode's corrective command stands.
enum Corrective {
    /// Nothing to enforce.
    Inert,
    Pending(oneshot::Receiver<CommandResult>),
    /// The vehicle accepted it, or already was in the target state, at this instant.
    Settled(Instant),
    Failed(Instant),
}

struct Episode {
    event_id: u64,
    action: FailsafeAction,
    clear_since: Option<Instant>,
    corrective: Corrective,
}

#[derive(Default)]
struct Episodes {
    active: BTreeMap<FailsafeTrigger, Episode>,
    rc_lost: Option<(Instant, Vec<u16>)>,
    next_id: u64,
    last_raised_ms: i64,
    unavailable: bool,
}

#[derive(Clone)]
pub struct SafetySupervisor {
    inner: Arc<SafetyInner>,
}

struct SafetyInner {
    cfg: SafetyConfig,
    conn: ConnectionManager,
    exec: CommandExecutor,
    radio: Arc<dyn RadioSource>,
    mission: MissionActivity,
    episodes: Mutex<Episodes>,
    log: Mutex<Vec<FailsafeEvent>>,
    notices: broadcast::Sender<FailsafeNotice>,
    health: watch::Sender<CoreHealth>,
}

impl SafetySupervisor {
    pub fn new(
        cfg: SafetyConfig,
        conn: ConnectionManager,
        exec: CommandExecutor,
        radio: Arc<dyn RadioSource>,
    ) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (health, _) = watch::channel(CoreHealth::Nominal);
        Self {
            inner: Arc::new(SafetyInner {
                cfg,
                conn,
                exec,
                radio,
                mission: MissionActivity::new(),
                episodes: Mutex::new(Episodes::default()),
                log: Mutex::new(Vec::new()),
                notices,
                health,
            }),
        }
    }

    /// Supervisor reading RC from the link snapshot.
    pub fn with_link_radio(cfg: SafetyConfig, conn: ConnectionManager, exec: CommandExecutor) -> Self {
        let radio = Arc::new(LinkRadio::new(conn.clone(), &cfg));
        Self::new(cfg, conn, exec, radio)
    }

    pub fn mission_activity(&self) -> MissionActivity {
        self.inner.mission.clone()
    }

    pub fn subscribe(&self) -> Subscription<FailsafeNotice> {
        Subscription::new(None, self.inner.notices.subscribe())
    }

    pub fn health(&self) -> watch::Receiver<CoreHealth> {
        self.inner.health.subscribe()
    }

    pub fn active(&self) -> Vec<FailsafeTrigger> {
        self.inner.episodes().active.keys().copied().collect()
    }

    /// Every event raised so far, in order.
    pub fn failsafe_log(&self) -> Vec<FailsafeEvent> {
        self.inner.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.inner.cfg.tick_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("safety: supervisor running every {} ms", self.inner.cfg.tick_ms);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.evaluate(Instant::now());
                }
            }
        }
    }

    /// One evaluation tick. Returns the event raised, if any.
    pub fn evaluate(&self, now: Instant) -> Option<FailsafeEvent> {
        let inner = self.inner.as_ref();
        let view = inner.conn.view();
        let radio = inner.radio.radio(now);
        let mut st = inner.episodes();

        let conditions = [
            (FailsafeTrigger::HeartbeatLoss, inner.heartbeat_lost(&view, now)),
            (FailsafeTrigger::RcLoss, inner.rc_lost(&mut st, radio, now)),
            (FailsafeTrigger::LowBattery, inner.battery_low(&view.snapshot)),
            (FailsafeTrigger::GpsLoss, inner.gps_lost(&view.snapshot)),
        ];

        let debounce = Duration::from_millis(inner.cfg.clear_debounce_ms);
        let mut cleared = Vec::new();
        for (trigger, detail) in &conditions {
            let Some(episode) = st.active.get_mut(trigger) else { continue };
            if detail.is_some() {
                episode.clear_since = None;
                continue;
            }
            let since = *episode.clear_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= debounce {
                cleared.push(*trigger);
            }
        }
        for trigger in cleared {
            inner.clear(&mut st, trigger);
        }

        let raised = conditions
            .into_iter()
            .find_map(|(trigger, detail)| detail.map(|d| (trigger, d)))
            .filter(|(trigger, _)| !st.active.contains_key(trigger))
            .map(|(trigger, detail)| inner.raise(&mut st, trigger, detail, &view.snapshot, now));

        inner.enforce(&mut st, &view, now);
        inner.escalate(&mut st, &view, now);
        raised
    }

    /// Operator emergency stop. `None` if one is already active.
    pub fn trigger_manual(&self, detail: impl Into<String>) -> Option<FailsafeEvent> {
        let inner = self.inner.as_ref();
        let snapshot = inner.conn.snapshot();
        let mut st = inner.episodes();
        if st.active.contains_key(&FailsafeTrigger::Manual) {
            return None;
        }
        Some(inner.raise(&mut st, FailsafeTrigger::Manual, detail.into(), &snapshot, Instant::now()))
    }

    /// Ends a manual episode. Returns false if none was active.
    pub fn reset_manual(&self) -> bool {
        let inner = self.inner.as_ref();
        let mut st = inner.episodes();
        if !st.active.contains_key(&FailsafeTrigger::Manual) {
            return false;
        }
        inner.clear(&mut st, FailsafeTrigger::Manual);
        true
    }
}

impl SafetyInner {
    fn episodes(&self) -> MutexGuard<'_, Episodes> {
        self.episodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn heartbeat_lost(&self, view: &LinkView, now: Instant) -> Option<String> {
        let link = &view.link;
        if !link.wanted {
            return None;
        }
        let grace = Duration::from_millis(self.cfg.heartbeat_grace_ms);
        let silent_for = view
            .snapshot
            .heartbeat
            .as_ref()
            .map(|hb| hb.age(now))
            .unwrap_or_else(|| link.in_state_for(now));
        let lost = match link.state {
            LinkState::Connected => false,
            LinkState::Degraded => link.in_state_for(now) >= grace,
            LinkState::Connecting | LinkState::Disconnected => {
                silent_for >= self.conn.config().heartbeat_timeout() + grace
            }
        };
        lost.then(|| format!("link {:?}, no heartbeat for {} ms", link.state, silent_for.as_millis()))
    }

    fn rc_lost(&self, st: &mut Episodes, radio: Option<RadioStatus>, now: Instant) -> Option<String> {
        let Some(radio) = radio.filter(|r| r.signal_lost) else {
            st.rc_lost = None;
            return None;
        };
        match &st.rc_lost {
            Some((since, channels)) if *channels == radio.channels => {
                let lost_for = now.saturating_duration_since(*since);
                (lost_for > Duration::from_millis(self.cfg.rc_loss_ms))
                    .then(|| format!("rc signal lost for {} ms", lost_for.as_millis()))
            }
            _ => {
                st.rc_lost = Some((now, radio.channels));
                None
            }
        }
    }

    fn battery_low(&self, snapshot: &VehicleSnapshot) -> Option<String> {
        let remaining = snapshot.battery.as_ref()?.value.remaining?;
        (remaining < self.cfg.battery_critical_pct).then(|| format!("battery at {}%", remaining))
    }

    fn gps_lost(&self, snapshot: &VehicleSnapshot) -> Option<String> {
        if !self.mission.is_active() {
            return None;
        }
        let fix_type = snapshot.gps.as_ref().map(|g| g.value.fix_type).unwrap_or(0);
        (fix_type < 3).then(|| format!("gps fix type {} during mission", fix_type))
    }

    fn raise(
        &self,
        st: &mut Episodes,
        trigger: FailsafeTrigger,
        detail: String,
        snapshot: &VehicleSnapshot,
        now: Instant,
    ) -> FailsafeEvent {
        let action = self.cfg.actions.for_trigger(trigger).clone();
        let (action_taken, corrective) = self.apply(&action, snapshot, now);
        let event = self.record(st, trigger, action_taken, detail);
        st.active.insert(trigger, Episode { event_id: event.id, action, clear_since: None, corrective });

        match event.severity {
            Severity::Critical => error!("safety: {} raised: {} ({:?})", trigger, event.detail, event.action_taken),
            Severity::Warning => warn!("safety: {} raised: {} ({:?})", trigger, event.detail, event.action_taken),
        }
        let _ = self.notices.send(FailsafeNotice::Raised(event.clone()));
        event
    }

    /// Appends to the log with the next id and a non-decreasing timestamp.
    fn record(
        &self,
        st: &mut Episodes,
        trigger: FailsafeTrigger,
        action_taken: ActionTaken,
        detail: String,
    ) -> FailsafeEvent {
        st.next_id += 1;
        let raised_unix_ms = unix_ms_now().max(st.last_raised_ms);
        st.last_raised_ms = raised_unix_ms;
        let event = FailsafeEvent {
            id: st.next_id,
            trigger,
            severity: trigger.severity(),
            raised_unix_ms,
            action_taken,
            detail,
        };
        self.log.lock().unwrap_or_else(|e| e.into_inner()).push(event.clone());
        event
    }

    fn clear(&self, st: &mut Episodes, trigger: FailsafeTrigger) {
        if let Some(episode) = st.active.remove(&trigger) {
            info!("safety: {} cleared", trigger);
            let _ = self.notices.send(FailsafeNotice::Cleared { trigger, event_id: episode.event_id });
        }
    }

    /// Whether the vehicle already reports the state `action` drives it to.
    fn satisfied(&self, action: &FailsafeAction, snapshot: &VehicleSnapshot) -> bool {
        match action {
            FailsafeAction::None => true,
            FailsafeAction::SetMode { mode } | FailsafeAction::HoldPosition { mode } => {
                let target = self.exec.mode_number(mode);
                target.is_some() && snapshot.custom_mode() == target
            }
            FailsafeAction::Disarm { .. } => snapshot.armed() == Some(false),
        }
    }

    fn apply(&self, action: &FailsafeAction, snapshot: &VehicleSnapshot, now: Instant) -> (ActionTaken, Corrective) {
        match action {
            FailsafeAction::None => (ActionTaken::NoAction, Corrective::Inert),
            _ if self.satisfied(action, snapshot) => {
                (ActionTaken::AlreadyActive(action.clone()), Corrective::Settled(now))
            }
            _ => (ActionTaken::Issued(action.clone()), self.send_corrective(action)),
        }
    }

    /// Hands the corrective command to the executor; the result is picked
    /// up by a later tick.
    fn send_corrective(&self, action: &FailsafeAction) -> Corrective {
        let payload = match action {
            FailsafeAction::SetMode { mode } | FailsafeAction::HoldPosition { mode } => {
                CommandPayload::SetMode { mode: mode.clone() }
            }
            FailsafeAction::Disarm { force } => CommandPayload::Arm { arm: false, force: *force },
            FailsafeAction::None => return Corrective::Inert,
        };
        let (tx, rx) = oneshot::channel();
        let exec = self.exec.clone();
        tokio::spawn(async move {
            let _ = tx.send(exec.submit(payload).await);
        });
        Corrective::Pending(rx)
    }

    /// Collects finished corrective commands, logs the failed ones and
    /// resends for the governing episode when it is due.
    fn enforce(&self, st: &mut Episodes, view: &LinkView, now: Instant) {
        let mut failures = Vec::new();
        for (trigger, episode) in st.active.iter_mut() {
            let Corrective::Pending(rx) = &mut episode.corrective else { continue };
            let (accepted, detail) = match rx.try_recv() {
                Ok(result) => (result.accepted(), result.detail),
                Err(oneshot::error::TryRecvError::Empty) => continue,
                Err(oneshot::error::TryRecvError::Closed) => (false, "corrective task ended without a result".into()),
            };
            if accepted {
                episode.corrective = Corrective::Settled(now);
            } else {
                episode.corrective = Corrective::Failed(now);
                failures.push((*trigger, episode.event_id, episode.action.clone(), detail));
            }
        }
        for (trigger, event_id, action, detail) in failures {
            warn!("safety: {} corrective {:?} failed: {}", trigger, action, detail);
            let taken = ActionTaken::Failed { action, detail: detail.clone() };
            self.record(st, trigger, taken, format!("corrective for event {} failed: {}", event_id, detail));
        }

        if !matches!(view.link.state, LinkState::Connected | LinkState::Degraded) {
            return;
        }
        // Manual stop first, then rule priority. Episodes already clearing don't count.
        let governing = st
            .active
            .iter()
            .filter(|(_, e)| e.clear_since.is_none())
            .min_by_key(|(t, _)| (**t != FailsafeTrigger::Manual, **t))
            .map(|(t, _)| *t);
        let Some(trigger) = governing else { return };
        let Some(episode) = st.active.get_mut(&trigger) else { return };

        let retry = Duration::from_millis(self.cfg.action_retry_ms);
        let due = match episode.corrective {
            Corrective::Inert | Corrective::Pending(_) => false,
            Corrective::Failed(at) => now.saturating_duration_since(at) >= retry,
            // Only a heartbeat that arrived after the vehicle settled can show it left the target.
            Corrective::Settled(at) => view.snapshot.heartbeat.as_ref().is_some_and(|hb| hb.received_at > at),
        };
        if !due || self.satisfied(&episode.action, &view.snapshot) {
            return;
        }

        let current = view
            .snapshot
            .custom_mode()
            .map(|n| self.exec.mode_name(n).map(str::to_string).unwrap_or_else(|| n.to_string()))
            .unwrap_or_else(|| "unknown".into());
        info!("safety: {} still active, vehicle in {}, resending {:?}", trigger, current, episode.action);
        episode.corrective = self.send_corrective(&episode.action);
    }

    fn escalate(&self, st: &mut Episodes, view: &LinkView, now: Instant) {
        let outage = view
            .snapshot
            .heartbeat
            .as_ref()
            .map(|hb| hb.age(now))
            .unwrap_or_else(|| view.link.in_state_for(now));
        let unavailable = st.active.contains_key(&FailsafeTrigger::HeartbeatLoss)
            && outage >= Duration::from_millis(self.cfg.fatal_ceiling_ms)
            && view.link.reconnect_failures >= self.cfg.fatal_min_reconnect_failures;
        if unavailable == st.unavailable {
            return;
        }
        st.unavailable = unavailable;

        if unavailable {
            let reason = format!(
                "no heartbeat for {} s after {} failed reconnects",
                outage.as_secs(),
                view.link.reconnect_failures
            );
            error!("safety: vehicle unavailable: {}", reason);
            self.health.send_replace(CoreHealth::Unavailable { reason });
        } else {
            info!("safety: vehicle reachable again");
            self.health.send_replace(CoreHealth::Nominal);
        }
    }
}
