//! Waypoint missions flown as a sequence of goto commands.
//!
//! A mission moves Created -> Uploaded -> Active and ends Completed or
//! Aborted; Active and Paused switch back and forth. While a mission is
//! Active every snapshot carrying a fresh GPS fix is checked against the
//! current waypoint, and the mission advances by at most one waypoint per
//! fix. Only one mission may be Active or Paused at a time.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use agro_fc::{
    codec::{GeoTarget, GpsFix},
    safety::{FailsafeNotice, MissionActivity},
    state::{Stamped, VehicleSnapshot},
    CommandExecutor, CommandPayload, CommandResult, ConnectionManager, LinkObserver, SafetySupervisor,
};
use agro_proto::failsafe::FailsafeTrigger;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::geo::{haversine_m, path_length_m};

/// Fix types below 2D carry no usable position.
const MIN_FIX_TYPE: u8 = 2;
/// Home is only taken from a 3D fix.
const HOME_FIX_TYPE: u8 = 3;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MissionConfig {
    pub max_waypoints: usize,
    /// Radius for plan waypoints that do not set their own.
    pub default_acceptance_m: f32,
    pub max_altitude_m: f32,
    /// Speed for duration estimates when a mission does not give one.
    pub default_speed_mps: f32,
    pub max_speed_mps: f32,
    /// Mode that holds position on pause and abort.
    pub hold_mode: String,
    pub rtl_mode: String,
    /// Every waypoint must lie within this many metres of home.
    pub geofence_radius_m: Option<f64>,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            max_waypoints: 100,
            default_acceptance_m: 2.0,
            max_altitude_m: 500.0,
            default_speed_mps: 5.0,
            max_speed_mps: 20.0,
            hold_mode: "LOITER".into(),
            rtl_mode: "RTL".into(),
            geofence_radius_m: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub sequence_index: u16,
    pub latitude: f64,
    pub longitude: f64,
    /// Metres above home.
    pub altitude: f32,
    pub acceptance_radius: f32,
    #[serde(default)]
    pub hold_s: f32,
}

impl Waypoint {
    pub fn new(sequence_index: u16, latitude: f64, longitude: f64, altitude: f32, acceptance_radius: f32) -> Self {
        Self { sequence_index, latitude, longitude, altitude, acceptance_radius, hold_s: 0.0 }
    }

    fn target(&self) -> GeoTarget {
        GeoTarget {
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude,
            acceptance_radius: self.acceptance_radius,
            hold_s: self.hold_s,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MissionOptions {
    pub return_to_launch: bool,
    /// If set, reaching a waypoint also needs the altitude within this many metres.
    pub vertical_tolerance_m: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Created,
    Uploaded,
    Active,
    Paused,
    Completed,
    Aborted,
}

impl MissionStatus {
    fn is_live(self) -> bool {
        matches!(self, MissionStatus::Active | MissionStatus::Paused)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MissionId(pub u64);

impl fmt::Display for MissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mission-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissionSummary {
    pub id: MissionId,
    pub status: MissionStatus,
    /// Waypoint being flown to; equals `waypoint_count` once completed.
    pub current_index: usize,
    pub waypoint_count: usize,
    pub total_distance_m: f64,
    pub estimated_duration_s: f64,
    pub speed_mps: f32,
    pub options: MissionOptions,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MissionValidationError {
    #[error("mission must have at least one waypoint")]
    Empty,
    #[error("mission has {count} waypoints, limit is {max}")]
    TooManyWaypoints { count: usize, max: usize },
    #[error("waypoint sequence {0} appears more than once")]
    DuplicateSequence(u16),
    #[error("waypoint {seq}: non-finite value")]
    NonFinite { seq: u16 },
    #[error("waypoint {seq}: latitude {value} outside -90..90")]
    Latitude { seq: u16, value: f64 },
    #[error("waypoint {seq}: longitude {value} outside -180..180")]
    Longitude { seq: u16, value: f64 },
    #[error("waypoint {seq}: altitude {value} m outside 0..{max}")]
    Altitude { seq: u16, value: f32, max: f32 },
    #[error("waypoint {seq}: acceptance radius must be > 0, got {value}")]
    AcceptanceRadius { seq: u16, value: f32 },
    #[error("waypoint {seq}: negative hold time {value}")]
    HoldTime { seq: u16, value: f32 },
    #[error("default speed {value} m/s outside (0, {max}]")]
    Speed { value: f32, max: f32 },
    #[error("vertical tolerance {0} m must be finite and >= 0")]
    VerticalTolerance(f32),
    #[error("waypoint {seq}: {distance_m:.0} m from home, geofence is {radius_m:.0} m")]
    OutsideGeofence { seq: u16, distance_m: f64, radius_m: f64 },
    #[error("geofence needs a home position and none is known yet")]
    NoHome,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MissionError {
    #[error("{0} not found")]
    NotFound(MissionId),
    #[error("{id}: cannot {op} while {status:?}")]
    InvalidTransition { id: MissionId, op: &'static str, status: MissionStatus },
    #[error("{0} is already running")]
    AnotherActive(MissionId),
    #[error("{0} has an operation in progress")]
    Busy(MissionId),
    #[error("failsafe active: {0:?}")]
    FailsafeActive(Vec<FailsafeTrigger>),
    #[error("command {:?} {:?}: {}", .0.kind, .0.outcome, .0.detail)]
    Command(CommandResult),
}

/// Path length through the waypoints in order.
pub fn total_distance_m(waypoints: &[Waypoint]) -> f64 {
    path_length_m(waypoints.iter().map(|w| (w.latitude, w.longitude)))
}

pub fn validate(
    waypoints: &[Waypoint],
    default_speed: Option<f32>,
    options: &MissionOptions,
    cfg: &MissionConfig,
) -> Result<(), MissionValidationError> {
    use MissionValidationError as E;

    if waypoints.is_empty() {
        return Err(E::Empty);
    }
    if waypoints.len() > cfg.max_waypoints {
        return Err(E::TooManyWaypoints { count: waypoints.len(), max: cfg.max_waypoints });
    }

    let mut seen = BTreeSet::new();
    for wp in waypoints {
        let seq = wp.sequence_index;
        if !seen.insert(seq) {
            return Err(E::DuplicateSequence(seq));
        }
        let finite = wp.latitude.is_finite()
            && wp.longitude.is_finite()
            && wp.altitude.is_finite()
            && wp.acceptance_radius.is_finite()
            && wp.hold_s.is_finite();
        if !finite {
            return Err(E::NonFinite { seq });
        }
        if !(-90.0..=90.0).contains(&wp.latitude) {
            return Err(E::Latitude { seq, value: wp.latitude });
        }
        if !(-180.0..=180.0).contains(&wp.longitude) {
            return Err(E::Longitude { seq, value: wp.longitude });
        }
        if !(0.0..=cfg.max_altitude_m).contains(&wp.altitude) {
            return Err(E::Altitude { seq, value: wp.altitude, max: cfg.max_altitude_m });
        }
        if wp.acceptance_radius <= 0.0 {
            return Err(E::AcceptanceRadius { seq, value: wp.acceptance_radius });
        }
        if wp.hold_s < 0.0 {
            return Err(E::HoldTime { seq, value: wp.hold_s });
        }
    }

    if let Some(speed) = default_speed {
        if !(speed.is_finite() && speed > 0.0 && speed <= cfg.max_speed_mps) {
            return Err(E::Speed { value: speed, max: cfg.max_speed_mps });
        }
    }
    if let Some(tol) = options.vertical_tolerance_m {
        if !(tol.is_finite() && tol >= 0.0) {
            return Err(E::VerticalTolerance(tol));
        }
    }
    Ok(())
}

/// Checks every waypoint lies within `radius_m` of `home` (lat, lon).
pub fn check_geofence(waypoints: &[Waypoint], home: (f64, f64), radius_m: f64) -> Result<(), MissionValidationError> {
    for wp in waypoints {
        let distance_m = haversine_m(home.0, home.1, wp.latitude, wp.longitude);
        if distance_m > radius_m {
            return Err(MissionValidationError::OutsideGeofence { seq: wp.sequence_index, distance_m, radius_m });
        }
    }
    Ok(())
}

struct Mission {
    waypoints: Arc<[Waypoint]>,
    speed_mps: f32,
    options: MissionOptions,
    status: MissionStatus,
    current_index: usize,
    /// An upload, start or resume is waiting on the vehicle.
    busy: bool,
    /// Last fix evaluated, so each fix advances at most once.
    last_fix: Option<Stamped<GpsFix>>,
    total_distance_m: f64,
}

impl Mission {
    fn summary(&self, id: MissionId) -> MissionSummary {
        MissionSummary {
            id,
            status: self.status,
            current_index: self.current_index,
            waypoint_count: self.waypoints.len(),
            total_distance_m: self.total_distance_m,
            estimated_duration_s: self.total_distance_m / self.speed_mps as f64,
            speed_mps: self.speed_mps,
            options: self.options,
        }
    }

    fn claim(&mut self, id: MissionId, op: &'static str, from: &[MissionStatus]) -> Result<(), MissionError> {
        if self.busy {
            return Err(MissionError::Busy(id));
        }
        if !from.contains(&self.status) {
            return Err(MissionError::InvalidTransition { id, op, status: self.status });
        }
        self.busy = true;
        Ok(())
    }

    fn current_target(&self) -> Option<GeoTarget> {
        self.waypoints.get(self.current_index).map(Waypoint::target)
    }
}

#[derive(Default)]
struct Book {
    missions: BTreeMap<MissionId, Mission>,
    /// Mission that is Active or Paused, or being started.
    current: Option<MissionId>,
}

impl Book {
    fn get_mut(&mut self, id: MissionId) -> Result<&mut Mission, MissionError> {
        self.missions.get_mut(&id).ok_or(MissionError::NotFound(id))
    }
}

#[derive(Clone)]
pub struct MissionExecutor {
    inner: Arc<MissionInner>,
}

struct MissionInner {
    cfg: MissionConfig,
    exec: CommandExecutor,
    safety: SafetySupervisor,
    activity: MissionActivity,
    next_id: AtomicU64,
    book: Mutex<Book>,
    /// Geofence centre as (lat, lon).
    home: Mutex<Option<(f64, f64)>>,
}

/// Clears the busy flag when an operation ends, however it ends, and gives
/// up the running slot if the mission never went live.
struct BusyGuard<'a> {
    inner: &'a MissionInner,
    id: MissionId,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut book = self.inner.book();
        let live = match book.missions.get_mut(&self.id) {
            Some(m) => {
                m.busy = false;
                m.status.is_live()
            }
            None => false,
        };
        if !live && book.current == Some(self.id) {
            book.current = None;
        }
    }
}

impl MissionExecutor {
    pub fn new(cfg: MissionConfig, exec: CommandExecutor, safety: SafetySupervisor) -> Self {
        let activity = safety.mission_activity();
        Self {
            inner: Arc::new(MissionInner {
                cfg,
                exec,
                safety,
                activity,
                next_id: AtomicU64::new(0),
                book: Mutex::new(Book::default()),
                home: Mutex::new(None),
            }),
        }
    }

    /// Builds an executor and registers it for snapshot updates on `conn`.
    pub fn attach(conn: &ConnectionManager, cfg: MissionConfig, exec: CommandExecutor, safety: SafetySupervisor) -> Self {
        let missions = Self::new(cfg, exec, safety);
        conn.add_observer(Arc::new(missions.clone()));
        missions
    }

    pub fn config(&self) -> &MissionConfig {
        &self.inner.cfg
    }

    /// Home position, taken from the first 3D fix unless set explicitly.
    pub fn home(&self) -> Option<(f64, f64)> {
        *self.inner.home()
    }

    pub fn set_home(&self, latitude: f64, longitude: f64) {
        info!("mission: home set to {:.6}, {:.6}", latitude, longitude);
        *self.inner.home() = Some((latitude, longitude));
    }

    /// Validates and stores a mission. Waypoints are flown in sequence order.
    pub fn create(
        &self,
        mut waypoints: Vec<Waypoint>,
        default_speed: Option<f32>,
        options: MissionOptions,
    ) -> Result<MissionId, MissionValidationError> {
        let cfg = &self.inner.cfg;
        validate(&waypoints, default_speed, &options, cfg)?;
        if let Some(radius) = cfg.geofence_radius_m {
            let home = self.home().ok_or(MissionValidationError::NoHome)?;
            check_geofence(&waypoints, home, radius)?;
        }
        waypoints.sort_by_key(|w| w.sequence_index);

        let id = MissionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let total = total_distance_m(&waypoints);
        info!("mission: {} created, {} waypoints, {:.0} m", id, waypoints.len(), total);
        let mission = Mission {
            waypoints: waypoints.into(),
            speed_mps: default_speed.unwrap_or(cfg.default_speed_mps),
            options,
            status: MissionStatus::Created,
            current_index: 0,
            busy: false,
            last_fix: None,
            total_distance_m: total,
        };
        self.inner.book().missions.insert(id, mission);
        Ok(id)
    }

    /// Sends the waypoint list to the vehicle. Created -> Uploaded on acceptance.
    pub async fn upload(&self, id: MissionId) -> Result<(), MissionError> {
        let inner = self.inner.as_ref();
        let items: Vec<GeoTarget> = {
            let mut book = inner.book();
            let m = book.get_mut(id)?;
            m.claim(id, "upload", &[MissionStatus::Created, MissionStatus::Uploaded])?;
            m.waypoints.iter().map(Waypoint::target).collect()
        };
        let _busy = BusyGuard { inner, id };

        let result = inner.exec.submit(CommandPayload::UploadMission { items }).await;
        if !result.accepted() {
            return Err(MissionError::Command(result));
        }
        let mut book = inner.book();
        let m = book.get_mut(id)?;
        m.status = MissionStatus::Uploaded;
        info!("mission: {} uploaded", id);
        Ok(())
    }

    /// Uploaded -> Active once the vehicle accepts a goto to the first waypoint.
    pub async fn start(&self, id: MissionId) -> Result<(), MissionError> {
        self.go(id, "start", MissionStatus::Uploaded).await
    }

    /// Active -> Paused and hold position.
    pub async fn pause(&self, id: MissionId) -> Result<(), MissionError> {
        {
            let mut book = self.inner.book();
            let m = book.get_mut(id)?;
            if m.busy {
                return Err(MissionError::Busy(id));
            }
            if m.status != MissionStatus::Active {
                return Err(MissionError::InvalidTransition { id, op: "pause", status: m.status });
            }
            m.status = MissionStatus::Paused;
            info!("mission: {} paused at waypoint {}", id, m.current_index);
        }
        self.inner.activity.set(false);
        self.inner.hold().await
    }

    /// Paused -> Active by flying again to the current waypoint. Refused
    /// while any failsafe is active.
    pub async fn resume(&self, id: MissionId) -> Result<(), MissionError> {
        self.go(id, "resume", MissionStatus::Paused).await
    }

    /// Active|Paused -> Aborted and hold position. The state change stands
    /// even if the hold command fails.
    pub async fn abort(&self, id: MissionId) -> Result<(), MissionError> {
        {
            let mut book = self.inner.book();
            let m = book.get_mut(id)?;
            if !m.status.is_live() {
                return Err(MissionError::InvalidTransition { id, op: "abort", status: m.status });
            }
            m.status = MissionStatus::Aborted;
            warn!("mission: {} aborted at waypoint {}", id, m.current_index);
            if book.current == Some(id) {
                book.current = None;
            }
        }
        self.inner.activity.set(false);
        self.inner.hold().await
    }

    /// Paused|Aborted|Completed -> Uploaded, back at the first waypoint.
    pub fn restart(&self, id: MissionId) -> Result<(), MissionError> {
        let mut book = self.inner.book();
        let m = book.get_mut(id)?;
        if m.busy {
            return Err(MissionError::Busy(id));
        }
        let from = [MissionStatus::Paused, MissionStatus::Aborted, MissionStatus::Completed];
        if !from.contains(&m.status) {
            return Err(MissionError::InvalidTransition { id, op: "restart", status: m.status });
        }
        m.status = MissionStatus::Uploaded;
        m.current_index = 0;
        m.last_fix = None;
        info!("mission: {} restarted", id);
        if book.current == Some(id) {
            book.current = None;
            self.inner.activity.set(false);
        }
        Ok(())
    }

    pub fn status(&self, id: MissionId) -> Result<MissionSummary, MissionError> {
        let mut book = self.inner.book();
        Ok(book.get_mut(id)?.summary(id))
    }

    pub fn list(&self) -> Vec<MissionSummary> {
        let book = self.inner.book();
        book.missions.iter().map(|(id, m)| m.summary(*id)).collect()
    }

    /// The mission that is Active or Paused, if any.
    pub fn current(&self) -> Option<MissionSummary> {
        let book = self.inner.book();
        let id = book.current?;
        book.missions.get(&id).filter(|m| m.status.is_live()).map(|m| m.summary(id))
    }

    pub fn waypoints(&self, id: MissionId) -> Result<Vec<Waypoint>, MissionError> {
        let mut book = self.inner.book();
        Ok(book.get_mut(id)?.waypoints.to_vec())
    }

    /// Pauses the running mission whenever a failsafe is raised. The
    /// subscription is taken before this returns, so nothing raised after
    /// the call is missed.
    pub fn watch_failsafes(&self, cancel: CancellationToken) -> impl Future<Output = ()> + Send + 'static {
        let mut notices = self.inner.safety.subscribe();
        let this = self.clone();
        async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    notice = notices.recv() => match notice {
                        Some(FailsafeNotice::Raised(ev)) => this.inner.pause_for(ev.trigger),
                        Some(FailsafeNotice::Cleared { .. }) => {}
                        None => break,
                    },
                }
            }
        }
    }

    async fn go(&self, id: MissionId, op: &'static str, from: MissionStatus) -> Result<(), MissionError> {
        let inner = self.inner.as_ref();
        let failsafes = inner.safety.active();
        let target = {
            let mut book = inner.book();
            book.get_mut(id)?;
            if let Some(other) = book.current.filter(|c| *c != id) {
                return Err(MissionError::AnotherActive(other));
            }
            if !failsafes.is_empty() {
                return Err(MissionError::FailsafeActive(failsafes));
            }
            let m = book.get_mut(id)?;
            m.claim(id, op, &[from])?;
            let target = m.current_target();
            book.current = Some(id);
            target
        };
        let _busy = BusyGuard { inner, id };
        let Some(target) = target else {
            return Err(MissionError::InvalidTransition { id, op, status: from });
        };

        let result = inner.exec.submit(CommandPayload::Goto { target }).await;
        if !result.accepted() {
            return Err(MissionError::Command(result));
        }

        let failsafes = inner.safety.active();
        let mut book = inner.book();
        let m = book.get_mut(id)?;
        if m.status != from {
            return Err(MissionError::InvalidTransition { id, op, status: m.status });
        }
        if !failsafes.is_empty() {
            m.status = MissionStatus::Paused;
            warn!("mission: {} held paused, failsafe raised during {}", id, op);
            return Err(MissionError::FailsafeActive(failsafes));
        }
        m.status = MissionStatus::Active;
        m.last_fix = None;
        info!("mission: {} active, heading to waypoint {}", id, m.current_index);
        inner.activity.set(true);
        Ok(())
    }

    fn spawn_goto(&self, id: MissionId, index: usize, target: GeoTarget) {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.inner.exec.submit(CommandPayload::Goto { target }).await;
            if result.accepted() {
                return;
            }
            let mut book = this.inner.book();
            let Some(m) = book.missions.get_mut(&id) else { return };
            if m.status == MissionStatus::Active && m.current_index == index {
                m.status = MissionStatus::Paused;
                drop(book);
                this.inner.activity.set(false);
                warn!("mission: {} paused, goto waypoint {} failed: {}", id, index, result.detail);
            }
        });
    }
}

impl MissionInner {
    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn home(&self) -> MutexGuard<'_, Option<(f64, f64)>> {
        self.home.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn hold(&self) -> Result<(), MissionError> {
        let result = self.exec.submit(CommandPayload::SetMode { mode: self.cfg.hold_mode.clone() }).await;
        if result.accepted() {
            Ok(())
        } else {
            Err(MissionError::Command(result))
        }
    }

    /// The supervisor has already issued its corrective command; only the
    /// mission state changes here.
    fn pause_for(&self, trigger: FailsafeTrigger) {
        let mut book = self.book();
        let Some(id) = book.current else { return };
        let Some(m) = book.missions.get_mut(&id) else { return };
        if m.status != MissionStatus::Active {
            return;
        }
        m.status = MissionStatus::Paused;
        warn!("mission: {} paused by {} failsafe at waypoint {}", id, trigger, m.current_index);
        drop(book);
        self.activity.set(false);
    }
}

enum Advance {
    Next(MissionId, usize, GeoTarget),
    Completed(MissionId, bool),
}

impl LinkObserver for MissionExecutor {
    fn on_snapshot(&self, snapshot: &Arc<VehicleSnapshot>) {
        let Some(gps) = snapshot.gps.as_ref() else { return };
        if gps.value.fix_type >= HOME_FIX_TYPE {
            let mut home = self.inner.home();
            if home.is_none() {
                info!("mission: home set from first 3D fix {:.6}, {:.6}", gps.value.latitude, gps.value.longitude);
                *home = Some((gps.value.latitude, gps.value.longitude));
            }
        }
        if gps.value.fix_type < MIN_FIX_TYPE {
            return;
        }

        let advance = {
            let mut book = self.inner.book();
            let Some(id) = book.current else { return };
            let Some(m) = book.missions.get_mut(&id) else { return };
            if m.status != MissionStatus::Active || m.last_fix.as_ref() == Some(gps) {
                return;
            }
            m.last_fix = Some(gps.clone());
            let Some(wp) = m.waypoints.get(m.current_index).copied() else { return };

            let fix = &gps.value;
            let dist = haversine_m(fix.latitude, fix.longitude, wp.latitude, wp.longitude);
            if dist > wp.acceptance_radius as f64 {
                trace!("mission: {} waypoint {} is {:.1} m away", id, wp.sequence_index, dist);
                return;
            }
            if let Some(tol) = m.options.vertical_tolerance_m {
                if (fix.altitude_m - wp.altitude).abs() > tol {
                    debug!("mission: {} over waypoint {} but {:.1} m off altitude", id, wp.sequence_index, fix.altitude_m - wp.altitude);
                    return;
                }
            }

            m.current_index += 1;
            info!("mission: {} reached waypoint {} ({:.1} m)", id, wp.sequence_index, dist);
            match m.current_target() {
                Some(next) => Advance::Next(id, m.current_index, next),
                None => {
                    m.status = MissionStatus::Completed;
                    let rtl = m.options.return_to_launch;
                    book.current = None;
                    Advance::Completed(id, rtl)
                }
            }
        };

        match advance {
            Advance::Next(id, index, target) => self.spawn_goto(id, index, target),
            Advance::Completed(id, rtl) => {
                self.inner.activity.set(false);
                info!("mission: {} completed", id);
                if rtl {
                    let exec = self.inner.exec.clone();
                    let mode = self.inner.cfg.rtl_mode.clone();
                    tokio::spawn(async move {
                        let result = exec.submit(CommandPayload::SetMode { mode }).await;
                        if !result.accepted() {
                            warn!("mission: {} return to launch not accepted: {}", id, result.detail);
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use agro_fc::{
        codec::{CommandCode, Message},
        link::{
            mock::{Autopilot, JsonLinesCodec, MockTransport},
            TransportConfig,
        },
        CommandConfig, LinkConfig, SafetyConfig,
    };

    use super::*;

    struct Rig {
        exec: CommandExecutor,
        safety: SafetySupervisor,
        missions: MissionExecutor,
        pilot: Autopilot,
        _conn: ConnectionManager,
    }

    async fn rig() -> Rig {
        rig_with(MissionConfig::default()).await
    }

    async fn rig_with(cfg: MissionConfig) -> Rig {
        let transport = MockTransport::new();
        let conn = ConnectionManager::new(LinkConfig::default(), transport.clone(), Arc::new(JsonLinesCodec));
        let exec = CommandExecutor::attach(&conn, CommandConfig::default());
        let safety = SafetySupervisor::with_link_radio(SafetyConfig::default(), conn.clone(), exec.clone());
        let missions = MissionExecutor::attach(&conn, cfg, exec.clone(), safety.clone());
        conn.connect(TransportConfig::Tcp { address: "mock".into() }).await.unwrap();
        let pilot = transport.next_vehicle().await.unwrap().autopilot();
        pilot.heartbeat();
        settle().await;
        Rig { exec, safety, missions, pilot, _conn: conn }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn two_points() -> Vec<Waypoint> {
        vec![Waypoint::new(0, 45.0, -122.0, 10.0, 2.0), Waypoint::new(1, 45.001, -122.001, 10.0, 2.0)]
    }

    fn fix_at(lat: f64, lon: f64, fix_type: u8) -> Message {
        Message::Gps {
            fix: GpsFix { latitude: lat, longitude: lon, altitude_m: 10.0, fix_type, satellites: 12, hdop: Some(0.7) },
            time_us: None,
        }
    }

    async fn fly_to(pilot: &Autopilot, lat: f64, lon: f64) {
        pilot.send(&fix_at(lat, lon, 3));
        settle().await;
    }

    async fn started(rig: &Rig, waypoints: Vec<Waypoint>, options: MissionOptions) -> MissionId {
        let id = rig.missions.create(waypoints, None, options).unwrap();
        rig.missions.upload(id).await.unwrap();
        rig.missions.start(id).await.unwrap();
        id
    }

    fn goto_lats(pilot: &Autopilot) -> Vec<f32> {
        pilot.commands(CommandCode::NavWaypoint).iter().map(|p| p[4]).collect()
    }

    #[test]
    fn test_validation_rejects_bad_waypoints() {
        let cfg = MissionConfig::default();
        let opts = MissionOptions::default();
        let ok = Waypoint::new(0, 45.0, -122.0, 10.0, 2.0);

        assert_eq!(validate(&[], None, &opts, &cfg), Err(MissionValidationError::Empty));
        assert!(validate(&[ok], None, &opts, &cfg).is_ok());

        let bad_lat = Waypoint { latitude: 91.0, ..ok };
        assert!(matches!(validate(&[bad_lat], None, &opts, &cfg), Err(MissionValidationError::Latitude { .. })));
        let bad_lon = Waypoint { longitude: -180.5, ..ok };
        assert!(matches!(validate(&[bad_lon], None, &opts, &cfg), Err(MissionValidationError::Longitude { .. })));
        let below_ground = Waypoint { altitude: -1.0, ..ok };
        assert!(matches!(validate(&[below_ground], None, &opts, &cfg), Err(MissionValidationError::Altitude { .. })));
        let no_radius = Waypoint { acceptance_radius: 0.0, ..ok };
        assert!(matches!(
            validate(&[no_radius], None, &opts, &cfg),
            Err(MissionValidationError::AcceptanceRadius { .. })
        ));
        let nan = Waypoint { latitude: f64::NAN, ..ok };
        assert_eq!(validate(&[nan], None, &opts, &cfg), Err(MissionValidationError::NonFinite { seq: 0 }));
        assert_eq!(validate(&[ok, ok], None, &opts, &cfg), Err(MissionValidationError::DuplicateSequence(0)));
    }

    #[test]
    fn test_validation_checks_speed_and_limits() {
        let cfg = MissionConfig { max_waypoints: 2, ..MissionConfig::default() };
        let opts = MissionOptions::default();
        let wps: Vec<Waypoint> = (0..3).map(|i| Waypoint::new(i, 45.0, -122.0, 10.0, 2.0)).collect();
        assert_eq!(
            validate(&wps, None, &opts, &cfg),
            Err(MissionValidationError::TooManyWaypoints { count: 3, max: 2 })
        );
        assert!(matches!(validate(&wps[..1], Some(0.0), &opts, &cfg), Err(MissionValidationError::Speed { .. })));
        assert!(matches!(validate(&wps[..1], Some(25.0), &opts, &cfg), Err(MissionValidationError::Speed { .. })));
        assert!(validate(&wps[..1], Some(20.0), &opts, &cfg).is_ok());
        let neg_tol = MissionOptions { vertical_tolerance_m: Some(-1.0), ..opts };
        assert_eq!(validate(&wps[..1], None, &neg_tol, &cfg), Err(MissionValidationError::VerticalTolerance(-1.0)));
    }

    #[test]
    fn test_geofence_measures_from_home() {
        let home = (45.0, -122.0);
        let near = Waypoint::new(0, 45.0005, -122.0, 10.0, 2.0);
        let far = Waypoint::new(1, 45.002, -122.0, 10.0, 2.0);
        assert!(check_geofence(&[near], home, 100.0).is_ok());
        match check_geofence(&[near, far], home, 100.0) {
            Err(MissionValidationError::OutsideGeofence { seq, distance_m, .. }) => {
                assert_eq!(seq, 1);
                assert!((distance_m - 222.4).abs() < 1.0, "{distance_m}");
            }
            other => panic!("expected a geofence error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_enforces_geofence_around_first_fix() {
        let rig = rig_with(MissionConfig { geofence_radius_m: Some(200.0), ..MissionConfig::default() }).await;
        assert_eq!(rig.missions.create(two_points(), None, MissionOptions::default()), Err(MissionValidationError::NoHome));

        // A 2D fix does not set home.
        rig.pilot.send(&fix_at(10.0, 10.0, 2));
        settle().await;
        assert_eq!(rig.missions.home(), None);

        fly_to(&rig.pilot, 45.0, -122.0).await;
        fly_to(&rig.pilot, 45.0001, -122.0).await;
        assert_eq!(rig.missions.home(), Some((45.0, -122.0)));
        assert!(rig.missions.create(two_points(), None, MissionOptions::default()).is_ok());

        let too_far = vec![Waypoint::new(0, 45.0, -122.0, 10.0, 2.0), Waypoint::new(1, 45.01, -122.0, 10.0, 2.0)];
        assert!(matches!(
            rig.missions.create(too_far, None, MissionOptions::default()),
            Err(MissionValidationError::OutsideGeofence { seq: 1, .. })
        ));

        rig.missions.set_home(45.01, -122.0);
        assert!(matches!(
            rig.missions.create(two_points(), None, MissionOptions::default()),
            Err(MissionValidationError::OutsideGeofence { seq: 0, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_orders_by_sequence_and_estimates() {
        let rig = rig().await;
        let mut wps = two_points();
        wps.reverse();
        let id = rig.missions.create(wps, Some(4.0), MissionOptions::default()).unwrap();

        let stored = rig.missions.waypoints(id).unwrap();
        assert_eq!(stored[0].sequence_index, 0);
        let s = rig.missions.status(id).unwrap();
        assert_eq!(s.status, MissionStatus::Created);
        assert_eq!(s.waypoint_count, 2);
        assert!((s.total_distance_m - total_distance_m(&stored)).abs() < 1e-9);
        assert!((s.estimated_duration_s - s.total_distance_m / 4.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_then_start_flies_to_first_waypoint() {
        let rig = rig().await;
        let id = rig.missions.create(two_points(), None, MissionOptions::default()).unwrap();
        rig.missions.upload(id).await.unwrap();
        assert_eq!(rig.missions.status(id).unwrap().status, MissionStatus::Uploaded);
        assert!(rig.pilot.seen().contains(&agro_fc::codec::Outbound::MissionCount { count: 2 }));

        rig.missions.start(id).await.unwrap();
        assert_eq!(rig.missions.status(id).unwrap().status, MissionStatus::Active);
        assert_eq!(goto_lats(&rig.pilot), vec![45.0_f32]);
        assert!(rig.safety.mission_activity().is_active());
        assert_eq!(rig.missions.current().map(|s| s.id), Some(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_requires_upload() {
        let rig = rig().await;
        let id = rig.missions.create(two_points(), None, MissionOptions::default()).unwrap();
        let err = rig.missions.start(id).await.unwrap_err();
        assert_eq!(err, MissionError::InvalidTransition { id, op: "start", status: MissionStatus::Created });
        assert!(rig.missions.current().is_none());
        assert_eq!(rig.missions.status(MissionId(99)).unwrap_err(), MissionError::NotFound(MissionId(99)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_mission_runs() {
        let rig = rig().await;
        let first = started(&rig, two_points(), MissionOptions::default()).await;
        let second = rig.missions.create(two_points(), None, MissionOptions::default()).unwrap();
        rig.missions.upload(second).await.unwrap();
        assert_eq!(rig.missions.start(second).await.unwrap_err(), MissionError::AnotherActive(first));

        rig.missions.abort(first).await.unwrap();
        rig.missions.start(second).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_index_only_moves_forward() {
        let rig = rig().await;
        let id = started(&rig, two_points(), MissionOptions::default()).await;

        // Far from waypoint 0: nothing happens.
        fly_to(&rig.pilot, 45.001, -122.001).await;
        assert_eq!(rig.missions.status(id).unwrap().current_index, 0);

        fly_to(&rig.pilot, 45.0, -122.0).await;
        assert_eq!(rig.missions.status(id).unwrap().current_index, 1);
        assert_eq!(goto_lats(&rig.pilot), vec![45.0_f32, 45.001_f32]);

        // Back over waypoint 0 does not rewind.
        fly_to(&rig.pilot, 45.0, -122.0).await;
        assert_eq!(rig.missions.status(id).unwrap().current_index, 1);

        fly_to(&rig.pilot, 45.001, -122.001).await;
        let s = rig.missions.status(id).unwrap();
        assert_eq!(s.status, MissionStatus::Completed);
        assert_eq!(s.current_index, 2);
        assert!(!rig.safety.mission_activity().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_waypoint_per_fix() {
        let rig = rig().await;
        let wps = vec![Waypoint::new(0, 45.0, -122.0, 10.0, 2.0), Waypoint::new(1, 45.0, -122.0, 10.0, 2.0)];
        let id = started(&rig, wps, MissionOptions::default()).await;

        fly_to(&rig.pilot, 45.0, -122.0).await;
        assert_eq!(rig.missions.status(id).unwrap().current_index, 1);
        fly_to(&rig.pilot, 45.0, -122.0).await;
        assert_eq!(rig.missions.status(id).unwrap().status, MissionStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_fix_no_advance() {
        let rig = rig().await;
        let id = started(&rig, two_points(), MissionOptions::default()).await;
        rig.pilot.send(&fix_at(45.0, -122.0, 1));
        settle().await;
        assert_eq!(rig.missions.status(id).unwrap().current_index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vertical_tolerance_gates_arrival() {
        let rig = rig().await;
        let wps = vec![Waypoint::new(0, 45.0, -122.0, 30.0, 2.0), Waypoint::new(1, 45.001, -122.001, 30.0, 2.0)];
        let opts = MissionOptions { vertical_tolerance_m: Some(5.0), ..MissionOptions::default() };
        let id = started(&rig, wps, opts).await;

        // fix_at reports 10 m, twenty below the waypoint.
        fly_to(&rig.pilot, 45.0, -122.0).await;
        assert_eq!(rig.missions.status(id).unwrap().current_index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_returns_to_launch() {
        let rig = rig().await;
        let opts = MissionOptions { return_to_launch: true, ..MissionOptions::default() };
        let id = started(&rig, vec![Waypoint::new(0, 45.0, -122.0, 10.0, 2.0)], opts).await;

        fly_to(&rig.pilot, 45.0, -122.0).await;
        settle().await;
        assert_eq!(rig.missions.status(id).unwrap().status, MissionStatus::Completed);
        assert_eq!(rig.pilot.custom_mode(), rig.exec.mode_number("RTL").unwrap());
        assert!(rig.missions.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_and_freezes_index() {
        let rig = rig().await;
        let id = started(&rig, two_points(), MissionOptions::default()).await;

        rig.missions.pause(id).await.unwrap();
        assert_eq!(rig.pilot.custom_mode(), rig.exec.mode_number("LOITER").unwrap());
        assert!(!rig.safety.mission_activity().is_active());

        fly_to(&rig.pilot, 45.0, -122.0).await;
        assert_eq!(rig.missions.status(id).unwrap().current_index, 0);

        rig.missions.resume(id).await.unwrap();
        assert_eq!(rig.missions.status(id).unwrap().status, MissionStatus::Active);
        assert_eq!(goto_lats(&rig.pilot), vec![45.0_f32, 45.0_f32]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_and_restart() {
        let rig = rig().await;
        let id = started(&rig, two_points(), MissionOptions::default()).await;
        fly_to(&rig.pilot, 45.0, -122.0).await;

        rig.missions.abort(id).await.unwrap();
        assert_eq!(rig.missions.status(id).unwrap().status, MissionStatus::Aborted);
        assert_eq!(rig.pilot.custom_mode(), rig.exec.mode_number("LOITER").unwrap());
        assert!(matches!(rig.missions.pause(id).await, Err(MissionError::InvalidTransition { .. })));
        assert!(matches!(rig.missions.abort(id).await, Err(MissionError::InvalidTransition { .. })));

        rig.missions.restart(id).unwrap();
        let s = rig.missions.status(id).unwrap();
        assert_eq!((s.status, s.current_index), (MissionStatus::Uploaded, 0));
        rig.missions.start(id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_goto_keeps_mission_uploaded() {
        let rig = rig().await;
        rig.pilot.deny(CommandCode::NavWaypoint);
        let id = rig.missions.create(two_points(), None, MissionOptions::default()).unwrap();
        rig.missions.upload(id).await.unwrap();

        let err = rig.missions.start(id).await.unwrap_err();
        assert!(matches!(err, MissionError::Command(ref r) if !r.accepted()));
        assert_eq!(rig.missions.status(id).unwrap().status, MissionStatus::Uploaded);
        assert!(rig.missions.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_advance_pauses() {
        let rig = rig().await;
        let id = started(&rig, two_points(), MissionOptions::default()).await;
        rig.pilot.deny(CommandCode::NavWaypoint);

        fly_to(&rig.pilot, 45.0, -122.0).await;
        settle().await;
        let s = rig.missions.status(id).unwrap();
        assert_eq!((s.status, s.current_index), (MissionStatus::Paused, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failsafe_pauses_without_resume() {
        let rig = rig().await;
        let cancel = CancellationToken::new();
        tokio::spawn(rig.missions.watch_failsafes(cancel.clone()));
        let id = started(&rig, two_points(), MissionOptions::default()).await;

        rig.safety.trigger_manual("operator stop").unwrap();
        settle().await;
        assert_eq!(rig.missions.status(id).unwrap().status, MissionStatus::Paused);
        assert_eq!(
            rig.missions.resume(id).await.unwrap_err(),
            MissionError::FailsafeActive(vec![FailsafeTrigger::Manual])
        );

        assert!(rig.safety.reset_manual());
        settle().await;
        assert_eq!(rig.missions.status(id).unwrap().status, MissionStatus::Paused);
        rig.missions.resume(id).await.unwrap();
        assert_eq!(rig.missions.status(id).unwrap().status, MissionStatus::Active);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_refused_during_failsafe() {
        let rig = rig().await;
        let id = rig.missions.create(two_points(), None, MissionOptions::default()).unwrap();
        rig.missions.upload(id).await.unwrap();
        rig.safety.trigger_manual("operator stop").unwrap();
        assert!(matches!(rig.missions.start(id).await, Err(MissionError::FailsafeActive(_))));
        assert_eq!(rig.missions.status(id).unwrap().status, MissionStatus::Uploaded);
    }
}
