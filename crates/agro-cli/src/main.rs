use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};

use agro_fc::autodetect::{autodetect_fc, AutodetectResult, ProbeSettings};
use agro_fc::codec::MavlinkCodec;
use agro_fc::link::{SystemTransport, TransportConfig};
use agro_fc::safety::CoreHealth;
use agro_fc::{
    doctor as fc_doctor, CommandExecutor, ConnectionManager, CoreConfig, LinkConfig, SafetySupervisor,
    TelemetryAggregator,
};
use agro_nav::{doctor as nav_doctor, MissionConfig, MissionExecutor, MissionPlan};
use agro_proto::LinkState;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "agro", version, about = "AgroBot vehicle link controller")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Doctor,
    /// Connect to the vehicle and supervise it until Ctrl-C.
    Run {
        /// Mission plan to upload and start once the link is up.
        #[arg(long)]
        mission: Option<PathBuf>,
    },
    Fc { #[command(subcommand)] cmd: FcCmd },
    Mission { #[command(subcommand)] cmd: MissionCmd },
}

#[derive(Debug, Subcommand)]
enum FcCmd {
    /// Probe serial ports/bauds for MAVLink heartbeats.
    Autodetect,
}

#[derive(Debug, Subcommand)]
enum MissionCmd {
    /// Validate a mission plan and print its length.
    Check { plan: PathBuf },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    #[serde(flatten)]
    core: CoreConfig,
    mission: MissionSection,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct MissionSection {
    #[serde(flatten)]
    limits: MissionConfig,
    /// Plan `run` starts when no --mission is given.
    plan: Option<PathBuf>,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run { mission } => run(&cfg, mission).await?,
        Command::Fc { cmd } => fc_cmd(&cfg, cmd).await?,
        Command::Mission { cmd } => mission_cmd(&cfg, cmd)?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    fc_doctor::check_core_config(&cfg.core)?;
    nav_doctor::check_mission_config(&cfg.mission.limits)?;
    for mode in [&cfg.mission.limits.hold_mode, &cfg.mission.limits.rtl_mode] {
        anyhow::ensure!(
            cfg.core.commands.modes.keys().any(|m| m.eq_ignore_ascii_case(mode)),
            "mission mode {} not in commands.modes",
            mode
        );
    }

    if let Some(dir) = &cfg.core.telemetry.spool_dir {
        if dir.exists() {
            anyhow::ensure!(dir.is_dir(), "telemetry.spool_dir is not a dir: {}", dir.display());
        }
    }

    if let Some(path) = &cfg.mission.plan {
        let plan = MissionPlan::load(path)?;
        let dist = nav_doctor::check_mission_plan(&plan, &cfg.mission.limits)
            .with_context(|| format!("mission plan {}", path.display()))?;
        info!("doctor: mission plan {:?} OK ({:.0} m)", plan.name, dist);
    }

    if cfg.core.link.autodetect {
        info!("doctor: fc autodetect enabled (OK)");
    }

    info!("doctor: OK");
    Ok(())
}

async fn fc_cmd(cfg: &Config, cmd: FcCmd) -> Result<()> {
    match cmd {
        FcCmd::Autodetect => {
            let res = run_fc_autodetect(&cfg.core.link).await?;
            if let Some((dev, baud)) = &res.chosen {
                println!("CHOSEN: {} @ {}", dev, baud);
            } else {
                println!("CHOSEN: none");
            }
            for p in res.probes {
                println!("probe dev={} baud={} hb={} {}ms note={}", p.dev, p.baud, p.hb_seen, p.elapsed_ms, p.note);
            }
            Ok(())
        }
    }
}

fn mission_cmd(cfg: &Config, cmd: MissionCmd) -> Result<()> {
    match cmd {
        MissionCmd::Check { plan } => {
            let p = MissionPlan::load(&plan)?;
            let dist = nav_doctor::check_mission_plan(&p, &cfg.mission.limits)?;
            let speed = p.default_speed.unwrap_or(cfg.mission.limits.default_speed_mps);
            println!("mission {:?}: {} waypoints", p.name, p.waypoints.len());
            println!("distance={:.1}m speed={:.1}m/s est_duration={:.0}s", dist, speed, dist / speed as f64);
            Ok(())
        }
    }
}

async fn run(cfg: &Config, mission: Option<PathBuf>) -> Result<()> {
    info!("run: starting");

    let link_cfg = &cfg.core.link;
    let codec = Arc::new(MavlinkCodec::from_config(link_cfg).context("mavlink codec")?);
    let target = resolve_transport(link_cfg).await?;

    let conn = ConnectionManager::new(link_cfg.clone(), Arc::new(SystemTransport), codec);
    let exec = CommandExecutor::attach(&conn, cfg.core.commands.clone());
    let safety = SafetySupervisor::with_link_radio(cfg.core.safety.clone(), conn.clone(), exec.clone());
    let missions = MissionExecutor::attach(&conn, cfg.mission.limits.clone(), exec.clone(), safety.clone());
    let telemetry = TelemetryAggregator::new(cfg.core.telemetry.clone(), conn.clone());

    conn.connect(target.clone()).await.with_context(|| format!("FC open {}", target))?;

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();
    handles.push(tokio::spawn(missions.watch_failsafes(cancel.clone())));
    handles.push(tokio::spawn({
        let (safety, cancel) = (safety.clone(), cancel.clone());
        async move { safety.run(cancel).await }
    }));
    handles.push(tokio::spawn({
        let (telemetry, cancel) = (telemetry.clone(), cancel.clone());
        async move { telemetry.run(cancel).await }
    }));
    handles.push(tokio::spawn({
        let (exec, cancel) = (exec.clone(), cancel.clone());
        let hz = link_cfg.send_heartbeat_hz;
        async move { exec.run_heartbeat(hz, cancel).await }
    }));
    if let Some(dir) = cfg.core.telemetry.spool_dir.clone() {
        let flush_every = Duration::from_millis(cfg.core.telemetry.interval_ms * telemetry.batch_size() as u64);
        handles.push(tokio::spawn(spool_loop(telemetry.clone(), dir, flush_every, cancel.clone())));
    }

    if let Some(path) = mission.or_else(|| cfg.mission.plan.clone()) {
        start_mission(&conn, &missions, &cfg.mission.limits, &path).await?;
    }

    let mut health = safety.health();
    let outcome = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("wait for ctrl-c")?;
            info!("run: ctrl-c, shutting down");
            Ok(())
        }
        reason = unavailable(&mut health) => {
            error!("run: core unavailable: {}", reason);
            Err(anyhow::anyhow!("core unavailable: {}", reason))
        }
    };

    if let Some(m) = missions.current() {
        warn!("run: leaving {} {:?} at waypoint {}", m.id, m.status, m.current_index);
    }
    cancel.cancel();
    for h in handles {
        let _ = h.await;
    }
    conn.disconnect().await;

    if let Some(dir) = &cfg.core.telemetry.spool_dir {
        match spool_pending(&telemetry, dir).await {
            Ok(n) => info!("run: flushed {} telemetry samples", n),
            Err(e) => warn!("run: telemetry flush failed, {} samples unsent: {:#}", telemetry.len(), e),
        }
    }
    outcome
}

async fn start_mission(
    conn: &ConnectionManager,
    missions: &MissionExecutor,
    limits: &MissionConfig,
    path: &Path,
) -> Result<()> {
    let plan = MissionPlan::load(path)?;

    let mut link = conn.watch();
    tokio::time::timeout(Duration::from_secs(30), link.wait_for(|v| v.link.state == LinkState::Connected))
        .await
        .context("no heartbeat from FC within 30s")?
        .context("link closed")?;

    if limits.geofence_radius_m.is_some() && missions.home().is_none() {
        let fix = tokio::time::timeout(
            Duration::from_secs(30),
            link.wait_for(|v| v.snapshot.gps.as_ref().is_some_and(|g| g.value.fix_type >= 3)),
        )
        .await
        .context("no 3D fix within 30s to set geofence home")?
        .context("link closed")?
        .snapshot
        .gps
        .as_ref()
        .map(|g| (g.value.latitude, g.value.longitude));
        if let (Some((lat, lon)), None) = (fix, missions.home()) {
            missions.set_home(lat, lon);
        }
    }

    let id = missions
        .create(plan.waypoints(limits), plan.default_speed, plan.options())
        .with_context(|| format!("mission plan {}", path.display()))?;
    missions.upload(id).await.context("mission upload")?;
    missions.start(id).await.context("mission start")?;
    let s = missions.status(id)?;
    info!(
        "run: mission {:?} started as {} ({} waypoints, {:.0} m, ~{:.0} s)",
        plan.name, id, s.waypoint_count, s.total_distance_m, s.estimated_duration_s
    );
    Ok(())
}

async fn unavailable(health: &mut watch::Receiver<CoreHealth>) -> String {
    loop {
        if let CoreHealth::Unavailable { reason } = &*health.borrow_and_update() {
            return reason.clone();
        }
        if health.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

async fn spool_loop(telemetry: TelemetryAggregator, dir: PathBuf, every: Duration, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(every.max(Duration::from_secs(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                if let Err(e) = spool_pending(&telemetry, &dir).await {
                    warn!("telemetry spool failed: {:#}", e);
                }
            }
        }
    }
}

/// Writes buffered samples as JSON files of up to one batch each until the
/// buffer is empty. Samples leave the buffer only once their file is written.
async fn spool_pending(telemetry: &TelemetryAggregator, dir: &Path) -> Result<usize> {
    let mut total = 0;
    loop {
        let written = spool_batch(telemetry, dir).await?;
        if written == 0 {
            return Ok(total);
        }
        total += written;
    }
}

async fn spool_batch(telemetry: &TelemetryAggregator, dir: &Path) -> Result<usize> {
    let batch = telemetry.peek_batch(telemetry.batch_size().max(1));
    let Some(last) = batch.last() else {
        return Ok(0);
    };
    tokio::fs::create_dir_all(dir).await.context("create spool dir")?;
    let name = dir.join(format!("{}.json", time::OffsetDateTime::now_utc().unix_timestamp_nanos()));
    let json = serde_json::to_vec(&batch)?;
    tokio::fs::write(&name, json).await.with_context(|| format!("write {}", name.display()))?;
    telemetry.release_through(last.seq);
    debug!("telemetry: spooled {} samples to {}", batch.len(), name.display());
    Ok(batch.len())
}

async fn run_fc_autodetect(link: &LinkConfig) -> Result<AutodetectResult> {
    let codec = MavlinkCodec::from_config(link).context("mavlink codec")?;
    autodetect_fc(&SystemTransport, &codec, &ProbeSettings::from_config(link)).await
}

async fn resolve_transport(link: &LinkConfig) -> Result<TransportConfig> {
    if link.transport == "serial" && link.autodetect {
        let res = run_fc_autodetect(link).await?;
        return res.transport().context("fc autodetect failed: no heartbeat found");
    }
    Ok(link.transport_config()?)
}
