//! End-to-end runs of the core against a simulated autopilot.

use std::{sync::Arc, time::Duration};

use agro_fc::{
    codec::{AckResult, Battery, CommandCode, GpsFix, Message},
    command::CommandKind,
    link::{
        mock::{Autopilot, JsonLinesCodec, MockTransport},
        TransportConfig,
    },
    safety::FailsafeNotice,
    CommandConfig, CommandExecutor, CommandOutcome, CommandPayload, ConnectionManager, LinkConfig, SafetyConfig,
    SafetySupervisor, TelemetryAggregator, TelemetryConfig,
};
use agro_nav::{MissionConfig, MissionExecutor, MissionOptions, MissionStatus, Waypoint};
use agro_proto::{
    failsafe::{ActionTaken, FailsafeAction, FailsafeTrigger},
    LinkState,
};
use tokio_util::sync::CancellationToken;

struct Core {
    transport: Arc<MockTransport>,
    conn: ConnectionManager,
    exec: CommandExecutor,
    safety: SafetySupervisor,
    missions: MissionExecutor,
    pilot: Arc<Autopilot>,
    cancel: CancellationToken,
}

impl Drop for Core {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn core() -> Core {
    let transport = MockTransport::new();
    let conn = ConnectionManager::new(LinkConfig::default(), transport.clone(), Arc::new(JsonLinesCodec));
    let exec = CommandExecutor::attach(&conn, CommandConfig::default());
    let safety = SafetySupervisor::with_link_radio(SafetyConfig::default(), conn.clone(), exec.clone());
    let missions = MissionExecutor::attach(&conn, MissionConfig::default(), exec.clone(), safety.clone());
    let cancel = CancellationToken::new();

    tokio::spawn(missions.watch_failsafes(cancel.clone()));
    tokio::spawn({
        let safety = safety.clone();
        let cancel = cancel.clone();
        async move { safety.run(cancel).await }
    });

    conn.connect(TransportConfig::Tcp { address: "sim:5760".into() }).await.unwrap();
    let pilot = Arc::new(transport.next_vehicle().await.unwrap().autopilot());
    pilot.heartbeat();
    wait_for_link(&conn, LinkState::Connected).await;

    Core { transport, conn, exec, safety, missions, pilot, cancel }
}

/// Keeps the vehicle's heartbeat going at 1 Hz until cancelled.
fn keep_alive(pilot: Arc<Autopilot>, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            pilot.heartbeat();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    });
}

async fn wait_for_link(conn: &ConnectionManager, state: LinkState) {
    let mut rx = conn.watch();
    tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|v| v.link.state == state))
        .await
        .expect("link state not reached")
        .expect("connection manager dropped");
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn battery(pct: u8) -> Message {
    Message::SysStatus(Battery { voltage: Some(11.1), current: Some(4.2), remaining: Some(pct) })
}

fn fix_at(lat: f64, lon: f64) -> Message {
    Message::Gps {
        fix: GpsFix { latitude: lat, longitude: lon, altitude_m: 10.0, fix_type: 3, satellites: 14, hdop: Some(0.6) },
        time_us: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_arm_while_connected_is_accepted() {
    let core = core().await;
    keep_alive(core.pilot.clone(), core.cancel.clone());
    core.pilot.send(&fix_at(45.0, -122.0));
    settle().await;

    let result = core.exec.submit(CommandPayload::Arm { arm: true, force: false }).await;
    assert_eq!(result.outcome, CommandOutcome::Accepted);
    assert!(result.completed_at - result.submitted_at <= Duration::from_secs(2));
    assert!(core.pilot.armed());
    assert_eq!(core.exec.history(10), vec![result]);
}

#[tokio::test(start_paused = true)]
async fn test_lost_heartbeat_triggers_rtl_once() {
    let core = core().await;
    let mut notices = core.safety.subscribe();

    // No more heartbeats from here on.
    wait_for_link(&core.conn, LinkState::Degraded).await;
    tokio::time::sleep(Duration::from_millis(3_300)).await;

    let raised = match notices.recv().await {
        Some(FailsafeNotice::Raised(ev)) => ev,
        other => panic!("expected a raised failsafe, got {:?}", other),
    };
    assert_eq!(raised.trigger, FailsafeTrigger::HeartbeatLoss);
    assert_eq!(raised.action_taken, ActionTaken::Issued(FailsafeAction::SetMode { mode: "RTL".into() }));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(core.pilot.commands(CommandCode::SetMode).len(), 1);
    assert_eq!(core.pilot.custom_mode(), core.exec.mode_number("RTL").unwrap());
    assert_eq!(core.safety.failsafe_log().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_mission_advances_through_waypoints() {
    let core = core().await;
    keep_alive(core.pilot.clone(), core.cancel.clone());

    let waypoints = vec![Waypoint::new(0, 45.0, -122.0, 10.0, 2.0), Waypoint::new(1, 45.001, -122.001, 10.0, 2.0)];
    let id = core.missions.create(waypoints, None, MissionOptions::default()).unwrap();
    core.missions.upload(id).await.unwrap();
    core.missions.start(id).await.unwrap();

    core.pilot.send(&fix_at(45.0, -122.0));
    settle().await;

    let status = core.missions.status(id).unwrap();
    assert_eq!(status.status, MissionStatus::Active);
    assert_eq!(status.current_index, 1);
    let gotos = core.pilot.commands(CommandCode::NavWaypoint);
    assert_eq!(gotos.len(), 2);
    assert_eq!(gotos[1][4], 45.001_f64 as f32);
    assert_eq!(gotos[1][5], -122.001_f64 as f32);
}

#[tokio::test(start_paused = true)]
async fn test_low_battery_lands_and_clears_quietly() {
    let core = core().await;
    keep_alive(core.pilot.clone(), core.cancel.clone());

    core.pilot.send(&battery(9));
    tokio::time::sleep(Duration::from_millis(500)).await;

    let log = core.safety.failsafe_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].trigger, FailsafeTrigger::LowBattery);
    assert_eq!(core.pilot.custom_mode(), core.exec.mode_number("LAND").unwrap());
    assert_eq!(core.pilot.commands(CommandCode::SetMode).len(), 1);

    core.pilot.send(&battery(15));
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    assert!(!core.safety.active().contains(&FailsafeTrigger::LowBattery));
    assert_eq!(core.safety.failsafe_log().len(), 1);
    assert_eq!(core.pilot.commands(CommandCode::SetMode).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failsafe_pauses_active_mission() {
    let core = core().await;
    keep_alive(core.pilot.clone(), core.cancel.clone());

    let waypoints = vec![Waypoint::new(0, 45.0, -122.0, 10.0, 2.0), Waypoint::new(1, 45.001, -122.001, 10.0, 2.0)];
    let id = core.missions.create(waypoints, None, MissionOptions::default()).unwrap();
    core.missions.upload(id).await.unwrap();
    core.missions.start(id).await.unwrap();
    core.pilot.send(&fix_at(45.0, -122.0));
    settle().await;

    core.pilot.send(&battery(5));
    tokio::time::sleep(Duration::from_millis(250)).await;

    let status = core.missions.status(id).unwrap();
    assert_eq!(status.status, MissionStatus::Paused);
    assert_eq!(status.current_index, 1);

    // Frozen while paused, even on arrival at the next waypoint.
    core.pilot.send(&fix_at(45.001, -122.001));
    tokio::time::sleep(Duration::from_secs(5)).await;
    let status = core.missions.status(id).unwrap();
    assert_eq!((status.status, status.current_index), (MissionStatus::Paused, 1));
}

#[tokio::test(start_paused = true)]
async fn test_command_across_reconnect_times_out() {
    let core = core().await;
    core.pilot.silence(CommandCode::ArmDisarm);
    core.pilot.send(&fix_at(45.0, -122.0));
    settle().await;

    let pending = tokio::spawn({
        let exec = core.exec.clone();
        async move { exec.submit(CommandPayload::Arm { arm: true, force: false }).await }
    });
    settle().await;
    assert_eq!(core.pilot.commands(CommandCode::ArmDisarm).len(), 1);

    core.pilot.hang_up();
    let fresh = core.transport.next_vehicle().await.unwrap().autopilot();
    fresh.heartbeat();
    // A late ack on the new link must not resolve the old command.
    fresh.send(&Message::CommandAck { code: CommandCode::ArmDisarm, result: AckResult::Accepted });

    let result = pending.await.unwrap();
    assert_eq!(result.outcome, CommandOutcome::TimedOut);
    assert_eq!(result.kind, CommandKind::Arm);
    assert!(fresh.commands(CommandCode::ArmDisarm).is_empty());
    assert_eq!(core.exec.history(10).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_telemetry_stays_bounded_and_ordered() {
    let core = core().await;
    keep_alive(core.pilot.clone(), core.cancel.clone());
    let cfg = TelemetryConfig { interval_ms: 100, capacity: 5, ..TelemetryConfig::default() };
    let telemetry = TelemetryAggregator::new(cfg, core.conn.clone());
    tokio::spawn({
        let telemetry = telemetry.clone();
        let cancel = core.cancel.clone();
        async move { telemetry.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(1_050)).await;
    assert_eq!(telemetry.len(), 5);
    assert!(telemetry.stats().evicted >= 5);

    let batch = telemetry.drain_batch(3);
    assert_eq!(batch.len(), 3);
    assert!(batch.windows(2).all(|w| w[0].seq < w[1].seq && w[0].ts_unix_ms <= w[1].ts_unix_ms));
    let rest = telemetry.drain_batch(100);
    assert!(rest.first().map(|s| s.seq) > batch.last().map(|s| s.seq));
    assert!(rest.iter().all(|s| s.link_state == LinkState::Connected));
}
