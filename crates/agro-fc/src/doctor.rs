use anyhow::Result;

use crate::CoreConfig;

pub fn check_core_config(cfg: &CoreConfig) -> Result<()> {
    check_link(cfg)?;
    check_commands(cfg)?;
    check_safety(cfg)?;
    anyhow::ensure!(cfg.telemetry.interval_ms >= 50, "telemetry.interval_ms too small");
    anyhow::ensure!(cfg.telemetry.capacity >= 1, "telemetry.capacity must be >= 1");
    anyhow::ensure!(cfg.telemetry.batch_size >= 1, "telemetry.batch_size must be >= 1");
    Ok(())
}

fn check_link(cfg: &CoreConfig) -> Result<()> {
    let link = &cfg.link;
    if !(link.transport == "serial" && link.autodetect) {
        link.transport_config()?;
    }
    anyhow::ensure!(link.heartbeat_timeout_ms >= 500, "link.heartbeat_timeout_ms should be >= 500");
    anyhow::ensure!(
        link.reconnect_base_ms >= 100 && link.reconnect_base_ms <= link.reconnect_max_ms,
        "link.reconnect_base_ms must be >= 100 and <= reconnect_max_ms"
    );
    anyhow::ensure!(link.sys_id != link.target_sys, "link.sys_id must differ from link.target_sys");
    anyhow::ensure!(
        matches!(link.mavlink_version.to_ascii_uppercase().as_str(), "V1" | "V2"),
        "link.mavlink_version must be V1 or V2"
    );
    Ok(())
}

fn check_commands(cfg: &CoreConfig) -> Result<()> {
    let c = &cfg.commands;
    anyhow::ensure!(c.max_independent_in_flight >= 1, "commands.max_independent_in_flight must be >= 1");
    for (name, ms) in [
        ("arm_timeout_ms", c.arm_timeout_ms),
        ("mode_timeout_ms", c.mode_timeout_ms),
        ("goto_timeout_ms", c.goto_timeout_ms),
        ("upload_timeout_ms", c.upload_timeout_ms),
        ("mission_start_timeout_ms", c.mission_start_timeout_ms),
    ] {
        anyhow::ensure!(ms >= 100, "commands.{} too small", name);
    }
    let p = &c.pre_arm;
    anyhow::ensure!(p.min_fix_type <= 6, "commands.pre_arm.min_fix_type should be 0..6");
    if let Some(hdop) = p.max_hdop {
        anyhow::ensure!(hdop.is_finite() && hdop > 0.0, "commands.pre_arm.max_hdop must be > 0");
    }
    Ok(())
}

fn check_safety(cfg: &CoreConfig) -> Result<()> {
    let s = &cfg.safety;
    anyhow::ensure!(s.tick_ms >= 10 && s.tick_ms <= 1000, "safety.tick_ms should be 10..1000");
    anyhow::ensure!(
        (0.0..=1.0).contains(&s.rc_min_signal),
        "safety.rc_min_signal should be 0..1"
    );
    anyhow::ensure!(s.battery_critical_pct <= 100, "safety.battery_critical_pct should be 0..100");
    anyhow::ensure!(s.action_retry_ms >= s.tick_ms, "safety.action_retry_ms should be >= safety.tick_ms");
    anyhow::ensure!(
        s.fatal_ceiling_ms > cfg.link.heartbeat_timeout_ms + s.heartbeat_grace_ms,
        "safety.fatal_ceiling_ms must exceed heartbeat timeout + grace"
    );

    let modes: Vec<String> = cfg.commands.modes.keys().map(|m| m.to_ascii_uppercase()).collect();
    for trigger in ["heartbeat_loss", "rc_loss", "low_battery", "gps_loss", "manual"] {
        let action = match trigger {
            "heartbeat_loss" => &s.actions.heartbeat_loss,
            "rc_loss" => &s.actions.rc_loss,
            "low_battery" => &s.actions.low_battery,
            "gps_loss" => &s.actions.gps_loss,
            _ => &s.actions.manual,
        };
        if let Some(mode) = action.target_mode() {
            anyhow::ensure!(
                modes.contains(&mode.to_ascii_uppercase()),
                "safety.actions.{}: mode {} not in commands.modes",
                trigger,
                mode
            );
        }
    }
    Ok(())
}
