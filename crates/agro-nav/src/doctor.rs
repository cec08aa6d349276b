use anyhow::Result;

use crate::mission::{self, MissionConfig};
use crate::plan::MissionPlan;

pub fn check_mission_config(cfg: &MissionConfig) -> Result<()> {
    anyhow::ensure!(cfg.max_waypoints >= 1 && cfg.max_waypoints <= u16::MAX as usize, "mission.max_waypoints out of range");
    anyhow::ensure!(cfg.default_acceptance_m > 0.0, "mission.default_acceptance_m must be > 0");
    anyhow::ensure!(cfg.max_altitude_m > 0.0, "mission.max_altitude_m must be > 0");
    anyhow::ensure!(
        cfg.default_speed_mps > 0.0 && cfg.default_speed_mps <= cfg.max_speed_mps,
        "mission.default_speed_mps must be in (0, max_speed_mps]"
    );
    anyhow::ensure!(!cfg.hold_mode.is_empty(), "mission.hold_mode missing");
    anyhow::ensure!(!cfg.rtl_mode.is_empty(), "mission.rtl_mode missing");
    if let Some(radius) = cfg.geofence_radius_m {
        anyhow::ensure!(radius.is_finite() && radius > 0.0, "mission.geofence_radius_m must be > 0");
    }
    Ok(())
}

/// Validates a plan the way `MissionExecutor::create` would. Returns the
/// path length in metres.
pub fn check_mission_plan(plan: &MissionPlan, cfg: &MissionConfig) -> Result<f64> {
    anyhow::ensure!(!plan.name.trim().is_empty(), "mission plan name missing");
    let waypoints = plan.waypoints(cfg);
    mission::validate(&waypoints, plan.default_speed, &plan.options(), cfg)?;
    let mut ordered = waypoints;
    ordered.sort_by_key(|w| w.sequence_index);
    Ok(mission::total_distance_m(&ordered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanWaypoint;

    fn plan(waypoints: Vec<PlanWaypoint>) -> MissionPlan {
        MissionPlan {
            name: "test".into(),
            default_speed: None,
            return_to_launch: false,
            vertical_tolerance_m: None,
            waypoints,
        }
    }

    fn wp(sequence: u16, latitude: f64) -> PlanWaypoint {
        PlanWaypoint { sequence, latitude, longitude: -122.0, altitude: 10.0, acceptance_radius: None, hold_s: 0.0 }
    }

    #[test]
    fn test_default_config_passes() {
        check_mission_config(&MissionConfig::default()).unwrap();
        let bad = MissionConfig { default_speed_mps: 50.0, ..MissionConfig::default() };
        assert!(check_mission_config(&bad).is_err());
    }

    #[test]
    fn test_plan_check_reports_distance() {
        let cfg = MissionConfig::default();
        let d = check_mission_plan(&plan(vec![wp(1, 45.001), wp(0, 45.0)]), &cfg).unwrap();
        assert!((d - 111.19).abs() < 0.5, "got {d}");
    }

    #[test]
    fn test_plan_check_rejects_invalid() {
        let cfg = MissionConfig::default();
        let err = check_mission_plan(&plan(vec![wp(0, 95.0)]), &cfg).unwrap_err();
        assert!(err.to_string().contains("latitude"));
        assert!(check_mission_plan(&plan(vec![]), &cfg).is_err());
    }
}
