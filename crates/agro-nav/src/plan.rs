use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::mission::{MissionConfig, MissionOptions, Waypoint};

/// Mission as written in a plan file.
#[derive(Debug, Clone, Deserialize)]
pub struct MissionPlan {
    pub name: String,
    /// m/s; the mission config default applies when unset.
    pub default_speed: Option<f32>,
    #[serde(default)]
    pub return_to_launch: bool,
    pub vertical_tolerance_m: Option<f32>,
    pub waypoints: Vec<PlanWaypoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanWaypoint {
    pub sequence: u16,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f32,
    pub acceptance_radius: Option<f32>,
    #[serde(default)]
    pub hold_s: f32,
}

impl MissionPlan {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).with_context(|| format!("read mission plan {}", path.display()))?;
        toml::from_str(&s).context("parse mission plan toml")
    }

    pub fn waypoints(&self, cfg: &MissionConfig) -> Vec<Waypoint> {
        self.waypoints
            .iter()
            .map(|w| Waypoint {
                sequence_index: w.sequence,
                latitude: w.latitude,
                longitude: w.longitude,
                altitude: w.altitude,
                acceptance_radius: w.acceptance_radius.unwrap_or(cfg.default_acceptance_m),
                hold_s: w.hold_s,
            })
            .collect()
    }

    pub fn options(&self) -> MissionOptions {
        MissionOptions { return_to_launch: self.return_to_launch, vertical_tolerance_m: self.vertical_tolerance_m }
    }
}
