pub mod doctor;
pub mod geo;
pub mod mission;
pub mod plan;

pub use mission::{
    MissionConfig, MissionError, MissionExecutor, MissionId, MissionOptions, MissionStatus, MissionSummary,
    MissionValidationError, Waypoint,
};
pub use plan::MissionPlan;
