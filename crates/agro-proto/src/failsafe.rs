use std::fmt;

use serde::{Deserialize, Serialize};

/// Condition that raised a failsafe. Variant order is evaluation priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailsafeTrigger {
    HeartbeatLoss,
    RcLoss,
    LowBattery,
    GpsLoss,
    Manual,
}

impl FailsafeTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailsafeTrigger::HeartbeatLoss => "heartbeat-loss",
            FailsafeTrigger::RcLoss => "rc-loss",
            FailsafeTrigger::LowBattery => "low-battery",
            FailsafeTrigger::GpsLoss => "gps-loss",
            FailsafeTrigger::Manual => "manual",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            FailsafeTrigger::HeartbeatLoss | FailsafeTrigger::LowBattery | FailsafeTrigger::Manual => {
                Severity::Critical
            }
            FailsafeTrigger::RcLoss | FailsafeTrigger::GpsLoss => Severity::Warning,
        }
    }
}

impl fmt::Display for FailsafeTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

/// Corrective action configured for a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FailsafeAction {
    /// Switch the vehicle into `mode` (e.g. RTL, LAND).
    SetMode { mode: String },
    /// Pause the active mission and hold position in `mode`.
    HoldPosition { mode: String },
    Disarm { force: bool },
    None,
}

impl FailsafeAction {
    /// Mode the vehicle ends up in once the action is applied, if any.
    pub fn target_mode(&self) -> Option<&str> {
        match self {
            FailsafeAction::SetMode { mode } | FailsafeAction::HoldPosition { mode } => Some(mode),
            FailsafeAction::Disarm { .. } | FailsafeAction::None => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTaken {
    /// Corrective command handed to the command executor.
    Issued(FailsafeAction),
    /// The vehicle already reports the corrective mode; nothing was sent.
    AlreadyActive(FailsafeAction),
    NoAction,
    /// Follow-up entry: the corrective command for an earlier event was
    /// rejected or timed out.
    Failed { action: FailsafeAction, detail: String },
}

/// Append-only failsafe log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailsafeEvent {
    pub id: u64,
    pub trigger: FailsafeTrigger,
    pub severity: Severity,
    pub raised_unix_ms: i64,
    pub action_taken: ActionTaken,
    pub detail: String,
}
