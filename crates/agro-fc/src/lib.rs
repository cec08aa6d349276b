pub mod autodetect;
pub mod codec;
pub mod command;
pub mod connection;
pub mod doctor;
pub mod error;
pub mod link;
pub mod safety;
pub mod state;
pub mod subscription;
pub mod telemetry;

use std::time::Duration;

use serde::Deserialize;

pub use command::{CommandConfig, CommandExecutor, CommandOutcome, CommandPayload, CommandResult};
pub use connection::{ConnectionManager, LinkObserver};
pub use error::{CodecError, LinkError};
pub use safety::{SafetyConfig, SafetySupervisor};
pub use telemetry::{TelemetryAggregator, TelemetryConfig};

/// Everything the core needs, one section per component.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub link: LinkConfig,
    pub commands: CommandConfig,
    pub safety: SafetyConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// "serial", "tcp" or "udp".
    pub transport: String,

    /// If true, probe candidate serial ports/bauds and pick the first
    /// that yields a MAVLink HEARTBEAT. Serial only.
    pub autodetect: bool,

    /// Fixed serial port when autodetect=false.
    pub serial_dev: Option<String>,
    pub baud: Option<u32>,

    /// host:port to dial (tcp) or bind (udp).
    pub address: Option<String>,

    /// Autodetect candidates, e.g.
    /// ["/dev/serial0","/dev/ttyAMA0","/dev/ttyS0","/dev/ttyUSB0","/dev/ttyACM0"]
    pub candidate_devs: Option<Vec<String>>,
    pub candidate_bauds: Option<Vec<u32>>,

    /// Heartbeat wait per probe attempt.
    pub probe_timeout_ms: Option<u64>,

    /// MAVLink ids we use (companion side).
    pub sys_id: u8,
    pub comp_id: u8,

    /// FC side. 1/1 is common for ArduPilot. 0 accepts any.
    pub target_sys: u8,
    pub target_comp: u8,

    /// "V1" or "V2".
    pub mavlink_version: String,

    pub heartbeat_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,

    /// Companion heartbeat rate. 0 disables.
    pub send_heartbeat_hz: f32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            transport: "serial".into(),
            autodetect: false,
            serial_dev: None,
            baud: None,
            address: None,
            candidate_devs: None,
            candidate_bauds: None,
            probe_timeout_ms: None,
            sys_id: 255,
            comp_id: 190,
            target_sys: 1,
            target_comp: 1,
            mavlink_version: "V2".into(),
            heartbeat_timeout_ms: 3000,
            reconnect_base_ms: 1000,
            reconnect_max_ms: 30_000,
            send_heartbeat_hz: 1.0,
        }
    }
}

impl LinkConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Delay before reconnect attempt `attempt` (0-based): base doubling up to max.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .reconnect_base_ms
            .saturating_mul(factor)
            .min(self.reconnect_max_ms);
        Duration::from_millis(ms)
    }

    /// Fixed transport described by this section. Autodetect is resolved by the caller.
    pub fn transport_config(&self) -> Result<link::TransportConfig, LinkError> {
        match self.transport.as_str() {
            "serial" => {
                let dev = self
                    .serial_dev
                    .clone()
                    .ok_or_else(|| LinkError::Config("link.serial_dev missing".into()))?;
                let baud = self
                    .baud
                    .ok_or_else(|| LinkError::Config("link.baud missing".into()))?;
                Ok(link::TransportConfig::Serial { dev, baud })
            }
            "tcp" => Ok(link::TransportConfig::Tcp { address: self.require_address()? }),
            "udp" => Ok(link::TransportConfig::Udp { bind: self.require_address()? }),
            other => Err(LinkError::Config(format!("unknown transport {other:?}"))),
        }
    }

    fn require_address(&self) -> Result<String, LinkError> {
        self.address
            .clone()
            .ok_or_else(|| LinkError::Config("link.address missing".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg: CoreConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.link.heartbeat_timeout_ms, 3000);
        assert_eq!(cfg.commands.max_independent_in_flight, 4);
        assert_eq!(cfg.safety.tick_ms, 200);
        assert_eq!(cfg.telemetry.capacity, 500);
    }

    #[test]
    fn test_reconnect_delay_doubles_and_caps() {
        let cfg = LinkConfig::default();
        assert_eq!(cfg.reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(cfg.reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(cfg.reconnect_delay(4), Duration::from_secs(16));
        assert_eq!(cfg.reconnect_delay(5), Duration::from_secs(30));
        assert_eq!(cfg.reconnect_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_transport_config_requires_address() {
        let cfg = LinkConfig { transport: "tcp".into(), ..Default::default() };
        assert!(matches!(cfg.transport_config(), Err(LinkError::Config(_))));

        let cfg = LinkConfig {
            transport: "udp".into(),
            address: Some("0.0.0.0:14550".into()),
            ..Default::default()
        };
        assert!(matches!(
            cfg.transport_config(),
            Ok(link::TransportConfig::Udp { bind }) if bind == "0.0.0.0:14550"
        ));
    }
}
