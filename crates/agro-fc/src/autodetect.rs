use std::time::Duration;

use anyhow::Result;
use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    codec::{Decoded, Message, MessageCodec},
    error::LinkError,
    link::{LinkTransport, TransportConfig},
    LinkConfig,
};

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub dev: String,
    pub baud: u32,
    pub hb_seen: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct AutodetectResult {
    pub chosen: Option<(String, u32)>,
    pub probes: Vec<ProbeResult>,
}

impl AutodetectResult {
    pub fn transport(&self) -> Option<TransportConfig> {
        self.chosen
            .as_ref()
            .map(|(dev, baud)| TransportConfig::Serial { dev: dev.clone(), baud: *baud })
    }
}

pub fn default_candidate_devs() -> Vec<String> {
    vec![
        "/dev/serial0".into(),
        "/dev/ttyAMA0".into(),
        "/dev/ttyS0".into(),
        "/dev/ttyUSB0".into(),
        "/dev/ttyUSB1".into(),
        "/dev/ttyACM0".into(),
        "/dev/ttyACM1".into(),
    ]
}

pub fn default_candidate_bauds() -> Vec<u32> {
    vec![57600, 115200, 230400, 921600]
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub candidate_devs: Vec<String>,
    pub candidate_bauds: Vec<u32>,
    pub heartbeat_timeout: Duration,
}

impl ProbeSettings {
    pub fn from_config(cfg: &LinkConfig) -> Self {
        Self {
            candidate_devs: cfg.candidate_devs.clone().unwrap_or_else(default_candidate_devs),
            candidate_bauds: cfg.candidate_bauds.clone().unwrap_or_else(default_candidate_bauds),
            heartbeat_timeout: Duration::from_millis(cfg.probe_timeout_ms.unwrap_or(1500)),
        }
    }
}

/// Tries every device × baud until one yields a heartbeat.
pub async fn autodetect_fc(
    transport: &dyn LinkTransport,
    codec: &dyn MessageCodec,
    settings: &ProbeSettings,
) -> Result<AutodetectResult> {
    let mut probes = Vec::new();

    for dev in &settings.candidate_devs {
        for baud in &settings.candidate_bauds {
            let start = Instant::now();
            let target = TransportConfig::Serial { dev: dev.clone(), baud: *baud };
            let (hb_seen, note) = match probe(transport, codec, &target, settings.heartbeat_timeout).await {
                Ok(true) => (true, "heartbeat".to_string()),
                Ok(false) => (false, "no heartbeat".to_string()),
                Err(e) => {
                    warn!("fc autodetect probe failed dev={} baud={} err={}", dev, baud, e);
                    (false, format!("open/connect failed: {}", e))
                }
            };
            probes.push(ProbeResult {
                dev: dev.clone(),
                baud: *baud,
                hb_seen,
                elapsed_ms: start.elapsed().as_millis() as u64,
                note,
            });
            if hb_seen {
                info!("fc autodetect: OK {} @ {}", dev, baud);
                return Ok(AutodetectResult { chosen: Some((dev.clone(), *baud)), probes });
            }
        }
    }

    Ok(AutodetectResult { chosen: None, probes })
}

async fn probe(
    transport: &dyn LinkTransport,
    codec: &dyn MessageCodec,
    target: &TransportConfig,
    timeout: Duration,
) -> Result<bool, LinkError> {
    let mut io = transport.open(target).await?;
    let wait = async {
        let mut buf = BytesMut::with_capacity(1024);
        let mut chunk = vec![0u8; 512];
        loop {
            let n = io.reader.read(&mut chunk[..]).await?;
            if n == 0 {
                return Ok::<_, LinkError>(false);
            }
            buf.extend_from_slice(&chunk[..n]);
            loop {
                match codec.decode(&mut buf) {
                    Ok(Decoded::Message(Message::Heartbeat(_))) => return Ok(true),
                    Ok(Decoded::Message(_)) | Err(_) => continue,
                    Ok(Decoded::NeedMoreData) => break,
                }
            }
        }
    };
    let seen = tokio::time::timeout(timeout, wait).await.unwrap_or(Ok(false));
    let _ = io.writer.close().await;
    seen
}
