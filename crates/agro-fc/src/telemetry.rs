use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use agro_proto::{telemetry::TelemetrySample, unix_ms_now, LinkState};
use serde::Deserialize;
use tokio::{sync::broadcast, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{connection::ConnectionManager, state::VehicleSnapshot, subscription::Subscription};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub interval_ms: u64,
    /// Ring buffer size. The oldest sample is evicted once full.
    pub capacity: usize,
    /// Default `drain_batch` size for the uploader.
    pub batch_size: usize,
    pub live_capacity: usize,
    /// Where the binary spools drained batches. Unused by the core.
    pub spool_dir: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            capacity: 500,
            batch_size: 100,
            live_capacity: 64,
            spool_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    pub sampled: u64,
    pub evicted: u64,
    pub drained: u64,
}

struct Ring {
    samples: VecDeque<TelemetrySample>,
    next_seq: u64,
    last_ts: i64,
    stats: TelemetryStats,
}

/// Samples the vehicle snapshot at a fixed rate into a bounded buffer that
/// the uploader drains in batches.
#[derive(Clone)]
pub struct TelemetryAggregator {
    inner: Arc<TelemInner>,
}

struct TelemInner {
    cfg: TelemetryConfig,
    conn: ConnectionManager,
    ring: Mutex<Ring>,
    live: broadcast::Sender<TelemetrySample>,
}

impl TelemetryAggregator {
    pub fn new(cfg: TelemetryConfig, conn: ConnectionManager) -> Self {
        let (live, _) = broadcast::channel(cfg.live_capacity.max(1));
        let ring = Ring {
            samples: VecDeque::with_capacity(cfg.capacity),
            next_seq: 1,
            last_ts: i64::MIN,
            stats: TelemetryStats::default(),
        };
        Self { inner: Arc::new(TelemInner { cfg, conn, ring: Mutex::new(ring), live }) }
    }

    /// Takes one sample now, buffers it and publishes it live.
    pub fn sample_now(&self) -> TelemetrySample {
        let (state, snapshot) = self.inner.conn.current_state();
        let sample = {
            let mut ring = self.inner.ring();
            // Wall clock may step backwards; sample order must not.
            let ts = unix_ms_now().max(ring.last_ts);
            ring.last_ts = ts;
            let sample = to_sample(ring.next_seq, ts, state, &snapshot);
            ring.next_seq += 1;
            ring.stats.sampled += 1;

            if self.inner.cfg.capacity == 0 {
                ring.stats.evicted += 1;
            } else {
                while ring.samples.len() >= self.inner.cfg.capacity {
                    ring.samples.pop_front();
                    ring.stats.evicted += 1;
                }
                ring.samples.push_back(sample.clone());
            }
            sample
        };
        let _ = self.inner.live.send(sample.clone());
        sample
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let period = Duration::from_millis(self.inner.cfg.interval_ms.max(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("telemetry: sampling every {:?}", period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let sample = self.sample_now();
                    debug!("telemetry: sample {} ({:?})", sample.seq, sample.link_state);
                }
            }
        }
    }

    /// Removes and returns up to `max` of the oldest samples.
    pub fn drain_batch(&self, max: usize) -> Vec<TelemetrySample> {
        let mut ring = self.inner.ring();
        let n = max.min(ring.samples.len());
        let batch: Vec<_> = ring.samples.drain(..n).collect();
        ring.stats.drained += batch.len() as u64;
        batch
    }

    /// Copies up to `max` of the oldest samples, leaving them buffered until
    /// [`release_through`](Self::release_through).
    pub fn peek_batch(&self, max: usize) -> Vec<TelemetrySample> {
        self.inner.ring().samples.iter().take(max).cloned().collect()
    }

    /// Drops buffered samples up to and including `seq` once they have been
    /// delivered. Returns how many were removed.
    pub fn release_through(&self, seq: u64) -> usize {
        let mut ring = self.inner.ring();
        let n = ring.samples.iter().take_while(|s| s.seq <= seq).count();
        ring.samples.drain(..n);
        ring.stats.drained += n as u64;
        n
    }

    pub fn batch_size(&self) -> usize {
        self.inner.cfg.batch_size
    }

    /// Latest buffered sample first, then every new one.
    pub fn subscribe(&self) -> Subscription<TelemetrySample> {
        let ring = self.inner.ring();
        let rx = self.inner.live.subscribe();
        Subscription::new(ring.samples.back().cloned(), rx)
    }

    pub fn len(&self) -> usize {
        self.inner.ring().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TelemetryStats {
        self.inner.ring().stats
    }
}

impl TelemInner {
    fn ring(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn to_sample(seq: u64, ts: i64, state: LinkState, snap: &VehicleSnapshot) -> TelemetrySample {
    let mut sample = TelemetrySample::empty(seq, ts, state);
    if let Some(hb) = &snap.heartbeat {
        sample.armed = Some(hb.value.armed);
        sample.custom_mode = Some(hb.value.custom_mode);
    }
    if let Some(gps) = &snap.gps {
        sample.lat = Some(gps.value.latitude);
        sample.lon = Some(gps.value.longitude);
        sample.alt_m = Some(gps.value.altitude_m);
        sample.fix_type = Some(gps.value.fix_type);
        sample.satellites = Some(gps.value.satellites);
        sample.hdop = gps.value.hdop;
    }
    if let Some(att) = &snap.attitude {
        sample.roll = Some(att.value.roll);
        sample.pitch = Some(att.value.pitch);
        sample.yaw = Some(att.value.yaw);
    }
    if let Some(bat) = &snap.battery {
        sample.battery_voltage = bat.value.voltage;
        sample.battery_percent = bat.value.remaining;
        sample.battery_current = bat.value.current;
    }
    if let Some(rc) = &snap.rc {
        sample.rc_rssi = Some(rc.value.rssi);
    }
    sample
}
