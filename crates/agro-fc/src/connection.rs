//! Owns the link: opens it, runs the read loop, tracks heartbeat liveness,
//! reconnects with backoff, and publishes the vehicle snapshot.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use agro_proto::LinkState;
use bytes::BytesMut;
use tokio::{
    sync::{broadcast, watch, Mutex, MutexGuard},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    codec::{Decoded, Message, MessageCodec, Outbound},
    error::LinkError,
    link::{LinkReader, LinkTransport, LinkWriter, TransportConfig},
    state::{LinkStatus, VehicleSnapshot},
    subscription::Subscription,
    LinkConfig,
};

const READ_CHUNK: usize = 1024;
const UPDATES_CAPACITY: usize = 64;

/// Hooks run synchronously on the read loop. Implementations must not block.
pub trait LinkObserver: Send + Sync {
    fn on_snapshot(&self, _snapshot: &Arc<VehicleSnapshot>) {}
    /// Acks and mission handshake messages, with the session they arrived on.
    fn on_control(&self, _msg: &Message, _session: u64) {}
    fn on_link_state(&self, _status: &LinkStatus) {}
}

/// Link status and snapshot, always published together.
#[derive(Debug, Clone)]
pub struct LinkView {
    pub link: LinkStatus,
    pub snapshot: Arc<VehicleSnapshot>,
}

/// Shared write half of the current link.
#[derive(Clone)]
pub struct OutboundLink {
    inner: Arc<OutboundInner>,
}

struct OutboundInner {
    writer: Mutex<Option<(u64, Box<dyn LinkWriter>)>>,
    codec: Arc<dyn MessageCodec>,
}

impl OutboundLink {
    fn new(codec: Arc<dyn MessageCodec>) -> Self {
        Self { inner: Arc::new(OutboundInner { writer: Mutex::new(None), codec }) }
    }

    /// Holds the writer so callers can note the session before the bytes
    /// leave, and nothing else interleaves.
    pub async fn lock(&self) -> OutboundGuard<'_> {
        OutboundGuard { slot: self.inner.writer.lock().await, codec: self.inner.codec.as_ref() }
    }

    /// Encodes and writes one message. Returns the session it went out on.
    pub async fn send(&self, out: &Outbound) -> Result<u64, LinkError> {
        self.lock().await.send(out).await
    }

    async fn install(&self, session: u64, writer: Box<dyn LinkWriter>) {
        *self.inner.writer.lock().await = Some((session, writer));
    }

    async fn take(&self) -> Option<Box<dyn LinkWriter>> {
        self.inner.writer.lock().await.take().map(|(_, w)| w)
    }
}

pub struct OutboundGuard<'a> {
    slot: MutexGuard<'a, Option<(u64, Box<dyn LinkWriter>)>>,
    codec: &'a dyn MessageCodec,
}

impl OutboundGuard<'_> {
    /// `None` while no link is open.
    pub fn session(&self) -> Option<u64> {
        self.slot.as_ref().map(|(session, _)| *session)
    }

    pub async fn send(&mut self, out: &Outbound) -> Result<u64, LinkError> {
        let bytes = self.codec.encode(out)?;
        let (session, writer) = self.slot.as_mut().ok_or(LinkError::NotConnected)?;
        writer.write(&bytes).await?;
        Ok(*session)
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: LinkConfig,
    transport: Arc<dyn LinkTransport>,
    codec: Arc<dyn MessageCodec>,
    outbound: OutboundLink,
    view_tx: watch::Sender<LinkView>,
    updates_tx: broadcast::Sender<Arc<VehicleSnapshot>>,
    observers: RwLock<Vec<Arc<dyn LinkObserver>>>,
    running: Mutex<Option<Running>>,
    decode_errors: AtomicU64,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

enum PumpExit {
    Cancelled,
    Closed { reason: String, saw_heartbeat: bool },
}

impl ConnectionManager {
    pub fn new(
        cfg: LinkConfig,
        transport: Arc<dyn LinkTransport>,
        codec: Arc<dyn MessageCodec>,
    ) -> Self {
        let view = LinkView {
            link: LinkStatus::new(Instant::now()),
            snapshot: Arc::new(VehicleSnapshot::default()),
        };
        let (view_tx, _) = watch::channel(view);
        let (updates_tx, _) = broadcast::channel(UPDATES_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                outbound: OutboundLink::new(codec.clone()),
                cfg,
                transport,
                codec,
                view_tx,
                updates_tx,
                observers: RwLock::new(Vec::new()),
                running: Mutex::new(None),
                decode_errors: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.cfg
    }

    /// Opens the link and starts the read loop. Once this returns `Ok`, link
    /// loss is handled by reconnecting until [`disconnect`](Self::disconnect).
    pub async fn connect(&self, target: TransportConfig) -> Result<(), LinkError> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            debug!("fc: connect while already connected, ignoring");
            return Ok(());
        }

        let io = self.inner.transport.open(&target).await.map_err(|e| {
            warn!("fc: open {} failed: {}", target, e);
            e
        })?;
        let session = self.inner.link_status().session + 1;
        self.inner.outbound.install(session, io.writer).await;
        self.inner.transition(LinkState::Connecting, |s| {
            s.session = session;
            s.wanted = true;
            s.reconnect_failures = 0;
        });
        info!("fc: link open on {} (session {})", target, session);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(read_loop(self.inner.clone(), io.reader, target, cancel.clone()));
        *running = Some(Running { cancel, task });
        Ok(())
    }

    /// Stops the read loop and any reconnect attempts and closes the link.
    /// Safe to call at any time, any number of times.
    pub async fn disconnect(&self) {
        let running = self.inner.running.lock().await.take();
        if let Some(Running { cancel, task }) = running {
            cancel.cancel();
            if let Err(e) = task.await {
                warn!("fc: read loop ended abnormally: {}", e);
            }
        }
        if let Some(mut writer) = self.inner.outbound.take().await {
            if let Err(e) = writer.close().await {
                debug!("fc: close: {}", e);
            }
        }
        self.inner.transition(LinkState::Disconnected, |s| s.wanted = false);
    }

    /// Link state and snapshot as one consistent pair.
    pub fn current_state(&self) -> (LinkState, Arc<VehicleSnapshot>) {
        let view = self.inner.view_tx.borrow();
        (view.link.state, view.snapshot.clone())
    }

    pub fn link_status(&self) -> LinkStatus {
        self.inner.link_status()
    }

    pub fn snapshot(&self) -> Arc<VehicleSnapshot> {
        self.inner.view_tx.borrow().snapshot.clone()
    }

    pub fn view(&self) -> LinkView {
        self.inner.view_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<LinkView> {
        self.inner.view_tx.subscribe()
    }

    /// Current snapshot first, then every update.
    pub fn subscribe(&self) -> Subscription<Arc<VehicleSnapshot>> {
        let rx = self.inner.updates_tx.subscribe();
        Subscription::new(Some(self.snapshot()), rx)
    }

    pub fn add_observer(&self, observer: Arc<dyn LinkObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn outbound(&self) -> OutboundLink {
        self.inner.outbound.clone()
    }

    pub fn decode_errors(&self) -> u64 {
        self.inner.decode_errors.load(Ordering::Relaxed)
    }
}

impl Inner {
    fn link_status(&self) -> LinkStatus {
        self.view_tx.borrow().link
    }

    fn observers(&self) -> Vec<Arc<dyn LinkObserver>> {
        self.observers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Moves to `state` (restamping `since` only on an actual change) and
    /// applies `edit` in the same publish.
    fn transition(&self, state: LinkState, edit: impl FnOnce(&mut LinkStatus)) {
        let mut entered = None;
        self.view_tx.send_if_modified(|view| {
            let before = view.link;
            edit(&mut view.link);
            if view.link.state != state {
                entered = Some(view.link.state);
                view.link.state = state;
                view.link.since = Instant::now();
            }
            view.link != before
        });

        if let Some(from) = entered {
            info!("fc: link {:?} -> {:?}", from, state);
            let status = self.link_status();
            for obs in self.observers() {
                obs.on_link_state(&status);
            }
        }
    }

    async fn pump(&self, reader: &mut dyn LinkReader, cancel: &CancellationToken) -> PumpExit {
        let session = self.link_status().session;
        let hb_timeout = self.cfg.heartbeat_timeout();
        let deadline = tokio::time::sleep(hb_timeout);
        tokio::pin!(deadline);
        let mut watching = false;
        let mut saw_heartbeat = false;

        let mut buf = BytesMut::with_capacity(READ_CHUNK * 4);
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return PumpExit::Cancelled,
                _ = &mut deadline, if watching => {
                    watching = false;
                    warn!("fc: no heartbeat for {:?}", hb_timeout);
                    self.transition(LinkState::Degraded, |_| {});
                }
                res = reader.read(&mut chunk[..]) => {
                    let n = match res {
                        Ok(0) => return PumpExit::Closed { reason: "peer closed".into(), saw_heartbeat },
                        Ok(n) => n,
                        Err(e) => return PumpExit::Closed { reason: e.to_string(), saw_heartbeat },
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    while let Some(msg) = self.next_message(&mut buf) {
                        if matches!(msg, Message::Heartbeat(_)) {
                            deadline.as_mut().reset(Instant::now() + hb_timeout);
                            watching = true;
                            saw_heartbeat = true;
                        }
                        self.dispatch(msg, session);
                    }
                }
            }
        }
    }

    fn next_message(&self, buf: &mut BytesMut) -> Option<Message> {
        loop {
            match self.codec.decode(buf) {
                Ok(Decoded::Message(msg)) => return Some(msg),
                Ok(Decoded::NeedMoreData) => return None,
                Err(e) => {
                    self.decode_errors.fetch_add(1, Ordering::Relaxed);
                    debug!("fc: {}", e);
                }
            }
        }
    }

    fn dispatch(&self, msg: Message, session: u64) {
        if msg.is_control() {
            for obs in self.observers() {
                obs.on_control(&msg, session);
            }
            return;
        }
        if matches!(msg, Message::Other) {
            trace!("fc: ignoring message");
            return;
        }

        let now = Instant::now();
        let mut published = None;
        self.view_tx.send_if_modified(|view| {
            let mut next = (*view.snapshot).clone();
            if !next.apply(&msg, now, session) {
                return false;
            }
            let next = Arc::new(next);
            view.snapshot = next.clone();
            published = Some(next);
            true
        });

        if matches!(msg, Message::Heartbeat(_)) {
            self.transition(LinkState::Connected, |s| s.reconnect_failures = 0);
        }

        if let Some(snapshot) = published {
            let _ = self.updates_tx.send(snapshot.clone());
            for obs in self.observers() {
                obs.on_snapshot(&snapshot);
            }
        }
    }
}

async fn read_loop(
    inner: Arc<Inner>,
    reader: Box<dyn LinkReader>,
    target: TransportConfig,
    cancel: CancellationToken,
) {
    let mut reader = Some(reader);
    let mut attempt: u32 = 0;

    loop {
        let mut rd = match reader.take() {
            Some(rd) => rd,
            None => {
                let delay = inner.cfg.reconnect_delay(attempt);
                debug!("fc: reconnecting to {} in {:?}", target, delay);
                let opened = tokio::select! {
                    _ = cancel.cancelled() => return,
                    opened = async {
                        tokio::time::sleep(delay).await;
                        inner.transport.open(&target).await
                    } => opened,
                };
                match opened {
                    Ok(io) => {
                        let session = inner.link_status().session + 1;
                        inner.outbound.install(session, io.writer).await;
                        inner.transition(LinkState::Connecting, |s| s.session = session);
                        info!("fc: link reopened on {} (session {})", target, session);
                        io.reader
                    }
                    Err(e) => {
                        attempt = attempt.saturating_add(1);
                        inner.transition(LinkState::Disconnected, |s| s.reconnect_failures += 1);
                        warn!("fc: reconnect attempt {} failed: {}", attempt, e);
                        continue;
                    }
                }
            }
        };

        match inner.pump(rd.as_mut(), &cancel).await {
            PumpExit::Cancelled => return,
            PumpExit::Closed { reason, saw_heartbeat } => {
                warn!("fc: link lost: {}", reason);
                if saw_heartbeat {
                    attempt = 0;
                }
                if let Some(mut writer) = inner.outbound.take().await {
                    let _ = writer.close().await;
                }
                inner.transition(LinkState::Disconnected, |_| {});
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex as StdMutex, time::Duration};

    use super::*;
    use crate::{
        codec::{GpsFix, Heartbeat},
        link::mock::{JsonLinesCodec, MockTransport, MockVehicle},
    };

    fn target() -> TransportConfig {
        TransportConfig::Tcp { address: "mock:5760".into() }
    }

    fn manager(transport: &Arc<MockTransport>) -> ConnectionManager {
        ConnectionManager::new(LinkConfig::default(), transport.clone(), Arc::new(JsonLinesCodec))
    }

    async fn wait_until(conn: &ConnectionManager, pred: impl Fn(&LinkView) -> bool) {
        let mut rx = conn.watch();
        tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|v| pred(v)))
            .await
            .expect("condition not reached")
            .expect("manager dropped");
    }

    async fn connected(transport: &Arc<MockTransport>) -> (ConnectionManager, MockVehicle) {
        let conn = manager(transport);
        conn.connect(target()).await.unwrap();
        let vehicle = transport.next_vehicle().await.unwrap();
        vehicle.send(&Message::Heartbeat(Heartbeat::default()));
        wait_until(&conn, |v| v.link.state == LinkState::Connected).await;
        (conn, vehicle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_heartbeat_connects() {
        let transport = MockTransport::new();
        let conn = manager(&transport);
        conn.connect(target()).await.unwrap();
        assert_eq!(conn.link_status().state, LinkState::Connecting);
        assert!(conn.link_status().wanted);
        assert_eq!(conn.link_status().session, 1);

        let vehicle = transport.next_vehicle().await.unwrap();
        vehicle.send(&Message::Heartbeat(Heartbeat { custom_mode: 5, ..Default::default() }));
        wait_until(&conn, |v| v.link.state == LinkState::Connected).await;
        assert_eq!(conn.snapshot().custom_mode(), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_heartbeat_degrades_and_recovers() {
        let transport = MockTransport::new();
        let (conn, vehicle) = connected(&transport).await;

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(conn.link_status().state, LinkState::Degraded);

        vehicle.send(&Message::Heartbeat(Heartbeat::default()));
        wait_until(&conn, |v| v.link.state == LinkState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_eof_reconnects_with_backoff() {
        let transport = MockTransport::new();
        let (conn, mut vehicle) = connected(&transport).await;

        vehicle.hang_up();
        wait_until(&conn, |v| v.link.state == LinkState::Disconnected).await;
        assert!(conn.link_status().wanted);

        transport.refuse_next_opens(1);
        let lost_at = Instant::now();
        let vehicle = transport.next_vehicle().await.unwrap();
        // 1s to the refused attempt, 2s more to the one that works
        assert!(lost_at.elapsed() >= Duration::from_secs(3));
        assert_eq!(transport.open_count(), 3);

        wait_until(&conn, |v| v.link.session == 2).await;
        assert_eq!(conn.link_status().reconnect_failures, 1);

        vehicle.send(&Message::Heartbeat(Heartbeat::default()));
        wait_until(&conn, |v| v.link.state == LinkState::Connected).await;
        assert_eq!(conn.link_status().reconnect_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_open_failure_is_returned() {
        let transport = MockTransport::new();
        transport.refuse_next_opens(1);
        let conn = manager(&transport);

        let err = conn.connect(target()).await.unwrap_err();
        assert!(matches!(err, LinkError::OpenFailed { .. }));
        assert_eq!(conn.link_status().state, LinkState::Disconnected);
        assert!(!conn.link_status().wanted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent_and_stops_reconnects() {
        let transport = MockTransport::new();
        let (conn, mut vehicle) = connected(&transport).await;

        conn.disconnect().await;
        conn.disconnect().await;
        assert_eq!(conn.link_status().state, LinkState::Disconnected);
        assert!(!conn.link_status().wanted);
        assert_eq!(vehicle.recv().await, None, "writer closed");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), 1);

        let err = conn.outbound().send(&Outbound::Heartbeat).await.unwrap_err();
        assert!(matches!(err, LinkError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_yields_current_then_updates() {
        let transport = MockTransport::new();
        let (conn, vehicle) = connected(&transport).await;

        let mut sub = conn.subscribe();
        let first = sub.recv().await.unwrap();
        assert!(first.heartbeat.is_some());
        assert!(first.gps.is_none());

        let fix = GpsFix { latitude: 48.1, longitude: 11.5, fix_type: 3, ..Default::default() };
        vehicle.send(&Message::Gps { fix, time_us: Some(1_000) });
        let next = sub.recv().await.unwrap();
        assert_eq!(next.gps.as_ref().unwrap().value, fix);
        assert!(next.revision > first.revision);
    }

    #[derive(Default)]
    struct Recorder {
        control: StdMutex<Vec<(Message, u64)>>,
        states: StdMutex<Vec<LinkState>>,
    }

    impl LinkObserver for Recorder {
        fn on_control(&self, msg: &Message, session: u64) {
            self.control.lock().unwrap().push((msg.clone(), session));
        }

        fn on_link_state(&self, status: &LinkStatus) {
            self.states.lock().unwrap().push(status.state);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_observers_see_control_messages_and_transitions() {
        let transport = MockTransport::new();
        let conn = manager(&transport);
        let recorder = Arc::new(Recorder::default());
        conn.add_observer(recorder.clone());

        conn.connect(target()).await.unwrap();
        let vehicle = transport.next_vehicle().await.unwrap();
        vehicle.send(&Message::Heartbeat(Heartbeat::default()));
        vehicle.send(&Message::MissionRequest { seq: 2 });
        wait_until(&conn, |v| v.link.state == LinkState::Connected).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            *recorder.control.lock().unwrap(),
            vec![(Message::MissionRequest { seq: 2 }, 1)]
        );
        assert_eq!(
            *recorder.states.lock().unwrap(),
            vec![LinkState::Connecting, LinkState::Connected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_is_counted_not_fatal() {
        let transport = MockTransport::new();
        let (conn, vehicle) = connected(&transport).await;

        vehicle.send_raw(b"{broken\n");
        vehicle.send(&Message::SysStatus(crate::codec::Battery {
            remaining: Some(80),
            ..Default::default()
        }));
        wait_until(&conn, |v| v.snapshot.battery.is_some()).await;
        assert_eq!(conn.decode_errors(), 1);
        assert_eq!(conn.link_status().state, LinkState::Connected);
    }
}
