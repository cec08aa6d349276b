//! In-memory transport and a JSON-lines codec for driving the core without
//! a flight controller.
//!
//! Every successful [`MockTransport::open`] hands the other end of the new
//! link to the test as a [`MockVehicle`]. The vehicle can be scripted
//! directly or turned into an [`Autopilot`] that acknowledges commands and
//! walks the mission upload handshake.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use tokio::{sync::mpsc, task::JoinHandle};

use super::{LinkIo, LinkReader, LinkTransport, LinkWriter, TransportConfig};
use crate::{
    codec::{AckResult, CommandCode, Decoded, Heartbeat, Message, MessageCodec, Outbound},
    error::{CodecError, LinkError},
};

/// Newline-delimited JSON of [`Message`] (inbound) and [`Outbound`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesCodec;

impl MessageCodec for JsonLinesCodec {
    fn decode(&self, buf: &mut BytesMut) -> Result<Decoded, CodecError> {
        match next_line::<Message>(buf) {
            None => Ok(Decoded::NeedMoreData),
            Some(Ok(msg)) => Ok(Decoded::Message(msg)),
            Some(Err(e)) => Err(e),
        }
    }

    fn encode(&self, out: &Outbound) -> Result<Bytes, CodecError> {
        to_line(out)
    }
}

fn to_line<T: serde::Serialize>(value: &T) -> Result<Bytes, CodecError> {
    let mut line = serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

fn next_line<T: DeserializeOwned>(buf: &mut BytesMut) -> Option<Result<T, CodecError>> {
    loop {
        let pos = buf.iter().position(|b| *b == b'\n')?;
        let line = buf.split_to(pos + 1);
        let text = &line[..pos];
        if text.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return Some(serde_json::from_slice(text).map_err(|e| CodecError::Malformed(e.to_string())));
    }
}

pub struct MockTransport {
    vehicles_tx: mpsc::UnboundedSender<MockVehicle>,
    vehicles_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockVehicle>>,
    refuse: AtomicU32,
    opens: AtomicU32,
}

impl Default for MockTransport {
    fn default() -> Self {
        let (vehicles_tx, vehicles_rx) = mpsc::unbounded_channel();
        Self {
            vehicles_tx,
            vehicles_rx: tokio::sync::Mutex::new(vehicles_rx),
            refuse: AtomicU32::new(0),
            opens: AtomicU32::new(0),
        }
    }
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `n` opens fail with `OpenFailed`.
    pub fn refuse_next_opens(&self, n: u32) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// Open attempts so far, failed ones included.
    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Waits for the vehicle end of the next successfully opened link.
    pub async fn next_vehicle(&self) -> Option<MockVehicle> {
        self.vehicles_rx.lock().await.recv().await
    }
}

#[async_trait]
impl LinkTransport for MockTransport {
    async fn open(&self, cfg: &TransportConfig) -> Result<LinkIo, LinkError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(LinkError::OpenFailed {
                target: cfg.to_string(),
                reason: "mock refused open".into(),
            });
        }

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let vehicle = MockVehicle {
            inbound: Some(in_tx),
            outbound: out_rx,
            pending: BytesMut::new(),
        };
        self.vehicles_tx.send(vehicle).map_err(|_| LinkError::Closed)?;

        Ok(LinkIo {
            reader: Box::new(MockReader { rx: in_rx, pending: Vec::new() }),
            writer: Box::new(MockWriter { tx: Some(out_tx) }),
        })
    }
}

struct MockReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
}

#[async_trait]
impl LinkReader for MockReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if self.pending.is_empty() {
            match self.rx.recv().await {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct MockWriter {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[async_trait]
impl LinkWriter for MockWriter {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let tx = self.tx.as_ref().ok_or(LinkError::Closed)?;
        tx.send(bytes.to_vec()).map_err(|_| LinkError::Write("vehicle gone".into()))
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        self.tx = None;
        Ok(())
    }
}

/// The vehicle end of one mock link.
pub struct MockVehicle {
    inbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: BytesMut,
}

impl MockVehicle {
    /// Returns false once the link has been hung up.
    pub fn send(&self, msg: &Message) -> bool {
        match to_line(msg) {
            Ok(line) => self.send_raw(&line),
            Err(_) => false,
        }
    }

    pub fn send_raw(&self, bytes: &[u8]) -> bool {
        self.inbound
            .as_ref()
            .map(|tx| tx.send(bytes.to_vec()).is_ok())
            .unwrap_or(false)
    }

    /// Next message the core wrote, or `None` once its writer is gone.
    pub async fn recv(&mut self) -> Option<Outbound> {
        loop {
            match next_line::<Outbound>(&mut self.pending) {
                Some(Ok(out)) => return Some(out),
                Some(Err(_)) => continue,
                None => {}
            }
            let chunk = self.outbound.recv().await?;
            self.pending.extend_from_slice(&chunk);
        }
    }

    /// Closes the vehicle-to-core direction; the core reads EOF.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Hands the link to a background task that behaves like a cooperative
    /// flight controller.
    pub fn autopilot(self) -> Autopilot {
        Autopilot::spawn(self)
    }
}

#[derive(Debug, Default)]
struct Behaviour {
    silent: HashSet<CommandCode>,
    deny: HashSet<CommandCode>,
    custom_mode: u32,
    armed: bool,
    mission_count: u16,
}

/// Acks every command (unless told otherwise), tracks mode and arming from
/// what it accepted, and serves mission uploads item by item.
pub struct Autopilot {
    inbound: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
    seen: Arc<Mutex<Vec<Outbound>>>,
    behaviour: Arc<Mutex<Behaviour>>,
    task: JoinHandle<()>,
}

impl Autopilot {
    fn spawn(mut vehicle: MockVehicle) -> Self {
        let inbound = Arc::new(Mutex::new(vehicle.inbound.take()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let behaviour = Arc::new(Mutex::new(Behaviour::default()));

        let task = tokio::spawn({
            let inbound = inbound.clone();
            let seen = seen.clone();
            let behaviour = behaviour.clone();
            async move {
                while let Some(out) = vehicle.recv().await {
                    lock(&seen).push(out.clone());
                    let reply = respond(&mut lock(&behaviour), &out);
                    if let Some(reply) = reply {
                        if let (Some(tx), Ok(line)) = (lock(&inbound).as_ref(), to_line(&reply)) {
                            let _ = tx.send(line.to_vec());
                        }
                    }
                }
            }
        });

        Self { inbound, seen, behaviour, task }
    }

    pub fn send(&self, msg: &Message) -> bool {
        match (lock(&self.inbound).as_ref(), to_line(msg)) {
            (Some(tx), Ok(line)) => tx.send(line.to_vec()).is_ok(),
            _ => false,
        }
    }

    /// Sends a heartbeat reflecting the mode and arming state it has accepted.
    pub fn heartbeat(&self) -> bool {
        let hb = {
            let b = lock(&self.behaviour);
            Heartbeat { custom_mode: b.custom_mode, armed: b.armed, system_status: 4, vehicle_type: 2 }
        };
        self.send(&Message::Heartbeat(hb))
    }

    pub fn set_mode(&self, custom_mode: u32) {
        lock(&self.behaviour).custom_mode = custom_mode;
    }

    pub fn custom_mode(&self) -> u32 {
        lock(&self.behaviour).custom_mode
    }

    pub fn armed(&self) -> bool {
        lock(&self.behaviour).armed
    }

    /// Never ack this command.
    pub fn silence(&self, code: CommandCode) {
        lock(&self.behaviour).silent.insert(code);
    }

    /// Ack this command with `Denied`.
    pub fn deny(&self, code: CommandCode) {
        lock(&self.behaviour).deny.insert(code);
    }

    /// Back to acking this command normally.
    pub fn restore(&self, code: CommandCode) {
        let mut b = lock(&self.behaviour);
        b.silent.remove(&code);
        b.deny.remove(&code);
    }

    pub fn seen(&self) -> Vec<Outbound> {
        lock(&self.seen).clone()
    }

    /// Params of every `CommandLong` with this code, in send order.
    pub fn commands(&self, code: CommandCode) -> Vec<[f32; 7]> {
        lock(&self.seen)
            .iter()
            .filter_map(|out| match out {
                Outbound::CommandLong { code: c, params } if *c == code => Some(*params),
                _ => None,
            })
            .collect()
    }

    pub fn hang_up(&self) {
        lock(&self.inbound).take();
    }
}

impl Drop for Autopilot {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn respond(b: &mut Behaviour, out: &Outbound) -> Option<Message> {
    match out {
        Outbound::CommandLong { code, params } => {
            if b.silent.contains(code) {
                return None;
            }
            if b.deny.contains(code) {
                return Some(Message::CommandAck { code: *code, result: AckResult::Denied });
            }
            match code {
                CommandCode::ArmDisarm => b.armed = params[0] >= 0.5,
                CommandCode::SetMode => b.custom_mode = params[1] as u32,
                _ => {}
            }
            Some(Message::CommandAck { code: *code, result: AckResult::Accepted })
        }
        Outbound::MissionCount { count } => {
            b.mission_count = *count;
            if *count == 0 {
                Some(Message::MissionAck { accepted: true, detail: "MAV_MISSION_ACCEPTED".into() })
            } else {
                Some(Message::MissionRequest { seq: 0 })
            }
        }
        Outbound::MissionItem { seq, .. } => {
            if seq + 1 < b.mission_count {
                Some(Message::MissionRequest { seq: seq + 1 })
            } else {
                Some(Message::MissionAck { accepted: true, detail: "MAV_MISSION_ACCEPTED".into() })
            }
        }
        Outbound::Heartbeat => None,
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::GpsFix;

    #[test]
    fn test_json_lines_skips_blank_lines_and_waits_for_newline() {
        let codec = JsonLinesCodec;
        let mut buf = BytesMut::from(&b"\n  \n{\"type\":\"mission_request\",\"seq\":3}"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Decoded::NeedMoreData);

        buf.extend_from_slice(b"\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Decoded::Message(Message::MissionRequest { seq: 3 })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_json_lines_bad_line_is_consumed() {
        let codec = JsonLinesCodec;
        let mut buf = BytesMut::from(&b"not json\n{\"type\":\"other\"}\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Malformed(_))));
        assert_eq!(codec.decode(&mut buf).unwrap(), Decoded::Message(Message::Other));
    }

    #[tokio::test]
    async fn test_mock_link_carries_both_directions() {
        let transport = MockTransport::new();
        let cfg = TransportConfig::Tcp { address: "mock".into() };
        let mut io = transport.open(&cfg).await.unwrap();
        let mut vehicle = transport.next_vehicle().await.unwrap();

        let fix = GpsFix { latitude: 1.0, longitude: 2.0, fix_type: 3, ..Default::default() };
        assert!(vehicle.send(&Message::Gps { fix, time_us: Some(5) }));
        let mut buf = [0u8; 256];
        let n = io.reader.read(&mut buf).await.unwrap();
        let mut bytes = BytesMut::from(&buf[..n]);
        assert_eq!(
            JsonLinesCodec.decode(&mut bytes).unwrap(),
            Decoded::Message(Message::Gps { fix, time_us: Some(5) })
        );

        let line = JsonLinesCodec.encode(&Outbound::MissionCount { count: 2 }).unwrap();
        io.writer.write(&line).await.unwrap();
        assert_eq!(vehicle.recv().await, Some(Outbound::MissionCount { count: 2 }));

        vehicle.hang_up();
        assert_eq!(io.reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refused_opens_are_counted() {
        let transport = MockTransport::new();
        transport.refuse_next_opens(2);
        let cfg = TransportConfig::Serial { dev: "/dev/null".into(), baud: 57600 };

        assert!(matches!(transport.open(&cfg).await, Err(LinkError::OpenFailed { .. })));
        assert!(matches!(transport.open(&cfg).await, Err(LinkError::OpenFailed { .. })));
        assert!(transport.open(&cfg).await.is_ok());
        assert_eq!(transport.open_count(), 3);
    }
}
