//! In-memory lock for the device tests.
//!
//! Speaks the device side of the protocol: answers DEVICE_INFO and PAIR,
//! acknowledges datapoint batches and status polls, and can echo batches
//! back as reports, push its own frames or drop the link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::catalog::DeviceCredentials;
use crate::core::{DEFAULT_MTU, DEVICE_INFO_MIN_SIZE, Link, LinkEvent, Transport, TransportError};
use crate::crypto::{KeySet, LocalKey, random_iv};
use crate::transport::{Frame, Opcode, Reassembler, decode_frame, encode_frame, fragment};

pub(crate) const ADDRESS: &str = "DC:23:4D:7A:1B:2C";

pub(crate) const CREDENTIALS: &str = r#"{
    "uuid": "uuid0123456789ab",
    "local_key": "abcdefghijklmnop",
    "device_id": "bf0123456789",
    "category": "jtmspro",
    "product_id": "rlyxv7pe",
    "device_name": "Front door",
    "functions": [
        {"code": "unlock_ble", "dp_id": 6, "type": "Boolean"},
        {"code": "manual_lock", "dp_id": 46, "type": "Boolean"},
        {"code": "beep_volume", "dp_id": 31, "type": "Enum",
         "values": "{\"range\":[\"mute\",\"low\",\"high\"]}"}
    ],
    "status_range": [
        {"code": "lock_motor_state", "dp_id": 47, "type": "Boolean"},
        {"code": "residual_electricity", "dp_id": 8, "type": "Integer"}
    ]
}"#;

pub(crate) const DEVICE_RANDOM: [u8; 6] = *b"r4nd0m";

pub(crate) fn credentials() -> DeviceCredentials {
    DeviceCredentials::from_json(CREDENTIALS).unwrap()
}

struct LinkHandle {
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

struct FakeState {
    protocol_version: u8,
    pair_result: u8,
    echo_datapoints: bool,
    answer_status: bool,
    refuse_connect: bool,
    fail_next_write: Option<TransportError>,
    connects: usize,
    keys: KeySet,
    reassembler: Reassembler,
    seq: u32,
    received: Vec<(Frame, Instant)>,
    link: Option<LinkHandle>,
}

impl FakeState {
    fn send(&mut self, opcode: Opcode, payload: &[u8], response_to: u32) {
        self.seq += 1;
        let blob = encode_frame(&self.keys, self.seq, opcode, payload, response_to, &random_iv())
            .unwrap();
        let chunks = fragment(&blob, DEFAULT_MTU, self.protocol_version).unwrap();
        if let Some(link) = &self.link {
            for chunk in chunks {
                let _ = link.events.send(LinkEvent::Chunk(chunk));
            }
        }
    }

    fn respond(&mut self, local_key: &LocalKey, frame: Frame) {
        let Some(opcode) = frame.opcode() else {
            return;
        };
        let seq = frame.seq;
        let payload = frame.payload.clone();
        self.received.push((frame, Instant::now()));

        match opcode {
            Opcode::DeviceInfo => {
                let info = device_info_payload(self.protocol_version);
                self.send(opcode, &info, seq);
                self.keys.set_session(local_key.session_key(&DEVICE_RANDOM));
            }
            Opcode::Pair => {
                let result = self.pair_result;
                self.send(opcode, &[result], seq);
            }
            Opcode::DatapointSet => {
                self.send(opcode, &[], seq);
                if self.echo_datapoints {
                    self.send(Opcode::DatapointReport, &payload, 0);
                }
            }
            Opcode::DeviceStatus if self.answer_status => self.send(opcode, &[0], seq),
            _ => {}
        }
    }
}

fn device_info_payload(protocol_version: u8) -> Vec<u8> {
    let mut info = vec![0u8; DEVICE_INFO_MIN_SIZE];
    info[..6].copy_from_slice(&[1, 2, protocol_version, 0, 0, 1]);
    info[6..12].copy_from_slice(&DEVICE_RANDOM);
    info[12..14].copy_from_slice(&[1, 0]);
    info
}

struct Shared {
    local_key: LocalKey,
    state: Mutex<FakeState>,
}

/// Fake lock; clones share state.
#[derive(Clone)]
pub(crate) struct FakeLock {
    shared: Arc<Shared>,
}

impl FakeLock {
    pub(crate) fn new() -> Self {
        let local_key = credentials().local_key();
        let keys = KeySet::from_local_key(&local_key);
        Self {
            shared: Arc::new(Shared {
                local_key,
                state: Mutex::new(FakeState {
                    protocol_version: 3,
                    pair_result: 0,
                    echo_datapoints: false,
                    answer_status: true,
                    refuse_connect: false,
                    fail_next_write: None,
                    connects: 0,
                    keys,
                    reassembler: Reassembler::new(),
                    seq: 0,
                    received: Vec::new(),
                    link: None,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.shared.state.lock().unwrap()
    }

    pub(crate) fn with_pair_result(self, result: u8) -> Self {
        self.state().pair_result = result;
        self
    }

    pub(crate) fn with_protocol_version(self, version: u8) -> Self {
        self.state().protocol_version = version;
        self
    }

    pub(crate) fn with_echo(self) -> Self {
        self.state().echo_datapoints = true;
        self
    }

    /// Turn echoing of datapoint batches on or off.
    pub(crate) fn set_echo(&self, echo: bool) {
        self.state().echo_datapoints = echo;
    }

    /// Fail the next chunk write with `error`.
    pub(crate) fn fail_next_write(&self, error: TransportError) {
        self.state().fail_next_write = Some(error);
    }

    pub(crate) fn silent_status(self) -> Self {
        self.state().answer_status = false;
        self
    }

    pub(crate) fn refuse_connect(&self, refuse: bool) {
        self.state().refuse_connect = refuse;
    }

    pub(crate) fn connects(&self) -> usize {
        self.state().connects
    }

    /// Frames received from the host with the given opcode.
    pub(crate) fn received(&self, opcode: Opcode) -> Vec<Frame> {
        self.state()
            .received
            .iter()
            .filter(|(frame, _)| frame.opcode() == Some(opcode))
            .map(|(frame, _)| frame.clone())
            .collect()
    }

    /// When each frame with the given opcode arrived.
    pub(crate) fn received_at(&self, opcode: Opcode) -> Vec<Instant> {
        self.state()
            .received
            .iter()
            .filter(|(frame, _)| frame.opcode() == Some(opcode))
            .map(|(_, at)| *at)
            .collect()
    }

    /// Push a device-initiated frame.
    pub(crate) fn push(&self, opcode: Opcode, payload: &[u8]) {
        self.state().send(opcode, payload, 0);
    }

    /// Simulate the link dropping.
    pub(crate) fn drop_link(&self) {
        if let Some(link) = self.state().link.take() {
            link.connected.store(false, Ordering::SeqCst);
            let _ = link.events.send(LinkEvent::Disconnected);
        }
    }

    /// Wait until `count` frames with `opcode` were received.
    pub(crate) async fn wait_for(&self, opcode: Opcode, count: usize) {
        tokio::time::timeout(Duration::from_secs(30), async {
            while self.received(opcode).len() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }
}

pub(crate) struct FakeLink {
    shared: Arc<Shared>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for FakeLock {
    type Link = FakeLink;

    async fn connect(&self) -> Result<FakeLink, TransportError> {
        let mut state = self.state();
        if state.refuse_connect {
            return Err(TransportError::Bus("connection refused".into()));
        }
        state.connects += 1;
        state.keys = KeySet::from_local_key(&self.shared.local_key);
        state.reassembler.reset();
        state.seq = 0;
        Ok(FakeLink {
            shared: Arc::clone(&self.shared),
            connected: Arc::new(AtomicBool::new(true)),
        })
    }
}

#[async_trait]
impl Link for FakeLink {
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<LinkEvent>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.state.lock().unwrap().link = Some(LinkHandle {
            connected: Arc::clone(&self.connected),
            events: tx,
        });
        Ok(rx)
    }

    async fn write(&self, chunk: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let mut state = self.shared.state.lock().unwrap();
        if let Some(error) = state.fail_next_write.take() {
            return Err(error);
        }
        let blob = match state.reassembler.push(chunk) {
            Ok(Some(blob)) => blob,
            Ok(None) => return Ok(()),
            Err(e) => return Err(TransportError::Bus(e.to_string())),
        };
        let frame = decode_frame(&state.keys, &blob).map_err(|e| TransportError::Bus(e.to_string()))?;
        state.respond(&self.shared.local_key, frame);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(link) = state.link.take() {
                let _ = link.events.send(LinkEvent::Disconnected);
            }
        }
        Ok(())
    }
}
