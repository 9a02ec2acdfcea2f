//! Per-device session state.
//!
//! Holds everything that is reset when the link drops: the connection
//! phase, the outbound sequence counter, responses being waited for, the
//! session key and the inbound reassembly buffer.

use std::collections::HashMap;

use tokio::sync::oneshot;

use super::fragment::{ReassemblyError, Reassembler};
use crate::core::{DEVICE_RANDOM_SIZE, ProtocolError};
use crate::crypto::{KeySet, LocalKey};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// No link.
    #[default]
    Disconnected,
    /// Link being established.
    Connecting,
    /// Link up, waiting for the DEVICE_INFO response.
    AwaitingDeviceInfo,
    /// Session key installed, waiting for the PAIR response.
    AwaitingPairing,
    /// Ready for datapoint traffic.
    Paired,
    /// Link being closed.
    Disconnecting,
}

/// Outcome delivered to a caller waiting for a response.
pub type ResponseResult = Result<(), ProtocolError>;

/// Session state of one device.
#[derive(Debug)]
pub struct SessionState {
    /// Current phase.
    pub phase: ConnectionPhase,
    /// Set by an explicit stop; suppresses reconnects.
    pub expected_disconnect: bool,
    next_seq: u32,
    pending: HashMap<u32, oneshot::Sender<ResponseResult>>,
    local_key: LocalKey,
    keys: KeySet,
    reassembler: Reassembler,
    generation: u64,
}

impl SessionState {
    /// Create a disconnected session for a local key.
    pub fn new(local_key: LocalKey) -> Self {
        let keys = KeySet::from_local_key(&local_key);
        Self {
            phase: ConnectionPhase::Disconnected,
            expected_disconnect: false,
            next_seq: 1,
            pending: HashMap::new(),
            local_key,
            keys,
            reassembler: Reassembler::new(),
            generation: 0,
        }
    }

    /// Get the next outbound sequence number.
    ///
    /// Starts at 1 and skips 0, which marks frames that answer nothing.
    pub fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        seq
    }

    /// Register a waiter for the response to `seq`.
    pub fn expect_response(&mut self, seq: u32) -> oneshot::Receiver<ResponseResult> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);
        rx
    }

    /// Complete the waiter for `response_to`.
    ///
    /// Returns `false` when nobody was waiting.
    pub fn complete(&mut self, response_to: u32, result: ResponseResult) -> bool {
        match self.pending.remove(&response_to) {
            Some(tx) => {
                // The waiter may have timed out in the meantime.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Forget the waiter for `seq` (after a timeout or a failed write).
    pub fn cancel(&mut self, seq: u32) {
        self.pending.remove(&seq);
    }

    /// Number of responses being waited for.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Local key of the device.
    pub fn local_key(&self) -> &LocalKey {
        &self.local_key
    }

    /// Keys of the current connection.
    pub fn keys(&self) -> &KeySet {
        &self.keys
    }

    /// Derive and install the session key.
    pub fn install_session_key(&mut self, device_random: &[u8; DEVICE_RANDOM_SIZE]) {
        let key = self.local_key.session_key(device_random);
        self.keys.set_session(key);
    }

    /// Feed an inbound chunk to the reassembler.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, ReassemblyError> {
        self.reassembler.push(chunk)
    }

    /// Check if the session is paired.
    pub fn is_paired(&self) -> bool {
        self.phase == ConnectionPhase::Paired
    }

    /// Link generation; bumped on every new link.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a new link generation.
    pub fn begin_link(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.phase = ConnectionPhase::AwaitingDeviceInfo;
        self.generation
    }

    /// Reset everything tied to the link.
    ///
    /// Waiters are dropped, so their receivers observe the disconnect.
    /// Returns whether the session was paired before.
    pub fn reset(&mut self) -> bool {
        let was_paired = self.is_paired();
        self.phase = ConnectionPhase::Disconnected;
        self.next_seq = 1;
        self.pending.clear();
        self.keys.clear_session();
        self.reassembler.reset();
        was_paired
    }
}
