//! Splitting blobs into MTU-sized chunks and joining them back.
//!
//! ```text
//! chunk 0:  varint(index) | varint(total length) | version << 4 | data
//! chunk n:  varint(index) | data
//! ```

use thiserror::Error;

use super::varint;
use crate::core::{MAX_VARINT_SIZE, ProtocolError};

/// Largest blob whose length still fits a four-byte varint.
const MAX_BLOB_SIZE: usize = (1 << (7 * MAX_VARINT_SIZE)) - 1;

/// Split an encrypted blob into chunks of at most `mtu` bytes.
///
/// Fails with [`ProtocolError::Length`] when a chunk header plus one data
/// byte does not fit the MTU, or when the blob is too large to describe.
pub fn fragment(
    blob: &[u8],
    mtu: usize,
    protocol_version: u8,
) -> Result<Vec<Vec<u8>>, ProtocolError> {
    if blob.len() > MAX_BLOB_SIZE {
        return Err(ProtocolError::Length);
    }

    let mut chunks = Vec::new();
    let mut pos = 0;
    let mut index: u32 = 0;
    while pos < blob.len() {
        let mut chunk = Vec::with_capacity(mtu);
        varint::encode_into(index, &mut chunk);
        if index == 0 {
            varint::encode_into(blob.len() as u32, &mut chunk);
            chunk.push(protocol_version << 4);
        }
        if chunk.len() >= mtu {
            return Err(ProtocolError::Length);
        }

        let end = blob.len().min(pos + mtu - chunk.len());
        chunk.extend_from_slice(&blob[pos..end]);
        chunks.push(chunk);

        pos = end;
        index += 1;
    }
    Ok(chunks)
}

/// Reasons an inbound chunk was discarded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    /// Chunk index did not follow the previous one.
    #[error("unexpected chunk {received}, expected {expected}")]
    OutOfOrder {
        /// Next index the reassembler was waiting for.
        expected: u32,
        /// Index that arrived.
        received: u32,
    },

    /// More data arrived than chunk 0 announced.
    #[error("received {received} bytes, expected {expected}")]
    Overrun {
        /// Announced blob length.
        expected: usize,
        /// Bytes accumulated so far.
        received: usize,
    },

    /// Chunk header could not be parsed.
    #[error("malformed chunk header: {0}")]
    Malformed(#[from] ProtocolError),
}

/// Inbound chunk buffer.
///
/// Any error discards the partial blob; the next chunk 0 starts over.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
    expected_index: u32,
    expected_length: usize,
    protocol_version: Option<u8>,
}

impl Reassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk.
    ///
    /// Returns the complete blob once the announced length is reached.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, ReassemblyError> {
        let (index, mut pos) = varint::decode(chunk, 0).inspect_err(|_| self.reset())?;

        if index == 0 && self.expected_index != 0 {
            tracing::debug!(
                "chunk 0 while expecting {}, restarting reassembly",
                self.expected_index
            );
            self.reset();
        }

        if index != self.expected_index {
            let expected = self.expected_index;
            self.reset();
            return Err(ReassemblyError::OutOfOrder {
                expected,
                received: index,
            });
        }

        if index == 0 {
            let (length, next) = varint::decode(chunk, pos).inspect_err(|_| self.reset())?;
            self.expected_length = length as usize;
            self.protocol_version = chunk.get(next).map(|b| b >> 4);
            pos = next + 1;
        }
        self.buffer
            .extend_from_slice(chunk.get(pos..).unwrap_or_default());
        self.expected_index += 1;

        if self.buffer.len() > self.expected_length {
            let err = ReassemblyError::Overrun {
                expected: self.expected_length,
                received: self.buffer.len(),
            };
            self.reset();
            return Err(err);
        }
        if self.buffer.len() == self.expected_length {
            let blob = std::mem::take(&mut self.buffer);
            self.reset();
            return Ok(Some(blob));
        }
        Ok(None)
    }

    /// Drop any partial blob.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected_index = 0;
        self.expected_length = 0;
    }

    /// Check if a blob is partially received.
    pub fn is_idle(&self) -> bool {
        self.expected_index == 0
    }

    /// Protocol version announced by the most recent chunk 0.
    pub fn protocol_version(&self) -> Option<u8> {
        self.protocol_version
    }
}
