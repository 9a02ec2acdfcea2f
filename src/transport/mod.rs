//! Gimdow BLE protocol - Transport layer
//!
//! - **Frame codec**: [`encode_frame`] / [`decode_frame`] with CRC-16 and
//!   AES-128-CBC envelope
//! - **Fragmentation**: [`fragment`] and [`Reassembler`] for MTU-sized chunks
//! - **Varints**: chunk index and length encoding
//! - **Session state**: [`SessionState`] with sequence numbers, pending
//!   responses and keys (requires `device` feature)
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      Device layer (handshake, dps)      │
//! ├─────────────────────────────────────────┤
//! │         Transport layer                 │  ← This module
//! │   frames, fragments, session state      │
//! ├─────────────────────────────────────────┤
//! │         Security layer                  │
//! ├─────────────────────────────────────────┤
//! │       BLE link (host provided)          │
//! └─────────────────────────────────────────┘
//! ```

#[cfg(feature = "device")]
mod connection;
mod fragment;
mod frame;
pub mod varint;

#[cfg(feature = "device")]
pub use connection::*;
pub use fragment::*;
pub use frame::*;
