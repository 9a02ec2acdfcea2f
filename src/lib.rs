//! # Gimdow BLE protocol
//!
//! Host side of the Bluetooth LE protocol spoken by Gimdow (Tuya BLE) smart
//! locks. It provides:
//!
//! - **Framing**: CRC-16 protected frames inside an AES-128-CBC envelope,
//!   split into MTU-sized chunks and reassembled on the way back
//! - **Handshake**: device-info exchange, session key derivation and pairing
//! - **Datapoints**: typed device state, reports, batched writes
//! - **Lock control**: product lock mappings and a sequencer that resolves an
//!   unknown bolt position
//!
//! The Bluetooth stack and the credential store are provided by the host
//! through the [`Transport`](core::Transport) and
//! [`CredentialSource`](core::CredentialSource) traits.
//!
//! ## Feature Flags
//!
//! - `device` (default): async device layer (tokio)
//!
//! ## Modules
//!
//! - [`core`](crate::core): constants, error types and boundary traits
//! - [`crypto`]: key derivation, AES envelope and CRC
//! - [`transport`]: frame codec, fragmentation and session state
//! - [`datapoint`]: datapoint values, reports and the store
//! - [`catalog`]: credentials, product catalog and advertisements
//! - [`device`]: the [`GimdowDevice`] handle (requires `device` feature)
//!
//! ## Example Usage
//!
//! ```rust
//! use gimdow_protocol::prelude::*;
//!
//! let keys = KeySet::from_local_key(&LocalKey::from_secret("abcdefghijklmnop"));
//! let iv = [7u8; 16];
//! let blob = encode_frame(&keys, 1, Opcode::DeviceInfo, &[], 0, &iv).unwrap();
//!
//! let mut reassembler = Reassembler::new();
//! let mut decoded = None;
//! for chunk in fragment(&blob, 20, 2).unwrap() {
//!     decoded = reassembler.push(&chunk).unwrap();
//! }
//! let frame = decode_frame(&keys, &decoded.unwrap()).unwrap();
//! assert_eq!(frame.opcode(), Some(Opcode::DeviceInfo));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod catalog;
pub mod core;
pub mod crypto;
pub mod datapoint;
pub mod transport;

// Device layer (feature-gated)
#[cfg(feature = "device")]
#[cfg_attr(docsrs, doc(cfg(feature = "device")))]
pub mod device;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::catalog::{Advertisement, DeviceCredentials, LockMapping, ProductInfo};
    pub use crate::core::*;
    pub use crate::crypto::{KeySet, LocalKey, SecurityFlag, SymmetricKey};
    pub use crate::datapoint::{
        Datapoint, DatapointRecord, DatapointReport, DatapointStore, DatapointType,
        DatapointValue,
    };
    pub use crate::transport::{Frame, Opcode, Reassembler, decode_frame, encode_frame, fragment};

    #[cfg(feature = "device")]
    pub use crate::device::{
        DeviceConfig, GimdowDevice, LockTarget, ResolutionPlan, Subscription, UpdateScope,
    };
    #[cfg(feature = "device")]
    pub use crate::transport::ConnectionPhase;
}

// Re-export commonly used items at crate root
pub use crate::core::{DatapointError, GimdowError, ProtocolError, Result, TransportError};
pub use datapoint::{DatapointType, DatapointValue};

#[cfg(feature = "device")]
pub use device::{DeviceConfig, GimdowDevice};
