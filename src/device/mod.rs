//! Gimdow BLE protocol - Device layer
//!
//! - [`GimdowDevice`]: connection lifecycle, handshake, datapoint access
//!   and reconnects for one lock
//! - [`handshake`]: DEVICE_INFO and PAIR payloads
//! - [`dispatch`]: inbound frame interpretation and time replies
//! - [`observer`]: callback registries with RAII [`Subscription`]s
//! - Lock state resolution: [`GimdowDevice::resolve_unknown_state`]

mod config;
#[allow(clippy::module_inception)]
mod device;
pub mod dispatch;
pub mod handshake;
#[cfg(test)]
mod mock;
pub mod observer;
mod resolver;

pub use config::{DeviceConfig, DeviceConfigBuilder};
pub use device::{GimdowDevice, UpdateScope};
pub use dispatch::{Inbound, TimeFormat, local_time_reply, standard_offset, time_reply};
pub use handshake::{DeviceInfo, pairing_request};
pub use observer::{Observers, Subscription};
pub use resolver::{LockTarget, ResolutionPlan};
