//! Gimdow BLE protocol - Core constants, errors and boundary traits.

mod constants;
mod error;
#[cfg(feature = "device")]
mod traits;

pub use constants::*;
pub use error::*;
#[cfg(feature = "device")]
pub use traits::*;
