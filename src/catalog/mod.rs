//! Gimdow BLE protocol - Device catalog
//!
//! - [`credentials`]: identity, pairing secret and datapoint schema
//! - [`products`]: known products and lock mappings
//! - [`advertisement`]: identity decoded from advertisements

pub mod advertisement;
pub mod credentials;
pub mod products;

pub use advertisement::Advertisement;
pub use credentials::{CloudType, DeviceCredentials, DeviceFunction, FunctionValues};
pub use products::{LockMapping, ProductInfo, display_name, product_for, product_info, short_address};
