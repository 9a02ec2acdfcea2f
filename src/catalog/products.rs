//! Known products and their lock mappings.

use super::credentials::DeviceCredentials;

/// Manufacturer reported for products without their own.
pub const DEFAULT_MANUFACTURER: &str = "Gimdow";

/// Which datapoints drive a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockMapping {
    /// Datapoint written to lock.
    pub lock_dp: u8,
    /// Datapoint written to unlock.
    pub unlock_dp: u8,
    /// Datapoint reporting the bolt state (true = unlocked).
    pub state_dp: u8,
    /// Value written to `lock_dp`.
    pub lock_value: bool,
    /// Value written to `unlock_dp`.
    pub unlock_value: bool,
}

/// A known product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductInfo {
    /// Display name.
    pub name: &'static str,
    /// Manufacturer.
    pub manufacturer: &'static str,
    /// Lock datapoints, for lock products.
    pub lock: Option<LockMapping>,
}

struct CategoryInfo {
    products: &'static [(&'static str, ProductInfo)],
    fallback: Option<ProductInfo>,
}

const A1_PRO_MAX_LOCK: LockMapping = LockMapping {
    lock_dp: 46,
    unlock_dp: 6,
    state_dp: 47,
    lock_value: true,
    unlock_value: true,
};

static CATALOG: &[(&str, CategoryInfo)] = &[(
    "jtmspro",
    CategoryInfo {
        products: &[(
            "rlyxv7pe",
            ProductInfo {
                name: "A1 PRO MAX",
                manufacturer: DEFAULT_MANUFACTURER,
                lock: Some(A1_PRO_MAX_LOCK),
            },
        )],
        fallback: None,
    },
)];

/// Look up a product, falling back to the category entry.
pub fn product_info(category: &str, product_id: &str) -> Option<&'static ProductInfo> {
    let (_, category) = CATALOG.iter().find(|(name, _)| *name == category)?;
    category
        .products
        .iter()
        .find(|(id, _)| *id == product_id)
        .map(|(_, info)| info)
        .or(category.fallback.as_ref())
}

/// Look up the product of a device.
pub fn product_for(credentials: &DeviceCredentials) -> Option<&'static ProductInfo> {
    product_info(&credentials.category, &credentials.product_id)
}

/// Last three octets of a Bluetooth address, e.g. `"D4E5F6"`.
pub fn short_address(address: &str) -> String {
    let normalized = address.replace('-', ":").to_uppercase();
    let parts: Vec<&str> = normalized.split(':').collect();
    let tail: String = parts[parts.len().saturating_sub(3)..].concat();
    let skip = tail.chars().count().saturating_sub(6);
    tail.chars().skip(skip).collect()
}

/// Human readable device name: product name, else device name, else the
/// advertised name, followed by the short address.
pub fn display_name(
    address: &str,
    credentials: Option<&DeviceCredentials>,
    advertised_name: Option<&str>,
) -> String {
    let base = credentials
        .and_then(product_for)
        .map(|product| product.name.to_owned())
        .or_else(|| credentials.map(|c| c.device_name.clone()))
        .or_else(|| advertised_name.map(str::to_owned))
        .unwrap_or_default();
    let short = short_address(address);
    if base.is_empty() {
        short
    } else {
        format!("{base} {short}")
    }
}
