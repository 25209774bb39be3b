//! Device identity and description
//!
//! A device's identity for passthrough purposes is its `(vendor, product)`
//! id pair. Two simultaneously connected devices sharing that pair are
//! indistinguishable here; this is a deliberate limitation, not an
//! oversight.
//!
//! Descriptions resolve through three tiers: the in-process cache, the
//! usb.ids database, and a one-shot `lsusb` query for the string
//! descriptors the database does not carry. Resolution failures degrade to
//! unknown names; they never propagate to the caller.

use crate::usb_ids::UsbIdDatabase;
use regex::Regex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::{debug, error};

/// Stable identity of a USB device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// Lowercase zero-padded `"vvvv:pppp"`, the cache key and the filter
    /// argument handed to `lsusb -d`.
    pub fn hex_key(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id, self.product_id)
    }

    /// Decimal `"<vid>:<pid>"`, the id the device carries inside the VM
    /// device table.
    pub fn synthetic_id(&self) -> String {
        format!("{}:{}", self.vendor_id, self.product_id)
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hex_key())
    }
}

/// Manufacturer and product strings, either of which may be unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStrings {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// Format the canonical `[vvvv:pppp] Manufacturer | Product` description.
pub fn format_description(identity: DeviceIdentity, strings: &DeviceStrings) -> String {
    format!(
        "[{}] {} | {}",
        identity.hex_key(),
        strings.manufacturer.as_deref().unwrap_or("Unknown Vendor"),
        strings.product.as_deref().unwrap_or("Unknown Product"),
    )
}

/// One-shot external query for a device's string descriptors.
///
/// A trait so tests can stub the external process and count invocations.
pub trait DescriptorProbe: Send {
    fn query(&self, identity: DeviceIdentity) -> impl Future<Output = DeviceStrings> + Send;
}

/// Production probe: `lsusb -v -d vvvv:pppp` with stderr suppressed.
pub struct LsusbProbe;

impl DescriptorProbe for LsusbProbe {
    async fn query(&self, identity: DeviceIdentity) -> DeviceStrings {
        let output = Command::new("lsusb")
            .arg("-v")
            .arg("-d")
            .arg(identity.hex_key())
            .stderr(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) => parse_descriptor_dump(&String::from_utf8_lossy(&output.stdout)),
            Err(err) => {
                // lsusb missing or not executable; expected on some hosts.
                error!(device = %identity, %err, "descriptor query failed");
                DeviceStrings::default()
            }
        }
    }
}

static MANUFACTURER_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*iManufacturer\s+\d+\s+(.+)$").unwrap());
static PRODUCT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*iProduct\s+\d+\s+(.+)$").unwrap());

/// Scrape `iManufacturer` / `iProduct` lines out of a verbose descriptor
/// dump. Absent or index-only lines yield `None` for that field.
pub fn parse_descriptor_dump(dump: &str) -> DeviceStrings {
    let capture = |re: &Regex| {
        re.captures(dump)
            .map(|c| c[1].trim().to_string())
            .filter(|s| !s.is_empty())
    };
    DeviceStrings {
        manufacturer: capture(&MANUFACTURER_LINE),
        product: capture(&PRODUCT_LINE),
    }
}

/// Tiered identity resolution with a process-lifetime cache.
///
/// Entries are never evicted; a cached entry is the prerequisite for
/// turning a live device into a persisted passthrough entry.
pub struct IdentityResolver<P> {
    database: UsbIdDatabase,
    probe: P,
    cache: HashMap<String, DeviceStrings>,
}

impl<P: DescriptorProbe> IdentityResolver<P> {
    pub fn new(database: UsbIdDatabase, probe: P) -> Self {
        Self {
            database,
            probe,
            cache: HashMap::new(),
        }
    }

    /// The cached strings for a device, if it has been resolved before.
    pub fn cached(&self, identity: DeviceIdentity) -> Option<&DeviceStrings> {
        self.cache.get(&identity.hex_key())
    }

    /// Resolve a device's strings: cache, then database, then one external
    /// probe for whatever the database is missing. Always caches.
    pub async fn resolve(&mut self, identity: DeviceIdentity) -> DeviceStrings {
        let key = identity.hex_key();
        if let Some(hit) = self.cache.get(&key) {
            return hit.clone();
        }

        let mut manufacturer = self
            .database
            .vendor_name(identity.vendor_id)
            .map(str::to_string);
        let mut product = self
            .database
            .product_name(identity.vendor_id, identity.product_id)
            .map(str::to_string);

        // The database is famously incomplete; the device itself may still
        // carry string descriptors.
        if manufacturer.is_none() || product.is_none() {
            debug!(device = %identity, "database miss, querying descriptors");
            let probed = self.probe.query(identity).await;
            manufacturer = manufacturer.or(probed.manufacturer);
            product = product.or(probed.product);
        }

        let strings = DeviceStrings {
            manufacturer,
            product,
        };
        self.cache.insert(key, strings.clone());
        strings
    }

    /// Resolve and format the human-readable description, establishing the
    /// cache entry as a side effect.
    pub async fn stringify(&mut self, identity: DeviceIdentity) -> String {
        let strings = self.resolve(identity).await;
        format_description(identity, &strings)
    }
}
