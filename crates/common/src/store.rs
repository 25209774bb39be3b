//! Persisted desired-state store
//!
//! The passthrough list lives inside an externally owned JSON settings
//! document. This module is the narrow read/modify/write contract over it:
//! only the passthrough key is interpreted, every other key in the document
//! is preserved byte-for-meaning on write.

use crate::identity::{DeviceIdentity, DeviceStrings, format_description};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Document key holding the passthrough list.
pub const DEFAULT_DOCUMENT_KEY: &str = "passthroughDevices";

/// One desired-passthrough device, serialized camelCase into the settings
/// document. No two entries share a `(vendorId, productId)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassthroughEntry {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl PassthroughEntry {
    pub fn new(identity: DeviceIdentity, strings: DeviceStrings) -> Self {
        Self {
            vendor_id: identity.vendor_id,
            product_id: identity.product_id,
            manufacturer: strings.manufacturer,
            product: strings.product,
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.vendor_id, self.product_id)
    }

    /// Human-readable description from the persisted strings.
    pub fn describe(&self) -> String {
        let strings = DeviceStrings {
            manufacturer: self.manufacturer.clone(),
            product: self.product.clone(),
        };
        format_description(self.identity(), &strings)
    }
}

/// Read/modify/write access to the desired passthrough list.
pub trait DesiredStateStore: Send {
    /// The current desired list, in insertion order.
    fn entries(&self) -> &[PassthroughEntry];

    /// Replace the desired list and persist it.
    fn replace(&mut self, entries: Vec<PassthroughEntry>) -> crate::Result<()>;
}

/// Store backed by the externally owned JSON document.
pub struct JsonFileStore {
    path: PathBuf,
    key: String,
    entries: Vec<PassthroughEntry>,
}

impl JsonFileStore {
    /// Open the document at `path`, reading the passthrough list under the
    /// default key. A missing file or missing key reads as an empty list.
    pub fn open(path: impl Into<PathBuf>) -> crate::Result<Self> {
        Self::open_with_key(path, DEFAULT_DOCUMENT_KEY)
    }

    pub fn open_with_key(path: impl Into<PathBuf>, key: &str) -> crate::Result<Self> {
        let path = path.into();
        let document = read_document(&path)?;
        let entries = match document.get(key) {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| crate::Error::Store(format!("malformed passthrough list: {e}")))?,
            None => Vec::new(),
        };
        debug!(path = %path.display(), entries = entries.len(), "opened desired-state store");
        Ok(Self {
            path,
            key: key.to_string(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DesiredStateStore for JsonFileStore {
    fn entries(&self) -> &[PassthroughEntry] {
        &self.entries
    }

    fn replace(&mut self, entries: Vec<PassthroughEntry>) -> crate::Result<()> {
        // Re-read before writing so unrelated keys written by the owning
        // application since open are preserved.
        let mut document = read_document(&self.path)?;
        document.insert(
            self.key.clone(),
            serde_json::to_value(&entries)
                .map_err(|e| crate::Error::Store(format!("serialize passthrough list: {e}")))?,
        );

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let rendered = serde_json::to_string_pretty(&Value::Object(document))
            .map_err(|e| crate::Error::Store(format!("render settings document: {e}")))?;
        std::fs::write(&self.path, rendered)?;

        info!(
            path = %self.path.display(),
            entries = entries.len(),
            "persisted desired passthrough list"
        );
        self.entries = entries;
        Ok(())
    }
}

fn read_document(path: &Path) -> crate::Result<Map<String, Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(err) => return Err(err.into()),
    };
    let value: Value = serde_json::from_str(&content)
        .map_err(|e| crate::Error::Store(format!("settings document is not JSON: {e}")))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(crate::Error::Store(
            "settings document root is not an object".to_string(),
        )),
    }
}

/// In-memory store for tests and embedding without persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Vec<PassthroughEntry>,
}

impl MemoryStore {
    pub fn new(entries: Vec<PassthroughEntry>) -> Self {
        Self { entries }
    }
}

impl DesiredStateStore for MemoryStore {
    fn entries(&self) -> &[PassthroughEntry] {
        &self.entries
    }

    fn replace(&mut self, entries: Vec<PassthroughEntry>) -> crate::Result<()> {
        self.entries = entries;
        Ok(())
    }
}
