//! QMP payload types
//!
//! Response payload shapes for the supported command set. Each command has a
//! fixed payload type; anything the hypervisor leaves implementation-defined
//! (`device_add`, `device_del`) stays a raw [`serde_json::Value`].

use serde::Deserialize;
use serde_json::Value;

/// The unsolicited greeting QEMU sends immediately after the socket opens.
///
/// A connection attempt is rejected unless the first inbound message parses
/// as this shape.
#[derive(Debug, Clone, Deserialize)]
pub struct Greeting {
    #[serde(rename = "QMP")]
    pub qmp: GreetingBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GreetingBody {
    pub version: VersionInfo,
    #[serde(default)]
    pub capabilities: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub qemu: VersionTriple,
    #[serde(default)]
    pub package: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionTriple {
    pub major: u64,
    pub minor: u64,
    pub micro: u64,
}

/// Payload of `query-status`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusInfo {
    pub running: bool,
    pub status: String,
}

/// One entry of the `query-commands` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandInfo {
    pub name: String,
}

/// One entry of the `device-list-properties` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct DevicePropertyInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "default-value", default)]
    pub default_value: Option<Value>,
}

/// One entry of the `query-block` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockInfo {
    pub device: String,
    #[serde(default)]
    pub qdev: Option<String>,
    #[serde(rename = "type")]
    pub type_name: String,
    pub removable: bool,
    pub locked: bool,
    #[serde(default)]
    pub tray_open: Option<bool>,
    #[serde(default)]
    pub io_status: Option<Value>,
    #[serde(default)]
    pub inserted: Option<Value>,
}

/// One entry of the `qom-list` payload.
///
/// Listing `/machine/peripheral` yields the ids of all devices added with an
/// explicit `id`, which makes this the authoritative device-table query.
#[derive(Debug, Clone, Deserialize)]
pub struct QomListEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

/// The error object of an `{"error": ...}` envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub desc: String,
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.desc)
    }
}
