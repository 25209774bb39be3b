//! QMP command definitions
//!
//! The closed set of commands this client issues, serialized as the
//! `{"execute": <name>, "arguments": <object>}` envelope. Command names mix
//! underscores and dashes because QEMU does; each variant carries its exact
//! wire name.

use serde::Serialize;

/// Every command the client can issue.
///
/// Adjacent tagging produces the wire envelope directly: unit variants
/// serialize as `{"execute": "..."}`, variants with fields as
/// `{"execute": "...", "arguments": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "execute", content = "arguments")]
pub enum Command {
    /// Capability negotiation; the only command accepted before `Ready`.
    #[serde(rename = "qmp_capabilities")]
    QmpCapabilities,

    /// VM run-state query, also used as the liveness probe.
    #[serde(rename = "query-status")]
    QueryStatus,

    /// Enumerate the commands this hypervisor supports.
    #[serde(rename = "query-commands")]
    QueryCommands,

    /// Block-device descriptors.
    #[serde(rename = "query-block")]
    QueryBlock,

    /// Pass a line to the embedded human monitor; returns free text.
    #[serde(rename = "human-monitor-command")]
    HumanMonitorCommand {
        #[serde(rename = "command-line")]
        command_line: String,
    },

    /// Hot-add a device to the VM device table.
    #[serde(rename = "device_add")]
    DeviceAdd(DeviceAddArgs),

    /// Remove a device from the VM device table by id.
    #[serde(rename = "device_del")]
    DeviceDel { id: String },

    /// Property introspection for a device type.
    #[serde(rename = "device-list-properties")]
    DeviceListProperties { typename: String },

    /// List the children of a QOM path.
    #[serde(rename = "qom-list")]
    QomList { path: String },
}

/// Arguments of `device_add` for a host USB passthrough device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceAddArgs {
    pub driver: String,
    pub id: String,
    pub vendorid: u16,
    pub productid: u16,
    pub hostdevice: String,
}

impl DeviceAddArgs {
    /// Build the canonical `usb-host` add for a device at `hostdevice`,
    /// identified inside the VM by `id`.
    pub fn usb_host(id: String, vendorid: u16, productid: u16, hostdevice: String) -> Self {
        Self {
            driver: "usb-host".to_string(),
            id,
            vendorid,
            productid,
            hostdevice,
        }
    }
}
