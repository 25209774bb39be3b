//! Host-side USB concerns: enumeration, hot-plug events, and conflicting
//! driver handling.

pub mod hotplug;
pub mod mtp;

pub use hotplug::{DeviceWatcher, HostDevice, HotplugEvent};
pub use mtp::{HostTools, MtpGuard, SystemTools};
