//! vmusb agent library
//!
//! Host-side USB passthrough for a QEMU-backed VM: watch the host bus,
//! watch VM reachability, and converge the VM's device table with the
//! persisted desired-passthrough list. The binary in this package wires
//! these pieces to a real QMP endpoint; everything here is constructed
//! from explicit collaborators and testable in isolation.

pub mod reconciler;
pub mod usb;
pub mod vm;

pub use reconciler::{ReconcileError, Reconciler};
pub use usb::{DeviceWatcher, HostDevice, HostTools, HotplugEvent, MtpGuard, SystemTools};
pub use vm::{QmpVmController, TableQuery, VmController};
